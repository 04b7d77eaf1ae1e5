#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Codeword decoding repairs or rejects, never panics.
    let _ = beamlink_core::ecc::decode(data);
});
