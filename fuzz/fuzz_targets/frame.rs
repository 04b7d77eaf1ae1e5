#![no_main]

use beamlink_core::frame::Frame;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Frame parsing must never panic on arbitrary input.
    let _ = Frame::parse(data);
});
