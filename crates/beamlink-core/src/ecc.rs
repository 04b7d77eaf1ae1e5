//! Adaptive concatenated error-correction codec.
//!
//! Codewords combine three layers so the payload channel stays usable under
//! burst interference:
//! - an outer Reed-Solomon erasure code across shards,
//! - an inner Reed-Solomon code across CRC-marked sub-blocks within each
//!   shard, turning localized damage into repairable erasures,
//! - a byte block interleaver over the whole body, spreading wire bursts
//!   across many sub-blocks.
//!
//! Every codeword is self-describing: a fixed header carries the shard
//! counts, inner rate, interleave depth, payload length and payload CRC, so
//! a decoder never needs out-of-band profile knowledge. Decoding either
//! returns the exact original payload or fails; garbled output is never
//! produced. The header itself is integrity-checked but not repairable.
//!
//! All multi-byte integers are little-endian.

pub mod interleave;
pub mod profile;

pub use profile::{recommend_profile, EccProfile, InnerRate, LinkQuality, ProfileBounds};

use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::{Error, Result};

/// Magic number for codeword headers (0x424C4357 = "BLCW").
pub const MAGIC_CODEWORD: u32 = 0x424C_4357;
/// Codeword format version.
pub const CODEWORD_VERSION: u8 = 1;
/// Fixed codeword header length in bytes.
pub const HEADER_LEN: usize = 21;

/// Per-sub-block CRC32 trailer length.
const SUB_BLOCK_CRC_LEN: usize = 4;

/// Derived codeword dimensions for one profile and payload length.
struct Geometry {
    data_shards: usize,
    parity_shards: usize,
    inner_data: usize,
    inner_parity: usize,
    sub_len: usize,
    shard_len: usize,
    record_len: usize,
    body_len: usize,
}

fn geometry(profile: &EccProfile, payload_len: usize) -> Result<Geometry> {
    let data_shards = profile.data_shards as usize;
    let parity_shards = profile.parity_shards as usize;
    let (inner_data, inner_parity) = profile.inner_rate.sub_block_counts();

    let shard_data_len = (payload_len + data_shards - 1) / data_shards;
    let sub_len = ((shard_data_len + inner_data - 1) / inner_data).max(1);

    let overflow = || Error::InvalidFrame("Codeword dimensions overflow".into());
    let record_len = sub_len
        .checked_add(SUB_BLOCK_CRC_LEN)
        .and_then(|r| r.checked_mul(inner_data + inner_parity))
        .ok_or_else(overflow)?;
    // record_len bounds sub_len * inner_data, so this cannot overflow.
    let shard_len = sub_len * inner_data;
    let body_len = record_len
        .checked_mul(data_shards + parity_shards)
        .ok_or_else(overflow)?;

    Ok(Geometry {
        data_shards,
        parity_shards,
        inner_data,
        inner_parity,
        sub_len,
        shard_len,
        record_len,
        body_len,
    })
}

/// Encode a payload into a self-describing codeword.
///
/// The payload is split across `profile.data_shards` zero-padded shards,
/// extended by the outer parity shards, inner-coded per shard, and the
/// whole body interleaved at the profile's depth.
///
/// # Arguments
///
/// * `payload` - Application bytes; length up to `u32::MAX`
/// * `profile` - Redundancy profile; applies to this codeword only
///
/// # Errors
///
/// Returns `InvalidFrame` if the profile is unusable or the payload does
/// not fit the length field.
pub fn encode(payload: &[u8], profile: &EccProfile) -> Result<Vec<u8>> {
    profile.validate()?;
    if payload.len() > u32::MAX as usize {
        return Err(Error::InvalidFrame("Payload exceeds codeword capacity".into()));
    }
    let geo = geometry(profile, payload.len())?;

    let mut out = Vec::with_capacity(HEADER_LEN + geo.body_len);
    out.extend_from_slice(&MAGIC_CODEWORD.to_le_bytes());
    out.push(CODEWORD_VERSION);
    out.push(profile.data_shards);
    out.push(profile.parity_shards);
    out.push(profile.inner_rate.to_u8());
    out.push(profile.interleave_depth);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    let header_crc = crc32fast::hash(&out);
    out.extend_from_slice(&header_crc.to_le_bytes());

    // Outer code: payload split into equal shards, zero-padded.
    let mut shards: Vec<Vec<u8>> = Vec::with_capacity(geo.data_shards + geo.parity_shards);
    for i in 0..geo.data_shards {
        let start = (i * geo.shard_len).min(payload.len());
        let end = (start + geo.shard_len).min(payload.len());
        let mut shard = payload[start..end].to_vec();
        shard.resize(geo.shard_len, 0);
        shards.push(shard);
    }
    shards.resize(geo.data_shards + geo.parity_shards, vec![0u8; geo.shard_len]);

    let outer = ReedSolomon::new(geo.data_shards, geo.parity_shards)
        .map_err(|e| Error::InvalidFrame(format!("Outer code rejected profile: {:?}", e)))?;
    outer
        .encode(&mut shards)
        .map_err(|e| Error::InvalidFrame(format!("Outer encode failed: {:?}", e)))?;

    // Inner code: each shard becomes CRC-marked sub-block records.
    let inner = ReedSolomon::new(geo.inner_data, geo.inner_parity)
        .map_err(|e| Error::InvalidFrame(format!("Inner code rejected profile: {:?}", e)))?;
    let mut body = Vec::with_capacity(geo.body_len);
    for shard in &shards {
        let mut subs: Vec<Vec<u8>> = shard.chunks(geo.sub_len).map(|c| c.to_vec()).collect();
        subs.resize(geo.inner_data + geo.inner_parity, vec![0u8; geo.sub_len]);
        inner
            .encode(&mut subs)
            .map_err(|e| Error::InvalidFrame(format!("Inner encode failed: {:?}", e)))?;
        for sub in &subs {
            body.extend_from_slice(sub);
            body.extend_from_slice(&crc32fast::hash(sub).to_le_bytes());
        }
    }

    out.extend_from_slice(&interleave::interleave(&body, profile.interleave_depth as usize));
    Ok(out)
}

/// Decode a codeword back into the exact original payload.
///
/// Repair runs inside-out: deinterleave, repair each shard from its valid
/// sub-blocks, erase shards whose inner layer fails, reconstruct erased
/// shards with the outer code, then verify the end-to-end payload CRC.
///
/// # Errors
///
/// * `InsufficientData` - input shorter than the header or declared body
/// * `InvalidFrame` - wrong magic/version, unknown rate id, unusable
///   profile fields, or trailing bytes
/// * `EccUncorrectable` - damage beyond the profile's correction capacity,
///   a damaged header, or a final payload CRC mismatch
pub fn decode(bytes: &[u8]) -> Result<Vec<u8>> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::InsufficientData(HEADER_LEN));
    }

    let magic = read_u32_le(&bytes[0..4]);
    if magic != MAGIC_CODEWORD {
        return Err(Error::InvalidFrame(format!(
            "Unknown codeword magic: 0x{:08X}",
            magic
        )));
    }
    if bytes[4] != CODEWORD_VERSION {
        return Err(Error::InvalidFrame(format!(
            "Unsupported codeword version: {}",
            bytes[4]
        )));
    }

    let stored_header_crc = read_u32_le(&bytes[17..21]);
    if crc32fast::hash(&bytes[0..17]) != stored_header_crc {
        // Header damage is detectable but not repairable.
        return Err(Error::EccUncorrectable);
    }

    let inner_rate = InnerRate::from_u8(bytes[7])
        .ok_or_else(|| Error::InvalidFrame(format!("Unknown inner rate id: 0x{:02X}", bytes[7])))?;
    let profile = EccProfile {
        data_shards: bytes[5],
        parity_shards: bytes[6],
        inner_rate,
        interleave_depth: bytes[8],
    };
    profile.validate()?;

    let payload_len = read_u32_le(&bytes[9..13]) as usize;
    let payload_crc = read_u32_le(&bytes[13..17]);
    let geo = geometry(&profile, payload_len)?;

    let expected = HEADER_LEN + geo.body_len;
    if bytes.len() < expected {
        return Err(Error::InsufficientData(expected));
    }
    if bytes.len() > expected {
        return Err(Error::InvalidFrame("Trailing bytes after codeword".into()));
    }

    let body = interleave::deinterleave(&bytes[HEADER_LEN..], profile.interleave_depth as usize);

    // Inner layer: CRC-marked sub-blocks become erasures; shards whose
    // inner layer cannot recover are themselves erased for the outer code.
    let inner = ReedSolomon::new(geo.inner_data, geo.inner_parity)
        .map_err(|_| Error::EccUncorrectable)?;
    let mut shards: Vec<Option<Vec<u8>>> = Vec::with_capacity(geo.data_shards + geo.parity_shards);
    for record in body.chunks_exact(geo.record_len) {
        let mut subs: Vec<Option<Vec<u8>>> = record
            .chunks_exact(geo.sub_len + SUB_BLOCK_CRC_LEN)
            .map(|rec| {
                let (data, crc) = rec.split_at(geo.sub_len);
                if crc32fast::hash(data) == read_u32_le(crc) {
                    Some(data.to_vec())
                } else {
                    None
                }
            })
            .collect();

        let present = subs.iter().filter(|s| s.is_some()).count();
        if present < geo.inner_data {
            shards.push(None);
            continue;
        }
        if present < subs.len() && inner.reconstruct(&mut subs).is_err() {
            shards.push(None);
            continue;
        }

        let mut shard = Vec::with_capacity(geo.shard_len);
        let mut complete = true;
        for sub in subs.iter().take(geo.inner_data) {
            match sub {
                Some(data) => shard.extend_from_slice(data),
                None => {
                    complete = false;
                    break;
                }
            }
        }
        shards.push(if complete { Some(shard) } else { None });
    }

    // Outer layer: reconstruct erased shards if enough survive.
    let present = shards.iter().filter(|s| s.is_some()).count();
    if present < geo.data_shards {
        return Err(Error::EccUncorrectable);
    }
    if present < shards.len() {
        let outer = ReedSolomon::new(geo.data_shards, geo.parity_shards)
            .map_err(|_| Error::EccUncorrectable)?;
        outer
            .reconstruct(&mut shards)
            .map_err(|_| Error::EccUncorrectable)?;
    }

    let mut payload = Vec::with_capacity(geo.data_shards * geo.shard_len);
    for shard in shards.into_iter().take(geo.data_shards) {
        match shard {
            Some(data) => payload.extend_from_slice(&data),
            None => return Err(Error::EccUncorrectable),
        }
    }
    payload.truncate(payload_len);

    if crc32fast::hash(&payload) != payload_crc {
        return Err(Error::EccUncorrectable);
    }
    Ok(payload)
}

#[inline]
fn read_u32_le(data: &[u8]) -> u32 {
    u32::from_le_bytes([data[0], data[1], data[2], data[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    /// Zero out whole shard records in the (deinterleaved) body, then
    /// re-interleave. Every sub-block CRC in a zeroed record fails, so the
    /// inner layer erases the entire shard.
    fn destroy_shards(encoded: &mut [u8], profile: &EccProfile, payload_len: usize, count: usize) {
        let geo = geometry(profile, payload_len).expect("geometry");
        let depth = profile.interleave_depth as usize;
        let mut body = interleave::deinterleave(&encoded[HEADER_LEN..], depth);
        for record in 0..count {
            let start = record * geo.record_len;
            body[start..start + geo.record_len].fill(0);
        }
        let spread = interleave::interleave(&body, depth);
        encoded[HEADER_LEN..].copy_from_slice(&spread);
    }

    #[test]
    fn test_roundtrip_default_profile() {
        let payload = sample_payload(100);
        let encoded = encode(&payload, &EccProfile::default()).expect("encode");
        assert_eq!(decode(&encoded).expect("decode"), payload);
    }

    #[test]
    fn test_roundtrip_all_rates_and_depths() {
        for rate in [InnerRate::Half, InnerRate::TwoThirds, InnerRate::ThreeQuarters] {
            for depth in [1, 4, 8] {
                let profile = EccProfile {
                    data_shards: 8,
                    parity_shards: 4,
                    inner_rate: rate,
                    interleave_depth: depth,
                };
                let payload = sample_payload(333);
                let encoded = encode(&payload, &profile).expect("encode");
                assert_eq!(decode(&encoded).expect("decode"), payload);
            }
        }
    }

    #[test]
    fn test_roundtrip_edge_payload_sizes() {
        for len in [0, 1, 15, 16, 17, 64] {
            let payload = sample_payload(len);
            let encoded = encode(&payload, &EccProfile::default()).expect("encode");
            assert_eq!(decode(&encoded).expect("decode"), payload, "len={}", len);
        }
    }

    #[test]
    fn test_nine_destroyed_shards_uncorrectable() {
        let payload = sample_payload(64);
        let profile = EccProfile::default();
        assert_eq!(profile.data_shards, 16);
        assert_eq!(profile.parity_shards, 8);

        let mut encoded = encode(&payload, &profile).expect("encode");
        destroy_shards(&mut encoded, &profile, payload.len(), 9);

        assert!(matches!(decode(&encoded), Err(Error::EccUncorrectable)));
    }

    #[test]
    fn test_seven_destroyed_shards_recovered_exactly() {
        let payload = sample_payload(64);
        let profile = EccProfile::default();

        let mut encoded = encode(&payload, &profile).expect("encode");
        destroy_shards(&mut encoded, &profile, payload.len(), 7);

        assert_eq!(decode(&encoded).expect("decode"), payload);
    }

    #[test]
    fn test_loss_at_parity_budget_recovered() {
        // Exactly parity_shards destroyed is the correction boundary.
        let payload = sample_payload(64);
        let profile = EccProfile::default();

        let mut encoded = encode(&payload, &profile).expect("encode");
        destroy_shards(&mut encoded, &profile, payload.len(), 8);

        assert_eq!(decode(&encoded).expect("decode"), payload);
    }

    #[test]
    fn test_inner_layer_repairs_scattered_damage() {
        // Flip one byte inside two sub-block records of shard 0 and one of
        // shard 5; within the inner parity budget, so no shard is erased.
        let payload = sample_payload(64);
        let profile = EccProfile::default();
        let geo = geometry(&profile, payload.len()).expect("geometry");
        let sub_record = geo.sub_len + 4;

        let mut encoded = encode(&payload, &profile).expect("encode");
        let depth = profile.interleave_depth as usize;
        let mut body = interleave::deinterleave(&encoded[HEADER_LEN..], depth);
        body[0] ^= 0xA5;
        body[sub_record] ^= 0xA5;
        body[5 * geo.record_len + 3 * sub_record] ^= 0xA5;
        let spread = interleave::interleave(&body, depth);
        encoded[HEADER_LEN..].copy_from_slice(&spread);

        assert_eq!(decode(&encoded).expect("decode"), payload);
    }

    #[test]
    fn test_contiguous_wire_burst_tolerated() {
        // A 16-byte wire burst deinterleaves into single-sub-block damage
        // across four different shards; all repaired by the inner layer.
        let payload = sample_payload(64);
        let profile = EccProfile::default();

        let mut encoded = encode(&payload, &profile).expect("encode");
        for b in encoded[HEADER_LEN..HEADER_LEN + 16].iter_mut() {
            *b ^= 0xFF;
        }

        assert_eq!(decode(&encoded).expect("decode"), payload);
    }

    #[test]
    fn test_truncated_codeword_rejected() {
        let payload = sample_payload(64);
        let encoded = encode(&payload, &EccProfile::default()).expect("encode");

        assert!(matches!(
            decode(&encoded[..10]),
            Err(Error::InsufficientData(_))
        ));
        assert!(matches!(
            decode(&encoded[..encoded.len() - 1]),
            Err(Error::InsufficientData(_))
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let payload = sample_payload(64);
        let mut encoded = encode(&payload, &EccProfile::default()).expect("encode");
        encoded.push(0);

        assert!(matches!(decode(&encoded), Err(Error::InvalidFrame(_))));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let payload = sample_payload(64);
        let mut encoded = encode(&payload, &EccProfile::default()).expect("encode");
        encoded[0] ^= 0xFF;

        assert!(matches!(decode(&encoded), Err(Error::InvalidFrame(_))));
    }

    #[test]
    fn test_header_damage_detected() {
        // Damage inside the header body (not magic) trips the header CRC.
        let payload = sample_payload(64);
        let mut encoded = encode(&payload, &EccProfile::default()).expect("encode");
        encoded[9] ^= 0x01;

        assert!(matches!(decode(&encoded), Err(Error::EccUncorrectable)));
    }

    #[test]
    fn test_unknown_rate_id_rejected() {
        let payload = sample_payload(64);
        let mut encoded = encode(&payload, &EccProfile::default()).expect("encode");
        encoded[7] = 0x07;
        let patched_crc = crc32fast::hash(&encoded[0..17]);
        encoded[17..21].copy_from_slice(&patched_crc.to_le_bytes());

        assert!(matches!(decode(&encoded), Err(Error::InvalidFrame(_))));
    }

    #[test]
    fn test_invalid_profile_rejected_at_encode() {
        let profile = EccProfile {
            parity_shards: 0,
            ..EccProfile::default()
        };
        assert!(matches!(
            encode(b"data", &profile),
            Err(Error::InvalidFrame(_))
        ));
    }
}
