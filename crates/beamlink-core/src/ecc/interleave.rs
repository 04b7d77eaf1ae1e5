//! Byte block interleaver.
//!
//! A codeword body is read out column-wise from a `depth`-row layout, so a
//! contiguous burst of wire errors lands on bytes that are far apart in the
//! original body. Combined with the inner sub-block code this converts
//! channel bursts into isolated, repairable sub-block erasures.
//!
//! Both directions are exact permutations for any input length; nothing is
//! padded and no length marker is needed.

/// Interleave `data` with the given depth.
pub fn interleave(data: &[u8], depth: usize) -> Vec<u8> {
    let depth = depth.max(1);
    let cols = (data.len() + depth - 1) / depth;
    let mut out = Vec::with_capacity(data.len());
    for col in 0..cols {
        for row in 0..depth {
            let idx = row * cols + col;
            if idx < data.len() {
                out.push(data[idx]);
            }
        }
    }
    out
}

/// Invert [`interleave`] with the same depth.
pub fn deinterleave(data: &[u8], depth: usize) -> Vec<u8> {
    let depth = depth.max(1);
    let cols = (data.len() + depth - 1) / depth;
    let mut out = vec![0u8; data.len()];
    let mut pos = 0;
    for col in 0..cols {
        for row in 0..depth {
            let idx = row * cols + col;
            if idx < data.len() {
                out[idx] = data[pos];
                pos += 1;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_various_shapes() {
        let data: Vec<u8> = (0..=255).collect();
        for depth in [1, 2, 3, 4, 7, 8] {
            for len in [0, 1, 5, 64, 100, 256] {
                let slice = &data[..len];
                let spread = interleave(slice, depth);
                assert_eq!(spread.len(), len);
                assert_eq!(deinterleave(&spread, depth), slice);
            }
        }
    }

    #[test]
    fn test_interleave_is_a_permutation() {
        let data: Vec<u8> = (0..100).collect();
        let spread = interleave(&data, 4);

        let mut sorted = spread.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, data);
        assert_ne!(spread, data);
    }

    #[test]
    fn test_depth_one_is_identity() {
        let data: Vec<u8> = (0..32).collect();
        assert_eq!(interleave(&data, 1), data);
        assert_eq!(deinterleave(&data, 1), data);
    }

    #[test]
    fn test_burst_spreads_across_body() {
        // 64 bytes at depth 4: wire positions 0..4 come from body positions
        // 0, 16, 32, 48. A 4-byte wire burst therefore never hits two bytes
        // closer than one column width apart.
        let data: Vec<u8> = (0..64).collect();
        let mut spread = interleave(&data, 4);
        for b in spread.iter_mut().take(4) {
            *b = 0xFF;
        }
        let restored = deinterleave(&spread, 4);

        let hit: Vec<usize> = restored
            .iter()
            .enumerate()
            .filter(|(_, b)| **b == 0xFF)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(hit, vec![0, 16, 32, 48]);
    }
}
