//! Redundancy profiles and link-quality-driven profile recommendation.

use crate::{Error, Result};

/// Inner code rate, selected from a fixed set.
///
/// The rate fixes the data/parity sub-block split inside each shard:
/// 1/2 → 4+4, 2/3 → 4+2, 3/4 → 6+2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InnerRate {
    /// Rate 1/2 (0x01): strongest burst repair, doubles shard size.
    Half = 0x01,
    /// Rate 2/3 (0x02): balanced.
    TwoThirds = 0x02,
    /// Rate 3/4 (0x03): leanest.
    ThreeQuarters = 0x03,
}

impl InnerRate {
    /// Convert to wire byte.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Parse from wire byte. Returns `None` for unknown rate ids.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(InnerRate::Half),
            0x02 => Some(InnerRate::TwoThirds),
            0x03 => Some(InnerRate::ThreeQuarters),
            _ => None,
        }
    }

    /// Data and parity sub-block counts per shard.
    pub fn sub_block_counts(self) -> (usize, usize) {
        match self {
            InnerRate::Half => (4, 4),
            InnerRate::TwoThirds => (4, 2),
            InnerRate::ThreeQuarters => (6, 2),
        }
    }
}

/// Redundancy profile for one codeword.
///
/// Integer-valued by design: both peers must agree on the exact profile,
/// negotiated in the cleartext challenge preamble. A profile applies to
/// whole codewords only; the next codeword may use a different one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EccProfile {
    /// Outer-code data shard count.
    pub data_shards: u8,
    /// Outer-code parity shard count; up to this many shards may be lost.
    pub parity_shards: u8,
    /// Inner code rate.
    pub inner_rate: InnerRate,
    /// Block interleave depth applied to the codeword body.
    pub interleave_depth: u8,
}

impl Default for EccProfile {
    fn default() -> Self {
        Self {
            data_shards: 16,
            parity_shards: 8,
            inner_rate: InnerRate::TwoThirds,
            interleave_depth: 4,
        }
    }
}

impl EccProfile {
    /// Check the profile is usable by the codec.
    ///
    /// GF(2^8) Reed-Solomon limits the total shard count to 256.
    pub fn validate(&self) -> Result<()> {
        if self.data_shards == 0 || self.parity_shards == 0 {
            return Err(Error::InvalidFrame(
                "Profile requires at least one data and one parity shard".into(),
            ));
        }
        if self.data_shards as usize + self.parity_shards as usize > 256 {
            return Err(Error::InvalidFrame(
                "Profile exceeds 256 total shards".into(),
            ));
        }
        if self.interleave_depth == 0 {
            return Err(Error::InvalidFrame(
                "Profile requires interleave depth of at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Recent link quality estimates feeding profile recommendation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkQuality {
    /// Estimated bit-error rate in [0,1].
    pub bit_error_rate: f32,
    /// Estimated packet-error rate in [0,1].
    pub packet_error_rate: f32,
    /// Estimated signal attenuation in dB.
    pub attenuation_db: f32,
}

impl Default for LinkQuality {
    fn default() -> Self {
        Self {
            bit_error_rate: 0.0,
            packet_error_rate: 0.0,
            attenuation_db: 0.0,
        }
    }
}

/// Configured envelope for recommended profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileBounds {
    /// Fixed data shard count for recommended profiles.
    pub data_shards: u8,
    /// Minimum parity shard count.
    pub min_parity_shards: u8,
    /// Maximum parity shard count.
    pub max_parity_shards: u8,
    /// Minimum interleave depth.
    pub min_interleave_depth: u8,
    /// Maximum interleave depth.
    pub max_interleave_depth: u8,
}

impl Default for ProfileBounds {
    fn default() -> Self {
        Self {
            data_shards: 16,
            min_parity_shards: 4,
            max_parity_shards: 12,
            min_interleave_depth: 2,
            max_interleave_depth: 8,
        }
    }
}

// Saturation points for severity normalization: a 5% bit-error rate, 50%
// packet loss, or 40 dB attenuation each individually demand the most
// conservative profile the bounds allow.
const BER_SATURATION: f32 = 0.05;
const PER_SATURATION: f32 = 0.5;
const ATTENUATION_SATURATION_DB: f32 = 40.0;

/// Recommend a redundancy profile for the measured link quality.
///
/// Pure function: the same inputs always yield the same profile. Redundancy
/// grows as quality degrades and shrinks as it improves, clamped to
/// `bounds`. The worst of the three normalized metrics drives the decision,
/// so a link that is clean on average but bursty still gets a conservative
/// profile.
///
/// # Example
///
/// ```
/// use beamlink_core::ecc::profile::{recommend_profile, LinkQuality, ProfileBounds};
///
/// let clean = LinkQuality { bit_error_rate: 0.0, packet_error_rate: 0.0, attenuation_db: 0.0 };
/// let noisy = LinkQuality { bit_error_rate: 0.04, packet_error_rate: 0.3, attenuation_db: 25.0 };
/// let bounds = ProfileBounds::default();
///
/// let lean = recommend_profile(&clean, &bounds);
/// let conservative = recommend_profile(&noisy, &bounds);
/// assert!(conservative.parity_shards > lean.parity_shards);
/// ```
pub fn recommend_profile(quality: &LinkQuality, bounds: &ProfileBounds) -> EccProfile {
    let ber = (quality.bit_error_rate / BER_SATURATION).clamp(0.0, 1.0);
    let per = (quality.packet_error_rate / PER_SATURATION).clamp(0.0, 1.0);
    let att = (quality.attenuation_db / ATTENUATION_SATURATION_DB).clamp(0.0, 1.0);
    let severity = ber.max(per).max(att);

    let parity_span = bounds.max_parity_shards.saturating_sub(bounds.min_parity_shards);
    let parity_shards = bounds
        .min_parity_shards
        .saturating_add((severity * parity_span as f32).round() as u8)
        .min(bounds.max_parity_shards);

    let depth_span = bounds
        .max_interleave_depth
        .saturating_sub(bounds.min_interleave_depth);
    let interleave_depth = bounds
        .min_interleave_depth
        .saturating_add((severity * depth_span as f32).round() as u8)
        .min(bounds.max_interleave_depth)
        .max(1);

    let inner_rate = if severity < 1.0 / 3.0 {
        InnerRate::ThreeQuarters
    } else if severity < 2.0 / 3.0 {
        InnerRate::TwoThirds
    } else {
        InnerRate::Half
    };

    EccProfile {
        data_shards: bounds.data_shards,
        parity_shards,
        inner_rate,
        interleave_depth,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_id_roundtrip() {
        for rate in [InnerRate::Half, InnerRate::TwoThirds, InnerRate::ThreeQuarters] {
            assert_eq!(InnerRate::from_u8(rate.to_u8()), Some(rate));
        }
        assert_eq!(InnerRate::from_u8(0x00), None);
        assert_eq!(InnerRate::from_u8(0x04), None);
    }

    #[test]
    fn test_rate_sub_block_splits() {
        assert_eq!(InnerRate::Half.sub_block_counts(), (4, 4));
        assert_eq!(InnerRate::TwoThirds.sub_block_counts(), (4, 2));
        assert_eq!(InnerRate::ThreeQuarters.sub_block_counts(), (6, 2));
    }

    #[test]
    fn test_profile_validation() {
        assert!(EccProfile::default().validate().is_ok());

        let no_parity = EccProfile {
            parity_shards: 0,
            ..EccProfile::default()
        };
        assert!(no_parity.validate().is_err());

        let too_many = EccProfile {
            data_shards: 255,
            parity_shards: 255,
            ..EccProfile::default()
        };
        assert!(too_many.validate().is_err());

        let flat = EccProfile {
            interleave_depth: 0,
            ..EccProfile::default()
        };
        assert!(flat.validate().is_err());
    }

    #[test]
    fn test_clean_link_gets_leanest_profile() {
        let bounds = ProfileBounds::default();
        let profile = recommend_profile(&LinkQuality::default(), &bounds);

        assert_eq!(profile.parity_shards, bounds.min_parity_shards);
        assert_eq!(profile.inner_rate, InnerRate::ThreeQuarters);
        assert_eq!(profile.interleave_depth, bounds.min_interleave_depth);
    }

    #[test]
    fn test_degraded_link_gets_most_conservative_profile() {
        let bounds = ProfileBounds::default();
        let quality = LinkQuality {
            bit_error_rate: 0.1,
            packet_error_rate: 0.8,
            attenuation_db: 60.0,
        };
        let profile = recommend_profile(&quality, &bounds);

        assert_eq!(profile.parity_shards, bounds.max_parity_shards);
        assert_eq!(profile.inner_rate, InnerRate::Half);
        assert_eq!(profile.interleave_depth, bounds.max_interleave_depth);
    }

    #[test]
    fn test_single_bad_metric_dominates() {
        // Clean on average but saturated packet loss: still conservative.
        let bounds = ProfileBounds::default();
        let bursty = LinkQuality {
            bit_error_rate: 0.0,
            packet_error_rate: 0.6,
            attenuation_db: 0.0,
        };
        let profile = recommend_profile(&bursty, &bounds);
        assert_eq!(profile.parity_shards, bounds.max_parity_shards);
        assert_eq!(profile.inner_rate, InnerRate::Half);
    }

    #[test]
    fn test_redundancy_monotone_in_bit_error_rate() {
        let bounds = ProfileBounds::default();
        let mut last_parity = 0u8;
        for step in 0..=10 {
            let quality = LinkQuality {
                bit_error_rate: 0.005 * step as f32,
                packet_error_rate: 0.0,
                attenuation_db: 0.0,
            };
            let profile = recommend_profile(&quality, &bounds);
            assert!(profile.parity_shards >= last_parity);
            assert!(profile.parity_shards >= bounds.min_parity_shards);
            assert!(profile.parity_shards <= bounds.max_parity_shards);
            last_parity = profile.parity_shards;
        }
    }

    #[test]
    fn test_recommendation_is_deterministic() {
        let bounds = ProfileBounds::default();
        let quality = LinkQuality {
            bit_error_rate: 0.02,
            packet_error_rate: 0.1,
            attenuation_db: 12.0,
        };
        assert_eq!(
            recommend_profile(&quality, &bounds),
            recommend_profile(&quality, &bounds)
        );
    }

    #[test]
    fn test_recommended_profiles_always_validate() {
        let bounds = ProfileBounds::default();
        for step in 0..=20 {
            let quality = LinkQuality {
                bit_error_rate: 0.005 * step as f32,
                packet_error_rate: 0.05 * step as f32,
                attenuation_db: 4.0 * step as f32,
            };
            let profile = recommend_profile(&quality, &bounds);
            assert!(profile.validate().is_ok());
        }
    }
}
