//! Channel coupling validation.
//!
//! Decides whether a primary-channel frame and a secondary-channel
//! attestation represent the same physical event, elevating trust from
//! "cryptographically valid" to "physically co-located and simultaneous".
//! Forging one channel is insufficient: an attacker must produce correlated
//! content on both channels inside the timing window.
//!
//! Checks run in a fixed order and every rejection is typed: timestamp
//! window first (regardless of MAC validity), then the coupling MAC over
//! the primary bytes, then the engine-wide nonce replay guard, then the
//! per-channel quality floor.

use std::collections::HashMap;

use thiserror::Error;

use crate::frame::Frame;

/// Physical channel classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Acoustic burst channel (low bandwidth, omnidirectional).
    Acoustic,
    /// Optical / laser channel (high bandwidth, directional).
    Optical,
    /// Visual code channel (camera-read, directional).
    VisualCode,
}

/// One captured transmission on a physical channel.
///
/// Immutable once captured; the timestamp is stamped at capture time by the
/// transport, not taken from the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSample {
    /// Channel the bytes arrived on.
    pub kind: ChannelKind,
    /// Raw captured bytes (already ECC-decoded for codeword channels).
    pub bytes: Vec<u8>,
    /// Capture timestamp in milliseconds.
    pub timestamp_ms: u64,
    /// Channel quality score in [0,1] at capture time.
    pub quality: f32,
}

/// Trust level attached to a validated bundle and the connected state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustLevel {
    /// Both channels attested the same physical event.
    DualChannel,
    /// Single-channel fallback; physical co-location not cross-attested.
    SingleChannelDegraded,
}

/// Typed coupling rejection.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationFailure {
    /// Capture timestamps differ by more than the correlation window.
    #[error("Capture instants differ by {delta_ms} ms")]
    WindowExceeded {
        /// Absolute timestamp difference in milliseconds.
        delta_ms: u64,
    },

    /// The secondary attestation does not authenticate the primary bytes.
    #[error("Coupling MAC does not match the primary payload")]
    MacMismatch,

    /// The attestation nonce was already accepted once.
    #[error("Nonce already observed")]
    NonceReplayed,

    /// A channel scored below the configured quality floor.
    #[error("{kind:?} channel quality {score} below the floor")]
    LowQuality {
        /// Channel that failed the floor.
        kind: ChannelKind,
        /// Reported quality score.
        score: f32,
    },
}

/// Successfully coupled evidence, ready for key derivation.
#[derive(Debug, Clone)]
pub struct CoupledBundle {
    /// The primary-channel sample the bundle authenticates.
    pub primary: ChannelSample,
    /// Trust level of the bundle.
    pub trust: TrustLevel,
    /// Composite confidence: the minimum of the channel scores, so one weak
    /// channel weakens the whole bundle.
    pub confidence: f32,
}

/// Coupling validator configuration.
#[derive(Debug, Clone, Copy)]
pub struct ValidatorConfig {
    /// Maximum capture-timestamp difference in milliseconds.
    pub correlation_window_ms: u64,
    /// Minimum acceptable per-channel quality score.
    pub min_quality: f32,
    /// How long accepted nonces are remembered, in milliseconds.
    pub replay_retention_ms: u64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            correlation_window_ms: 100,
            min_quality: 0.7,
            replay_retention_ms: 5000,
        }
    }
}

/// Engine-wide record of recently accepted attestation nonces.
///
/// Retention is bounded: entries older than the retention window are pruned
/// on every check, keeping memory proportional to recent traffic.
pub struct ReplayGuard {
    seen: HashMap<[u8; 32], u64>,
    retention_ms: u64,
}

impl ReplayGuard {
    /// Create a guard with the given retention window.
    pub fn new(retention_ms: u64) -> Self {
        Self {
            seen: HashMap::new(),
            retention_ms,
        }
    }

    /// Record a nonce. Returns `false` if it was already seen within the
    /// retention window.
    pub fn check_and_insert(&mut self, nonce: &[u8; 32], now_ms: u64) -> bool {
        let retention = self.retention_ms;
        self.seen
            .retain(|_, first_seen| now_ms.saturating_sub(*first_seen) < retention);

        if self.seen.contains_key(nonce) {
            return false;
        }
        self.seen.insert(*nonce, now_ms);
        true
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.seen.len()
    }
}

/// Channel coupling validator with its engine-wide replay guard.
pub struct CouplingValidator {
    config: ValidatorConfig,
    replay: ReplayGuard,
}

impl CouplingValidator {
    /// Create a validator from configuration.
    pub fn new(config: ValidatorConfig) -> Self {
        let replay = ReplayGuard::new(config.replay_retention_ms);
        Self { config, replay }
    }

    /// Validate that a primary frame and a secondary attestation describe
    /// the same physical event.
    ///
    /// `primary.bytes` must hold the primary frame bytes as transmitted
    /// (post ECC decode); `secondary.bytes` must hold a serialized coupling
    /// mark. A secondary that does not parse as a coupling mark, or whose
    /// mark targets another session, carries no valid MAC and is rejected
    /// as `MacMismatch`.
    ///
    /// Only nonces with a valid MAC consume replay-guard entries.
    pub fn validate(
        &mut self,
        session_id: &[u8; 16],
        primary: &ChannelSample,
        secondary: &ChannelSample,
        now_ms: u64,
    ) -> core::result::Result<CoupledBundle, ValidationFailure> {
        let delta_ms = primary.timestamp_ms.abs_diff(secondary.timestamp_ms);
        if delta_ms > self.config.correlation_window_ms {
            return Err(ValidationFailure::WindowExceeded { delta_ms });
        }

        let (mark_session_id, nonce, tag) = match Frame::parse(&secondary.bytes) {
            Ok(Frame::CouplingMark {
                session_id, nonce, tag, ..
            }) => (session_id, nonce, tag),
            _ => return Err(ValidationFailure::MacMismatch),
        };
        if &mark_session_id != session_id {
            return Err(ValidationFailure::MacMismatch);
        }
        let verified =
            beamlink_crypto::mac::verify_coupling_tag(&nonce, session_id, &primary.bytes, &tag)
                .unwrap_or(false);
        if !verified {
            return Err(ValidationFailure::MacMismatch);
        }

        if !self.replay.check_and_insert(&nonce, now_ms) {
            return Err(ValidationFailure::NonceReplayed);
        }

        self.quality_floor(primary)?;
        self.quality_floor(secondary)?;

        Ok(CoupledBundle {
            primary: primary.clone(),
            trust: TrustLevel::DualChannel,
            confidence: primary.quality.min(secondary.quality),
        })
    }

    /// Accept a primary sample alone when the secondary channel is out of
    /// service and policy allows degraded trust.
    ///
    /// The quality floor and the replay guard (over the nonce carried in
    /// the primary frame) still apply; the resulting bundle is explicitly
    /// marked `SingleChannelDegraded` and its confidence is the primary
    /// quality alone.
    pub fn validate_single_channel(
        &mut self,
        primary: &ChannelSample,
        nonce: &[u8; 32],
        now_ms: u64,
    ) -> core::result::Result<CoupledBundle, ValidationFailure> {
        if !self.replay.check_and_insert(nonce, now_ms) {
            return Err(ValidationFailure::NonceReplayed);
        }
        self.quality_floor(primary)?;

        Ok(CoupledBundle {
            primary: primary.clone(),
            trust: TrustLevel::SingleChannelDegraded,
            confidence: primary.quality,
        })
    }

    fn quality_floor(&self, sample: &ChannelSample) -> core::result::Result<(), ValidationFailure> {
        // Written so NaN scores fail the floor.
        if !(sample.quality >= self.config.min_quality) {
            return Err(ValidationFailure::LowQuality {
                kind: sample.kind,
                score: sample.quality,
            });
        }
        Ok(())
    }
}
