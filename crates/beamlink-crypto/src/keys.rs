//! Session key lifecycle.
//!
//! Session keys are short-lived by design: a key older than its TTL is
//! refused for both sealing and opening, forcing a fresh handshake
//! instead of silently continuing on stale material. All containers
//! here zero their contents on drop.

use crate::{Error, Result};
use rand::RngCore;
use zeroize::Zeroizing;

/// Default session key time-to-live in milliseconds.
pub const DEFAULT_KEY_TTL_MS: u64 = 5_000;

/// A 32-byte symmetric session key, zeroed on drop.
///
/// `Debug` never prints the key bytes.
#[derive(Clone)]
pub struct SessionKey(Zeroizing<[u8; 32]>);

impl SessionKey {
    /// Wrap derived key bytes.
    pub fn new(bytes: Zeroizing<[u8; 32]>) -> Self {
        Self(bytes)
    }

    /// Raw key bytes for AEAD calls.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionKey([REDACTED])")
    }
}

/// A session key together with its validity window.
///
/// Time is a caller-supplied monotonic millisecond count, so expiry
/// checks stay pure and testable.
#[derive(Debug, Clone)]
pub struct KeyMaterial {
    key: SessionKey,
    established_at_ms: u64,
    ttl_ms: u64,
}

impl KeyMaterial {
    /// Bind a freshly derived key to its establishment time and TTL.
    pub fn new(key: SessionKey, established_at_ms: u64, ttl_ms: u64) -> Self {
        Self {
            key,
            established_at_ms,
            ttl_ms,
        }
    }

    /// The session key, valid only while not expired.
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Whether the key's TTL has elapsed at `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.established_at_ms) >= self.ttl_ms
    }

    /// Milliseconds of validity remaining at `now_ms` (zero if expired).
    pub fn remaining_ms(&self, now_ms: u64) -> u64 {
        self.ttl_ms
            .saturating_sub(now_ms.saturating_sub(self.established_at_ms))
    }
}

/// Generate a fresh 32-byte handshake nonce.
///
/// # Errors
/// Fails only on entropy-source failure, which is fatal for the
/// session.
pub fn generate_nonce() -> Result<[u8; 32]> {
    let mut nonce = [0u8; 32];
    rand::rngs::OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|e| Error::Entropy(e.to_string()))?;
    Ok(nonce)
}

/// Generate a random 16-byte session id.
pub fn generate_session_id() -> Result<[u8; 16]> {
    let mut id = [0u8; 16];
    rand::rngs::OsRng
        .try_fill_bytes(&mut id)
        .map_err(|e| Error::Entropy(e.to_string()))?;
    Ok(id)
}
