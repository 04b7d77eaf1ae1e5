//! Error types for cryptographic operations.

use thiserror::Error;

/// Result type alias for cryptographic operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Cryptographic operation errors.
#[derive(Debug, Error)]
pub enum Error {
    /// The peer's public key is not a usable curve point.
    #[error("Invalid peer public key: {0}")]
    InvalidPeerKey(String),

    /// AEAD encryption failed.
    #[error("AEAD encryption failed: {0}")]
    Encryption(String),

    /// AEAD tag verification failed. No plaintext is ever returned
    /// alongside this error; treat it as a security event.
    #[error("AEAD authentication failed")]
    AuthFailure,

    /// Key derivation failed.
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    /// MAC computation failed.
    #[error("MAC computation failed: {0}")]
    Mac(String),

    /// The operating-system entropy source failed. Fatal and
    /// non-retryable.
    #[error("Entropy source failure: {0}")]
    Entropy(String),
}
