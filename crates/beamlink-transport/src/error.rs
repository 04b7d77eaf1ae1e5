//! Transport layer errors.

use thiserror::Error;

/// Result type alias for transport operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Transport layer errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Emission or capture failed on a physical channel.
    #[error("Channel failure: {0}")]
    ChannelFailed(String),

    /// Protocol error bubbled up from the core.
    #[error("Protocol error: {0}")]
    Protocol(#[from] beamlink_core::Error),

    /// I/O error from a hardware channel backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this failure must never be retried with the same
    /// cryptographic material.
    pub fn is_security_relevant(&self) -> bool {
        matches!(self, Error::Protocol(inner) if inner.is_security_relevant())
    }
}
