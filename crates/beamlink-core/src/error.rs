//! Protocol error types and wire error codes.

use thiserror::Error;

use crate::validator::ValidationFailure;

/// Result type alias.
pub type Result<T> = core::result::Result<T, Error>;

/// Protocol errors.
///
/// Variants are split along the retry policy: transient failures
/// (`TransportTimeout`, `EccUncorrectable`) may be retried with the same
/// material; security-relevant failures (`Correlation`, `Crypto`) force a
/// fresh nonce and keypair and count toward peer quarantine.
#[derive(Debug, Error)]
pub enum Error {
    /// No valid peer response arrived before the deadline.
    #[error("Timed out waiting for the peer")]
    TransportTimeout,

    /// Cross-channel coupling validation rejected a sample pair.
    #[error("Coupling validation failed: {0}")]
    Correlation(#[from] ValidationFailure),

    /// Cryptographic failure (invalid peer key, tag mismatch, entropy).
    #[error("Crypto failure: {0}")]
    Crypto(#[from] beamlink_crypto::Error),

    /// Codeword damage exceeds the correction capacity of the profile.
    #[error("Uncorrectable codeword")]
    EccUncorrectable,

    /// A required physical channel is not present or not usable.
    #[error("Channel unavailable: {0}")]
    ResourceUnavailable(String),

    /// Operation not permitted in the current handshake state.
    #[error("Invalid state for operation")]
    InvalidState,

    /// Frame violates the wire format.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Not enough bytes to parse.
    #[error("Insufficient data: need {0} bytes")]
    InsufficientData(usize),

    /// Data frame sequence number does not advance past the last accepted.
    #[error("Sequence {received} does not advance past {last_accepted}")]
    SequenceRegression {
        /// Last sequence number accepted from the peer.
        last_accepted: u64,
        /// Sequence number carried by the rejected frame.
        received: u64,
    },

    /// Session key TTL has elapsed; re-handshake or close.
    #[error("Session key expired")]
    KeyExpired,

    /// Retry budget exhausted without a successful exchange.
    #[error("Retries exhausted")]
    RetriesExhausted,

    /// Peer is quarantined after repeated security failures.
    #[error("Peer quarantined")]
    PeerQuarantined,

    /// No session with the given id.
    #[error("Session not found")]
    SessionNotFound,

    /// Session has already been closed.
    #[error("Session closed")]
    SessionClosed,
}

impl Error {
    /// Wire error code for this error, carried in `ErrorFrame`.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::TransportTimeout => ErrorCode::TransportTimeout,
            Error::Correlation(_) => ErrorCode::CorrelationFailure,
            Error::Crypto(_) => ErrorCode::CryptoFailure,
            Error::EccUncorrectable => ErrorCode::EccUncorrectable,
            Error::ResourceUnavailable(_) => ErrorCode::ResourceUnavailable,
            Error::InvalidState => ErrorCode::InvalidState,
            Error::InvalidFrame(_) => ErrorCode::InvalidFrame,
            Error::InsufficientData(_) => ErrorCode::InvalidFrame,
            Error::SequenceRegression { .. } => ErrorCode::SequenceRegression,
            Error::KeyExpired => ErrorCode::KeyExpired,
            Error::RetriesExhausted => ErrorCode::RetriesExhausted,
            Error::PeerQuarantined => ErrorCode::PeerQuarantined,
            Error::SessionNotFound => ErrorCode::SessionNotFound,
            Error::SessionClosed => ErrorCode::SessionClosed,
        }
    }

    /// True for failures that must never be retried with the same
    /// cryptographic material.
    pub fn is_security_relevant(&self) -> bool {
        matches!(self, Error::Correlation(_) | Error::Crypto(_))
    }
}

/// Wire error codes carried in `ErrorFrame`.
///
/// Values are stable across releases; new codes append, never renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    /// Peer response deadline elapsed (0x01).
    TransportTimeout = 0x01,
    /// Coupling validation rejected the sample pair (0x02).
    CorrelationFailure = 0x02,
    /// Key exchange or AEAD failure (0x03).
    CryptoFailure = 0x03,
    /// Codeword could not be corrected (0x04).
    EccUncorrectable = 0x04,
    /// Required channel absent or unusable (0x05).
    ResourceUnavailable = 0x05,
    /// Operation invalid in the current state (0x06).
    InvalidState = 0x06,
    /// Malformed or truncated frame (0x07).
    InvalidFrame = 0x07,
    /// Data sequence number regressed (0x08).
    SequenceRegression = 0x08,
    /// Session key TTL elapsed (0x09).
    KeyExpired = 0x09,
    /// Retry budget exhausted (0x0A).
    RetriesExhausted = 0x0A,
    /// Peer refused due to quarantine (0x0B).
    PeerQuarantined = 0x0B,
    /// Unknown session id (0x0C).
    SessionNotFound = 0x0C,
    /// Session already closed (0x0D).
    SessionClosed = 0x0D,
}

impl ErrorCode {
    /// Convert to wire byte.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Parse from wire byte. Returns `None` for unknown codes.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ErrorCode::TransportTimeout),
            0x02 => Some(ErrorCode::CorrelationFailure),
            0x03 => Some(ErrorCode::CryptoFailure),
            0x04 => Some(ErrorCode::EccUncorrectable),
            0x05 => Some(ErrorCode::ResourceUnavailable),
            0x06 => Some(ErrorCode::InvalidState),
            0x07 => Some(ErrorCode::InvalidFrame),
            0x08 => Some(ErrorCode::SequenceRegression),
            0x09 => Some(ErrorCode::KeyExpired),
            0x0A => Some(ErrorCode::RetriesExhausted),
            0x0B => Some(ErrorCode::PeerQuarantined),
            0x0C => Some(ErrorCode::SessionNotFound),
            0x0D => Some(ErrorCode::SessionClosed),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_roundtrip() {
        let codes = [
            ErrorCode::TransportTimeout,
            ErrorCode::CorrelationFailure,
            ErrorCode::CryptoFailure,
            ErrorCode::EccUncorrectable,
            ErrorCode::ResourceUnavailable,
            ErrorCode::InvalidState,
            ErrorCode::InvalidFrame,
            ErrorCode::SequenceRegression,
            ErrorCode::KeyExpired,
            ErrorCode::RetriesExhausted,
            ErrorCode::PeerQuarantined,
            ErrorCode::SessionNotFound,
            ErrorCode::SessionClosed,
        ];
        for code in codes {
            assert_eq!(ErrorCode::from_u8(code.to_u8()), Some(code));
        }
    }

    #[test]
    fn test_unknown_error_code_rejected() {
        assert_eq!(ErrorCode::from_u8(0x00), None);
        assert_eq!(ErrorCode::from_u8(0x0E), None);
        assert_eq!(ErrorCode::from_u8(0xFF), None);
    }

    #[test]
    fn test_security_relevance_split() {
        use crate::validator::ValidationFailure;

        assert!(Error::Correlation(ValidationFailure::MacMismatch).is_security_relevant());
        assert!(Error::Crypto(beamlink_crypto::Error::AuthFailure).is_security_relevant());
        assert!(!Error::TransportTimeout.is_security_relevant());
        assert!(!Error::EccUncorrectable.is_security_relevant());
    }
}
