//! Typed engine events.
//!
//! The transport engine publishes one `Event` per observable lifecycle
//! step on a broadcast channel. Events carry copies of small values and
//! never key material; consumers (audit storage, a pairing UI) subscribe
//! and observe without being able to influence the protocol.

use crate::error::ErrorCode;
use crate::session::{HandshakePhase, Role, SessionId};
use crate::validator::{TrustLevel, ValidationFailure};

/// Why a session left the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by local request.
    Requested,
    /// Terminal protocol failure with the given wire code.
    Failed(ErrorCode),
}

/// Engine event stream payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A session entered the engine.
    SessionStarted {
        /// Session the event belongs to.
        id: SessionId,
        /// Local role in the session.
        role: Role,
    },

    /// The session's handshake phase changed.
    StateChanged {
        /// Session the event belongs to.
        id: SessionId,
        /// Phase after the transition.
        state: HandshakePhase,
    },

    /// The coupling validator ruled on a sample pair.
    ///
    /// Accepted verdicts carry the trust level and composite confidence;
    /// rejected ones carry the typed failure instead.
    ValidatorVerdict {
        /// Session the event belongs to.
        id: SessionId,
        /// Whether the bundle was accepted.
        accepted: bool,
        /// Trust level of an accepted bundle.
        trust: Option<TrustLevel>,
        /// Composite confidence of an accepted bundle.
        confidence: Option<f32>,
        /// Typed rejection when the bundle was refused.
        failure: Option<ValidationFailure>,
    },

    /// A cryptographic operation failed.
    CryptoFailure {
        /// Session the event belongs to.
        id: SessionId,
        /// Failure description, free of key material.
        detail: String,
    },

    /// A codeword could not be corrected.
    ///
    /// Damage can make the codeword header unreadable, in which case the
    /// frame inside never surfaces and no session can be attributed.
    EccDecodeFailure {
        /// Session the codeword belonged to, when attributable.
        id: Option<SessionId>,
    },

    /// The session fell back to single-channel trust.
    DegradedModeEntered {
        /// Session the event belongs to.
        id: SessionId,
    },

    /// A peer crossed the security-failure threshold and is now refused.
    PeerQuarantined {
        /// Peer hint as supplied at initiation.
        peer: String,
    },

    /// A session left the engine; its key material has been destroyed.
    SessionClosed {
        /// Session the event belongs to.
        id: SessionId,
        /// Why the session ended.
        reason: CloseReason,
    },
}

impl Event {
    /// Session id the event is attributed to, when it has one.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Event::SessionStarted { id, .. }
            | Event::StateChanged { id, .. }
            | Event::ValidatorVerdict { id, .. }
            | Event::CryptoFailure { id, .. }
            | Event::DegradedModeEntered { id }
            | Event::SessionClosed { id, .. } => Some(id),
            Event::EccDecodeFailure { id } => id.as_ref(),
            Event::PeerQuarantined { .. } => None,
        }
    }
}
