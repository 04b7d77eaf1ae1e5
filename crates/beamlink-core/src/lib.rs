//! Core protocol engine for the beamlink pairing protocol.
//!
//! This crate implements the protocol logic of sub-second device pairing
//! over noisy physical channels:
//! - Frame parsing and serialization for the handshake and data phases
//! - The directional handshake state machine with retry, degraded-mode
//!   and key-TTL policy
//! - Dual-channel coupling validation (timestamp window, coupling MAC,
//!   nonce replay guard, quality floor)
//! - The adaptive concatenated error-correction codec and its
//!   link-quality-driven profile recommendation
//! - Typed events describing every observable lifecycle step
//!
//! The core is synchronous and clock-free: every time-dependent operation
//! takes the current time in milliseconds from the caller. All waiting,
//! I/O and scheduling live in beamlink-transport.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod ecc;
pub mod error;
pub mod event;
pub mod frame;
pub mod session;
pub mod validator;

pub use error::{Error, ErrorCode, Result};
pub use event::Event;
pub use frame::Frame;
pub use session::{Role, Session, SessionConfig, SessionId};
pub use validator::{ChannelKind, ChannelSample, CouplingValidator, TrustLevel};
