//! Physical-channel transport for the beamlink pairing protocol.
//!
//! Drives [`beamlink_core`] sessions over real or simulated physical
//! channels:
//! - Channel abstraction and per-engine registry ([`channel`])
//! - The async session engine with driver tasks, quarantine and a typed
//!   event stream ([`engine`])
//! - An in-process simulated channel pair for tests and demos ([`sim`])
//!
//! The core decides and never waits; this crate moves bytes and owns
//! all waiting.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod channel;
pub mod engine;
pub mod error;
pub mod sim;

pub use channel::{ChannelRegistry, PhysicalChannel};
pub use engine::{Engine, EngineConfig};
pub use error::{Error, Result};
