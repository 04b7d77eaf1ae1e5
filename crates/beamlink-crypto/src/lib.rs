//! Cryptographic primitives for the beamlink pairing protocol.
//!
//! This crate implements the session-establishment cryptography:
//! - Ephemeral key exchange (X25519, RFC 7748)
//! - AEAD payload protection (AES-256-GCM) with sequence-derived nonces
//! - Key derivation (HKDF-SHA256) binding keys to both nonces and the
//!   session id
//! - The coupling MAC that binds the secondary physical channel's
//!   attestation to the primary channel's bytes
//! - Session key lifecycle with short TTLs
//!
//! Security conventions, applied throughout:
//! - All secrets live in `Zeroizing` wrappers or zero-on-drop types
//! - Constant-time comparisons via the `subtle` crate
//! - No logging of key material, at any level
//! - Decryption fails closed: tag mismatch returns an error and nothing
//!   else

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aead;
pub mod error;
pub mod kdf;
pub mod kex;
pub mod keys;
pub mod mac;

pub use error::{Error, Result};
pub use kex::EphemeralKeyPair;
pub use keys::{KeyMaterial, SessionKey, DEFAULT_KEY_TTL_MS};
