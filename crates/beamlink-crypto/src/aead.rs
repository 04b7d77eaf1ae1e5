//! Authenticated encryption (AES-256-GCM, NIST SP 800-38D).
//!
//! Payload frames are sealed with a nonce derived from the frame's
//! sequence number, so nonce uniqueness reduces to sequence uniqueness,
//! which the record layer enforces by construction. Decryption fails
//! closed: a tag mismatch returns [`Error::AuthFailure`] and never any
//! plaintext.

use crate::{Error, Result};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use zeroize::Zeroizing;

/// Build the 12-byte AEAD nonce for a frame sequence number.
///
/// Layout: `nonce[0:4] = 0x00000000`, `nonce[4:12] = sequence` in
/// little-endian. A (key, sequence) pair is therefore never reused as
/// long as sequences increase, which the session's record layer
/// guarantees.
///
/// # Example
/// ```
/// use beamlink_crypto::aead::construct_nonce;
///
/// let nonce = construct_nonce(0x4746454443424140);
/// assert_eq!(&nonce[0..4], &[0, 0, 0, 0]);
/// assert_eq!(&nonce[4..12], &[0x40, 0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47]);
/// ```
pub fn construct_nonce(sequence: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    // nonce[0:4] already zero
    nonce[4..12].copy_from_slice(&sequence.to_le_bytes());
    nonce
}

/// Encrypt and authenticate a payload frame.
///
/// # Arguments
/// * `key` - 32-byte session key
/// * `sequence` - frame sequence number, unique per direction per key
/// * `aad` - associated data (session id ‖ sequence), authenticated but
///   not encrypted
/// * `plaintext` - frame body
///
/// # Returns
/// Ciphertext with the 16-byte authentication tag appended.
pub fn seal(key: &[u8; 32], sequence: u64, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| Error::Encryption("invalid key length".into()))?;

    let nonce = construct_nonce(sequence);
    let payload = Payload {
        msg: plaintext,
        aad,
    };

    cipher
        .encrypt(Nonce::from_slice(&nonce), payload)
        .map_err(|_| Error::Encryption("AES-256-GCM encryption failed".into()))
}

/// Decrypt and verify a payload frame.
///
/// # Arguments
/// * `key` - 32-byte session key
/// * `sequence` - the sequence number the sender sealed with
/// * `aad` - associated data, must match the sealing side exactly
/// * `ciphertext_and_tag` - ciphertext with the appended 16-byte tag
///
/// # Returns
/// The plaintext wrapped in `Zeroizing` so it is cleared when dropped.
///
/// # Errors
/// Returns [`Error::AuthFailure`] on any tag mismatch. The failure
/// carries no detail on purpose; it is surfaced to callers as a
/// security event, not a parse error.
pub fn open(
    key: &[u8; 32],
    sequence: u64,
    aad: &[u8],
    ciphertext_and_tag: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|_| Error::Encryption("invalid key length".into()))?;

    let nonce = construct_nonce(sequence);
    let payload = Payload {
        msg: ciphertext_and_tag,
        aad,
    };

    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce), payload)
        .map_err(|_| Error::AuthFailure)?;

    Ok(Zeroizing::new(plaintext))
}
