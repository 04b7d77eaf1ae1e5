//! Key derivation (HKDF-SHA256, RFC 5869).
//!
//! The session key is bound to the shared secret, both parties' nonces
//! and the session id, so a key derived for one session can never be
//! replayed into another even if an attacker replays individual
//! handshake fields.

use crate::{Error, Result};
use hkdf::Hkdf;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// Which side of the handshake a confirmation tag belongs to.
///
/// Initiator and responder tags use distinct derivation labels so one
/// side's tag can never be reflected back as the other's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmSide {
    /// Tag sent by the session initiator.
    Initiator,
    /// Tag sent by the responder.
    Responder,
}

/// Generic HKDF-SHA256 derivation per RFC 5869.
///
/// # Arguments
/// * `ikm` - input key material
/// * `salt` - salt value (empty slice for no salt)
/// * `info` - context and application-specific information
/// * `output_len` - length of output key material
///
/// # Returns
/// Derived key material wrapped in `Zeroizing`.
pub fn hkdf_sha256(
    ikm: &[u8],
    salt: &[u8],
    info: &[u8],
    output_len: usize,
) -> Result<Zeroizing<Vec<u8>>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);

    let mut okm = vec![0u8; output_len];
    hk.expand(info, &mut okm)
        .map_err(|_| Error::KeyDerivation("HKDF expansion failed".into()))?;

    Ok(Zeroizing::new(okm))
}

/// Derive the symmetric session key for one pairing session.
///
/// Uses HKDF-SHA256 with:
/// - IKM: the X25519 shared secret
/// - Salt: `nonce_a ‖ nonce_b` (initiator nonce first)
/// - Info: `"beamlink-session-key" ‖ session_id`
/// - Length: 32 bytes
///
/// The output is one-way and indistinguishable from random without the
/// shared secret.
pub fn derive_session_key(
    shared_secret: &[u8],
    nonce_a: &[u8; 32],
    nonce_b: &[u8; 32],
    session_id: &[u8; 16],
) -> Result<Zeroizing<[u8; 32]>> {
    let mut salt = Vec::with_capacity(64);
    salt.extend_from_slice(nonce_a);
    salt.extend_from_slice(nonce_b);

    let mut info = Vec::with_capacity(20 + 16);
    info.extend_from_slice(b"beamlink-session-key");
    info.extend_from_slice(session_id);

    let okm = hkdf_sha256(shared_secret, &salt, &info, 32)?;

    let mut key = [0u8; 32];
    key.copy_from_slice(&okm);

    Ok(Zeroizing::new(key))
}

/// Derive the key-confirmation tag one side sends after key agreement.
///
/// Uses HKDF-SHA256 with:
/// - IKM: the freshly derived session key
/// - Salt: session id
/// - Info: `"beamlink-confirm-init"` or `"beamlink-confirm-resp"`
/// - Length: 32 bytes
///
/// Proves possession of the session key without exposing it; the
/// receiving side recomputes and compares in constant time.
pub fn derive_confirm_tag(
    session_key: &[u8; 32],
    session_id: &[u8; 16],
    side: ConfirmSide,
) -> Result<[u8; 32]> {
    let info: &[u8] = match side {
        ConfirmSide::Initiator => b"beamlink-confirm-init",
        ConfirmSide::Responder => b"beamlink-confirm-resp",
    };

    let okm = hkdf_sha256(session_key, session_id, info, 32)?;

    let mut tag = [0u8; 32];
    tag.copy_from_slice(&okm);

    Ok(tag)
}

/// Verify a received confirmation tag in constant time.
pub fn verify_confirm_tag(
    session_key: &[u8; 32],
    session_id: &[u8; 16],
    side: ConfirmSide,
    tag: &[u8; 32],
) -> Result<bool> {
    let expected = derive_confirm_tag(session_key, session_id, side)?;
    Ok(expected.ct_eq(tag).into())
}
