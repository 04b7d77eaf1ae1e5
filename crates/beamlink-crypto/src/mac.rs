//! Coupling MAC (HMAC-SHA256).
//!
//! The secondary channel attests to the bytes carried on the primary
//! channel before any session key exists. The only material both sides
//! hold at that point is the handshake nonce itself, so the tag is
//! keyed by the nonce over the session id and the primary payload. This
//! binds the two channels together: forging one channel is useless
//! without forging matching content on the other within the correlation
//! window.

use crate::{Error, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Compute the coupling tag for a primary-channel payload.
pub fn coupling_tag(
    nonce: &[u8; 32],
    session_id: &[u8; 16],
    primary_payload: &[u8],
) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(nonce)
        .map_err(|_| Error::Mac("invalid HMAC key length".into()))?;
    mac.update(session_id);
    mac.update(primary_payload);

    let mut tag = [0u8; 32];
    tag.copy_from_slice(&mac.finalize().into_bytes());
    Ok(tag)
}

/// Verify a coupling tag in constant time.
pub fn verify_coupling_tag(
    nonce: &[u8; 32],
    session_id: &[u8; 16],
    primary_payload: &[u8],
    tag: &[u8; 32],
) -> Result<bool> {
    let expected = coupling_tag(nonce, session_id, primary_payload)?;
    Ok(expected.ct_eq(tag).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_verifies() {
        let nonce = [0x55u8; 32];
        let session_id = [0x01u8; 16];
        let payload = b"challenge frame bytes";

        let tag = coupling_tag(&nonce, &session_id, payload).unwrap();
        assert!(verify_coupling_tag(&nonce, &session_id, payload, &tag).unwrap());
    }

    #[test]
    fn test_wrong_nonce_rejected() {
        let session_id = [0x01u8; 16];
        let payload = b"challenge frame bytes";

        let tag = coupling_tag(&[0x55u8; 32], &session_id, payload).unwrap();
        assert!(!verify_coupling_tag(&[0x56u8; 32], &session_id, payload, &tag).unwrap());
    }

    #[test]
    fn test_payload_tamper_rejected() {
        let nonce = [0x55u8; 32];
        let session_id = [0x01u8; 16];

        let tag = coupling_tag(&nonce, &session_id, b"original payload").unwrap();
        assert!(!verify_coupling_tag(&nonce, &session_id, b"tampered payload", &tag).unwrap());
    }

    #[test]
    fn test_session_id_tamper_rejected() {
        let nonce = [0x55u8; 32];
        let payload = b"challenge frame bytes";

        let tag = coupling_tag(&nonce, &[0x01u8; 16], payload).unwrap();
        assert!(!verify_coupling_tag(&nonce, &[0x02u8; 16], payload, &tag).unwrap());
    }
}
