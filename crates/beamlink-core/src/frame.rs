//! Handshake and data frame parsing and serialization.
//!
//! Six frame types carry the whole protocol:
//! - `Challenge` and `Response` on the primary channel,
//! - `CouplingMark` as the secondary-channel attestation,
//! - `KeyConfirm` for key-agreement proof in both directions,
//! - `Data` for authenticated application payloads,
//! - `ErrorFrame` for typed failure signaling.
//!
//! The challenge starts with a cleartext preamble (protocol version and
//! redundancy profile) so profile negotiation works before any key exists.
//! All multi-byte integers use little-endian byte order. `parse` never
//! panics on arbitrary input.

use crate::ecc::{EccProfile, InnerRate};
use crate::{Error, ErrorCode, Result};

/// Protocol version carried in the challenge preamble.
pub const PROTOCOL_VERSION: u16 = 0x0001;

// Frame magic numbers (4 bytes, ASCII mnemonic)
/// Magic number for Challenge frames (0x424C4348 = "BLCH").
pub const MAGIC_CHALLENGE: u32 = 0x424C_4348;
/// Magic number for CouplingMark frames (0x424C434D = "BLCM").
pub const MAGIC_COUPLING_MARK: u32 = 0x424C_434D;
/// Magic number for Response frames (0x424C5253 = "BLRS").
pub const MAGIC_RESPONSE: u32 = 0x424C_5253;
/// Magic number for KeyConfirm frames (0x424C4B43 = "BLKC").
pub const MAGIC_KEY_CONFIRM: u32 = 0x424C_4B43;
/// Magic number for Data frames (0x424C4441 = "BLDA").
pub const MAGIC_DATA: u32 = 0x424C_4441;
/// Magic number for ErrorFrame (0x424C4552 = "BLER").
pub const MAGIC_ERROR: u32 = 0x424C_4552;

// Frame type identifiers (1 byte)
/// Type identifier for Challenge frames (0x01).
pub const TYPE_CHALLENGE: u8 = 0x01;
/// Type identifier for CouplingMark frames (0x02).
pub const TYPE_COUPLING_MARK: u8 = 0x02;
/// Type identifier for Response frames (0x03).
pub const TYPE_RESPONSE: u8 = 0x03;
/// Type identifier for KeyConfirm frames (0x04).
pub const TYPE_KEY_CONFIRM: u8 = 0x04;
/// Type identifier for Data frames (0x40).
pub const TYPE_DATA: u8 = 0x40;
/// Type identifier for ErrorFrame (0x60).
pub const TYPE_ERROR: u8 = 0x60;

/// Protocol frame types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Challenge - handshake initiation, sent on the primary channel.
    Challenge {
        /// Protocol version (cleartext preamble).
        version: u16,
        /// Redundancy profile for subsequent codewords (cleartext preamble).
        profile: EccProfile,
        /// Session identifier (16 bytes).
        session_id: [u8; 16],
        /// Initiator nonce (32 bytes), fresh per attempt.
        nonce: [u8; 32],
        /// Initiator X25519 public key (32 bytes).
        public_key: [u8; 32],
    },

    /// CouplingMark - secondary-channel attestation pairing with a primary
    /// frame sent in the same instant.
    CouplingMark {
        /// Session identifier (16 bytes).
        session_id: [u8; 16],
        /// Nonce keying the coupling MAC (32 bytes).
        nonce: [u8; 32],
        /// Capture timestamp in milliseconds.
        timestamp_ms: u64,
        /// HMAC-SHA256 over the paired primary frame bytes (32 bytes).
        tag: [u8; 32],
    },

    /// Response - responder's answer on the primary channel.
    Response {
        /// Session identifier (16 bytes).
        session_id: [u8; 16],
        /// Responder nonce (32 bytes).
        nonce: [u8; 32],
        /// Responder X25519 public key (32 bytes).
        public_key: [u8; 32],
        /// MAC over the received challenge bytes, keyed by the responder
        /// nonce; binds this response to one exact challenge (32 bytes).
        challenge_tag: [u8; 32],
    },

    /// KeyConfirm - proves session-key agreement, one per direction.
    KeyConfirm {
        /// Session identifier (16 bytes).
        session_id: [u8; 16],
        /// Per-direction confirmation tag (32 bytes).
        confirm_tag: [u8; 32],
    },

    /// Data - AEAD-protected application payload.
    Data {
        /// Session identifier (16 bytes).
        session_id: [u8; 16],
        /// Per-direction sequence number, strictly increasing.
        sequence: u64,
        /// Ciphertext followed by the 16-byte authentication tag.
        ciphertext: Vec<u8>,
    },

    /// ErrorFrame - typed failure signal.
    ErrorFrame {
        /// Session identifier (16 bytes).
        session_id: [u8; 16],
        /// Wire error code.
        code: ErrorCode,
    },
}

impl Frame {
    /// Parse a frame from bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 5 {
            return Err(Error::InsufficientData(5));
        }

        let magic = read_u32_le(&data[0..4]);
        let frame_type = data[4];

        match (magic, frame_type) {
            (MAGIC_CHALLENGE, TYPE_CHALLENGE) => Self::parse_challenge(&data[5..]),
            (MAGIC_COUPLING_MARK, TYPE_COUPLING_MARK) => Self::parse_coupling_mark(&data[5..]),
            (MAGIC_RESPONSE, TYPE_RESPONSE) => Self::parse_response(&data[5..]),
            (MAGIC_KEY_CONFIRM, TYPE_KEY_CONFIRM) => Self::parse_key_confirm(&data[5..]),
            (MAGIC_DATA, TYPE_DATA) => Self::parse_data(&data[5..]),
            (MAGIC_ERROR, TYPE_ERROR) => Self::parse_error_frame(&data[5..]),
            _ => Err(Error::InvalidFrame(format!(
                "Unknown frame: magic=0x{:08X}, type=0x{:02X}",
                magic, frame_type
            ))),
        }
    }

    /// Serialize frame to bytes.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        match self {
            Frame::Challenge { .. } => self.serialize_challenge(),
            Frame::CouplingMark { .. } => self.serialize_coupling_mark(),
            Frame::Response { .. } => self.serialize_response(),
            Frame::KeyConfirm { .. } => self.serialize_key_confirm(),
            Frame::Data { .. } => self.serialize_data(),
            Frame::ErrorFrame { .. } => self.serialize_error_frame(),
        }
    }

    /// Session identifier carried by this frame.
    pub fn session_id(&self) -> &[u8; 16] {
        match self {
            Frame::Challenge { session_id, .. }
            | Frame::CouplingMark { session_id, .. }
            | Frame::Response { session_id, .. }
            | Frame::KeyConfirm { session_id, .. }
            | Frame::Data { session_id, .. }
            | Frame::ErrorFrame { session_id, .. } => session_id,
        }
    }

    // === Challenge ===

    fn parse_challenge(data: &[u8]) -> Result<Self> {
        let mut offset = 0;

        check_len(data, offset + 2)?;
        let version = read_u16_le(&data[offset..offset + 2]);
        offset += 2;

        check_len(data, offset + 4)?;
        let inner_rate = InnerRate::from_u8(data[offset + 2]).ok_or_else(|| {
            Error::InvalidFrame(format!("Unknown inner rate id: 0x{:02X}", data[offset + 2]))
        })?;
        let profile = EccProfile {
            data_shards: data[offset],
            parity_shards: data[offset + 1],
            inner_rate,
            interleave_depth: data[offset + 3],
        };
        offset += 4;

        check_len(data, offset + 16)?;
        let mut session_id = [0u8; 16];
        session_id.copy_from_slice(&data[offset..offset + 16]);
        offset += 16;

        check_len(data, offset + 32)?;
        let mut nonce = [0u8; 32];
        nonce.copy_from_slice(&data[offset..offset + 32]);
        offset += 32;

        check_len(data, offset + 32)?;
        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(&data[offset..offset + 32]);

        Ok(Frame::Challenge {
            version,
            profile,
            session_id,
            nonce,
            public_key,
        })
    }

    fn serialize_challenge(&self) -> Result<Vec<u8>> {
        if let Frame::Challenge {
            version,
            profile,
            session_id,
            nonce,
            public_key,
        } = self
        {
            let mut buf = Vec::new();
            buf.extend_from_slice(&MAGIC_CHALLENGE.to_le_bytes());
            buf.push(TYPE_CHALLENGE);
            buf.extend_from_slice(&version.to_le_bytes());
            buf.push(profile.data_shards);
            buf.push(profile.parity_shards);
            buf.push(profile.inner_rate.to_u8());
            buf.push(profile.interleave_depth);
            buf.extend_from_slice(session_id);
            buf.extend_from_slice(nonce);
            buf.extend_from_slice(public_key);
            Ok(buf)
        } else {
            Err(Error::InvalidFrame("Wrong frame type".into()))
        }
    }

    // === CouplingMark ===

    fn parse_coupling_mark(data: &[u8]) -> Result<Self> {
        let mut offset = 0;

        check_len(data, offset + 16)?;
        let mut session_id = [0u8; 16];
        session_id.copy_from_slice(&data[offset..offset + 16]);
        offset += 16;

        check_len(data, offset + 32)?;
        let mut nonce = [0u8; 32];
        nonce.copy_from_slice(&data[offset..offset + 32]);
        offset += 32;

        check_len(data, offset + 8)?;
        let timestamp_ms = read_u64_le(&data[offset..offset + 8]);
        offset += 8;

        check_len(data, offset + 32)?;
        let mut tag = [0u8; 32];
        tag.copy_from_slice(&data[offset..offset + 32]);

        Ok(Frame::CouplingMark {
            session_id,
            nonce,
            timestamp_ms,
            tag,
        })
    }

    fn serialize_coupling_mark(&self) -> Result<Vec<u8>> {
        if let Frame::CouplingMark {
            session_id,
            nonce,
            timestamp_ms,
            tag,
        } = self
        {
            let mut buf = Vec::new();
            buf.extend_from_slice(&MAGIC_COUPLING_MARK.to_le_bytes());
            buf.push(TYPE_COUPLING_MARK);
            buf.extend_from_slice(session_id);
            buf.extend_from_slice(nonce);
            buf.extend_from_slice(&timestamp_ms.to_le_bytes());
            buf.extend_from_slice(tag);
            Ok(buf)
        } else {
            Err(Error::InvalidFrame("Wrong frame type".into()))
        }
    }

    // === Response ===

    fn parse_response(data: &[u8]) -> Result<Self> {
        let mut offset = 0;

        check_len(data, offset + 16)?;
        let mut session_id = [0u8; 16];
        session_id.copy_from_slice(&data[offset..offset + 16]);
        offset += 16;

        check_len(data, offset + 32)?;
        let mut nonce = [0u8; 32];
        nonce.copy_from_slice(&data[offset..offset + 32]);
        offset += 32;

        check_len(data, offset + 32)?;
        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(&data[offset..offset + 32]);
        offset += 32;

        check_len(data, offset + 32)?;
        let mut challenge_tag = [0u8; 32];
        challenge_tag.copy_from_slice(&data[offset..offset + 32]);

        Ok(Frame::Response {
            session_id,
            nonce,
            public_key,
            challenge_tag,
        })
    }

    fn serialize_response(&self) -> Result<Vec<u8>> {
        if let Frame::Response {
            session_id,
            nonce,
            public_key,
            challenge_tag,
        } = self
        {
            let mut buf = Vec::new();
            buf.extend_from_slice(&MAGIC_RESPONSE.to_le_bytes());
            buf.push(TYPE_RESPONSE);
            buf.extend_from_slice(session_id);
            buf.extend_from_slice(nonce);
            buf.extend_from_slice(public_key);
            buf.extend_from_slice(challenge_tag);
            Ok(buf)
        } else {
            Err(Error::InvalidFrame("Wrong frame type".into()))
        }
    }

    // === KeyConfirm ===

    fn parse_key_confirm(data: &[u8]) -> Result<Self> {
        let mut offset = 0;

        check_len(data, offset + 16)?;
        let mut session_id = [0u8; 16];
        session_id.copy_from_slice(&data[offset..offset + 16]);
        offset += 16;

        check_len(data, offset + 32)?;
        let mut confirm_tag = [0u8; 32];
        confirm_tag.copy_from_slice(&data[offset..offset + 32]);

        Ok(Frame::KeyConfirm {
            session_id,
            confirm_tag,
        })
    }

    fn serialize_key_confirm(&self) -> Result<Vec<u8>> {
        if let Frame::KeyConfirm {
            session_id,
            confirm_tag,
        } = self
        {
            let mut buf = Vec::new();
            buf.extend_from_slice(&MAGIC_KEY_CONFIRM.to_le_bytes());
            buf.push(TYPE_KEY_CONFIRM);
            buf.extend_from_slice(session_id);
            buf.extend_from_slice(confirm_tag);
            Ok(buf)
        } else {
            Err(Error::InvalidFrame("Wrong frame type".into()))
        }
    }

    // === Data ===

    fn parse_data(data: &[u8]) -> Result<Self> {
        let mut offset = 0;

        check_len(data, offset + 16)?;
        let mut session_id = [0u8; 16];
        session_id.copy_from_slice(&data[offset..offset + 16]);
        offset += 16;

        check_len(data, offset + 8)?;
        let sequence = read_u64_le(&data[offset..offset + 8]);
        offset += 8;

        check_len(data, offset + 4)?;
        let length = read_u32_le(&data[offset..offset + 4]) as usize;
        offset += 4;

        check_len(data, offset + length)?;
        let ciphertext = data[offset..offset + length].to_vec();

        Ok(Frame::Data {
            session_id,
            sequence,
            ciphertext,
        })
    }

    fn serialize_data(&self) -> Result<Vec<u8>> {
        if let Frame::Data {
            session_id,
            sequence,
            ciphertext,
        } = self
        {
            let mut buf = Vec::new();
            buf.extend_from_slice(&MAGIC_DATA.to_le_bytes());
            buf.push(TYPE_DATA);
            buf.extend_from_slice(session_id);
            buf.extend_from_slice(&sequence.to_le_bytes());
            buf.extend_from_slice(&(ciphertext.len() as u32).to_le_bytes());
            buf.extend_from_slice(ciphertext);
            Ok(buf)
        } else {
            Err(Error::InvalidFrame("Wrong frame type".into()))
        }
    }

    // === ErrorFrame ===

    fn parse_error_frame(data: &[u8]) -> Result<Self> {
        check_len(data, 20)?;
        let mut session_id = [0u8; 16];
        session_id.copy_from_slice(&data[0..16]);
        let code = ErrorCode::from_u8(data[16]).ok_or_else(|| {
            Error::InvalidFrame(format!("Unknown error code: 0x{:02X}", data[16]))
        })?;
        // reserved: 3 bytes (ignore)
        Ok(Frame::ErrorFrame { session_id, code })
    }

    fn serialize_error_frame(&self) -> Result<Vec<u8>> {
        if let Frame::ErrorFrame { session_id, code } = self {
            let mut buf = Vec::new();
            buf.extend_from_slice(&MAGIC_ERROR.to_le_bytes());
            buf.push(TYPE_ERROR);
            buf.extend_from_slice(session_id);
            buf.push(code.to_u8());
            buf.extend_from_slice(&[0u8; 3]); // reserved
            Ok(buf)
        } else {
            Err(Error::InvalidFrame("Wrong frame type".into()))
        }
    }
}

// === Helper functions ===

#[inline]
fn check_len(data: &[u8], needed: usize) -> Result<()> {
    if data.len() < needed {
        Err(Error::InsufficientData(needed))
    } else {
        Ok(())
    }
}

#[inline]
fn read_u16_le(data: &[u8]) -> u16 {
    u16::from_le_bytes([data[0], data[1]])
}

#[inline]
fn read_u32_le(data: &[u8]) -> u32 {
    u32::from_le_bytes([data[0], data[1], data[2], data[3]])
}

#[inline]
fn read_u64_le(data: &[u8]) -> u64 {
    u64::from_le_bytes([
        data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_challenge() -> Frame {
        Frame::Challenge {
            version: PROTOCOL_VERSION,
            profile: EccProfile::default(),
            session_id: [0x11; 16],
            nonce: [0x42; 32],
            public_key: [0x99; 32],
        }
    }

    #[test]
    fn test_challenge_roundtrip() {
        let frame = sample_challenge();
        let serialized = frame.serialize().expect("serialize failed");
        let parsed = Frame::parse(&serialized).expect("parse failed");
        assert_eq!(frame, parsed);
    }

    #[test]
    fn test_coupling_mark_roundtrip() {
        let frame = Frame::CouplingMark {
            session_id: [0x11; 16],
            nonce: [0x42; 32],
            timestamp_ms: 1_724_000_123,
            tag: [0xAB; 32],
        };

        let serialized = frame.serialize().expect("serialize failed");
        let parsed = Frame::parse(&serialized).expect("parse failed");
        assert_eq!(frame, parsed);
    }

    #[test]
    fn test_response_roundtrip() {
        let frame = Frame::Response {
            session_id: [0x11; 16],
            nonce: [0x24; 32],
            public_key: [0x77; 32],
            challenge_tag: [0xCD; 32],
        };

        let serialized = frame.serialize().expect("serialize failed");
        let parsed = Frame::parse(&serialized).expect("parse failed");
        assert_eq!(frame, parsed);
    }

    #[test]
    fn test_key_confirm_roundtrip() {
        let frame = Frame::KeyConfirm {
            session_id: [0x11; 16],
            confirm_tag: [0x5A; 32],
        };

        let serialized = frame.serialize().expect("serialize failed");
        let parsed = Frame::parse(&serialized).expect("parse failed");
        assert_eq!(frame, parsed);
    }

    #[test]
    fn test_data_roundtrip() {
        let frame = Frame::Data {
            session_id: [0x11; 16],
            sequence: 7,
            ciphertext: b"opaque payload bytes plus tag".to_vec(),
        };

        let serialized = frame.serialize().expect("serialize failed");
        let parsed = Frame::parse(&serialized).expect("parse failed");
        assert_eq!(frame, parsed);
    }

    #[test]
    fn test_error_frame_roundtrip() {
        let frame = Frame::ErrorFrame {
            session_id: [0x11; 16],
            code: ErrorCode::TransportTimeout,
        };

        let serialized = frame.serialize().expect("serialize failed");
        let parsed = Frame::parse(&serialized).expect("parse failed");
        assert_eq!(frame, parsed);
    }

    #[test]
    fn test_session_id_accessor() {
        let frame = sample_challenge();
        assert_eq!(frame.session_id(), &[0x11; 16]);
    }

    #[test]
    fn test_short_input_rejected() {
        assert!(matches!(Frame::parse(&[]), Err(Error::InsufficientData(5))));
        assert!(matches!(
            Frame::parse(&[0x42, 0x4C]),
            Err(Error::InsufficientData(5))
        ));
    }

    #[test]
    fn test_truncation_rejected_for_every_type() {
        let frames = [
            sample_challenge(),
            Frame::CouplingMark {
                session_id: [1; 16],
                nonce: [2; 32],
                timestamp_ms: 3,
                tag: [4; 32],
            },
            Frame::Response {
                session_id: [1; 16],
                nonce: [2; 32],
                public_key: [3; 32],
                challenge_tag: [4; 32],
            },
            Frame::KeyConfirm {
                session_id: [1; 16],
                confirm_tag: [2; 32],
            },
            Frame::Data {
                session_id: [1; 16],
                sequence: 9,
                ciphertext: vec![0xEE; 24],
            },
            Frame::ErrorFrame {
                session_id: [1; 16],
                code: ErrorCode::KeyExpired,
            },
        ];

        for frame in frames {
            let serialized = frame.serialize().expect("serialize failed");
            let truncated = &serialized[..serialized.len() - 1];
            assert!(
                matches!(Frame::parse(truncated), Err(Error::InsufficientData(_))),
                "truncation accepted for {:?}",
                frame
            );
        }
    }

    #[test]
    fn test_unknown_magic_rejected() {
        let mut serialized = sample_challenge().serialize().expect("serialize failed");
        serialized[0] ^= 0xFF;
        assert!(matches!(
            Frame::parse(&serialized),
            Err(Error::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_mismatched_type_byte_rejected() {
        let mut serialized = sample_challenge().serialize().expect("serialize failed");
        serialized[4] = TYPE_RESPONSE;
        assert!(matches!(
            Frame::parse(&serialized),
            Err(Error::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_unknown_rate_id_rejected() {
        let mut serialized = sample_challenge().serialize().expect("serialize failed");
        // Rate id sits after magic, type and version in the preamble.
        serialized[9] = 0x55;
        assert!(matches!(
            Frame::parse(&serialized),
            Err(Error::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_unknown_error_code_rejected() {
        let frame = Frame::ErrorFrame {
            session_id: [1; 16],
            code: ErrorCode::CryptoFailure,
        };
        let mut serialized = frame.serialize().expect("serialize failed");
        serialized[21] = 0xEE;
        assert!(matches!(
            Frame::parse(&serialized),
            Err(Error::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_data_length_field_bounds_payload() {
        let frame = Frame::Data {
            session_id: [1; 16],
            sequence: 1,
            ciphertext: vec![0xAA; 8],
        };
        let mut serialized = frame.serialize().expect("serialize failed");
        // Inflate the length field beyond the available bytes.
        let len_offset = 5 + 16 + 8;
        serialized[len_offset..len_offset + 4].copy_from_slice(&1000u32.to_le_bytes());
        assert!(matches!(
            Frame::parse(&serialized),
            Err(Error::InsufficientData(_))
        ));
    }
}
