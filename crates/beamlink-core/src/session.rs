//! Handshake state machine and session lifecycle.
//!
//! Implements:
//! - The directional handshake (challenge / response / confirm legs) for
//!   both roles, with illegal transitions unrepresentable
//! - Retry policy: transient timeouts re-emit the same challenge with
//!   linear backoff; security failures destroy all material and return
//!   the machine to `Idle` so a restart uses a fresh nonce and keypair
//! - The authenticated data phase with strict per-direction sequence
//!   monotonicity and key-TTL gating
//!
//! The machine is synchronous and clock-free: every operation takes the
//! current time in milliseconds from the caller, so the transport layer
//! owns all actual waiting.

use beamlink_crypto::kdf::{self, ConfirmSide};
use beamlink_crypto::keys::generate_nonce;
use beamlink_crypto::mac;
use beamlink_crypto::{EphemeralKeyPair, KeyMaterial, SessionKey, DEFAULT_KEY_TTL_MS};
use zeroize::Zeroizing;

use crate::ecc::{EccProfile, InnerRate};
use crate::frame::{Frame, PROTOCOL_VERSION};
use crate::validator::{CoupledBundle, TrustLevel, ValidationFailure};
use crate::{Error, ErrorCode, Result};

/// Response budget for close-range pairing, in milliseconds.
pub const SHORT_RANGE_TIMEOUT_MS: u64 = 300;
/// Default response budget for extended-range links, in milliseconds.
pub const LONG_RANGE_TIMEOUT_MS: u64 = 2_000;

/// Session identifier: 16 random bytes, carried in every frame.
pub type SessionId = [u8; 16];

/// Session role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Emits the challenge and drives the handshake.
    Initiator,
    /// Answers an incoming challenge.
    Responder,
}

/// Operating range class, selecting the response budget and how much
/// redundancy the first codewords carry before any link measurement exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeProfile {
    /// Close range (centimeters to a few meters), 300 ms response budget.
    Short,
    /// Extended range (directional optical links), configurable budget.
    Long {
        /// Response budget in milliseconds.
        timeout_ms: u64,
    },
}

impl RangeProfile {
    /// Extended range with the default budget.
    pub fn long() -> Self {
        RangeProfile::Long {
            timeout_ms: LONG_RANGE_TIMEOUT_MS,
        }
    }

    /// Response budget in milliseconds.
    pub fn response_timeout_ms(&self) -> u64 {
        match self {
            RangeProfile::Short => SHORT_RANGE_TIMEOUT_MS,
            RangeProfile::Long { timeout_ms } => *timeout_ms,
        }
    }

    /// Redundancy profile announced in the challenge preamble, before any
    /// link-quality measurement exists. Long range starts conservative and
    /// leaves it to measured adaptation to lean out.
    pub fn default_ecc_profile(&self) -> EccProfile {
        match self {
            RangeProfile::Short => EccProfile::default(),
            RangeProfile::Long { .. } => EccProfile {
                data_shards: 16,
                parity_shards: 12,
                inner_rate: InnerRate::Half,
                interleave_depth: 8,
            },
        }
    }
}

impl Default for RangeProfile {
    fn default() -> Self {
        RangeProfile::Short
    }
}

/// Session configuration.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Operating range class.
    pub range_profile: RangeProfile,
    /// Maximum challenge retransmissions after the initial attempt.
    pub max_retries: u32,
    /// Linear backoff base: the n-th retry waits `base × n` milliseconds.
    pub retry_backoff_base_ms: u64,
    /// Session key time-to-live in milliseconds.
    pub key_ttl_ms: u64,
    /// Whether a session may form on the primary channel alone when the
    /// secondary channel is out of service.
    pub degraded_allowed: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            range_profile: RangeProfile::Short,
            max_retries: 3,
            retry_backoff_base_ms: 50,
            key_ttl_ms: DEFAULT_KEY_TTL_MS,
            degraded_allowed: false,
        }
    }
}

/// Externally visible handshake phase, carried in snapshots and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    /// No handshake in progress.
    Idle,
    /// Challenge handed to the transport, sends pending.
    SendingChallenge,
    /// Waiting for the peer's response bundle.
    AwaitingResponse,
    /// Confirm leg in flight (own confirm emitted or the peer's awaited).
    SendingAck,
    /// Key confirmed; data frames may flow.
    Connected,
    /// Terminal failure; all key material destroyed.
    Error,
}

/// Bytes a handshake step hands to the transport for transmission.
#[derive(Debug, Clone)]
pub struct Emission {
    /// Serialized frame for the primary channel.
    pub primary: Vec<u8>,
    /// Serialized coupling mark for the secondary channel, when the step
    /// requires cross-channel attestation.
    pub secondary: Option<Vec<u8>>,
}

/// Outcome of a deadline check.
#[derive(Debug)]
pub enum TimeoutPoll {
    /// No armed deadline has passed; keep waiting.
    Pending,
    /// The response deadline passed. Re-emit the same challenge after the
    /// backoff; the nonce was never observed by anyone, so it stays valid.
    Retry {
        /// The challenge and mark to retransmit, byte-identical to the
        /// previous attempt.
        emission: Emission,
        /// How long to wait before retransmitting, in milliseconds.
        backoff_ms: u64,
    },
}

/// Point-in-time view of a session, safe to publish in events.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateSnapshot {
    /// Current handshake phase.
    pub phase: HandshakePhase,
    /// Session role.
    pub role: Role,
    /// Trust level, once coupling validation has produced one.
    pub trust: Option<TrustLevel>,
    /// Composite confidence, once coupling validation has produced one.
    pub confidence: Option<f32>,
    /// Challenge retransmissions used so far.
    pub retries: u32,
    /// Failure code when the session is terminal.
    pub failure: Option<ErrorCode>,
}

/// Handshake states. Variants own exactly the material their phase needs,
/// so a transition consumes the old state and drops (zeroizing) whatever
/// the new phase must not retain.
enum HandshakeState {
    /// No handshake in progress.
    Idle,
    /// Initiator: challenge and mark handed to the transport, awaiting
    /// send acks.
    SendingChallenge {
        nonce: [u8; 32],
        keypair: EphemeralKeyPair,
        challenge_bytes: Vec<u8>,
        mark_bytes: Vec<u8>,
    },
    /// Initiator: waiting for the peer's coupled response.
    AwaitingResponse {
        nonce: [u8; 32],
        keypair: EphemeralKeyPair,
        challenge_bytes: Vec<u8>,
        mark_bytes: Vec<u8>,
        deadline_ms: u64,
    },
    /// Initiator: own confirm emitted, awaiting the responder's confirm.
    SendingAck {
        trust: TrustLevel,
        confidence: f32,
        deadline_ms: u64,
    },
    /// Responder: response and mark emitted, awaiting the initiator's
    /// confirm.
    ResponseSent {
        trust: TrustLevel,
        confidence: f32,
        deadline_ms: u64,
    },
    /// Key confirmed; data frames may flow.
    Connected { trust: TrustLevel, confidence: f32 },
    /// Terminal failure.
    Failed { code: ErrorCode },
}

/// Handshake state machine for one session.
///
/// Owns the session's key material exclusively; the material is destroyed
/// (zeroized on drop) when the machine reaches a terminal state or is
/// dropped.
pub struct Session {
    role: Role,
    config: SessionConfig,
    /// Wire session id. For the responder this starts as a local handle
    /// and is replaced by the initiator's id when a challenge is accepted.
    session_id: SessionId,
    state: HandshakeState,
    material: Option<KeyMaterial>,
    /// Challenge retransmissions used in the current attempt.
    retries: u32,
    send_seq: u64,
    last_recv_seq: Option<u64>,
}

impl Session {
    /// Create a session with default configuration.
    pub fn new(role: Role, session_id: SessionId) -> Self {
        Self::with_config(role, session_id, SessionConfig::default())
    }

    /// Create a session with custom configuration.
    pub fn with_config(role: Role, session_id: SessionId, config: SessionConfig) -> Self {
        Self {
            role,
            config,
            session_id,
            state: HandshakeState::Idle,
            material: None,
            retries: 0,
            send_seq: 0,
            last_recv_seq: None,
        }
    }

    /// Get current role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Get the wire session id.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Get the current handshake phase.
    pub fn phase(&self) -> HandshakePhase {
        match &self.state {
            HandshakeState::Idle => HandshakePhase::Idle,
            HandshakeState::SendingChallenge { .. } => HandshakePhase::SendingChallenge,
            HandshakeState::AwaitingResponse { .. } => HandshakePhase::AwaitingResponse,
            HandshakeState::SendingAck { .. } | HandshakeState::ResponseSent { .. } => {
                HandshakePhase::SendingAck
            }
            HandshakeState::Connected { .. } => HandshakePhase::Connected,
            HandshakeState::Failed { .. } => HandshakePhase::Error,
        }
    }

    /// Check if the handshake is complete.
    pub fn is_connected(&self) -> bool {
        matches!(self.state, HandshakeState::Connected { .. })
    }

    /// The armed deadline, in milliseconds, when one exists.
    ///
    /// Lets the transport sleep until exactly the instant at which
    /// [`Session::poll_timeout`] would act instead of polling.
    pub fn next_deadline_ms(&self) -> Option<u64> {
        match &self.state {
            HandshakeState::AwaitingResponse { deadline_ms, .. }
            | HandshakeState::SendingAck { deadline_ms, .. }
            | HandshakeState::ResponseSent { deadline_ms, .. } => Some(*deadline_ms),
            _ => None,
        }
    }

    /// Point-in-time view of the session.
    pub fn snapshot(&self) -> StateSnapshot {
        let (trust, confidence) = match &self.state {
            HandshakeState::SendingAck {
                trust, confidence, ..
            }
            | HandshakeState::ResponseSent {
                trust, confidence, ..
            }
            | HandshakeState::Connected { trust, confidence } => (Some(*trust), Some(*confidence)),
            _ => (None, None),
        };
        let failure = match &self.state {
            HandshakeState::Failed { code } => Some(*code),
            _ => None,
        };
        StateSnapshot {
            phase: self.phase(),
            role: self.role,
            trust,
            confidence,
            retries: self.retries,
            failure,
        }
    }

    // === Initiator side ===

    /// Start a handshake: generate a fresh nonce and ephemeral keypair and
    /// build the challenge plus its coupling mark.
    ///
    /// Returns the emission for the transport. Also the restart entry
    /// point after a security failure, which leaves the machine in `Idle`;
    /// every call uses entirely fresh cryptographic material.
    pub fn initiate(&mut self, now_ms: u64) -> Result<Emission> {
        if self.role != Role::Initiator {
            return Err(Error::InvalidState);
        }
        if !matches!(self.state, HandshakeState::Idle) {
            return Err(Error::InvalidState);
        }

        let nonce = generate_nonce()?;
        let keypair = EphemeralKeyPair::generate()?;

        let challenge_bytes = Frame::Challenge {
            version: PROTOCOL_VERSION,
            profile: self.config.range_profile.default_ecc_profile(),
            session_id: self.session_id,
            nonce,
            public_key: *keypair.public_key(),
        }
        .serialize()?;

        let mark_bytes = Frame::CouplingMark {
            session_id: self.session_id,
            nonce,
            timestamp_ms: now_ms,
            tag: mac::coupling_tag(&nonce, &self.session_id, &challenge_bytes)?,
        }
        .serialize()?;

        self.retries = 0;
        self.state = HandshakeState::SendingChallenge {
            nonce,
            keypair,
            challenge_bytes: challenge_bytes.clone(),
            mark_bytes: mark_bytes.clone(),
        };

        Ok(Emission {
            primary: challenge_bytes,
            secondary: Some(mark_bytes),
        })
    }

    /// Signal that the transport has acked the pending emissions.
    ///
    /// - `SendingChallenge` arms the response deadline and moves to
    ///   `AwaitingResponse`.
    /// - `SendingAck` over a degraded bundle accepts the session
    ///   unilaterally: with no second channel to corroborate the peer's
    ///   confirm, delivery of our own confirm is the strongest signal
    ///   available, so the session becomes `Connected` now.
    /// - `SendingAck` over a dual-channel bundle re-arms the confirm
    ///   deadline and keeps waiting for the peer's confirm.
    pub fn emissions_confirmed(&mut self, now_ms: u64) -> Result<()> {
        match std::mem::replace(&mut self.state, HandshakeState::Idle) {
            HandshakeState::SendingChallenge {
                nonce,
                keypair,
                challenge_bytes,
                mark_bytes,
            } => {
                self.state = HandshakeState::AwaitingResponse {
                    nonce,
                    keypair,
                    challenge_bytes,
                    mark_bytes,
                    deadline_ms: now_ms + self.config.range_profile.response_timeout_ms(),
                };
                Ok(())
            }
            HandshakeState::SendingAck {
                trust: TrustLevel::SingleChannelDegraded,
                confidence,
                ..
            } => {
                self.enter_connected(TrustLevel::SingleChannelDegraded, confidence);
                Ok(())
            }
            HandshakeState::SendingAck {
                trust, confidence, ..
            } => {
                self.state = HandshakeState::SendingAck {
                    trust,
                    confidence,
                    deadline_ms: now_ms + self.config.range_profile.response_timeout_ms(),
                };
                Ok(())
            }
            old_state => {
                self.state = old_state;
                Err(Error::InvalidState)
            }
        }
    }

    /// Process the validator-accepted response bundle: derive the shared
    /// secret and session key and build the confirm frame.
    ///
    /// Returns the confirm emission. On any failure the machine returns to
    /// `Idle` with all attempt material destroyed, so a restart cannot
    /// reuse the nonce or keypair.
    pub fn handle_response(&mut self, bundle: &CoupledBundle, now_ms: u64) -> Result<Emission> {
        if self.role != Role::Initiator {
            return Err(Error::InvalidState);
        }
        let (nonce_a, keypair, challenge_bytes) =
            match std::mem::replace(&mut self.state, HandshakeState::Idle) {
                HandshakeState::AwaitingResponse {
                    nonce,
                    keypair,
                    challenge_bytes,
                    ..
                } => (nonce, keypair, challenge_bytes),
                old_state => {
                    self.state = old_state;
                    return Err(Error::InvalidState);
                }
            };

        if bundle.trust == TrustLevel::SingleChannelDegraded && !self.config.degraded_allowed {
            return Err(Error::ResourceUnavailable(
                "secondary channel attestation required".into(),
            ));
        }

        let (resp_session_id, nonce_b, peer_public, challenge_tag) =
            match Frame::parse(&bundle.primary.bytes)? {
                Frame::Response {
                    session_id,
                    nonce,
                    public_key,
                    challenge_tag,
                } => (session_id, nonce, public_key, challenge_tag),
                _ => return Err(Error::InvalidFrame("Expected Response".into())),
            };
        if resp_session_id != self.session_id {
            return Err(Error::InvalidFrame("Response for another session".into()));
        }

        // The challenge tag proves the responder answered this exact
        // challenge, not a concurrent or recorded one.
        let tag_ok =
            mac::verify_coupling_tag(&nonce_b, &self.session_id, &challenge_bytes, &challenge_tag)?;
        if !tag_ok {
            return Err(Error::Correlation(ValidationFailure::MacMismatch));
        }

        let shared = keypair.diffie_hellman(&peer_public)?;
        let key = kdf::derive_session_key(&*shared, &nonce_a, &nonce_b, &self.session_id)?;
        let confirm_tag =
            kdf::derive_confirm_tag(&key, &self.session_id, ConfirmSide::Initiator)?;

        let confirm_bytes = Frame::KeyConfirm {
            session_id: self.session_id,
            confirm_tag,
        }
        .serialize()?;

        self.material = Some(KeyMaterial::new(
            SessionKey::new(key),
            now_ms,
            self.config.key_ttl_ms,
        ));
        self.state = HandshakeState::SendingAck {
            trust: bundle.trust,
            confidence: bundle.confidence,
            deadline_ms: now_ms + self.config.range_profile.response_timeout_ms(),
        };

        Ok(Emission {
            primary: confirm_bytes,
            secondary: None,
        })
    }

    /// Process the responder's key confirmation and complete the handshake.
    pub fn handle_confirm(&mut self, frame: Frame, now_ms: u64) -> Result<()> {
        if self.role != Role::Initiator {
            return Err(Error::InvalidState);
        }
        let (trust, confidence) = match std::mem::replace(&mut self.state, HandshakeState::Idle) {
            HandshakeState::SendingAck {
                trust, confidence, ..
            } => (trust, confidence),
            old_state => {
                self.state = old_state;
                return Err(Error::InvalidState);
            }
        };

        let (confirm_session_id, confirm_tag) = match frame {
            Frame::KeyConfirm {
                session_id,
                confirm_tag,
            } => (session_id, confirm_tag),
            _ => {
                self.material = None;
                return Err(Error::InvalidFrame("Expected KeyConfirm".into()));
            }
        };
        if confirm_session_id != self.session_id {
            self.material = None;
            return Err(Error::InvalidFrame("KeyConfirm for another session".into()));
        }

        let expired = {
            let material = self.material.as_ref().ok_or(Error::InvalidState)?;
            if material.is_expired(now_ms) {
                true
            } else {
                let verified = kdf::verify_confirm_tag(
                    material.key().as_bytes(),
                    &self.session_id,
                    ConfirmSide::Responder,
                    &confirm_tag,
                )?;
                if !verified {
                    self.material = None;
                    return Err(Error::Crypto(beamlink_crypto::Error::AuthFailure));
                }
                false
            }
        };
        if expired {
            self.fail(ErrorCode::KeyExpired);
            return Err(Error::KeyExpired);
        }

        self.enter_connected(trust, confidence);
        Ok(())
    }

    /// Check the armed deadline.
    ///
    /// Past the response deadline the initiator either schedules a
    /// retransmission of the byte-identical challenge (linear backoff) or,
    /// with the retry budget spent, fails terminally. A responder or an
    /// initiator stuck in the confirm leg fails terminally; those legs
    /// have no retransmission.
    pub fn poll_timeout(&mut self, now_ms: u64) -> Result<TimeoutPoll> {
        match std::mem::replace(&mut self.state, HandshakeState::Idle) {
            HandshakeState::AwaitingResponse {
                nonce,
                keypair,
                challenge_bytes,
                mark_bytes,
                deadline_ms,
            } => {
                if now_ms < deadline_ms {
                    self.state = HandshakeState::AwaitingResponse {
                        nonce,
                        keypair,
                        challenge_bytes,
                        mark_bytes,
                        deadline_ms,
                    };
                    return Ok(TimeoutPoll::Pending);
                }
                if self.retries >= self.config.max_retries {
                    self.fail(ErrorCode::RetriesExhausted);
                    return Err(Error::RetriesExhausted);
                }
                self.retries += 1;
                let backoff_ms = self.config.retry_backoff_base_ms * u64::from(self.retries);
                let emission = Emission {
                    primary: challenge_bytes.clone(),
                    secondary: Some(mark_bytes.clone()),
                };
                self.state = HandshakeState::SendingChallenge {
                    nonce,
                    keypair,
                    challenge_bytes,
                    mark_bytes,
                };
                Ok(TimeoutPoll::Retry {
                    emission,
                    backoff_ms,
                })
            }
            HandshakeState::SendingAck { deadline_ms, .. }
            | HandshakeState::ResponseSent { deadline_ms, .. }
                if now_ms >= deadline_ms =>
            {
                self.fail(ErrorCode::TransportTimeout);
                Err(Error::TransportTimeout)
            }
            old_state => {
                self.state = old_state;
                Ok(TimeoutPoll::Pending)
            }
        }
    }

    /// Abort from any state: destroy key material, record the failure code
    /// and return the error frame to (best effort) signal the peer.
    pub fn abort(&mut self, reason: ErrorCode) -> Frame {
        self.fail(reason);
        Frame::ErrorFrame {
            session_id: self.session_id,
            code: reason,
        }
    }

    /// Destroy all attempt material and return to `Idle`, keeping the
    /// session id.
    ///
    /// Used when the peer signals a security failure mid-handshake: the
    /// next [`Session::initiate`] then uses entirely fresh cryptographic
    /// material under the same session handle.
    pub fn reset(&mut self) {
        self.material = None;
        self.retries = 0;
        self.state = HandshakeState::Idle;
    }

    // === Responder side ===

    /// Process a validator-accepted challenge bundle: adopt the session id,
    /// derive the session key and build the response plus its own mark.
    ///
    /// Returns the response emission. The responder's nonce keys both the
    /// challenge tag inside the response and the coupling mark that pairs
    /// with it.
    pub fn accept_challenge(&mut self, bundle: &CoupledBundle, now_ms: u64) -> Result<Emission> {
        if self.role != Role::Responder {
            return Err(Error::InvalidState);
        }
        if !matches!(self.state, HandshakeState::Idle) {
            return Err(Error::InvalidState);
        }
        if bundle.trust == TrustLevel::SingleChannelDegraded && !self.config.degraded_allowed {
            return Err(Error::ResourceUnavailable(
                "secondary channel attestation required".into(),
            ));
        }

        let (version, profile, challenge_session_id, nonce_a, peer_public) =
            match Frame::parse(&bundle.primary.bytes)? {
                Frame::Challenge {
                    version,
                    profile,
                    session_id,
                    nonce,
                    public_key,
                } => (version, profile, session_id, nonce, public_key),
                _ => return Err(Error::InvalidFrame("Expected Challenge".into())),
            };
        if version != PROTOCOL_VERSION {
            return Err(Error::InvalidFrame(format!(
                "Unsupported protocol version 0x{:04X}",
                version
            )));
        }
        profile.validate()?;

        let nonce_b = generate_nonce()?;
        let keypair = EphemeralKeyPair::generate()?;
        let shared = keypair.diffie_hellman(&peer_public)?;
        let key = kdf::derive_session_key(&*shared, &nonce_a, &nonce_b, &challenge_session_id)?;

        let response_bytes = Frame::Response {
            session_id: challenge_session_id,
            nonce: nonce_b,
            public_key: *keypair.public_key(),
            challenge_tag: mac::coupling_tag(
                &nonce_b,
                &challenge_session_id,
                &bundle.primary.bytes,
            )?,
        }
        .serialize()?;

        let mark_bytes = Frame::CouplingMark {
            session_id: challenge_session_id,
            nonce: nonce_b,
            timestamp_ms: now_ms,
            tag: mac::coupling_tag(&nonce_b, &challenge_session_id, &response_bytes)?,
        }
        .serialize()?;

        self.session_id = challenge_session_id;
        self.material = Some(KeyMaterial::new(
            SessionKey::new(key),
            now_ms,
            self.config.key_ttl_ms,
        ));
        self.state = HandshakeState::ResponseSent {
            trust: bundle.trust,
            confidence: bundle.confidence,
            deadline_ms: now_ms + self.config.range_profile.response_timeout_ms(),
        };

        Ok(Emission {
            primary: response_bytes,
            secondary: Some(mark_bytes),
        })
    }

    /// Verify the initiator's key confirmation and answer with our own.
    ///
    /// Returns the responder confirm emission and completes the handshake.
    pub fn confirm_key(&mut self, frame: Frame) -> Result<Emission> {
        if self.role != Role::Responder {
            return Err(Error::InvalidState);
        }
        let (trust, confidence) = match std::mem::replace(&mut self.state, HandshakeState::Idle) {
            HandshakeState::ResponseSent {
                trust, confidence, ..
            } => (trust, confidence),
            old_state => {
                self.state = old_state;
                return Err(Error::InvalidState);
            }
        };

        let (confirm_session_id, confirm_tag) = match frame {
            Frame::KeyConfirm {
                session_id,
                confirm_tag,
            } => (session_id, confirm_tag),
            _ => {
                self.material = None;
                return Err(Error::InvalidFrame("Expected KeyConfirm".into()));
            }
        };
        if confirm_session_id != self.session_id {
            self.material = None;
            return Err(Error::InvalidFrame("KeyConfirm for another session".into()));
        }

        let own_tag = {
            let material = self.material.as_ref().ok_or(Error::InvalidState)?;
            let verified = kdf::verify_confirm_tag(
                material.key().as_bytes(),
                &self.session_id,
                ConfirmSide::Initiator,
                &confirm_tag,
            )?;
            if !verified {
                self.material = None;
                return Err(Error::Crypto(beamlink_crypto::Error::AuthFailure));
            }
            kdf::derive_confirm_tag(
                material.key().as_bytes(),
                &self.session_id,
                ConfirmSide::Responder,
            )?
        };

        let confirm_bytes = Frame::KeyConfirm {
            session_id: self.session_id,
            confirm_tag: own_tag,
        }
        .serialize()?;

        self.enter_connected(trust, confidence);
        Ok(Emission {
            primary: confirm_bytes,
            secondary: None,
        })
    }

    // === Data phase ===

    /// Seal an application payload into a data frame.
    ///
    /// The sequence number advances per direction by construction; the
    /// initiator uses even sequences and the responder odd ones, so the
    /// counter-derived AEAD nonces of the two directions never collide
    /// under the shared session key.
    pub fn seal_data(&mut self, plaintext: &[u8], now_ms: u64) -> Result<Vec<u8>> {
        if !self.is_connected() {
            return Err(Error::InvalidState);
        }
        if self
            .material
            .as_ref()
            .map_or(true, |material| material.is_expired(now_ms))
        {
            self.fail(ErrorCode::KeyExpired);
            return Err(Error::KeyExpired);
        }

        let sequence = self.send_seq;
        let next = sequence.checked_add(2).ok_or(Error::InvalidState)?;
        let material = self.material.as_ref().ok_or(Error::InvalidState)?;

        let aad = data_aad(&self.session_id, sequence);
        let ciphertext = beamlink_crypto::aead::seal(
            material.key().as_bytes(),
            sequence,
            &aad,
            plaintext,
        )?;
        self.send_seq = next;

        Frame::Data {
            session_id: self.session_id,
            sequence,
            ciphertext,
        }
        .serialize()
    }

    /// Open a received data frame.
    ///
    /// Rejects frames for other sessions, sequences with the wrong
    /// direction parity (a reflected frame authenticates under the shared
    /// key, so parity is checked before the AEAD), and any sequence not
    /// strictly greater than the last accepted one. There is no buffering
    /// or reordering. An expired key fails terminally.
    pub fn open_data(&mut self, frame: Frame, now_ms: u64) -> Result<Zeroizing<Vec<u8>>> {
        if !self.is_connected() {
            return Err(Error::InvalidState);
        }
        let (frame_session_id, sequence, ciphertext) = match frame {
            Frame::Data {
                session_id,
                sequence,
                ciphertext,
            } => (session_id, sequence, ciphertext),
            _ => return Err(Error::InvalidFrame("Expected Data".into())),
        };
        if frame_session_id != self.session_id {
            return Err(Error::InvalidFrame("Data for another session".into()));
        }

        let peer_parity = match self.role {
            Role::Initiator => 1,
            Role::Responder => 0,
        };
        if sequence % 2 != peer_parity {
            return Err(Error::InvalidFrame("Reflected sequence parity".into()));
        }
        if let Some(last_accepted) = self.last_recv_seq {
            if sequence <= last_accepted {
                return Err(Error::SequenceRegression {
                    last_accepted,
                    received: sequence,
                });
            }
        }

        if self
            .material
            .as_ref()
            .map_or(true, |material| material.is_expired(now_ms))
        {
            self.fail(ErrorCode::KeyExpired);
            return Err(Error::KeyExpired);
        }
        let material = self.material.as_ref().ok_or(Error::InvalidState)?;

        let aad = data_aad(&self.session_id, sequence);
        let plaintext = beamlink_crypto::aead::open(
            material.key().as_bytes(),
            sequence,
            &aad,
            &ciphertext,
        )?;

        // Only an authenticated frame may advance the receive counter.
        self.last_recv_seq = Some(sequence);
        Ok(plaintext)
    }

    // === Internal transitions ===

    fn enter_connected(&mut self, trust: TrustLevel, confidence: f32) {
        self.send_seq = match self.role {
            Role::Initiator => 0,
            Role::Responder => 1,
        };
        self.last_recv_seq = None;
        self.state = HandshakeState::Connected { trust, confidence };
    }

    fn fail(&mut self, code: ErrorCode) {
        self.material = None;
        self.state = HandshakeState::Failed { code };
    }
}

/// Associated data binding a ciphertext to its session and position.
fn data_aad(session_id: &SessionId, sequence: u64) -> [u8; 24] {
    let mut aad = [0u8; 24];
    aad[..16].copy_from_slice(session_id);
    aad[16..].copy_from_slice(&sequence.to_le_bytes());
    aad
}
