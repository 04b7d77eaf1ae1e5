//! Session engine driving handshakes over physical channels.
//!
//! One driver task per session moves bytes between the channel registry
//! and the core state machine:
//! - primary-channel captures travel as self-describing codewords and
//!   are ECC-decoded before anything else looks at them,
//! - secondary-channel coupling marks travel raw,
//! - every handshake frame passes the engine-wide coupling validator
//!   before the session sees it.
//!
//! The core decides and never waits; the engine owns all waiting,
//! bounded by the session's armed deadlines and cancellable through
//! [`Engine::close_session`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use beamlink_core::ecc::{self, recommend_profile, EccProfile, ProfileBounds};
use beamlink_core::event::{CloseReason, Event};
use beamlink_core::frame::Frame;
use beamlink_core::session::{
    Emission, HandshakePhase, RangeProfile, Role, Session, SessionConfig, SessionId,
    StateSnapshot, TimeoutPoll,
};
use beamlink_core::validator::{
    ChannelKind, ChannelSample, CoupledBundle, CouplingValidator, TrustLevel, ValidationFailure,
    ValidatorConfig,
};
use beamlink_core::{Error as CoreError, ErrorCode};

use crate::channel::{now_ms, ChannelRegistry};
use crate::{Error, Result};

/// Broadcast capacity of the event stream; slow subscribers lag rather
/// than block the engine.
const EVENT_CAPACITY: usize = 256;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Per-session protocol configuration.
    pub session: SessionConfig,
    /// Coupling validator configuration. The replay guard built from it
    /// is shared by every session on this engine.
    pub validator: ValidatorConfig,
    /// Clamp envelope for redundancy adaptation in the data phase.
    pub profile_bounds: ProfileBounds,
    /// Consecutive security failures per peer before the engine refuses
    /// new attempts toward it.
    pub quarantine_threshold: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            validator: ValidatorConfig::default(),
            profile_bounds: ProfileBounds::default(),
            quarantine_threshold: 3,
        }
    }
}

struct SessionEntry {
    session: Arc<Mutex<Session>>,
    peer_hint: Option<String>,
    announce_profile: EccProfile,
    feed_tx: mpsc::UnboundedSender<ChannelSample>,
    driver: JoinHandle<()>,
}

/// Session engine over a configured channel registry.
///
/// Sessions are independent state machines indexed by id; the only
/// state they share is the channel registry, the validator's replay
/// guard and the quarantine ledger.
pub struct Engine {
    config: EngineConfig,
    registry: Arc<ChannelRegistry>,
    validator: Arc<Mutex<CouplingValidator>>,
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    quarantine: Arc<Mutex<HashMap<String, u32>>>,
    events: broadcast::Sender<Event>,
}

impl Engine {
    /// Create an engine over a configured channel registry.
    pub fn new(config: EngineConfig, registry: ChannelRegistry) -> Self {
        let validator = Arc::new(Mutex::new(CouplingValidator::new(config.validator)));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            registry: Arc::new(registry),
            validator,
            sessions: RwLock::new(HashMap::new()),
            quarantine: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Subscribe to the engine's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Start a session toward a peer and drive its handshake in the
    /// background.
    ///
    /// Refuses peers that crossed the quarantine threshold. The returned
    /// id stays stable across internal fresh-material restarts.
    pub async fn initiate_session(
        &self,
        peer_hint: &str,
        profile: RangeProfile,
    ) -> Result<SessionId> {
        {
            let quarantine = self.quarantine.lock().await;
            if quarantine.get(peer_hint).copied().unwrap_or(0) >= self.config.quarantine_threshold {
                warn!(peer = %peer_hint, "Refusing session toward quarantined peer");
                return Err(CoreError::PeerQuarantined.into());
            }
        }
        let session_id =
            beamlink_crypto::keys::generate_session_id().map_err(CoreError::from)?;
        self.spawn_session(session_id, Role::Initiator, profile, Some(peer_hint.to_string()))
            .await
    }

    /// Arm a responder session that accepts the next incoming challenge.
    pub async fn listen_session(&self, profile: RangeProfile) -> Result<SessionId> {
        let session_id =
            beamlink_crypto::keys::generate_session_id().map_err(CoreError::from)?;
        self.spawn_session(session_id, Role::Responder, profile, None).await
    }

    async fn spawn_session(
        &self,
        session_id: SessionId,
        role: Role,
        profile: RangeProfile,
        peer_hint: Option<String>,
    ) -> Result<SessionId> {
        let session_config = SessionConfig {
            range_profile: profile,
            ..self.config.session
        };
        let session = Arc::new(Mutex::new(Session::with_config(
            role,
            session_id,
            session_config,
        )));
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let announce_profile = profile.default_ecc_profile();

        info!(session = %short_id(&session_id), role = ?role, "Session started");
        let _ = self.events.send(Event::SessionStarted { id: session_id, role });

        let driver = Driver {
            session_id,
            wire_sid: session_id,
            role,
            peer_hint: peer_hint.clone(),
            session: Arc::clone(&session),
            registry: Arc::clone(&self.registry),
            validator: Arc::clone(&self.validator),
            quarantine: Arc::clone(&self.quarantine),
            events: self.events.clone(),
            config: EngineConfig {
                session: session_config,
                ..self.config.clone()
            },
            announce_profile,
            feed_rx,
            feed_open: true,
            stashed_mark: None,
            degraded_entered: false,
        };
        let handle = tokio::spawn(driver.run());

        self.sessions.write().await.insert(
            session_id,
            SessionEntry {
                session,
                peer_hint,
                announce_profile,
                feed_tx,
                driver: handle,
            },
        );
        Ok(session_id)
    }

    /// Point-in-time snapshot of a session's observable state.
    pub async fn get_state(&self, session_id: &SessionId) -> Result<StateSnapshot> {
        let sessions = self.sessions.read().await;
        let entry = sessions.get(session_id).ok_or(CoreError::SessionNotFound)?;
        let snapshot = entry.session.lock().await.snapshot();
        Ok(snapshot)
    }

    /// Inject an externally captured sample into a session's handshake.
    ///
    /// The ingestion point for integrators that own their capture loop,
    /// such as a camera pipeline decoding visual codes. Primary-kind
    /// samples must carry raw codeword bytes; the engine ECC-decodes
    /// them like any channel capture.
    pub async fn feed_channel_sample(
        &self,
        session_id: &SessionId,
        sample: ChannelSample,
    ) -> Result<()> {
        let sessions = self.sessions.read().await;
        let entry = sessions.get(session_id).ok_or(CoreError::SessionNotFound)?;
        let phase = entry.session.lock().await.phase();
        if matches!(phase, HandshakePhase::Connected | HandshakePhase::Error) {
            return Err(CoreError::InvalidState.into());
        }
        entry
            .feed_tx
            .send(sample)
            .map_err(|_| Error::from(CoreError::SessionClosed))
    }

    /// Seal an application payload and transmit it on the primary
    /// channel.
    ///
    /// Redundancy is chosen from the primary channel's current link
    /// quality on every call. Returns the transmitted codeword bytes.
    pub async fn send_application_data(
        &self,
        session_id: &SessionId,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        let (session, _) = self.session_handle(session_id).await?;
        let primary = self.registry.primary_kind().ok_or_else(|| {
            CoreError::ResourceUnavailable("No primary channel registered".into())
        })?;

        let sealed = {
            let mut session = session.lock().await;
            session.seal_data(payload, now_ms()).map_err(|err| {
                if matches!(err, CoreError::KeyExpired) {
                    let _ = self.events.send(Event::StateChanged {
                        id: *session_id,
                        state: HandshakePhase::Error,
                    });
                }
                Error::from(err)
            })?
        };

        let quality = self.registry.link_quality(primary)?;
        let profile = recommend_profile(&quality, &self.config.profile_bounds);
        let codeword = ecc::encode(&sealed, &profile)?;
        self.registry.transmit(primary, &codeword).await?;
        Ok(codeword)
    }

    /// Decode a captured primary-channel codeword and open the
    /// application payload it carries.
    pub async fn receive_application_data(
        &self,
        session_id: &SessionId,
        codeword: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        let (session, peer_hint) = self.session_handle(session_id).await?;

        let frame_bytes = match ecc::decode(codeword) {
            Ok(frame_bytes) => frame_bytes,
            Err(err) => {
                let _ = self.events.send(Event::EccDecodeFailure {
                    id: Some(*session_id),
                });
                return Err(err.into());
            }
        };
        let frame = Frame::parse(&frame_bytes).map_err(Error::from)?;

        let opened = {
            let mut session = session.lock().await;
            session.open_data(frame, now_ms())
        };
        match opened {
            Ok(plaintext) => Ok(plaintext),
            Err(err) => {
                if err.is_security_relevant() {
                    let _ = self.events.send(Event::CryptoFailure {
                        id: *session_id,
                        detail: err.to_string(),
                    });
                    record_security_failure(
                        &self.quarantine,
                        &self.events,
                        self.config.quarantine_threshold,
                        peer_hint.as_ref(),
                    )
                    .await;
                }
                if matches!(err, CoreError::KeyExpired) {
                    let _ = self.events.send(Event::StateChanged {
                        id: *session_id,
                        state: HandshakePhase::Error,
                    });
                }
                Err(err.into())
            }
        }
    }

    /// Close a session: cancel its driver, destroy key material and
    /// signal the peer best-effort.
    ///
    /// Key material is zeroized before this returns.
    pub async fn close_session(&self, session_id: &SessionId) -> Result<()> {
        let mut entry = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(session_id).ok_or(CoreError::SessionNotFound)?
        };
        entry.driver.abort();
        let _ = (&mut entry.driver).await;

        let reason = {
            let mut session = entry.session.lock().await;
            let reason = match session.snapshot().failure {
                Some(code) => CloseReason::Failed(code),
                None => CloseReason::Requested,
            };
            if session.phase() != HandshakePhase::Error {
                let frame = session.abort(ErrorCode::SessionClosed);
                signal_best_effort(&self.registry, &frame, &entry.announce_profile).await;
            }
            reason
        };

        info!(session = %short_id(session_id), reason = ?reason, "Session closed");
        let _ = self.events.send(Event::SessionClosed {
            id: *session_id,
            reason,
        });
        Ok(())
    }

    /// Whether a peer is currently quarantined.
    pub async fn is_quarantined(&self, peer_hint: &str) -> bool {
        let quarantine = self.quarantine.lock().await;
        quarantine.get(peer_hint).copied().unwrap_or(0) >= self.config.quarantine_threshold
    }

    /// Clear a peer's quarantine record after out-of-band re-vetting.
    pub async fn clear_quarantine(&self, peer_hint: &str) {
        self.quarantine.lock().await.remove(peer_hint);
    }

    async fn session_handle(
        &self,
        session_id: &SessionId,
    ) -> Result<(Arc<Mutex<Session>>, Option<String>)> {
        let sessions = self.sessions.read().await;
        let entry = sessions.get(session_id).ok_or(CoreError::SessionNotFound)?;
        Ok((Arc::clone(&entry.session), entry.peer_hint.clone()))
    }
}

/// What a driver learned from one handshake attempt.
#[derive(Debug, PartialEq, Eq)]
enum Progress {
    /// Key confirmed; the session is connected.
    Connected,
    /// Security failure; retry with entirely fresh material.
    Restart,
}

/// Outcome of coupling validation for one primary frame.
enum Verdict {
    Accepted(CoupledBundle),
    /// Rejected and signaled; the attempt restarts or keeps listening.
    Rejected,
    /// No attestation available yet; drop the frame and keep waiting.
    Skip,
}

enum Step {
    Sample(ChannelSample),
    Deadline,
}

/// Per-session driver.
///
/// Owns the receive side of a session: channel capture, ECC decode,
/// coupling validation and the timeout/retry schedule. Steps the state
/// machine through the engine-shared handle and publishes every
/// observable transition.
struct Driver {
    /// Engine handle id; also the wire id for initiator sessions.
    session_id: SessionId,
    /// Id used on the wire; responders adopt the challenge's id.
    wire_sid: SessionId,
    role: Role,
    peer_hint: Option<String>,
    session: Arc<Mutex<Session>>,
    registry: Arc<ChannelRegistry>,
    validator: Arc<Mutex<CouplingValidator>>,
    quarantine: Arc<Mutex<HashMap<String, u32>>>,
    events: broadcast::Sender<Event>,
    config: EngineConfig,
    announce_profile: EccProfile,
    feed_rx: mpsc::UnboundedReceiver<ChannelSample>,
    feed_open: bool,
    /// Latest unpaired attestation, kept until a primary frame arrives
    /// or a fresher mark replaces it.
    stashed_mark: Option<ChannelSample>,
    degraded_entered: bool,
}

impl Driver {
    async fn run(mut self) {
        let outcome = match self.role {
            Role::Initiator => self.run_initiator().await,
            Role::Responder => self.run_responder().await,
        };
        match outcome {
            Ok(()) => {
                info!(session = %short_id(&self.session_id), "Session connected");
            }
            Err(err) => self.fail(err).await,
        }
    }

    async fn run_initiator(&mut self) -> Result<()> {
        let mut restarts = 0u32;
        loop {
            let emission = {
                let mut session = self.session.lock().await;
                session.initiate(now_ms())?
            };
            self.publish_phase(HandshakePhase::SendingChallenge);
            self.transmit_emission(&emission).await?;
            {
                let mut session = self.session.lock().await;
                session.emissions_confirmed(now_ms())?;
            }
            self.publish_phase(HandshakePhase::AwaitingResponse);

            if self.drive_handshake().await? == Progress::Connected {
                self.clear_quarantine_on_success().await;
                return Ok(());
            }

            restarts += 1;
            if restarts > self.config.session.max_retries {
                return Err(CoreError::RetriesExhausted.into());
            }
            debug!(
                session = %short_id(&self.session_id),
                restarts,
                "Restarting handshake with fresh material"
            );
            self.session.lock().await.reset();
            self.stashed_mark = None;
        }
    }

    async fn run_responder(&mut self) -> Result<()> {
        loop {
            match self.next_sample().await? {
                Step::Sample(sample) => {
                    if let Some(Progress::Connected) = self.on_responder_sample(sample).await? {
                        return Ok(());
                    }
                }
                Step::Deadline => self.on_deadline().await?,
            }
        }
    }

    /// Drive one initiator attempt to a verdict.
    async fn drive_handshake(&mut self) -> Result<Progress> {
        loop {
            match self.next_sample().await? {
                Step::Sample(sample) => {
                    if let Some(progress) = self.on_initiator_sample(sample).await? {
                        return Ok(progress);
                    }
                }
                Step::Deadline => self.on_deadline().await?,
            }
        }
    }

    /// Wait for the next capture, fed sample or armed deadline.
    async fn next_sample(&mut self) -> Result<Step> {
        let deadline_ms = {
            let session = self.session.lock().await;
            session.next_deadline_ms()
        };
        let primary = self.registry.primary_kind();
        let secondary = self.registry.secondary_kind();

        loop {
            tokio::select! {
                sample = recv_kind(&self.registry, primary) => {
                    return Ok(Step::Sample(sample?));
                }
                sample = recv_kind(&self.registry, secondary), if secondary != primary => {
                    return Ok(Step::Sample(sample?));
                }
                fed = self.feed_rx.recv(), if self.feed_open => {
                    match fed {
                        Some(sample) => return Ok(Step::Sample(sample)),
                        None => self.feed_open = false,
                    }
                }
                _ = sleep_until_deadline(deadline_ms) => return Ok(Step::Deadline),
            }
        }
    }

    async fn on_deadline(&mut self) -> Result<()> {
        let poll = {
            let mut session = self.session.lock().await;
            session.poll_timeout(now_ms())
        }?;
        match poll {
            TimeoutPoll::Pending => Ok(()),
            TimeoutPoll::Retry {
                emission,
                backoff_ms,
            } => {
                debug!(
                    session = %short_id(&self.session_id),
                    backoff_ms,
                    "Response deadline passed; retransmitting"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                self.transmit_emission(&emission).await?;
                let mut session = self.session.lock().await;
                session.emissions_confirmed(now_ms())?;
                Ok(())
            }
        }
    }

    async fn on_initiator_sample(&mut self, sample: ChannelSample) -> Result<Option<Progress>> {
        let sample = match self.normalize(sample) {
            Some(sample) => sample,
            None => return Ok(None),
        };
        if !self.is_primary(sample.kind) {
            self.stashed_mark = Some(sample);
            return Ok(None);
        }
        let frame = match Frame::parse(&sample.bytes) {
            Ok(frame) => frame,
            Err(_) => {
                debug!(session = %short_id(&self.session_id), "Discarding unparseable frame");
                return Ok(None);
            }
        };
        if frame.session_id() != &self.wire_sid {
            return Ok(None);
        }
        if let Frame::ErrorFrame { code, .. } = frame {
            return self.on_peer_error(code).await.map(Some);
        }

        let phase = { self.session.lock().await.phase() };
        match (phase, frame) {
            (HandshakePhase::AwaitingResponse, frame @ Frame::Response { .. }) => {
                self.on_response(sample, frame).await
            }
            (HandshakePhase::SendingAck, frame @ Frame::KeyConfirm { .. }) => {
                self.on_peer_confirm(frame).await
            }
            _ => Ok(None),
        }
    }

    async fn on_responder_sample(&mut self, sample: ChannelSample) -> Result<Option<Progress>> {
        let sample = match self.normalize(sample) {
            Some(sample) => sample,
            None => return Ok(None),
        };
        if !self.is_primary(sample.kind) {
            self.stashed_mark = Some(sample);
            return Ok(None);
        }
        let frame = match Frame::parse(&sample.bytes) {
            Ok(frame) => frame,
            Err(_) => {
                debug!(session = %short_id(&self.session_id), "Discarding unparseable frame");
                return Ok(None);
            }
        };

        let phase = { self.session.lock().await.phase() };
        match (phase, frame) {
            (HandshakePhase::Idle, frame @ Frame::Challenge { .. }) => {
                self.on_challenge(sample, frame).await
            }
            (HandshakePhase::SendingAck, frame @ Frame::KeyConfirm { .. })
                if frame.session_id() == &self.wire_sid =>
            {
                self.on_confirm_request(frame).await
            }
            (phase, Frame::ErrorFrame { session_id, code })
                if session_id == self.wire_sid && phase != HandshakePhase::Idle =>
            {
                warn!(
                    session = %short_id(&self.session_id),
                    code = ?code,
                    "Peer aborted the attempt; listening again"
                );
                self.session.lock().await.reset();
                self.stashed_mark = None;
                self.publish_phase(HandshakePhase::Idle);
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Initiator receiving the responder's handshake response.
    async fn on_response(
        &mut self,
        sample: ChannelSample,
        frame: Frame,
    ) -> Result<Option<Progress>> {
        let nonce = match &frame {
            Frame::Response { nonce, .. } => *nonce,
            _ => return Ok(None),
        };
        let bundle = match self.validate_bundle(&sample, self.wire_sid, &nonce).await? {
            Verdict::Accepted(bundle) => bundle,
            Verdict::Rejected => return Ok(Some(Progress::Restart)),
            Verdict::Skip => return Ok(None),
        };

        let emission = {
            let mut session = self.session.lock().await;
            match session.handle_response(&bundle, now_ms()) {
                Ok(emission) => emission,
                Err(err) if err.is_security_relevant() => {
                    drop(session);
                    self.publish_security_failure(&err);
                    self.note_security_failure().await;
                    return Ok(Some(Progress::Restart));
                }
                Err(err) => return Err(err.into()),
            }
        };
        self.publish_phase(HandshakePhase::SendingAck);
        self.transmit_emission(&emission).await?;

        let connected = {
            let mut session = self.session.lock().await;
            session.emissions_confirmed(now_ms())?;
            session.is_connected()
        };
        if connected {
            // Degraded acceptance is unilateral.
            self.publish_phase(HandshakePhase::Connected);
            Ok(Some(Progress::Connected))
        } else {
            Ok(None)
        }
    }

    /// Initiator receiving the responder's key confirmation.
    async fn on_peer_confirm(&mut self, frame: Frame) -> Result<Option<Progress>> {
        let outcome = {
            let mut session = self.session.lock().await;
            session.handle_confirm(frame, now_ms())
        };
        match outcome {
            Ok(()) => {
                self.publish_phase(HandshakePhase::Connected);
                Ok(Some(Progress::Connected))
            }
            Err(err) if err.is_security_relevant() => {
                self.publish_security_failure(&err);
                self.note_security_failure().await;
                self.signal_error(err.code()).await;
                Ok(Some(Progress::Restart))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Responder receiving a fresh challenge while listening.
    async fn on_challenge(
        &mut self,
        sample: ChannelSample,
        frame: Frame,
    ) -> Result<Option<Progress>> {
        let (challenge_sid, nonce) = match &frame {
            Frame::Challenge {
                session_id, nonce, ..
            } => (*session_id, *nonce),
            _ => return Ok(None),
        };
        let bundle = match self.validate_bundle(&sample, challenge_sid, &nonce).await? {
            Verdict::Accepted(bundle) => bundle,
            // Signaled already; stay armed for the next challenge.
            Verdict::Rejected => return Ok(None),
            Verdict::Skip => return Ok(None),
        };

        let emission = {
            let mut session = self.session.lock().await;
            match session.accept_challenge(&bundle, now_ms()) {
                Ok(emission) => emission,
                Err(err) => {
                    drop(session);
                    if err.is_security_relevant() {
                        self.publish_security_failure(&err);
                        self.note_security_failure().await;
                    } else {
                        debug!(
                            session = %short_id(&self.session_id),
                            error = %err,
                            "Challenge refused"
                        );
                    }
                    self.signal_abort(challenge_sid, err.code()).await;
                    return Ok(None);
                }
            }
        };
        self.wire_sid = challenge_sid;
        self.publish_phase(HandshakePhase::SendingAck);
        self.transmit_emission(&emission).await?;
        Ok(None)
    }

    /// Responder receiving the initiator's key confirmation.
    async fn on_confirm_request(&mut self, frame: Frame) -> Result<Option<Progress>> {
        let outcome = {
            let mut session = self.session.lock().await;
            session.confirm_key(frame)
        };
        match outcome {
            Ok(emission) => {
                self.transmit_emission(&emission).await?;
                self.publish_phase(HandshakePhase::Connected);
                Ok(Some(Progress::Connected))
            }
            Err(err) if err.is_security_relevant() => {
                self.publish_security_failure(&err);
                self.note_security_failure().await;
                self.signal_error(err.code()).await;
                // Forged confirmation: material is gone, listen again.
                self.session.lock().await.reset();
                self.publish_phase(HandshakePhase::Idle);
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Peer-signaled abort while the initiator drives an attempt.
    async fn on_peer_error(&mut self, code: ErrorCode) -> Result<Progress> {
        warn!(
            session = %short_id(&self.session_id),
            code = ?code,
            "Peer signaled a failure"
        );
        match code {
            ErrorCode::CorrelationFailure | ErrorCode::CryptoFailure => {
                self.note_security_failure().await;
                Ok(Progress::Restart)
            }
            code => Err(peer_abort_error(code).into()),
        }
    }

    /// Pair the primary sample with an attestation and run coupling
    /// validation, publishing the verdict.
    async fn validate_bundle(
        &mut self,
        primary: &ChannelSample,
        target_sid: SessionId,
        frame_nonce: &[u8; 32],
    ) -> Result<Verdict> {
        let mark = match self.stashed_mark.take() {
            Some(mark) => Some(mark),
            None => self.await_mark().await,
        };

        if let Some(secondary) = mark {
            let outcome = {
                let mut validator = self.validator.lock().await;
                validator.validate(&target_sid, primary, &secondary, now_ms())
            };
            return match outcome {
                Ok(bundle) => Ok(self.accept_verdict(bundle)),
                Err(failure) => Ok(self.reject_verdict(target_sid, failure).await),
            };
        }

        // No attestation inside the coupling window.
        if self.config.session.degraded_allowed {
            let outcome = {
                let mut validator = self.validator.lock().await;
                validator.validate_single_channel(primary, frame_nonce, now_ms())
            };
            return match outcome {
                Ok(bundle) => Ok(self.accept_verdict(bundle)),
                Err(failure) => Ok(self.reject_verdict(target_sid, failure).await),
            };
        }
        if self.registry.secondary_kind().is_none() && !self.feed_open {
            // Nothing can ever attest this attempt.
            return Err(CoreError::ResourceUnavailable(
                "Secondary channel attestation required".into(),
            )
            .into());
        }
        debug!(
            session = %short_id(&self.session_id),
            "No attestation inside the coupling window; frame skipped"
        );
        Ok(Verdict::Skip)
    }

    fn accept_verdict(&mut self, bundle: CoupledBundle) -> Verdict {
        if bundle.trust == TrustLevel::SingleChannelDegraded && !self.degraded_entered {
            self.degraded_entered = true;
            info!(session = %short_id(&self.session_id), "Continuing with degraded trust");
            self.publish(Event::DegradedModeEntered {
                id: self.session_id,
            });
        }
        self.publish(Event::ValidatorVerdict {
            id: self.session_id,
            accepted: true,
            trust: Some(bundle.trust),
            confidence: Some(bundle.confidence),
            failure: None,
        });
        Verdict::Accepted(bundle)
    }

    async fn reject_verdict(&mut self, target_sid: SessionId, failure: ValidationFailure) -> Verdict {
        warn!(
            session = %short_id(&self.session_id),
            failure = %failure,
            "Coupling validation rejected the frame"
        );
        self.publish(Event::ValidatorVerdict {
            id: self.session_id,
            accepted: false,
            trust: None,
            confidence: None,
            failure: Some(failure),
        });
        self.note_security_failure().await;
        self.signal_abort(target_sid, ErrorCode::CorrelationFailure).await;
        Verdict::Rejected
    }

    /// Wait out the remainder of the coupling window for an attestation.
    async fn await_mark(&mut self) -> Option<ChannelSample> {
        let primary = self.registry.primary_kind();
        let secondary = self.registry.secondary_kind();
        if secondary.is_none() && !self.feed_open {
            return None;
        }
        let window = Duration::from_millis(self.config.validator.correlation_window_ms);
        let deadline = tokio::time::Instant::now() + window;
        loop {
            tokio::select! {
                sample = recv_kind(&self.registry, secondary) => {
                    match sample {
                        Ok(sample) => return Some(sample),
                        Err(_) => return None,
                    }
                }
                fed = self.feed_rx.recv(), if self.feed_open => {
                    match fed {
                        Some(sample) if Some(sample.kind) != primary => return Some(sample),
                        // A primary frame mid-window belongs to a stale attempt.
                        Some(_) => {}
                        None => self.feed_open = false,
                    }
                }
                _ = tokio::time::sleep_until(deadline) => return None,
            }
        }
    }

    /// ECC-decode primary-channel captures; marks travel raw.
    fn normalize(&self, sample: ChannelSample) -> Option<ChannelSample> {
        if !self.is_primary(sample.kind) {
            return Some(sample);
        }
        match ecc::decode(&sample.bytes) {
            Ok(bytes) => Some(ChannelSample { bytes, ..sample }),
            Err(_) => {
                debug!(session = %short_id(&self.session_id), "Codeword beyond repair");
                self.publish(Event::EccDecodeFailure {
                    id: Some(self.session_id),
                });
                None
            }
        }
    }

    fn is_primary(&self, kind: ChannelKind) -> bool {
        self.registry.primary_kind() == Some(kind)
    }

    /// Transmit an emission: the primary leg as a codeword, the optional
    /// mark raw on the secondary channel.
    async fn transmit_emission(&self, emission: &Emission) -> Result<()> {
        let primary = match self.registry.primary_kind() {
            Some(kind) => kind,
            None => {
                return Err(CoreError::ResourceUnavailable(
                    "No primary channel registered".into(),
                )
                .into());
            }
        };
        let codeword = ecc::encode(&emission.primary, &self.announce_profile)?;
        self.registry.transmit(primary, &codeword).await?;

        if let Some(mark) = &emission.secondary {
            match self.registry.secondary_kind() {
                Some(kind) => self.registry.transmit(kind, mark).await?,
                None if self.config.session.degraded_allowed => {
                    debug!(
                        session = %short_id(&self.session_id),
                        "No secondary channel; mark not emitted"
                    );
                }
                None => {
                    return Err(CoreError::ResourceUnavailable(
                        "Secondary channel attestation required".into(),
                    )
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Terminal failure: record the code, destroy material, tell the
    /// peer and publish the transition.
    async fn fail(&mut self, err: Error) {
        warn!(
            session = %short_id(&self.session_id),
            error = %err,
            "Session failed"
        );
        if err.is_security_relevant() {
            if let Error::Protocol(core_err) = &err {
                self.publish_security_failure(core_err);
            }
            self.note_security_failure().await;
        }

        let frame = {
            let mut session = self.session.lock().await;
            if session.phase() == HandshakePhase::Error {
                // Already failed terminally with its own code.
                None
            } else {
                let code = match &err {
                    Error::Protocol(core_err) => core_err.code(),
                    _ => ErrorCode::ResourceUnavailable,
                };
                Some(session.abort(code))
            }
        };
        if let Some(frame) = frame {
            signal_best_effort(&self.registry, &frame, &self.announce_profile).await;
        }
        self.publish_phase(HandshakePhase::Error);
    }

    async fn signal_error(&self, code: ErrorCode) {
        self.signal_abort(self.wire_sid, code).await;
    }

    async fn signal_abort(&self, wire_sid: SessionId, code: ErrorCode) {
        let frame = Frame::ErrorFrame {
            session_id: wire_sid,
            code,
        };
        signal_best_effort(&self.registry, &frame, &self.announce_profile).await;
    }

    async fn note_security_failure(&self) {
        record_security_failure(
            &self.quarantine,
            &self.events,
            self.config.quarantine_threshold,
            self.peer_hint.as_ref(),
        )
        .await;
    }

    async fn clear_quarantine_on_success(&self) {
        if let Some(peer) = &self.peer_hint {
            self.quarantine.lock().await.remove(peer);
        }
    }

    fn publish(&self, event: Event) {
        let _ = self.events.send(event);
    }

    fn publish_phase(&self, state: HandshakePhase) {
        self.publish(Event::StateChanged {
            id: self.session_id,
            state,
        });
    }

    fn publish_security_failure(&self, err: &CoreError) {
        self.publish(Event::CryptoFailure {
            id: self.session_id,
            detail: err.to_string(),
        });
    }
}

async fn recv_kind(
    registry: &ChannelRegistry,
    kind: Option<ChannelKind>,
) -> Result<ChannelSample> {
    match kind {
        Some(kind) => registry.recv(kind).await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline_ms: Option<u64>) {
    match deadline_ms {
        Some(deadline) => {
            let wait = deadline.saturating_sub(now_ms());
            tokio::time::sleep(Duration::from_millis(wait)).await;
        }
        None => std::future::pending().await,
    }
}

/// Count a security failure against a peer; the consecutive count
/// resets on the next successful connection.
async fn record_security_failure(
    quarantine: &Mutex<HashMap<String, u32>>,
    events: &broadcast::Sender<Event>,
    threshold: u32,
    peer_hint: Option<&String>,
) {
    let peer = match peer_hint {
        Some(peer) => peer.clone(),
        None => return,
    };
    let mut quarantine = quarantine.lock().await;
    let count = quarantine.entry(peer.clone()).or_insert(0);
    *count += 1;
    if *count == threshold {
        warn!(peer = %peer, "Peer quarantined after repeated security failures");
        let _ = events.send(Event::PeerQuarantined { peer });
    }
}

/// Best-effort error-frame transmission; teardown paths never fail on
/// signaling problems.
async fn signal_best_effort(registry: &ChannelRegistry, frame: &Frame, profile: &EccProfile) {
    let primary = match registry.primary_kind() {
        Some(kind) => kind,
        None => return,
    };
    let frame_bytes = match frame.serialize() {
        Ok(bytes) => bytes,
        Err(_) => return,
    };
    if let Ok(codeword) = ecc::encode(&frame_bytes, profile) {
        let _ = registry.transmit(primary, &codeword).await;
    }
}

/// Map a peer-signaled abort code onto a local error. Security codes
/// take the fresh-material restart path before this mapping applies.
fn peer_abort_error(code: ErrorCode) -> CoreError {
    match code {
        ErrorCode::TransportTimeout => CoreError::TransportTimeout,
        ErrorCode::EccUncorrectable => CoreError::EccUncorrectable,
        ErrorCode::ResourceUnavailable => {
            CoreError::ResourceUnavailable("Peer refused the attempt".into())
        }
        ErrorCode::InvalidState => CoreError::InvalidState,
        ErrorCode::InvalidFrame => CoreError::InvalidFrame("Peer rejected a frame".into()),
        ErrorCode::KeyExpired => CoreError::KeyExpired,
        ErrorCode::RetriesExhausted => CoreError::RetriesExhausted,
        ErrorCode::PeerQuarantined => CoreError::PeerQuarantined,
        _ => CoreError::SessionClosed,
    }
}

fn short_id(id: &SessionId) -> String {
    format!("{:02x}{:02x}{:02x}{:02x}", id[0], id[1], id[2], id[3])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.quarantine_threshold, 3);
        assert_eq!(config.validator.correlation_window_ms, 100);
        assert_eq!(config.session.max_retries, 3);
    }

    #[test]
    fn test_peer_abort_mapping_preserves_codes() {
        assert!(matches!(
            peer_abort_error(ErrorCode::TransportTimeout),
            CoreError::TransportTimeout
        ));
        assert!(matches!(
            peer_abort_error(ErrorCode::ResourceUnavailable),
            CoreError::ResourceUnavailable(_)
        ));
        assert!(matches!(
            peer_abort_error(ErrorCode::SessionClosed),
            CoreError::SessionClosed
        ));
    }

    #[test]
    fn test_short_id_renders_leading_bytes() {
        let mut id = [0u8; 16];
        id[0] = 0xAB;
        id[1] = 0xCD;
        assert_eq!(short_id(&id), "abcd0000");
    }
}
