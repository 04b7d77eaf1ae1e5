//! Physical channel abstraction and per-engine channel registry.
//!
//! A [`PhysicalChannel`] wraps one transmit/capture backend for a physical
//! medium: an acoustic modem, an optical pulse driver, or a visual-code
//! render/scan pipeline. The [`ChannelRegistry`] owns one handle per
//! channel kind together with its role assignment: the primary channel
//! carries codewords, the secondary carries raw coupling marks.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use beamlink_core::ecc::LinkQuality;
use beamlink_core::validator::{ChannelKind, ChannelSample};

use crate::{Error, Result};

/// Milliseconds elapsed since the process started.
///
/// Capture timestamps, coupling windows and protocol deadlines all share
/// this clock. Channel implementations must stamp samples with it at
/// capture time so that window comparisons compare like with like.
pub fn now_ms() -> u64 {
    static EPOCH: OnceLock<tokio::time::Instant> = OnceLock::new();
    let epoch = *EPOCH.get_or_init(tokio::time::Instant::now);
    tokio::time::Instant::now()
        .saturating_duration_since(epoch)
        .as_millis() as u64
}

/// One transmit/capture backend for a physical medium.
///
/// Hardware implementations surface device failures as
/// [`Error::ChannelFailed`] and bubble raw I/O problems through
/// [`Error::Io`]. The in-process pair in [`crate::sim`] implements the
/// same trait for tests and demos.
#[async_trait]
pub trait PhysicalChannel: Send + Sync {
    /// Channel class this backend drives.
    fn kind(&self) -> ChannelKind;

    /// Emit bytes on the medium.
    ///
    /// Must resolve when the hardware has finished emitting, not merely
    /// queued the bytes; the registry holds the channel's send guard for
    /// exactly that long.
    async fn transmit(&self, bytes: &[u8]) -> Result<()>;

    /// Capture the next transmission from the medium.
    ///
    /// The sample timestamp must be stamped locally with [`now_ms`] at
    /// capture time, never taken from the peer.
    async fn recv(&self) -> Result<ChannelSample>;

    /// Current measured link quality, feeding redundancy adaptation.
    fn link_quality(&self) -> LinkQuality;

    /// Whether the medium cannot capture while transmitting.
    fn half_duplex(&self) -> bool;
}

struct Registered {
    handle: Arc<dyn PhysicalChannel>,
    /// One logical transmitter per channel. Half-duplex channels take
    /// the same guard for capture.
    guard: Arc<Mutex<()>>,
}

/// Channel handles and role assignment owned by one engine.
///
/// Registration happens before the registry is handed to the engine;
/// afterwards the set is immutable until teardown drops the handles.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: HashMap<ChannelKind, Registered>,
    primary: Option<ChannelKind>,
    secondary: Option<ChannelKind>,
}

impl ChannelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the codeword-bearing channel. Replaces any previous
    /// primary of the same kind.
    pub fn register_primary(&mut self, channel: Arc<dyn PhysicalChannel>) {
        let kind = channel.kind();
        self.insert(kind, channel);
        self.primary = Some(kind);
    }

    /// Register the attestation channel carrying raw coupling marks.
    /// Replaces any previous secondary of the same kind.
    pub fn register_secondary(&mut self, channel: Arc<dyn PhysicalChannel>) {
        let kind = channel.kind();
        self.insert(kind, channel);
        self.secondary = Some(kind);
    }

    fn insert(&mut self, kind: ChannelKind, channel: Arc<dyn PhysicalChannel>) {
        self.channels.insert(
            kind,
            Registered {
                handle: channel,
                guard: Arc::new(Mutex::new(())),
            },
        );
    }

    /// Kind of the registered primary channel, if one exists.
    pub fn primary_kind(&self) -> Option<ChannelKind> {
        self.primary
    }

    /// Kind of the registered secondary channel, if one exists.
    pub fn secondary_kind(&self) -> Option<ChannelKind> {
        self.secondary
    }

    /// Whether a channel of this kind is registered.
    pub fn contains(&self, kind: ChannelKind) -> bool {
        self.channels.contains_key(&kind)
    }

    fn get(&self, kind: ChannelKind) -> Result<&Registered> {
        self.channels.get(&kind).ok_or_else(|| {
            Error::Protocol(beamlink_core::Error::ResourceUnavailable(format!(
                "No {:?} channel registered",
                kind
            )))
        })
    }

    /// Transmit on the channel of the given kind.
    ///
    /// The channel's send guard is held for the duration of the call, so
    /// concurrent emissions on one channel serialize instead of
    /// interleaving on the medium. The guard is released on every exit
    /// path, including cancellation.
    pub async fn transmit(&self, kind: ChannelKind, bytes: &[u8]) -> Result<()> {
        let registered = self.get(kind)?;
        let _sending = registered.guard.lock().await;
        registered.handle.transmit(bytes).await
    }

    /// Capture the next sample from the channel of the given kind.
    ///
    /// Half-duplex channels hold the send guard while capturing, so a
    /// pending capture blocks transmission on the same channel until it
    /// resolves or is cancelled.
    pub async fn recv(&self, kind: ChannelKind) -> Result<ChannelSample> {
        let registered = self.get(kind)?;
        if registered.handle.half_duplex() {
            let _listening = registered.guard.lock().await;
            registered.handle.recv().await
        } else {
            registered.handle.recv().await
        }
    }

    /// Current link quality of the channel of the given kind.
    pub fn link_quality(&self, kind: ChannelKind) -> Result<LinkQuality> {
        Ok(self.get(kind)?.handle.link_quality())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    /// Test channel whose emissions take a fixed time and are logged
    /// with start/end timestamps.
    struct SlowChannel {
        kind: ChannelKind,
        emission: Duration,
        half_duplex: bool,
        log: Arc<StdMutex<Vec<(u64, u64)>>>,
        inbox: Mutex<mpsc::UnboundedReceiver<ChannelSample>>,
    }

    impl SlowChannel {
        fn new(
            kind: ChannelKind,
            emission_ms: u64,
            half_duplex: bool,
        ) -> (Self, mpsc::UnboundedSender<ChannelSample>, Arc<StdMutex<Vec<(u64, u64)>>>) {
            let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
            let log = Arc::new(StdMutex::new(Vec::new()));
            let channel = Self {
                kind,
                emission: Duration::from_millis(emission_ms),
                half_duplex,
                log: Arc::clone(&log),
                inbox: Mutex::new(inbox_rx),
            };
            (channel, inbox_tx, log)
        }
    }

    #[async_trait]
    impl PhysicalChannel for SlowChannel {
        fn kind(&self) -> ChannelKind {
            self.kind
        }

        async fn transmit(&self, _bytes: &[u8]) -> Result<()> {
            let start = now_ms();
            tokio::time::sleep(self.emission).await;
            if let Ok(mut log) = self.log.lock() {
                log.push((start, now_ms()));
            }
            Ok(())
        }

        async fn recv(&self) -> Result<ChannelSample> {
            let mut inbox = self.inbox.lock().await;
            inbox
                .recv()
                .await
                .ok_or_else(|| Error::ChannelFailed("Inbox closed".into()))
        }

        fn link_quality(&self) -> LinkQuality {
            LinkQuality::default()
        }

        fn half_duplex(&self) -> bool {
            self.half_duplex
        }
    }

    fn sample(kind: ChannelKind) -> ChannelSample {
        ChannelSample {
            kind,
            bytes: vec![1, 2, 3],
            timestamp_ms: now_ms(),
            quality: 0.9,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_sends_serialize_on_one_channel() {
        let (channel, _inbox, log) = SlowChannel::new(ChannelKind::Acoustic, 50, false);
        let mut registry = ChannelRegistry::new();
        registry.register_primary(Arc::new(channel));
        let registry = Arc::new(registry);

        let first = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.transmit(ChannelKind::Acoustic, b"one").await })
        };
        let second = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.transmit(ChannelKind::Acoustic, b"two").await })
        };
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2);
        // The later emission must not start before the earlier one ends.
        assert!(log[1].0 >= log[0].1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_duplex_capture_blocks_transmit() {
        let (channel, inbox_tx, _log) = SlowChannel::new(ChannelKind::Optical, 5, true);
        let mut registry = ChannelRegistry::new();
        registry.register_primary(Arc::new(channel));
        let registry = Arc::new(registry);

        let listener = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.recv(ChannelKind::Optical).await })
        };
        tokio::task::yield_now().await;

        // Capture holds the guard, so transmission cannot start.
        let blocked = timeout(
            Duration::from_millis(20),
            registry.transmit(ChannelKind::Optical, b"blip"),
        )
        .await;
        assert!(blocked.is_err());

        // Delivering a sample releases the guard and unblocks sending.
        inbox_tx.send(sample(ChannelKind::Optical)).unwrap();
        let captured = listener.await.unwrap().unwrap();
        assert_eq!(captured.bytes, vec![1, 2, 3]);
        registry.transmit(ChannelKind::Optical, b"blip").await.unwrap();
    }

    #[tokio::test]
    async fn test_full_duplex_capture_does_not_block_transmit() {
        let (channel, _inbox, log) = SlowChannel::new(ChannelKind::Acoustic, 0, false);
        let mut registry = ChannelRegistry::new();
        registry.register_primary(Arc::new(channel));
        let registry = Arc::new(registry);

        let listener = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.recv(ChannelKind::Acoustic).await })
        };
        tokio::task::yield_now().await;

        registry.transmit(ChannelKind::Acoustic, b"through").await.unwrap();
        assert_eq!(log.lock().unwrap().len(), 1);
        listener.abort();
    }

    #[tokio::test]
    async fn test_unregistered_kind_is_resource_unavailable() {
        let registry = ChannelRegistry::new();
        let err = registry
            .transmit(ChannelKind::VisualCode, b"nothing")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(beamlink_core::Error::ResourceUnavailable(_))
        ));
        assert!(registry.primary_kind().is_none());
        assert!(!registry.contains(ChannelKind::VisualCode));
    }

    #[test]
    fn test_role_registration() {
        let (primary, _tx, _log) = SlowChannel::new(ChannelKind::Acoustic, 0, false);
        let (secondary, _tx2, _log2) = SlowChannel::new(ChannelKind::Optical, 0, false);
        let mut registry = ChannelRegistry::new();
        registry.register_primary(Arc::new(primary));
        registry.register_secondary(Arc::new(secondary));

        assert_eq!(registry.primary_kind(), Some(ChannelKind::Acoustic));
        assert_eq!(registry.secondary_kind(), Some(ChannelKind::Optical));
        assert!(registry.contains(ChannelKind::Acoustic));
        assert!(registry.contains(ChannelKind::Optical));
    }
}
