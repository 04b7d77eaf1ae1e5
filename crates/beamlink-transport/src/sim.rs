//! In-process simulated channels for tests and demos.
//!
//! [`wired_pair`] cross-connects two endpoints of the same channel kind:
//! bytes transmitted on one endpoint arrive at the other after a
//! configurable one-way latency, stamped at capture time with the
//! receiving side's quality score. Drop and burst-corruption injection
//! draw from a seeded generator shared by the pair, so a given seed
//! reproduces the same fault pattern.

use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, Mutex};

use beamlink_core::ecc::LinkQuality;
use beamlink_core::validator::{ChannelKind, ChannelSample};

use crate::channel::{now_ms, PhysicalChannel};
use crate::{Error, Result};

/// Fault and timing settings for one wired pair.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// One-way flight latency in milliseconds.
    pub latency_ms: u64,
    /// Quality score stamped on captured samples.
    pub quality: f32,
    /// Link quality reported to redundancy adaptation.
    pub link_quality: LinkQuality,
    /// Probability that an emission is damaged in flight.
    pub corrupt_prob: f64,
    /// Length of the damaged byte run when corruption strikes.
    pub corrupt_burst_len: usize,
    /// Probability that an emission is lost in flight.
    pub drop_prob: f64,
    /// Whether the endpoints cannot capture while transmitting.
    pub half_duplex: bool,
    /// Seed for the pair's fault generator.
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            latency_ms: 50,
            quality: 0.9,
            link_quality: LinkQuality {
                bit_error_rate: 0.001,
                packet_error_rate: 0.01,
                attenuation_db: 10.0,
            },
            corrupt_prob: 0.0,
            corrupt_burst_len: 8,
            drop_prob: 0.0,
            half_duplex: false,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Tunables {
    latency_ms: u64,
    quality: f32,
    link_quality: LinkQuality,
    corrupt_prob: f64,
    corrupt_burst_len: usize,
    drop_prob: f64,
}

struct Inner {
    kind: ChannelKind,
    half_duplex: bool,
    tunables: RwLock<Tunables>,
    rng: Arc<StdMutex<StdRng>>,
    to_peer: mpsc::UnboundedSender<Vec<u8>>,
    from_peer: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

/// One endpoint of a simulated wired pair.
///
/// Cloning yields another handle to the same endpoint; settings changed
/// through any clone apply to all of them.
#[derive(Clone)]
pub struct SimChannel {
    inner: Arc<Inner>,
}

/// Create a cross-wired endpoint pair of the given kind.
pub fn wired_pair(kind: ChannelKind, config: SimConfig) -> (SimChannel, SimChannel) {
    let (left_tx, right_rx) = mpsc::unbounded_channel();
    let (right_tx, left_rx) = mpsc::unbounded_channel();
    let rng = Arc::new(StdMutex::new(StdRng::seed_from_u64(config.seed)));
    let tunables = Tunables {
        latency_ms: config.latency_ms,
        quality: config.quality,
        link_quality: config.link_quality,
        corrupt_prob: config.corrupt_prob,
        corrupt_burst_len: config.corrupt_burst_len,
        drop_prob: config.drop_prob,
    };

    let endpoint = |to_peer, from_peer| SimChannel {
        inner: Arc::new(Inner {
            kind,
            half_duplex: config.half_duplex,
            tunables: RwLock::new(tunables),
            rng: Arc::clone(&rng),
            to_peer,
            from_peer: Mutex::new(from_peer),
        }),
    };
    (endpoint(left_tx, left_rx), endpoint(right_tx, right_rx))
}

impl SimChannel {
    /// Set this endpoint's outbound flight latency.
    pub fn set_latency_ms(&self, latency_ms: u64) {
        if let Ok(mut tunables) = self.inner.tunables.write() {
            tunables.latency_ms = latency_ms;
        }
    }

    /// Set the quality score stamped on samples captured here.
    pub fn set_quality(&self, quality: f32) {
        if let Ok(mut tunables) = self.inner.tunables.write() {
            tunables.quality = quality;
        }
    }

    /// Set the link quality reported to redundancy adaptation.
    pub fn set_link_quality(&self, link_quality: LinkQuality) {
        if let Ok(mut tunables) = self.inner.tunables.write() {
            tunables.link_quality = link_quality;
        }
    }

    /// Set the probability that an outbound emission is damaged.
    pub fn set_corruption(&self, corrupt_prob: f64) {
        if let Ok(mut tunables) = self.inner.tunables.write() {
            tunables.corrupt_prob = corrupt_prob;
        }
    }

    /// Set the probability that an outbound emission is lost.
    pub fn set_drop(&self, drop_prob: f64) {
        if let Ok(mut tunables) = self.inner.tunables.write() {
            tunables.drop_prob = drop_prob;
        }
    }

    fn tunables(&self) -> Result<Tunables> {
        self.inner
            .tunables
            .read()
            .map(|tunables| *tunables)
            .map_err(|_| Error::ChannelFailed("Endpoint state poisoned".into()))
    }
}

#[async_trait]
impl PhysicalChannel for SimChannel {
    fn kind(&self) -> ChannelKind {
        self.inner.kind
    }

    async fn transmit(&self, bytes: &[u8]) -> Result<()> {
        let tunables = self.tunables()?;

        // Fault draws happen in a fixed order so a seed reproduces the
        // same pattern regardless of timing.
        let (dropped, corruption_start) = {
            let mut rng = match self.inner.rng.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let dropped = rng.gen_bool(tunables.drop_prob.clamp(0.0, 1.0));
            let corrupted = rng.gen_bool(tunables.corrupt_prob.clamp(0.0, 1.0));
            let start = if corrupted && !bytes.is_empty() {
                Some(rng.gen_range(0..bytes.len()))
            } else {
                None
            };
            (dropped, start)
        };

        // The hardware emitted either way; the medium ate the dropped ones.
        if dropped {
            return Ok(());
        }

        let mut payload = bytes.to_vec();
        if let Some(start) = corruption_start {
            let run = tunables.corrupt_burst_len.min(payload.len() - start);
            for byte in &mut payload[start..start + run] {
                *byte ^= 0x55;
            }
        }

        let to_peer = self.inner.to_peer.clone();
        let latency_ms = tunables.latency_ms;
        tokio::spawn(async move {
            if latency_ms > 0 {
                tokio::time::sleep(Duration::from_millis(latency_ms)).await;
            }
            // Peer endpoint gone: the emission vanishes into the air.
            let _ = to_peer.send(payload);
        });
        Ok(())
    }

    async fn recv(&self) -> Result<ChannelSample> {
        let bytes = {
            let mut from_peer = self.inner.from_peer.lock().await;
            from_peer.recv().await
        }
        .ok_or_else(|| Error::ChannelFailed("Peer endpoint dropped".into()))?;

        let quality = self.tunables()?.quality;
        Ok(ChannelSample {
            kind: self.inner.kind,
            bytes,
            timestamp_ms: now_ms(),
            quality,
        })
    }

    fn link_quality(&self) -> LinkQuality {
        self.inner
            .tunables
            .read()
            .map(|tunables| tunables.link_quality)
            .unwrap_or_default()
    }

    fn half_duplex(&self) -> bool {
        self.inner.half_duplex
    }
}
