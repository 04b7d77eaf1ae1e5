//! X25519 ephemeral key exchange (RFC 7748).
//!
//! Every pairing session generates a fresh keypair, so compromise of one
//! session's keys exposes nothing about earlier or later sessions
//! (forward secrecy). The private scalar never leaves this module and is
//! zeroed on drop.
//!
//! # Example
//!
//! ```
//! use beamlink_crypto::kex::EphemeralKeyPair;
//!
//! # fn example() -> Result<(), beamlink_crypto::Error> {
//! let hub = EphemeralKeyPair::generate()?;
//! let agent = EphemeralKeyPair::generate()?;
//!
//! let hub_secret = hub.diffie_hellman(agent.public_key())?;
//! let agent_secret = agent.diffie_hellman(hub.public_key())?;
//!
//! assert_eq!(*hub_secret, *agent_secret);
//! # Ok(())
//! # }
//! ```

use crate::{Error, Result};
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// Session-scoped X25519 keypair.
///
/// Generated fresh for every handshake attempt and destroyed with the
/// session. The private scalar is zeroed when the keypair is dropped.
pub struct EphemeralKeyPair {
    /// Private scalar (32 bytes), zeroed on drop.
    private_key: Zeroizing<StaticSecret>,
    /// Public key point (32 bytes).
    public_key: PublicKey,
}

impl EphemeralKeyPair {
    /// Generate a new random keypair from the operating-system RNG.
    ///
    /// # Errors
    ///
    /// Fails only if the entropy source is unavailable, which is fatal
    /// and non-retryable for the session.
    pub fn generate() -> Result<Self> {
        let mut seed = Zeroizing::new([0u8; 32]);
        rand::rngs::OsRng
            .try_fill_bytes(&mut *seed)
            .map_err(|e| Error::Entropy(e.to_string()))?;

        let private_key = StaticSecret::from(*seed);
        let public_key = PublicKey::from(&private_key);

        Ok(Self {
            private_key: Zeroizing::new(private_key),
            public_key,
        })
    }

    /// The public half of the keypair, safe to send to the peer in the
    /// cleartext part of the handshake.
    pub fn public_key(&self) -> &[u8; 32] {
        self.public_key.as_bytes()
    }

    /// Compute the shared secret with a peer's public key.
    ///
    /// Deterministic for valid inputs. The result is wrapped in
    /// `Zeroizing` so it is cleared from memory when dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPeerKey`] if the exchange yields the
    /// all-zero secret, which happens exactly when the peer supplied a
    /// low-order or otherwise invalid point. The check is mandatory:
    /// accepting such a key would let an attacker force a predictable
    /// session key.
    pub fn diffie_hellman(&self, peer_public: &[u8; 32]) -> Result<Zeroizing<[u8; 32]>> {
        let peer_key = PublicKey::from(*peer_public);
        let shared = self.private_key.diffie_hellman(&peer_key);

        if shared.as_bytes() == &[0u8; 32] {
            return Err(Error::InvalidPeerKey("low-order point".into()));
        }

        Ok(Zeroizing::new(*shared.as_bytes()))
    }

    /// Build a keypair from a raw private scalar.
    ///
    /// Only for tests with known vectors; production code uses
    /// [`EphemeralKeyPair::generate`].
    #[doc(hidden)]
    pub fn from_private(private: [u8; 32]) -> Self {
        let private_key = StaticSecret::from(private);
        let public_key = PublicKey::from(&private_key);

        Self {
            private_key: Zeroizing::new(private_key),
            public_key,
        }
    }
}
