//! Cryptographic primitives for HyperBloom.
//!
//! Provides three things:
//!   1. Discovery keys — the keyed BLAKE3 rendezvous token for a feed
//!   2. Session identities — per-controller Noise static key + random local id
//!   3. Noise_XX establishment — authenticated key exchange that carries
//!      each side's local id inside the encrypted handshake payload
//!
//! Keypairs are managed via x25519-dalek for explicit key control.
//! snow drives the Noise_XX state machine using those keys.
//!
//! All key material derives ZeroizeOnDrop — wiped from memory when dropped.
//! There is no unsafe code in this module.

use rand::RngCore;
use snow::{Builder, HandshakeState, StatelessTransportState};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Public key identifying a feed. Supplied by the application.
pub type FeedKey = [u8; 32];

/// Rendezvous identifier announced on the discovery substrate.
pub type DiscoveryKey = [u8; 32];

/// Size of a session-local connection identity.
pub const ID_SIZE: usize = 32;

/// Short-lived identity presented during the secure handshake.
pub type LocalId = [u8; ID_SIZE];

// ── Discovery keys ────────────────────────────────────────────────────────────

/// Domain-separation key for discovery key derivation.
///
/// Shared by every participant. Changing it partitions the overlay.
pub const DISCOVERY_HASH_KEY: [u8; 32] = *b"hyperbloom-discovery-rendezvous1";

/// Derive the rendezvous identifier for a feed.
///
///   discovery_key = BLAKE3-keyed(DISCOVERY_HASH_KEY, feed_key)
///
/// One-way: observers of the discovery substrate learn nothing about the
/// feed key itself.
pub fn discovery_key(feed_key: &FeedKey) -> DiscoveryKey {
    *blake3::keyed_hash(&DISCOVERY_HASH_KEY, feed_key).as_bytes()
}

/// Generate a random local id.
pub fn generate_local_id() -> LocalId {
    let mut id = [0u8; ID_SIZE];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

// ── Keypair ───────────────────────────────────────────────────────────────────

/// The Noise protocol pattern HyperBloom uses.
///
/// Noise_XX: mutual authentication, both static keys transmitted encrypted.
/// Neither key is visible to a passive observer.
const NOISE_PATTERN: &str = "Noise_XX_25519_ChaChaPoly_BLAKE2s";

/// Upper bound for a single Noise message (handshake or transport).
pub const MAX_NOISE_MSG: usize = 65535;

/// Poly1305 tag appended to every encrypted message.
pub const TAG_LEN: usize = 16;

/// An X25519 keypair.
///
/// Used both for the long-term feed identity (loaded from disk) and for the
/// ephemeral per-controller Noise static key.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Keypair {
    /// Private key — zeroized on drop, never exposed directly.
    private: Zeroizing<[u8; 32]>,
    pub public: [u8; 32],
}

impl Keypair {
    /// Generate a new random X25519 keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let public = PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(secret.to_bytes()),
            public: *public.as_bytes(),
        }
    }

    /// Reconstruct a keypair from stored private key bytes.
    /// The public key is derived deterministically from the private key.
    pub fn from_private(private_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private_bytes);
        let public = PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(private_bytes),
            public: *public.as_bytes(),
        }
    }

    /// Serialize the private key for persistent storage.
    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(*self.private)
    }
}

/// What this process presents when it opens a secure stream.
///
/// One per controller. The Noise static key is generated fresh and never
/// persisted; the local id travels inside the encrypted handshake payload.
pub struct SessionIdentity {
    pub keypair: Keypair,
    pub local_id: LocalId,
}

impl SessionIdentity {
    pub fn generate() -> Self {
        Self {
            keypair: Keypair::generate(),
            local_id: generate_local_id(),
        }
    }
}

// ── Noise Handshake ───────────────────────────────────────────────────────────

/// Initiator side of the Noise_XX handshake.
///
/// Sends message 1, receives message 2 (which carries the responder's
/// local id), sends message 3 carrying its own local id.
pub struct NoiseInitiator {
    state: HandshakeState,
}

impl NoiseInitiator {
    /// Begin a handshake as the initiator.
    ///
    /// Returns the initiator state and the bytes of message 1.
    pub fn new(keypair: &Keypair) -> Result<(Self, Vec<u8>), CryptoError> {
        let mut state = Builder::new(NOISE_PATTERN.parse().map_err(|_| CryptoError::BadPattern)?)
            .local_private_key(&*keypair.private)
            .build_initiator()
            .map_err(CryptoError::Noise)?;

        let mut msg1 = vec![0u8; MAX_NOISE_MSG];
        let len = state
            .write_message(&[], &mut msg1)
            .map_err(CryptoError::Noise)?;
        msg1.truncate(len);

        Ok((Self { state }, msg1))
    }

    /// Process the responder's message 2 and complete the handshake.
    ///
    /// Returns the completed Session and message 3, which carries
    /// `local_id` encrypted to the responder.
    pub fn finish(
        mut self,
        msg2: &[u8],
        local_id: &LocalId,
    ) -> Result<(Session, Vec<u8>), CryptoError> {
        let mut payload = vec![0u8; msg2.len()];
        let len = self
            .state
            .read_message(msg2, &mut payload)
            .map_err(CryptoError::Noise)?;
        let peer_id = identity_from_payload(&payload[..len])?;

        let mut msg3 = vec![0u8; MAX_NOISE_MSG];
        let len = self
            .state
            .write_message(local_id, &mut msg3)
            .map_err(CryptoError::Noise)?;
        msg3.truncate(len);

        let session = Session::from_handshake(self.state, peer_id)?;
        Ok((session, msg3))
    }
}

/// Responder side of the Noise_XX handshake.
pub struct NoiseResponder {
    state: HandshakeState,
}

impl NoiseResponder {
    /// Begin a handshake as the responder.
    pub fn new(keypair: &Keypair) -> Result<Self, CryptoError> {
        let state = Builder::new(NOISE_PATTERN.parse().map_err(|_| CryptoError::BadPattern)?)
            .local_private_key(&*keypair.private)
            .build_responder()
            .map_err(CryptoError::Noise)?;

        Ok(Self { state })
    }

    /// Process the initiator's message 1 and write message 2,
    /// which carries `local_id` encrypted to the initiator.
    pub fn respond(
        mut self,
        msg1: &[u8],
        local_id: &LocalId,
    ) -> Result<(ResponderPending, Vec<u8>), CryptoError> {
        let mut payload = vec![0u8; msg1.len()];
        self.state
            .read_message(msg1, &mut payload)
            .map_err(CryptoError::Noise)?;

        let mut msg2 = vec![0u8; MAX_NOISE_MSG];
        let len = self
            .state
            .write_message(local_id, &mut msg2)
            .map_err(CryptoError::Noise)?;
        msg2.truncate(len);

        Ok((ResponderPending { state: self.state }, msg2))
    }
}

/// Responder waiting for message 3 from the initiator.
pub struct ResponderPending {
    state: HandshakeState,
}

impl ResponderPending {
    /// Read message 3 and complete the handshake.
    pub fn finish(mut self, msg3: &[u8]) -> Result<Session, CryptoError> {
        let mut payload = vec![0u8; msg3.len()];
        let len = self
            .state
            .read_message(msg3, &mut payload)
            .map_err(CryptoError::Noise)?;
        let peer_id = identity_from_payload(&payload[..len])?;

        Session::from_handshake(self.state, peer_id)
    }
}

fn identity_from_payload(payload: &[u8]) -> Result<LocalId, CryptoError> {
    payload
        .try_into()
        .map_err(|_| CryptoError::BadIdentity(payload.len()))
}

// ── Session ───────────────────────────────────────────────────────────────────

/// A completed Noise_XX session.
///
/// Uses StatelessTransportState with explicit nonces so the two directions
/// can be driven independently once the stream is split. Callers keep one
/// monotonically increasing nonce counter per direction.
pub struct Session {
    /// Local id the peer presented inside the encrypted handshake.
    pub peer_id: LocalId,
    /// The peer's Noise static public key.
    pub remote_static: [u8; 32],
    /// Noise handshake hash — identical on both sides.
    pub handshake_hash: [u8; 32],
    transport: StatelessTransportState,
}

impl Session {
    fn from_handshake(state: HandshakeState, peer_id: LocalId) -> Result<Self, CryptoError> {
        let remote_static: [u8; 32] = state
            .get_remote_static()
            .and_then(|k| k.try_into().ok())
            .ok_or(CryptoError::MissingRemoteStatic)?;
        let mut handshake_hash = [0u8; 32];
        let hash = state.get_handshake_hash();
        let n = hash.len().min(32);
        handshake_hash[..n].copy_from_slice(&hash[..n]);

        let transport = state
            .into_stateless_transport_mode()
            .map_err(CryptoError::Noise)?;

        Ok(Self {
            peer_id,
            remote_static,
            handshake_hash,
            transport,
        })
    }

    /// Encrypt `plaintext` under `nonce` into `out`, replacing its contents.
    pub fn encrypt(&self, nonce: u64, plaintext: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        out.clear();
        out.resize(plaintext.len() + TAG_LEN, 0);
        let written = self
            .transport
            .write_message(nonce, plaintext, out)
            .map_err(CryptoError::Noise)?;
        out.truncate(written);
        Ok(())
    }

    /// Decrypt `ciphertext` under `nonce` into `out`. Fails on MAC mismatch.
    pub fn decrypt(&self, nonce: u64, ciphertext: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        if ciphertext.len() < TAG_LEN {
            return Err(CryptoError::TooShort);
        }
        out.clear();
        out.resize(ciphertext.len(), 0);
        let written = self
            .transport
            .read_message(nonce, ciphertext, out)
            .map_err(CryptoError::Noise)?;
        out.truncate(written);
        Ok(())
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid Noise pattern string — this is a bug")]
    BadPattern,

    #[error("Noise protocol error: {0}")]
    Noise(#[from] snow::Error),

    #[error("handshake payload is {0} bytes, expected a {ID_SIZE}-byte local id")]
    BadIdentity(usize),

    #[error("peer static key missing after handshake")]
    MissingRemoteStatic,

    #[error("ciphertext too short (need at least {TAG_LEN} bytes for the MAC)")]
    TooShort,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
