//! Feed node contract.
//!
//! A feed node owns one feed's state and speaks that feed's protocol with
//! peers. The controller only builds nodes, hands them connections, and
//! closes them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bloom_core::crypto::{DiscoveryKey, FeedKey, SessionIdentity};
use bloom_core::{BoxTransport, Preamble, PreambleError, SecureError, SecureStream};
use bytes::Bytes;
use zeroize::Zeroizing;

use crate::storage::{StorageError, ValueStorage};
use crate::trust::{Chain, TrustStore};

/// Everything a node is constructed from.
pub struct NodeOptions {
    pub feed_key: FeedKey,
    pub discovery_key: DiscoveryKey,
    pub private_key: Zeroizing<[u8; 32]>,
    /// Present for full nodes only.
    pub storage: Option<ValueStorage>,
    /// Records already loaded from `storage`.
    pub initial: Vec<Bytes>,
    pub trust: Arc<dyn TrustStore>,
    pub chain: Chain,
    pub full: bool,
    pub identity: Arc<SessionIdentity>,
    /// Bound on each peer handshake the node runs itself.
    pub handshake_timeout: Duration,
}

#[async_trait]
pub trait FeedNode: Send + Sync + 'static {
    /// Take ownership of a raw, unauthenticated transport.
    ///
    /// `preamble` is the open frame the router already read off the wire,
    /// with any bytes read past it. `None` means this side dialled out and
    /// must announce the feed itself.
    fn add_peer(&self, transport: BoxTransport, preamble: Option<Preamble>);

    /// Take ownership of a stream the router already authenticated.
    fn add_stream(&self, stream: SecureStream);

    /// Stop all peer sessions and release storage.
    async fn close(&self) -> Result<(), NodeError>;
}

/// Builds feed nodes for the controller.
pub trait NodeFactory: Send + Sync + 'static {
    type Node: FeedNode;

    fn build(&self, options: NodeOptions) -> Result<Arc<Self::Node>, NodeError>;
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("node is closed")]
    Closed,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("malformed peer message: {0}")]
    Message(#[from] serde_json::Error),
    #[error(transparent)]
    Secure(#[from] SecureError),
    #[error(transparent)]
    Preamble(#[from] PreambleError),
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    #[error("open frame names feed {0}, not this one")]
    WrongFeed(String),
    #[error("peer handshake timed out")]
    HandshakeTimeout,
}
