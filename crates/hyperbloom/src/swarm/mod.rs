//! Swarm substrate — announces discovery keys and surfaces connections.
//!
//! The controller consumes a swarm through the `Swarm` trait. Connections
//! arrive on a channel taken once with `incoming()`, both the ones this side
//! dialled (`initiator == true`, channel known) and the ones it accepted.

mod memory;
mod tcp;

use std::sync::Arc;

use async_trait::async_trait;
use bloom_core::crypto::{DiscoveryKey, LocalId};
use bloom_core::BoxTransport;
use tokio::sync::mpsc;

pub use memory::{MemoryNetwork, MemorySwarm};
pub use tcp::TcpSwarm;

/// Queue depth between a swarm and its consumer.
pub(crate) const INCOMING_CAPACITY: usize = 64;

#[async_trait]
pub trait Swarm: Send + Sync + 'static {
    /// Bind the transport listener. Port 0 lets the substrate pick.
    /// Returns the bound port.
    async fn listen(&self, port: u16) -> Result<u16, SwarmError>;

    /// Announce `channel` and connect to peers announcing it.
    async fn join(&self, channel: DiscoveryKey) -> Result<(), SwarmError>;

    /// Withdraw the announce for `channel`.
    async fn leave(&self, channel: DiscoveryKey) -> Result<(), SwarmError>;

    async fn close(&self) -> Result<(), SwarmError>;

    /// The connection stream. Yields `Some` exactly once.
    fn incoming(&self) -> Option<mpsc::Receiver<Connection>>;
}

/// What the substrate knows about a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub initiator: bool,
    /// Discovery key the substrate already bound this connection to, if any.
    pub channel: Option<DiscoveryKey>,
}

/// A raw connection plus the substrate's metadata and handshake hook.
pub struct Connection {
    pub transport: BoxTransport,
    pub info: ConnectionInfo,
    pub handle: ConnectionHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeVerdict {
    Keep,
    /// The substrate already holds a connection to this peer.
    Duplicate,
}

/// Substrate-side observer of completed secure handshakes.
pub trait HandshakeHook: Send + Sync {
    fn on_handshake(&self, peer_id: &LocalId) -> HandshakeVerdict;
}

/// Lets the router report a peer's verified id back to the substrate that
/// produced the connection.
#[derive(Clone, Default)]
pub struct ConnectionHandle {
    hook: Option<Arc<dyn HandshakeHook>>,
}

impl ConnectionHandle {
    pub fn new(hook: Arc<dyn HandshakeHook>) -> Self {
        Self { hook: Some(hook) }
    }

    /// A handle whose substrate does no peer deduplication.
    pub fn detached() -> Self {
        Self { hook: None }
    }

    pub fn handshake(&self, peer_id: &LocalId) -> HandshakeVerdict {
        match &self.hook {
            Some(hook) => hook.on_handshake(peer_id),
            None => HandshakeVerdict::Keep,
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("hooked", &self.hook.is_some())
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("swarm is closed")]
    Closed,

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}
