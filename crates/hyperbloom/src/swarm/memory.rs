//! In-process swarm.
//!
//! Swarms created from the same `MemoryNetwork` find each other by discovery
//! key. Joining a key connects the joiner, as initiator, to every swarm
//! already announcing it; the other end sees an accepted connection. The
//! accepting side gets no channel hint unless it opted in with
//! `with_acceptor_hints`, so by default routing must read the open frame.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bloom_core::crypto::{DiscoveryKey, LocalId};
use bloom_core::short_hex;
use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc;

use super::{
    Connection, ConnectionHandle, ConnectionInfo, HandshakeHook, HandshakeVerdict, Swarm,
    SwarmError, INCOMING_CAPACITY,
};

/// Buffer size of each in-memory pipe.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Ports handed out by `listen(0)` start here.
const EPHEMERAL_BASE: u16 = 40_000;

// ── Network ───────────────────────────────────────────────────────────────────

/// Shared rendezvous for a set of `MemorySwarm`s.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    /// Announcing swarms per discovery key, in join order.
    members: DashMap<DiscoveryKey, Vec<u64>>,
    swarms: DashMap<u64, Arc<Peer>>,
    next_id: AtomicU64,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new swarm attached to this network.
    pub fn swarm(&self) -> MemorySwarm {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(INCOMING_CAPACITY);
        let peer = Arc::new(Peer {
            id,
            host: format!("mem-{id}"),
            port: AtomicU16::new(0),
            tx,
            acceptor_hints: AtomicBool::new(false),
            seen: DashMap::new(),
            joined: DashSet::new(),
            closed: AtomicBool::new(false),
        });
        self.inner.swarms.insert(id, peer.clone());
        MemorySwarm {
            peer,
            network: self.clone(),
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Swarms currently announcing `channel`.
    pub fn members(&self, channel: &DiscoveryKey) -> usize {
        self.inner.members.get(channel).map(|m| m.len()).unwrap_or(0)
    }

    fn peer(&self, id: u64) -> Option<Arc<Peer>> {
        self.inner.swarms.get(&id).map(|p| p.value().clone())
    }
}

// ── Swarm ─────────────────────────────────────────────────────────────────────

struct Peer {
    id: u64,
    host: String,
    port: AtomicU16,
    tx: mpsc::Sender<Connection>,
    acceptor_hints: AtomicBool,
    /// Verified peer ids per channel, with the swarm each one came from.
    seen: DashMap<(LocalId, DiscoveryKey), u64>,
    joined: DashSet<DiscoveryKey>,
    closed: AtomicBool,
}

impl Peer {
    /// Drop dedup records for `channel`, optionally only those from `remote`.
    fn forget(&self, channel: &DiscoveryKey, remote: Option<u64>) {
        self.seen
            .retain(|(_, c), from| !(c == channel && remote.map_or(true, |r| *from == r)));
    }
}

pub struct MemorySwarm {
    peer: Arc<Peer>,
    network: MemoryNetwork,
    rx: Mutex<Option<mpsc::Receiver<Connection>>>,
}

impl MemorySwarm {
    /// Tell the accepting side which channel each connection is for.
    pub fn with_acceptor_hints(self) -> Self {
        self.peer.acceptor_hints.store(true, Ordering::Relaxed);
        self
    }

    pub fn host(&self) -> &str {
        &self.peer.host
    }

    /// Pipe a fresh connection between this swarm (initiator) and `remote`.
    async fn connect(&self, remote: &Arc<Peer>, channel: DiscoveryKey) {
        let (local_io, remote_io) = tokio::io::duplex(PIPE_CAPACITY);

        let hint = remote
            .acceptor_hints
            .load(Ordering::Relaxed)
            .then_some(channel);
        let inbound = Connection {
            transport: Box::new(remote_io),
            info: ConnectionInfo {
                host: self.peer.host.clone(),
                port: self.peer.port.load(Ordering::Relaxed),
                initiator: false,
                channel: hint,
            },
            handle: ConnectionHandle::new(Arc::new(DedupHook {
                peer: remote.clone(),
                channel,
                remote: self.peer.id,
            })),
        };
        let outbound = Connection {
            transport: Box::new(local_io),
            info: ConnectionInfo {
                host: remote.host.clone(),
                port: remote.port.load(Ordering::Relaxed),
                initiator: true,
                channel: Some(channel),
            },
            handle: ConnectionHandle::new(Arc::new(DedupHook {
                peer: self.peer.clone(),
                channel,
                remote: remote.id,
            })),
        };

        if remote.tx.send(inbound).await.is_err() {
            tracing::debug!(remote = %remote.host, "remote swarm stopped consuming");
            return;
        }
        if self.peer.tx.send(outbound).await.is_err() {
            tracing::debug!(host = %self.peer.host, "swarm stopped consuming");
            return;
        }
        tracing::debug!(
            host = %self.peer.host,
            remote = %remote.host,
            channel = short_hex(&channel),
            "memory connection opened"
        );
    }
}

#[async_trait]
impl Swarm for MemorySwarm {
    async fn listen(&self, port: u16) -> Result<u16, SwarmError> {
        if self.peer.closed.load(Ordering::Acquire) {
            return Err(SwarmError::Closed);
        }
        let port = if port == 0 {
            EPHEMERAL_BASE.wrapping_add(self.peer.id as u16)
        } else {
            port
        };
        self.peer.port.store(port, Ordering::Relaxed);
        Ok(port)
    }

    async fn join(&self, channel: DiscoveryKey) -> Result<(), SwarmError> {
        if self.peer.closed.load(Ordering::Acquire) {
            return Err(SwarmError::Closed);
        }
        if !self.peer.joined.insert(channel) {
            return Ok(());
        }
        let existing: Vec<u64> = {
            let mut members = self.network.inner.members.entry(channel).or_default();
            let existing = members.clone();
            members.push(self.peer.id);
            existing
        };

        for remote in existing.into_iter().filter_map(|id| self.network.peer(id)) {
            if remote.closed.load(Ordering::Acquire) {
                continue;
            }
            self.connect(&remote, channel).await;
        }
        Ok(())
    }

    async fn leave(&self, channel: DiscoveryKey) -> Result<(), SwarmError> {
        if self.peer.joined.remove(&channel).is_none() {
            return Ok(());
        }
        let remaining: Vec<u64> = match self.network.inner.members.get_mut(&channel) {
            Some(mut members) => {
                members.retain(|id| *id != self.peer.id);
                members.clone()
            }
            None => Vec::new(),
        };
        self.network
            .inner
            .members
            .remove_if(&channel, |_, members| members.is_empty());

        self.peer.forget(&channel, None);
        for remote in remaining.into_iter().filter_map(|id| self.network.peer(id)) {
            remote.forget(&channel, Some(self.peer.id));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), SwarmError> {
        if self.peer.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let channels: Vec<DiscoveryKey> = self.peer.joined.iter().map(|c| *c).collect();
        for channel in channels {
            self.leave(channel).await?;
        }
        self.network.inner.swarms.remove(&self.peer.id);
        Ok(())
    }

    fn incoming(&self) -> Option<mpsc::Receiver<Connection>> {
        self.rx.lock().ok().and_then(|mut rx| rx.take())
    }
}

/// Rejects a second connection from the same peer on the same channel.
struct DedupHook {
    peer: Arc<Peer>,
    channel: DiscoveryKey,
    remote: u64,
}

impl HandshakeHook for DedupHook {
    fn on_handshake(&self, peer_id: &LocalId) -> HandshakeVerdict {
        use dashmap::mapref::entry::Entry;
        match self.peer.seen.entry((*peer_id, self.channel)) {
            Entry::Occupied(_) => HandshakeVerdict::Duplicate,
            Entry::Vacant(slot) => {
                slot.insert(self.remote);
                HandshakeVerdict::Keep
            }
        }
    }
}
