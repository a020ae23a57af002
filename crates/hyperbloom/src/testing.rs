//! Test doubles for the controller's collaborators.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bloom_core::crypto::{DiscoveryKey, LocalId};
use bloom_core::{BoxTransport, Preamble, SecureStream};
use bloom_services::{FeedNode, NodeError, NodeFactory, NodeOptions};
use tokio::sync::mpsc;

use crate::swarm::{Connection, Swarm, SwarmError};

// ── Node ──────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockNode {
    pub full: bool,
    peers: Mutex<Vec<(BoxTransport, Option<Preamble>)>>,
    streams: Mutex<Vec<SecureStream>>,
    pub closes: AtomicUsize,
    pub fail_close: AtomicBool,
}

impl MockNode {
    pub fn peers(&self) -> Vec<Option<Preamble>> {
        self.peers.lock().unwrap().iter().map(|(_, p)| p.clone()).collect()
    }

    pub fn stream_peers(&self) -> Vec<LocalId> {
        self.streams.lock().unwrap().iter().map(|s| *s.peer_id()).collect()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedNode for MockNode {
    fn add_peer(&self, transport: BoxTransport, preamble: Option<Preamble>) {
        self.peers.lock().unwrap().push((transport, preamble));
    }

    fn add_stream(&self, stream: SecureStream) {
        self.streams.lock().unwrap().push(stream);
    }

    async fn close(&self) -> Result<(), NodeError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(NodeError::Closed);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MockFactory {
    pub built: AtomicUsize,
    pub fail_close: AtomicBool,
    /// `(full, storage present, initial records)` per build.
    pub seen: Mutex<Vec<(bool, bool, usize)>>,
    pub nodes: Mutex<Vec<Arc<MockNode>>>,
}

impl MockFactory {
    pub fn nodes(&self) -> Vec<Arc<MockNode>> {
        self.nodes.lock().unwrap().clone()
    }
}

impl NodeFactory for MockFactory {
    type Node = MockNode;

    fn build(&self, options: NodeOptions) -> Result<Arc<MockNode>, NodeError> {
        self.built.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push((
            options.full,
            options.storage.is_some(),
            options.initial.len(),
        ));
        let node = MockNode {
            full: options.full,
            ..MockNode::default()
        };
        node.fail_close
            .store(self.fail_close.load(Ordering::SeqCst), Ordering::SeqCst);
        let node = Arc::new(node);
        self.nodes.lock().unwrap().push(node.clone());
        Ok(node)
    }
}

// ── Swarm ─────────────────────────────────────────────────────────────────────

pub type JoinProbe = Box<dyn Fn(&DiscoveryKey) + Send + Sync>;

pub struct MockSwarm {
    pub joins: Mutex<Vec<DiscoveryKey>>,
    pub leaves: Mutex<Vec<DiscoveryKey>>,
    pub closes: AtomicUsize,
    pub fail_join: AtomicBool,
    pub fail_leave: AtomicBool,
    /// How long `join` takes to announce.
    pub join_delay: Mutex<Duration>,
    /// Runs inside `join`, before it returns.
    pub probe: Mutex<Option<JoinProbe>>,
    pub tx: mpsc::Sender<Connection>,
    rx: Mutex<Option<mpsc::Receiver<Connection>>>,
}

impl Default for MockSwarm {
    fn default() -> Self {
        let (tx, rx) = mpsc::channel(16);
        Self {
            joins: Mutex::default(),
            leaves: Mutex::default(),
            closes: AtomicUsize::new(0),
            fail_join: AtomicBool::new(false),
            fail_leave: AtomicBool::new(false),
            join_delay: Mutex::new(Duration::ZERO),
            probe: Mutex::new(None),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }
}

fn refused() -> SwarmError {
    SwarmError::Io(std::io::ErrorKind::ConnectionRefused.into())
}

#[async_trait]
impl Swarm for MockSwarm {
    async fn listen(&self, port: u16) -> Result<u16, SwarmError> {
        Ok(if port == 0 { 4242 } else { port })
    }

    async fn join(&self, channel: DiscoveryKey) -> Result<(), SwarmError> {
        if let Some(probe) = self.probe.lock().unwrap().as_ref() {
            probe(&channel);
        }
        if self.fail_join.load(Ordering::SeqCst) {
            return Err(refused());
        }
        let delay = *self.join_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.joins.lock().unwrap().push(channel);
        Ok(())
    }

    async fn leave(&self, channel: DiscoveryKey) -> Result<(), SwarmError> {
        self.leaves.lock().unwrap().push(channel);
        if self.fail_leave.load(Ordering::SeqCst) {
            return Err(refused());
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), SwarmError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn incoming(&self) -> Option<mpsc::Receiver<Connection>> {
        self.rx.lock().unwrap().take()
    }
}
