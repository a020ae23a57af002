//! Value node — the reference feed node.
//!
//! Holds a set of opaque byte values. Full nodes persist every new value to
//! their `ValueStorage`; light nodes keep them in memory only. Every peer
//! session first sends a snapshot of the whole set and then forwards each
//! newly inserted batch, skipping the session the batch arrived on.
//!
//! Peer messages travel over a `SecureStream` as JSON, values hex-encoded.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bloom_core::crypto::{DiscoveryKey, FeedKey, SessionIdentity};
use bloom_core::secure::{SecureWriter, MAX_PLAINTEXT};
use bloom_core::{short_hex, BoxTransport, OpenFrame, Preamble, Rewind, SecureStream};
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, oneshot};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::node::{FeedNode, NodeError, NodeFactory, NodeOptions};
use crate::storage::ValueStorage;
use crate::trust::Chain;

/// Capacity of the change feed. A session that falls further behind is
/// resynchronised with a fresh snapshot.
const CHANGE_CAPACITY: usize = 256;

/// How long `close` waits for a session to wind down before aborting it.
const SESSION_DRAIN: Duration = Duration::from_secs(2);

/// Batch origin for values inserted locally.
const LOCAL_ORIGIN: u64 = 0;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum NodeMessage {
    Values { values: Vec<String> },
}

#[derive(Debug)]
struct Batch {
    origin: u64,
    values: Vec<Bytes>,
}

struct Inner {
    feed_key: FeedKey,
    discovery_key: DiscoveryKey,
    full: bool,
    chain: Chain,
    storage: Option<ValueStorage>,
    identity: Arc<SessionIdentity>,
    handshake_timeout: Duration,

    values: DashSet<Bytes>,
    changes: broadcast::Sender<Arc<Batch>>,
    shutdown: broadcast::Sender<()>,
    closed: AtomicBool,
    sessions: DashMap<u64, JoinHandle<()>>,
    next_session: AtomicU64,
}

pub struct ValueNode {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ValueNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueNode")
            .field("full", &self.inner.full)
            .finish_non_exhaustive()
    }
}

impl ValueNode {
    pub fn new(options: NodeOptions) -> Self {
        let NodeOptions {
            feed_key,
            discovery_key,
            storage,
            initial,
            chain,
            full,
            identity,
            handshake_timeout,
            ..
        } = options;

        let values = DashSet::new();
        for value in initial {
            values.insert(value);
        }
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        let (shutdown, _) = broadcast::channel(1);

        Self {
            inner: Arc::new(Inner {
                feed_key,
                discovery_key,
                full,
                chain,
                storage,
                identity,
                handshake_timeout,
                values,
                changes,
                shutdown,
                closed: AtomicBool::new(false),
                sessions: DashMap::new(),
                next_session: AtomicU64::new(LOCAL_ORIGIN + 1),
            }),
        }
    }

    pub fn feed_key(&self) -> &FeedKey {
        &self.inner.feed_key
    }

    pub fn discovery_key(&self) -> &DiscoveryKey {
        &self.inner.discovery_key
    }

    pub fn is_full(&self) -> bool {
        self.inner.full
    }

    pub fn chain(&self) -> &Chain {
        &self.inner.chain
    }

    /// Insert values, persisting and broadcasting the ones not seen before.
    /// Returns how many were new.
    pub async fn bulk_insert(&self, values: Vec<Bytes>) -> Result<usize, NodeError> {
        self.inner.insert_from(LOCAL_ORIGIN, values).await
    }

    pub fn has(&self, value: &[u8]) -> bool {
        self.inner.values.contains(value)
    }

    pub fn len(&self) -> usize {
        self.inner.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.values.is_empty()
    }

    /// Peer sessions currently running or handshaking.
    pub fn peer_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Watch values in `start..end` (byte-wise order). The first batch is
    /// whatever already matches, if anything.
    pub fn watch(&self, start: impl Into<Bytes>, end: impl Into<Bytes>) -> Watch {
        let changes = self.inner.changes.subscribe();
        let shutdown = self.inner.shutdown.subscribe();
        let start = start.into();
        let end = end.into();

        let mut existing: Vec<Bytes> = self
            .inner
            .values
            .iter()
            .filter(|v| in_range(v.key(), &start, &end))
            .map(|v| v.key().clone())
            .collect();
        existing.sort();

        let mut pending = VecDeque::new();
        if !existing.is_empty() {
            pending.push_back(existing);
        }

        Watch {
            start,
            end,
            pending,
            changes,
            shutdown,
            done: self.inner.closed.load(Ordering::Acquire),
        }
    }

    /// Run a session on whatever stream `establish` produces, bounded by the
    /// handshake timeout and cut short by `close`.
    fn spawn_session<F>(&self, establish: F)
    where
        F: Future<Output = Result<SecureStream, NodeError>> + Send + 'static,
    {
        let inner = self.inner.clone();
        let mut shutdown = inner.shutdown.subscribe();
        if inner.closed.load(Ordering::Acquire) {
            tracing::debug!(feed = short_hex(&inner.discovery_key), "node closed, dropping peer");
            return;
        }
        let id = inner.next_session.fetch_add(1, Ordering::Relaxed);

        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let task_inner = inner.clone();
        let handle = tokio::spawn(async move {
            let inner = task_inner;
            // The handle must be in the map before this task can remove it.
            let _ = registered_rx.await;
            let feed = short_hex(&inner.discovery_key);
            let established = tokio::select! {
                _ = shutdown.recv() => None,
                result = tokio::time::timeout(inner.handshake_timeout, establish) => match result {
                    Ok(Ok(stream)) => Some(stream),
                    Ok(Err(e)) => {
                        tracing::warn!(feed, error = %e, "peer handshake failed");
                        None
                    }
                    Err(_) => {
                        tracing::warn!(feed, error = %NodeError::HandshakeTimeout, "dropping peer");
                        None
                    }
                },
            };
            if let Some(stream) = established {
                run_session(inner.clone(), id, stream, shutdown).await;
            }
            inner.sessions.remove(&id);
        });
        inner.sessions.insert(id, handle);
        let _ = registered_tx.send(());
    }
}

#[async_trait]
impl FeedNode for ValueNode {
    fn add_peer(&self, transport: BoxTransport, preamble: Option<Preamble>) {
        self.spawn_session(establish_peer(
            transport,
            preamble,
            self.inner.identity.clone(),
            self.inner.discovery_key,
        ));
    }

    fn add_stream(&self, stream: SecureStream) {
        self.spawn_session(async move { Ok::<_, NodeError>(stream) });
    }

    async fn close(&self) -> Result<(), NodeError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _ = self.inner.shutdown.send(());

        let ids: Vec<u64> = self.inner.sessions.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, mut handle)) = self.inner.sessions.remove(&id) {
                if tokio::time::timeout(SESSION_DRAIN, &mut handle).await.is_err() {
                    handle.abort();
                }
            }
        }
        tracing::debug!(
            feed = short_hex(&self.inner.discovery_key),
            values = self.inner.values.len(),
            "value node closed"
        );
        Ok(())
    }
}

impl Inner {
    async fn insert_from(&self, origin: u64, values: Vec<Bytes>) -> Result<usize, NodeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NodeError::Closed);
        }
        let fresh: Vec<Bytes> = values
            .into_iter()
            .filter(|v| self.values.insert(v.clone()))
            .collect();
        if fresh.is_empty() {
            return Ok(0);
        }
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.append(&fresh).await {
                // Unpersisted values must stay insertable.
                for value in &fresh {
                    self.values.remove(value);
                }
                return Err(e.into());
            }
        }
        let count = fresh.len();
        // No subscribers is fine.
        let _ = self.changes.send(Arc::new(Batch {
            origin,
            values: fresh,
        }));
        Ok(count)
    }

    fn snapshot(&self) -> Vec<Bytes> {
        self.values.iter().map(|v| v.key().clone()).collect()
    }

    async fn apply(&self, origin: u64, message: &[u8]) -> Result<usize, NodeError> {
        let NodeMessage::Values { values } = serde_json::from_slice(message)?;
        let decoded = values
            .iter()
            .filter_map(|v| hex::decode(v).ok())
            .map(Bytes::from)
            .collect();
        self.insert_from(origin, decoded).await
    }
}

// ── Peer Session ──────────────────────────────────────────────────────────────

/// Secure a raw transport. Without a preamble this side dialled out, so it
/// announces the feed and leads the handshake.
async fn establish_peer(
    mut transport: BoxTransport,
    preamble: Option<Preamble>,
    identity: Arc<SessionIdentity>,
    discovery_key: DiscoveryKey,
) -> Result<SecureStream, NodeError> {
    match preamble {
        None => {
            let open = OpenFrame::new(discovery_key).encode()?;
            transport.write_all(&open).await?;
            Ok(SecureStream::initiate(transport, &identity).await?)
        }
        Some(preamble) => {
            if preamble.open.discovery_key != discovery_key {
                return Err(NodeError::WrongFeed(short_hex(&preamble.open.discovery_key)));
            }
            let io: BoxTransport = Box::new(Rewind::new(transport, preamble.extra));
            Ok(SecureStream::accept(io, &identity).await?)
        }
    }
}

async fn run_session(
    inner: Arc<Inner>,
    id: u64,
    stream: SecureStream,
    mut shutdown: broadcast::Receiver<()>,
) {
    // Subscribe before taking the snapshot so nothing falls between them.
    let mut changes = inner.changes.subscribe();
    let peer = short_hex(stream.peer_id());
    let feed = short_hex(&inner.discovery_key);
    tracing::debug!(feed, peer, session = id, "peer session started");

    let (mut reader, mut writer) = stream.into_split();

    let reader_inner = inner.clone();
    let mut reader_task = tokio::spawn(async move {
        loop {
            match reader.recv().await {
                Ok(Some(message)) => match reader_inner.apply(id, &message).await {
                    Ok(_) => {}
                    Err(NodeError::Closed) => break,
                    Err(e) => tracing::warn!(session = id, error = %e, "ignoring peer message"),
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(session = id, error = %e, "peer read failed");
                    break;
                }
            }
        }
    });

    let result: Result<(), NodeError> = async {
        send_values(&mut writer, &inner.snapshot()).await?;
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = &mut reader_task => break,
                batch = changes.recv() => match batch {
                    Ok(batch) if batch.origin == id => {}
                    Ok(batch) => send_values(&mut writer, &batch.values).await?,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(session = id, skipped, "session lagged, resending snapshot");
                        send_values(&mut writer, &inner.snapshot()).await?;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        Ok(())
    }
    .await;

    reader_task.abort();
    let _ = writer.shutdown().await;
    match result {
        Ok(()) => tracing::debug!(feed, peer, session = id, "peer session ended"),
        Err(e) => tracing::debug!(feed, peer, session = id, error = %e, "peer session failed"),
    }
}

/// Send `values` as one or more messages, each within a single frame.
async fn send_values(writer: &mut SecureWriter, values: &[Bytes]) -> Result<(), NodeError> {
    // Room for the JSON envelope around the hex strings.
    const BUDGET: usize = MAX_PLAINTEXT - 64;

    let mut chunk: Vec<String> = Vec::new();
    let mut size = 0usize;
    for value in values {
        let cost = value.len() * 2 + 3;
        if cost > BUDGET {
            tracing::warn!(len = value.len(), "value too large to replicate, skipping");
            continue;
        }
        if size + cost > BUDGET {
            send_message(writer, std::mem::take(&mut chunk)).await?;
            size = 0;
        }
        chunk.push(hex::encode(value));
        size += cost;
    }
    if !chunk.is_empty() {
        send_message(writer, chunk).await?;
    }
    Ok(())
}

async fn send_message(writer: &mut SecureWriter, values: Vec<String>) -> Result<(), NodeError> {
    let bytes = serde_json::to_vec(&NodeMessage::Values { values })?;
    writer.send(&bytes).await?;
    Ok(())
}

fn in_range(value: &[u8], start: &[u8], end: &[u8]) -> bool {
    value >= start && value < end
}

// ── Watch ─────────────────────────────────────────────────────────────────────

/// Batches of values in a range, as they arrive.
pub struct Watch {
    start: Bytes,
    end: Bytes,
    pending: VecDeque<Vec<Bytes>>,
    changes: broadcast::Receiver<Arc<Batch>>,
    shutdown: broadcast::Receiver<()>,
    done: bool,
}

impl Watch {
    /// Next non-empty batch, or `None` once the node is closed.
    pub async fn next(&mut self) -> Option<Vec<Bytes>> {
        if let Some(batch) = self.pending.pop_front() {
            return Some(batch);
        }
        while !self.done {
            tokio::select! {
                _ = self.shutdown.recv() => self.done = true,
                batch = self.changes.recv() => match batch {
                    Ok(batch) => {
                        let matching: Vec<Bytes> = batch
                            .values
                            .iter()
                            .filter(|v| in_range(v, &self.start, &self.end))
                            .cloned()
                            .collect();
                        if !matching.is_empty() {
                            return Some(matching);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "watch lagged behind the change feed");
                    }
                    Err(RecvError::Closed) => self.done = true,
                },
            }
        }
        None
    }
}

// ── Factory ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct ValueNodeFactory;

impl NodeFactory for ValueNodeFactory {
    type Node = ValueNode;

    fn build(&self, options: NodeOptions) -> Result<Arc<ValueNode>, NodeError> {
        Ok(Arc::new(ValueNode::new(options)))
    }
}
