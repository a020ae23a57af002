//! HyperBloom controller — feed lifecycle and the accept loop.
//!
//! Per feed: absent → joining → joined → leaving → absent.
//!
//! `join` resolves the trust chain, opens storage for full nodes, builds
//! the node, registers it, and only then announces the discovery key. That
//! order means a connection produced by the announce always finds its feed
//! in the registry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bloom_core::config::{ConfigError, JoinPolicy};
use bloom_core::crypto::{discovery_key, DiscoveryKey, FeedKey, LocalId, SessionIdentity};
use bloom_core::short_hex;
use bloom_services::{
    ChainStore, FeedEntry, FeedNode, FeedRegistry, Link, NodeFactory, NodeOptions, TrustStore,
    ValueStorage,
};
use futures::future::join_all;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::error::{BloomError, CloseError};
use crate::options::BloomOptions;
use crate::router::{Router, RouterSnapshot};
use crate::swarm::{Connection, Swarm, TcpSwarm};
use crate::trust::TrustBridge;

/// Per-join options.
#[derive(Debug, Clone, Copy)]
pub struct JoinOptions {
    /// Persist the feed locally. Light nodes keep nothing on disk.
    pub full: bool,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self { full: true }
    }
}

impl JoinOptions {
    pub fn light() -> Self {
        Self { full: false }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BloomStats {
    pub feeds: usize,
    pub router: RouterSnapshot,
}

pub struct HyperBloom<F: NodeFactory> {
    options: BloomOptions,
    factory: F,
    trust: TrustBridge,
    swarm: Arc<dyn Swarm>,
    registry: FeedRegistry<F::Node>,
    router: Arc<Router<F::Node>>,
    identity: Arc<SessionIdentity>,
    closed: AtomicBool,
    // Joins hold the read side from registration through the announce;
    // close takes the write side before draining.
    lifecycle: RwLock<()>,
    shutdown: broadcast::Sender<()>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl<F: NodeFactory> HyperBloom<F> {
    /// Controller with a `ChainStore` trust store and a `TcpSwarm`, both
    /// configured from `options`.
    pub fn new(options: BloomOptions, factory: F) -> Result<Self, BloomError> {
        let trust: Arc<dyn TrustStore> = if options.trust.db.as_os_str().is_empty() {
            Arc::new(ChainStore::new(options.public_key))
        } else {
            Arc::new(ChainStore::with_persistence(
                options.public_key,
                options.trust.db.clone(),
            ))
        };
        let swarm = Arc::new(TcpSwarm::from_config(&options.discovery)?);
        Self::with_components(options, factory, trust, swarm)
    }

    /// Controller over caller-supplied collaborators. Must run inside a
    /// tokio runtime: the accept loop starts immediately.
    pub fn with_components(
        options: BloomOptions,
        factory: F,
        trust: Arc<dyn TrustStore>,
        swarm: Arc<dyn Swarm>,
    ) -> Result<Self, BloomError> {
        if options.storage.as_os_str().is_empty() {
            return Err(ConfigError::MissingStorage.into());
        }
        let incoming = swarm.incoming().ok_or(ConfigError::SwarmInUse)?;

        let identity = Arc::new(SessionIdentity::generate());
        let registry = FeedRegistry::new();
        let router = Arc::new(Router::new(
            registry.clone(),
            identity.clone(),
            options.routing(),
            options.handshake_timeout(),
        ));
        let (shutdown, _) = broadcast::channel(1);
        let accept_task = tokio::spawn(accept_loop(router.clone(), incoming, shutdown.subscribe()));

        tracing::info!(
            routing = ?options.routing(),
            local_id = short_hex(&identity.local_id),
            storage = %options.storage.display(),
            "hyperbloom controller started"
        );

        Ok(Self {
            options,
            factory,
            trust: TrustBridge::new(trust),
            swarm,
            registry,
            router,
            identity,
            closed: AtomicBool::new(false),
            lifecycle: RwLock::new(()),
            shutdown,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn public_key(&self) -> &FeedKey {
        &self.options.public_key
    }

    /// Session id presented on every secure stream this controller opens.
    pub fn local_id(&self) -> &LocalId {
        &self.identity.local_id
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn registry(&self) -> FeedRegistry<F::Node> {
        self.registry.clone()
    }

    pub fn is_joined(&self, feed_key: &FeedKey) -> bool {
        self.registry.contains(&discovery_key(feed_key))
    }

    pub fn node(&self, feed_key: &FeedKey) -> Option<Arc<F::Node>> {
        self.registry
            .get(&discovery_key(feed_key))
            .map(|entry| entry.node)
    }

    pub fn stats(&self) -> BloomStats {
        BloomStats {
            feeds: self.registry.len(),
            router: self.router.stats().snapshot(),
        }
    }

    /// Bind the swarm listener. `None` or `Some(0)` lets the swarm pick.
    pub async fn listen(&self, port: Option<u16>) -> Result<u16, BloomError> {
        self.check_open()?;
        Ok(self.swarm.listen(port.unwrap_or(0)).await?)
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Join a feed and return its node.
    ///
    /// Nothing stays registered or announced if any step fails.
    pub async fn join(
        &self,
        feed_key: FeedKey,
        options: JoinOptions,
    ) -> Result<Arc<F::Node>, BloomError> {
        self.check_open()?;
        let dk = discovery_key(&feed_key);
        if let Some(entry) = self.registry.get(&dk) {
            return self.already_joined(entry.node, &dk);
        }

        let chain = self.trust.get_chain(&feed_key).await?;

        let (storage, initial) = if options.full {
            let storage = ValueStorage::open(&self.options.storage, &dk);
            let initial = storage.load().await?;
            (Some(storage), initial)
        } else {
            (None, Vec::new())
        };
        let records = initial.len();

        let node = self.factory.build(NodeOptions {
            feed_key,
            discovery_key: dk,
            private_key: self.options.private_key.clone(),
            storage,
            initial,
            trust: self.trust.store(),
            chain,
            full: options.full,
            identity: self.identity.clone(),
            handshake_timeout: self.options.handshake_timeout(),
        })?;

        let _gate = self.lifecycle.read().await;
        if self.closed.load(Ordering::Acquire) {
            close_quietly(&node, &dk).await;
            return Err(BloomError::Closed);
        }

        let entry = FeedEntry {
            feed_key,
            discovery_key: dk,
            node: node.clone(),
            full: options.full,
            local_id: self.identity.local_id,
        };
        if let Err((winner, _)) = self.registry.insert_if_absent(entry) {
            // A concurrent join got there first.
            close_quietly(&node, &dk).await;
            return self.already_joined(winner, &dk);
        }

        if let Err(e) = self.swarm.join(dk).await {
            self.registry.remove(&dk);
            close_quietly(&node, &dk).await;
            return Err(e.into());
        }

        if self.closed.load(Ordering::Acquire) {
            // `close` started during the announce and is waiting on us.
            self.registry.remove(&dk);
            if let Err(e) = self.swarm.leave(dk).await {
                tracing::warn!(feed = short_hex(&dk), error = %e, "swarm leave failed");
            }
            close_quietly(&node, &dk).await;
            return Err(BloomError::Closed);
        }

        tracing::info!(feed = short_hex(&dk), full = options.full, records, "feed joined");
        Ok(node)
    }

    fn already_joined(
        &self,
        node: Arc<F::Node>,
        dk: &DiscoveryKey,
    ) -> Result<Arc<F::Node>, BloomError> {
        match self.options.join_policy {
            JoinPolicy::Idempotent => Ok(node),
            JoinPolicy::RejectDuplicate => Err(BloomError::AlreadyJoined(short_hex(dk))),
        }
    }

    /// Withdraw the feed's announce and close its node. Not joined is a no-op.
    pub async fn leave(&self, feed_key: &FeedKey) {
        let dk = discovery_key(feed_key);
        let entry = self.registry.remove(&dk);

        let withdraw = async {
            if let Err(e) = self.swarm.leave(dk).await {
                tracing::warn!(feed = short_hex(&dk), error = %e, "swarm leave failed");
            }
        };
        let close = async {
            if let Some(entry) = &entry {
                if let Err(e) = entry.node.close().await {
                    tracing::warn!(feed = short_hex(&dk), error = %e, "node close failed");
                }
            }
        };
        tokio::join!(withdraw, close);

        match entry {
            Some(_) => tracing::info!(feed = short_hex(&dk), "feed left"),
            None => tracing::debug!(feed = short_hex(&dk), "leave for a feed that was not joined"),
        }
    }

    /// Fire-and-forget chain extension.
    pub fn add_link(&self, root: FeedKey, link: Link) {
        self.trust.add_link(root, link);
    }

    /// Tear down every joined feed, the trust store and the swarm.
    ///
    /// Everything is torn down even when some of it fails; all failures are
    /// reported together. A second call returns immediately.
    pub async fn close(&self) -> Result<(), CloseError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _ = self.shutdown.send(());

        let _gate = self.lifecycle.write().await;
        let entries = self.registry.drain();
        let feeds = entries.len();
        let teardowns = entries.into_iter().map(|entry| async move {
            let dk = entry.discovery_key;
            let (left, closed) = tokio::join!(self.swarm.leave(dk), entry.node.close());
            let mut failures = Vec::new();
            if let Err(e) = left {
                failures.push(BloomError::Swarm(e));
            }
            if let Err(e) = closed {
                failures.push(BloomError::Node(e));
            }
            failures
        });
        let (feed_failures, trust_result) = tokio::join!(join_all(teardowns), self.trust.close());

        let mut failures: Vec<BloomError> = feed_failures.into_iter().flatten().collect();
        if let Err(e) = trust_result {
            failures.push(BloomError::Trust(e));
        }
        if let Err(e) = self.swarm.close().await {
            failures.push(BloomError::Swarm(e));
        }

        let task = self.accept_task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            let _ = task.await;
        }

        if failures.is_empty() {
            tracing::info!(feeds, "hyperbloom controller closed");
            Ok(())
        } else {
            tracing::warn!(feeds, failures = failures.len(), "hyperbloom controller closed with errors");
            Err(CloseError { failures })
        }
    }

    fn check_open(&self) -> Result<(), BloomError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BloomError::Closed);
        }
        Ok(())
    }
}

impl<F: NodeFactory> Drop for HyperBloom<F> {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.accept_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

async fn close_quietly<N: FeedNode>(node: &Arc<N>, dk: &DiscoveryKey) {
    if let Err(e) = node.close().await {
        tracing::warn!(feed = short_hex(dk), error = %e, "failed to close abandoned node");
    }
}

/// Route each surfaced connection on its own task until shutdown.
async fn accept_loop<N: FeedNode>(
    router: Arc<Router<N>>,
    mut incoming: mpsc::Receiver<Connection>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            connection = incoming.recv() => match connection {
                Some(connection) => {
                    let router = router.clone();
                    tokio::spawn(async move {
                        router.route(connection).await;
                    });
                }
                None => break,
            },
        }
    }
    tracing::debug!("accept loop stopped");
}
