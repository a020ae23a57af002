//! Trust store — authorization chains for feeds.
//!
//! A chain links a feed's root key to this process's own key. The chain
//! semantics (who signed what) belong to the feed node; the store only
//! resolves, extends, and persists them.
//!
//! `get_chain(own key)` is always the empty chain. Any other feed needs a
//! chain previously added with `add_chain`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bloom_core::crypto::FeedKey;
use bloom_core::short_hex;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// One opaque chain extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link(pub Vec<u8>);

/// Authorization chain rooted at a feed key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    pub root: FeedKey,
    pub links: Vec<Link>,
}

impl Chain {
    pub fn empty(root: FeedKey) -> Self {
        Self {
            root,
            links: Vec::new(),
        }
    }
}

/// The contract the controller and feed nodes consume.
#[async_trait]
pub trait TrustStore: Send + Sync {
    /// Resolve the chain that authorizes this process on `feed_key`.
    async fn get_chain(&self, feed_key: &FeedKey) -> Result<Chain, TrustError>;

    /// Append `links` to the chain rooted at `root` and persist it.
    async fn add_chain(&self, root: &FeedKey, links: Vec<Link>) -> Result<(), TrustError>;

    async fn close(&self) -> Result<(), TrustError>;
}

#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    #[error("no authorization chain for feed {0}")]
    NoChain(String),
    #[error("cannot add an empty chain")]
    EmptyChain,
    #[error("trust store is closed")]
    Closed,
    #[error("failed to persist chains to {0}: {1}")]
    Persist(PathBuf, std::io::Error),
    #[error("failed to serialize chains: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Chains keyed by root, optionally persisted as JSON.
///
/// When constructed with a `persist_path`, chains are written to disk on
/// every mutation and reloaded on startup. A mutation that cannot be
/// persisted is undone in memory as well.
#[derive(Clone)]
pub struct ChainStore {
    owner: FeedKey,
    chains: Arc<DashMap<FeedKey, Vec<Link>>>,
    persist_path: Arc<Option<PathBuf>>,
    closed: Arc<AtomicBool>,
    // Serializes extend-then-persist so a rollback only undoes its own links.
    write_lock: Arc<Mutex<()>>,
}

impl ChainStore {
    /// In-memory store for `owner` (this process's public key).
    pub fn new(owner: FeedKey) -> Self {
        Self {
            owner,
            chains: Arc::new(DashMap::new()),
            persist_path: Arc::new(None),
            closed: Arc::new(AtomicBool::new(false)),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Store that persists to `path`, loading existing chains if present.
    pub fn with_persistence(owner: FeedKey, path: PathBuf) -> Self {
        let store = Self {
            owner,
            chains: Arc::new(DashMap::new()),
            persist_path: Arc::new(Some(path)),
            closed: Arc::new(AtomicBool::new(false)),
            write_lock: Arc::new(Mutex::new(())),
        };
        store.load_from_disk();
        store
    }

    /// Number of roots with a stored chain.
    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    fn check_open(&self) -> Result<(), TrustError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TrustError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl TrustStore for ChainStore {
    async fn get_chain(&self, feed_key: &FeedKey) -> Result<Chain, TrustError> {
        self.check_open()?;
        if *feed_key == self.owner {
            return Ok(Chain::empty(*feed_key));
        }
        self.chains
            .get(feed_key)
            .map(|links| Chain {
                root: *feed_key,
                links: links.value().clone(),
            })
            .ok_or_else(|| TrustError::NoChain(hex::encode(feed_key)))
    }

    async fn add_chain(&self, root: &FeedKey, links: Vec<Link>) -> Result<(), TrustError> {
        self.check_open()?;
        if links.is_empty() {
            return Err(TrustError::EmptyChain);
        }
        let count = links.len();

        let _guard = self.write_lock.lock().await;
        let previous = self.chains.get(root).map(|chain| chain.len());
        self.chains.entry(*root).or_default().extend(links);
        if let Err(e) = self.save_to_disk().await {
            match previous {
                Some(len) => {
                    if let Some(mut links) = self.chains.get_mut(root) {
                        links.truncate(len);
                    }
                }
                None => {
                    self.chains.remove(root);
                }
            }
            return Err(e);
        }
        tracing::debug!(root = short_hex(root), links = count, "chain extended");
        Ok(())
    }

    async fn close(&self) -> Result<(), TrustError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        self.save_to_disk().await
    }
}

impl ChainStore {
    /// Serialize all chains to disk as JSON.
    async fn save_to_disk(&self) -> Result<(), TrustError> {
        let path = match self.persist_path.as_ref() {
            Some(p) => p,
            None => return Ok(()),
        };
        let snapshot: HashMap<String, Vec<String>> = self
            .chains
            .iter()
            .map(|entry| {
                let links = entry.value().iter().map(|l| hex::encode(&l.0)).collect();
                (hex::encode(entry.key()), links)
            })
            .collect();
        let json = serde_json::to_string_pretty(&snapshot)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TrustError::Persist(path.clone(), e))?;
        }
        tokio::fs::write(path, json)
            .await
            .map_err(|e| TrustError::Persist(path.clone(), e))
    }

    /// Load chains from disk. Called once during construction.
    fn load_from_disk(&self) {
        let path = match self.persist_path.as_ref() {
            Some(p) => p,
            None => return,
        };
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to read trust chains");
                return;
            }
        };
        let map: HashMap<String, Vec<String>> = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to parse trust chains");
                return;
            }
        };
        let mut loaded = 0usize;
        for (hex_root, hex_links) in &map {
            let root: FeedKey = match hex::decode(hex_root).ok().and_then(|b| b.try_into().ok()) {
                Some(r) => r,
                None => continue,
            };
            let links: Vec<Link> = hex_links
                .iter()
                .filter_map(|l| hex::decode(l).ok())
                .map(Link)
                .collect();
            self.chains.insert(root, links);
            loaded += 1;
        }
        if loaded > 0 {
            tracing::info!(count = loaded, path = %path.display(), "loaded persisted trust chains");
        }
    }
}
