//! Feed registry — the feeds this controller has joined.
//!
//! Keyed on the hex-encoded discovery key. An entry is owned by the registry
//! from the moment `join` inserts it until `leave` or `close` removes it, and
//! an existing entry is never overwritten.

use std::sync::Arc;

use bloom_core::crypto::{DiscoveryKey, FeedKey, LocalId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// One joined feed.
#[derive(Debug)]
pub struct FeedEntry<N> {
    pub feed_key: FeedKey,
    pub discovery_key: DiscoveryKey,
    pub node: Arc<N>,
    /// Persisted (full) or in-memory (light) node.
    pub full: bool,
    /// Session identity presented on this feed's connections.
    pub local_id: LocalId,
}

// Manual impl so `N` itself need not be `Clone`.
impl<N> Clone for FeedEntry<N> {
    fn clone(&self) -> Self {
        Self {
            feed_key: self.feed_key,
            discovery_key: self.discovery_key,
            node: self.node.clone(),
            full: self.full,
            local_id: self.local_id,
        }
    }
}

/// Per-controller registry. Cloning shares the underlying map.
pub struct FeedRegistry<N> {
    feeds: Arc<DashMap<String, FeedEntry<N>>>,
}

impl<N> Clone for FeedRegistry<N> {
    fn clone(&self) -> Self {
        Self {
            feeds: self.feeds.clone(),
        }
    }
}

impl<N> Default for FeedRegistry<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N> FeedRegistry<N> {
    pub fn new() -> Self {
        Self {
            feeds: Arc::new(DashMap::new()),
        }
    }

    fn key(discovery_key: &DiscoveryKey) -> String {
        hex::encode(discovery_key)
    }

    /// Insert `entry` unless its feed is already registered.
    ///
    /// Returns `Ok(())` if inserted, or `Err(existing node)` if another entry
    /// won. The losing entry is handed back untouched inside the error tuple.
    pub fn insert_if_absent(&self, entry: FeedEntry<N>) -> Result<(), (Arc<N>, FeedEntry<N>)> {
        match self.feeds.entry(Self::key(&entry.discovery_key)) {
            Entry::Occupied(existing) => Err((existing.get().node.clone(), entry)),
            Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
        }
    }

    pub fn get(&self, discovery_key: &DiscoveryKey) -> Option<FeedEntry<N>> {
        self.feeds
            .get(&Self::key(discovery_key))
            .map(|e| e.value().clone())
    }

    pub fn remove(&self, discovery_key: &DiscoveryKey) -> Option<FeedEntry<N>> {
        self.feeds
            .remove(&Self::key(discovery_key))
            .map(|(_, entry)| entry)
    }

    pub fn contains(&self, discovery_key: &DiscoveryKey) -> bool {
        self.feeds.contains_key(&Self::key(discovery_key))
    }

    /// Remove and return every entry present right now.
    pub fn drain(&self) -> Vec<FeedEntry<N>> {
        let keys: Vec<String> = self.feeds.iter().map(|e| e.key().clone()).collect();
        keys.into_iter()
            .filter_map(|k| self.feeds.remove(&k).map(|(_, entry)| entry))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.feeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.feeds.is_empty()
    }

    /// Discovery keys of every joined feed.
    pub fn discovery_keys(&self) -> Vec<DiscoveryKey> {
        self.feeds.iter().map(|e| e.value().discovery_key).collect()
    }
}
