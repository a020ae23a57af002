//! Trust bridge — the controller's view of the trust store.

use std::sync::Arc;

use bloom_core::crypto::FeedKey;
use bloom_core::short_hex;
use bloom_services::{Chain, Link, TrustError, TrustStore};

#[derive(Clone)]
pub struct TrustBridge {
    store: Arc<dyn TrustStore>,
}

impl TrustBridge {
    pub fn new(store: Arc<dyn TrustStore>) -> Self {
        Self { store }
    }

    /// The store itself, as handed to feed nodes.
    pub fn store(&self) -> Arc<dyn TrustStore> {
        self.store.clone()
    }

    pub async fn get_chain(&self, feed_key: &FeedKey) -> Result<Chain, TrustError> {
        self.store.get_chain(feed_key).await
    }

    /// Extend the chain rooted at `root` in the background. Failures are
    /// logged and never reach the caller.
    pub fn add_link(&self, root: FeedKey, link: Link) {
        let store = self.store.clone();
        tokio::spawn(async move {
            match store.add_chain(&root, vec![link]).await {
                Ok(()) => tracing::debug!(root = short_hex(&root), "link added"),
                Err(e) => tracing::warn!(root = short_hex(&root), error = %e, "add_link failed"),
            }
        });
    }

    pub async fn close(&self) -> Result<(), TrustError> {
        self.store.close().await
    }
}
