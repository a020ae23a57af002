use std::path::PathBuf;
use std::time::Duration;

use bloom_core::config::{
    BloomConfig, ConfigError, DiscoveryConfig, JoinPolicy, RoutingMode, TrustConfig,
};
use bloom_core::crypto::{FeedKey, Keypair};
use zeroize::Zeroizing;

/// Construction options for `HyperBloom`.
pub struct BloomOptions {
    /// Root directory holding one storage unit per full feed. Required.
    pub storage: PathBuf,
    pub public_key: FeedKey,
    pub private_key: Zeroizing<[u8; 32]>,
    /// Forwarded to the trust store.
    pub trust: TrustConfig,
    /// Forwarded to the swarm; also selects the routing mode.
    pub discovery: DiscoveryConfig,
    pub join_policy: JoinPolicy,
}

impl BloomOptions {
    /// Options with defaults for everything but storage and identity.
    pub fn new(storage: impl Into<PathBuf>, keypair: &Keypair) -> Result<Self, ConfigError> {
        let storage = storage.into();
        if storage.as_os_str().is_empty() {
            return Err(ConfigError::MissingStorage);
        }
        Ok(Self {
            storage,
            public_key: keypair.public,
            private_key: keypair.private_bytes(),
            trust: TrustConfig::default(),
            discovery: DiscoveryConfig::default(),
            join_policy: JoinPolicy::default(),
        })
    }

    pub fn from_config(config: &BloomConfig, keypair: &Keypair) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut options = Self::new(config.storage.path.clone(), keypair)?;
        options.trust = config.trust.clone();
        options.discovery = config.discovery.clone();
        options.join_policy = config.feeds.join_policy;
        Ok(options)
    }

    pub fn with_routing(mut self, routing: RoutingMode) -> Self {
        self.discovery.routing = routing;
        self
    }

    pub fn with_join_policy(mut self, policy: JoinPolicy) -> Self {
        self.join_policy = policy;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.discovery.handshake_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn routing(&self) -> RoutingMode {
        self.discovery.routing
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.discovery.handshake_timeout()
    }
}
