//! Configuration system for HyperBloom.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $BLOOM_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/hyperbloom/config.toml
//!   3. ~/.config/hyperbloom/config.toml

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::crypto::{FeedKey, Keypair};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BloomConfig {
    pub identity: IdentityConfig,
    pub storage: StorageConfig,
    pub trust: TrustConfig,
    pub discovery: DiscoveryConfig,
    pub feeds: FeedsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Path to the long-term X25519 keypair. Auto-generated on first run.
    pub keypair_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory; one value store per joined full feed lives beneath it.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Chain database file. Empty = in-memory only.
    pub db: PathBuf,
}

/// How the router determines which feed an inbound connection belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// Read a plaintext open frame off the raw transport, then hand the
    /// transport to the feed node, which runs the handshake itself.
    #[default]
    Preamble,
    /// The router runs the handshake and reads the open frame as the first
    /// encrypted message.
    SecureStream,
}

impl std::str::FromStr for RoutingMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "preamble" => Ok(Self::Preamble),
            "secure_stream" => Ok(Self::SecureStream),
            other => Err(ConfigError::InvalidRouting(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// TCP listen port. 0 = OS-assigned.
    pub port: u16,
    pub routing: RoutingMode,
    /// Peers dialled whenever a feed is joined ("host:port").
    pub bootstrap: Vec<String>,
    /// Pending connections that have not resolved a feed by then are destroyed.
    pub handshake_timeout_secs: u64,
    /// If binding a fixed port fails, retry once on an OS-assigned port.
    pub listen_fallback: bool,
}

/// What `join` does when the feed is already joined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    /// Return the node that is already registered.
    #[default]
    Idempotent,
    /// Fail with an "already joined" error.
    RejectDuplicate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedsConfig {
    /// Feed keys (hex) joined at startup.
    pub join: Vec<String>,
    /// Join startup feeds as full (persisted) nodes.
    pub full: bool,
    pub join_policy: JoinPolicy,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for BloomConfig {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            storage: StorageConfig::default(),
            trust: TrustConfig {
                db: data_dir().join("trust.json"),
            },
            discovery: DiscoveryConfig::default(),
            feeds: FeedsConfig::default(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            keypair_path: config_dir().join("keypair"),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: data_dir().join("feeds"),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: 0,
            routing: RoutingMode::Preamble,
            bootstrap: Vec::new(),
            handshake_timeout_secs: 10,
            listen_fallback: true,
        }
    }
}

impl Default for FeedsConfig {
    fn default() -> Self {
        Self {
            join: Vec::new(),
            full: true,
            join_policy: JoinPolicy::Idempotent,
        }
    }
}

impl DiscoveryConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs.max(1))
    }

    /// Parsed bootstrap addresses.
    pub fn bootstrap_addrs(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        self.bootstrap
            .iter()
            .map(|s| {
                s.parse()
                    .map_err(|_| ConfigError::InvalidAddress(s.clone()))
            })
            .collect()
    }
}

impl FeedsConfig {
    pub fn feed_keys(&self) -> Result<Vec<FeedKey>, ConfigError> {
        self.join.iter().map(|k| parse_feed_key(k)).collect()
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("hyperbloom")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("hyperbloom")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

/// Parse a 32-byte hex key.
pub fn parse_feed_key(hex_key: &str) -> Result<FeedKey, ConfigError> {
    let bytes = hex::decode(hex_key.trim()).map_err(|_| ConfigError::InvalidKey(hex_key.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| ConfigError::InvalidKey(hex_key.to_string()))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("`storage.path` must be set")]
    MissingStorage,
    #[error("invalid key {0:?}: expected 64 hex characters")]
    InvalidKey(String),
    #[error("invalid peer address {0:?}")]
    InvalidAddress(String),
    #[error("unknown routing mode {0:?} (expected preamble or secure_stream)")]
    InvalidRouting(String),
    #[error("swarm connections were already taken by another controller")]
    SwarmInUse,
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl BloomConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            BloomConfig::default()
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("BLOOM_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&BloomConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject options the controller cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.path.as_os_str().is_empty() {
            return Err(ConfigError::MissingStorage);
        }
        self.discovery.bootstrap_addrs()?;
        self.feeds.feed_keys()?;
        Ok(())
    }

    /// Apply BLOOM_* env var overrides.
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = std::env::var("BLOOM_STORAGE__PATH") {
            self.storage.path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("BLOOM_DISCOVERY__PORT") {
            if let Ok(p) = v.parse() {
                self.discovery.port = p;
            }
        }
        if let Ok(v) = std::env::var("BLOOM_DISCOVERY__ROUTING") {
            self.discovery.routing = v.parse()?;
        }
        if let Ok(v) = std::env::var("BLOOM_DISCOVERY__BOOTSTRAP") {
            self.discovery.bootstrap = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(v) = std::env::var("BLOOM_FEEDS__FULL") {
            self.feeds.full = v == "true" || v == "1";
        }
        Ok(())
    }
}

impl IdentityConfig {
    /// Load the keypair, generating and persisting one on first run.
    pub fn load_or_generate(&self) -> Result<Keypair, ConfigError> {
        load_or_generate_keypair(&self.keypair_path)
    }
}

fn load_or_generate_keypair(path: &Path) -> Result<Keypair, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(text) => {
            let private = parse_feed_key(&text)?;
            Ok(Keypair::from_private(private))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let keypair = Keypair::generate();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
            }
            std::fs::write(path, hex::encode(*keypair.private_bytes()))
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
            tracing::info!(path = %path.display(), "generated new keypair");
            Ok(keypair)
        }
        Err(e) => Err(ConfigError::ReadFailed(path.to_path_buf(), e)),
    }
}
