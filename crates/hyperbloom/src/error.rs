use bloom_core::config::ConfigError;
use bloom_services::{NodeError, StorageError, TrustError};

use crate::swarm::SwarmError;

/// Errors surfaced to callers of the controller.
///
/// Connection-level failures never appear here; they end in the transport
/// being destroyed (see `router::ConnectionError`).
#[derive(Debug, thiserror::Error)]
pub enum BloomError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Trust(#[from] TrustError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    Swarm(#[from] SwarmError),

    #[error("feed {0} is already joined")]
    AlreadyJoined(String),

    #[error("controller is closed")]
    Closed,
}

/// Every failure seen while tearing the controller down. Teardown does not
/// stop at the first one.
#[derive(Debug, thiserror::Error)]
#[error("{} resource(s) failed to close: {}", .failures.len(), summary(.failures))]
pub struct CloseError {
    pub failures: Vec<BloomError>,
}

fn summary(failures: &[BloomError]) -> String {
    failures
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
