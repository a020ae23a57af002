//! hyperbloom — feed membership and connection demultiplexing.
//!
//! `HyperBloom` joins and leaves feeds, announces their discovery keys on a
//! swarm, and routes every connection the swarm surfaces to the node that
//! owns its feed.

pub mod controller;
pub mod error;
pub mod options;
pub mod router;
pub mod swarm;
pub mod trust;

#[cfg(test)]
mod testing;

pub use controller::{BloomStats, HyperBloom, JoinOptions};
pub use error::{BloomError, CloseError};
pub use options::BloomOptions;
pub use router::{ConnectionError, RouteOutcome, Router, RouterSnapshot, RouterStats};
pub use swarm::{
    Connection, ConnectionHandle, ConnectionInfo, HandshakeHook, HandshakeVerdict, MemoryNetwork,
    MemorySwarm, Swarm, SwarmError, TcpSwarm,
};
pub use trust::TrustBridge;
