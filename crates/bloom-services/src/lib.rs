//! bloom-services — the collaborators the controller drives: the feed
//! registry, trust store, value storage, and feed nodes.

pub mod node;
pub mod registry;
pub mod storage;
pub mod trust;
pub mod value_node;

pub use node::{FeedNode, NodeError, NodeFactory, NodeOptions};
pub use registry::{FeedEntry, FeedRegistry};
pub use storage::{FileBackend, MemoryBackend, StorageBackend, StorageError, ValueStorage};
pub use trust::{Chain, ChainStore, Link, TrustError, TrustStore};
pub use value_node::{ValueNode, ValueNodeFactory, Watch};
