//! bloom-core — shared types, wire format, and cryptographic primitives.
//! All other HyperBloom crates depend on this one.

pub mod config;
pub mod crypto;
pub mod secure;
pub mod transport;
pub mod wire;

pub use crypto::{discovery_key, DiscoveryKey, FeedKey, LocalId, SessionIdentity};
pub use secure::{SecureError, SecureStream};
pub use transport::{BoxTransport, Rewind, Transport};
pub use wire::{OpenFrame, Preamble, PreambleError, PreambleParser};

/// Short hex prefix of a key, for log fields.
pub fn short_hex(key: &[u8]) -> String {
    hex::encode(&key[..key.len().min(8)])
}
