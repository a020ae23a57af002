//! HyperBloom integration test harness.
//!
//! Every scenario runs two or more controllers inside one process, either
//! over a `MemoryNetwork` or over TCP on loopback. Nodes are real
//! `ValueNode`s, so a value inserted on one controller only shows up on
//! another if routing and the handshake both worked.
//!
//!   cargo test --test integration

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tempfile::TempDir;

use bloom_core::config::RoutingMode;
use bloom_core::crypto::Keypair;
use bloom_services::{ChainStore, ValueNode, ValueNodeFactory, Watch};
use hyperbloom::{BloomOptions, HyperBloom, MemoryNetwork, MemorySwarm, TcpSwarm};

mod lifecycle;
mod replication;

// ── Harness ───────────────────────────────────────────────────────────────────

/// How long replication may take before a test gives up.
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(10);

/// One controller plus the directory its full feeds live in.
pub struct Peer {
    pub bloom: HyperBloom<ValueNodeFactory>,
    pub trust: Arc<ChainStore>,
    pub dir: TempDir,
}

/// A second copy of `keypair`; peers of one feed share its key.
pub fn same_keypair(keypair: &Keypair) -> Keypair {
    Keypair::from_private(*keypair.private_bytes())
}

fn options(dir: &TempDir, keypair: &Keypair, routing: RoutingMode) -> Result<BloomOptions> {
    Ok(BloomOptions::new(dir.path(), keypair)?
        .with_routing(routing)
        .with_handshake_timeout(Duration::from_secs(5)))
}

/// Controller on an in-memory swarm.
pub fn memory_peer(network: &MemoryNetwork, keypair: &Keypair, routing: RoutingMode) -> Result<Peer> {
    memory_peer_with(network.swarm(), keypair, routing)
}

pub fn memory_peer_with(swarm: MemorySwarm, keypair: &Keypair, routing: RoutingMode) -> Result<Peer> {
    let dir = tempfile::tempdir()?;
    let trust = Arc::new(ChainStore::new(keypair.public));
    let bloom = HyperBloom::with_components(
        options(&dir, keypair, routing)?,
        ValueNodeFactory,
        trust.clone(),
        Arc::new(swarm),
    )?;
    Ok(Peer { bloom, trust, dir })
}

/// Controller on a `TcpSwarm` that dials `bootstrap` on every join.
pub fn tcp_peer(keypair: &Keypair, bootstrap: Option<SocketAddr>) -> Result<Peer> {
    let dir = tempfile::tempdir()?;
    let trust = Arc::new(ChainStore::new(keypair.public));
    let swarm = TcpSwarm::new(bootstrap.into_iter().collect(), true);
    let bloom = HyperBloom::with_components(
        options(&dir, keypair, RoutingMode::Preamble)?,
        ValueNodeFactory,
        trust.clone(),
        Arc::new(swarm),
    )?;
    Ok(Peer { bloom, trust, dir })
}

pub fn values(items: &[&str]) -> Vec<Bytes> {
    items.iter().map(|s| Bytes::copy_from_slice(s.as_bytes())).collect()
}

/// Wait until `node` holds `value`.
pub async fn wait_for_value(node: &ValueNode, value: &[u8]) -> Result<()> {
    tokio::time::timeout(SYNC_TIMEOUT, async {
        while !node.has(value) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .with_context(|| format!("value {:?} never arrived", String::from_utf8_lossy(value)))
}

/// Wait until `watch` yields a batch containing `value`.
pub async fn watch_for(watch: &mut Watch, value: &[u8]) -> Result<()> {
    let found = tokio::time::timeout(SYNC_TIMEOUT, async {
        while let Some(batch) = watch.next().await {
            if batch.iter().any(|v| v.as_ref() == value) {
                return true;
            }
        }
        false
    })
    .await
    .context("watch timed out")?;
    if !found {
        bail!("watch ended before {:?} arrived", String::from_utf8_lossy(value));
    }
    Ok(())
}

/// Wait until `check` holds.
pub async fn eventually(mut check: impl FnMut() -> bool, what: &str) -> Result<()> {
    tokio::time::timeout(SYNC_TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .with_context(|| format!("timed out waiting for {what}"))
}
