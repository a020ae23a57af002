use crate::*;

use std::net::SocketAddr;

use bloom_core::crypto::discovery_key;
use hyperbloom::JoinOptions;

/// Preamble routing: A joins first; B's join dials A, A's router reads the
/// open frame off the raw pipe and hands it to A's node.
#[tokio::test]
async fn test_memory_preamble_replication() -> Result<()> {
    let network = MemoryNetwork::new();
    let keypair = Keypair::generate();
    let feed = keypair.public;

    let a = memory_peer(&network, &keypair, RoutingMode::Preamble)?;
    let b = memory_peer(&network, &same_keypair(&keypair), RoutingMode::Preamble)?;

    let node_a = a.bloom.join(feed, JoinOptions::default()).await?;
    let node_b = b.bloom.join(feed, JoinOptions::default()).await?;
    assert_eq!(network.members(&discovery_key(&feed)), 2);

    let mut watch = node_b.watch("a", "z");
    node_a.bulk_insert(values(&["hello"])).await?;
    watch_for(&mut watch, b"hello").await?;

    // And the other way.
    node_b.bulk_insert(values(&["world"])).await?;
    wait_for_value(&node_a, b"world").await?;

    let stats = a.bloom.stats();
    assert_eq!(stats.feeds, 1);
    assert_eq!(stats.router.handed_off, 1);
    assert_eq!(b.bloom.stats().router.handed_off, 1);

    a.bloom.close().await?;
    b.bloom.close().await?;
    Ok(())
}

/// Values inserted before the second peer shows up arrive in its snapshot.
#[tokio::test]
async fn test_late_joiner_receives_existing_values() -> Result<()> {
    let network = MemoryNetwork::new();
    let keypair = Keypair::generate();
    let feed = keypair.public;

    let a = memory_peer(&network, &keypair, RoutingMode::Preamble)?;
    let node_a = a.bloom.join(feed, JoinOptions::default()).await?;
    node_a.bulk_insert(values(&["early", "earlier"])).await?;

    let b = memory_peer(&network, &same_keypair(&keypair), RoutingMode::Preamble)?;
    let node_b = b.bloom.join(feed, JoinOptions::light()).await?;

    wait_for_value(&node_b, b"early").await?;
    wait_for_value(&node_b, b"earlier").await?;
    assert!(!node_b.is_full());

    a.bloom.close().await?;
    b.bloom.close().await?;
    Ok(())
}

/// Secure-stream routing with acceptor hints: the routers run the handshake
/// and exchange the open frame as the first encrypted message.
#[tokio::test]
async fn test_memory_secure_stream_replication() -> Result<()> {
    let network = MemoryNetwork::new();
    let keypair = Keypair::generate();
    let feed = keypair.public;

    let a = memory_peer_with(
        network.swarm().with_acceptor_hints(),
        &keypair,
        RoutingMode::SecureStream,
    )?;
    let b = memory_peer_with(
        network.swarm().with_acceptor_hints(),
        &same_keypair(&keypair),
        RoutingMode::SecureStream,
    )?;

    let node_a = a.bloom.join(feed, JoinOptions::default()).await?;
    let node_b = b.bloom.join(feed, JoinOptions::default()).await?;

    let mut watch = node_b.watch("a", "z");
    node_a.bulk_insert(values(&["hello", "zzz-out-of-range"])).await?;
    watch_for(&mut watch, b"hello").await?;
    wait_for_value(&node_b, b"zzz-out-of-range").await?;

    eventually(|| node_a.peer_count() == 1 && node_b.peer_count() == 1, "one session each").await?;

    a.bloom.close().await?;
    b.bloom.close().await?;
    Ok(())
}

/// Secure-stream routing without hints: the acceptor learns the feed from
/// the first encrypted message alone.
#[tokio::test]
async fn test_secure_stream_without_hints() -> Result<()> {
    let network = MemoryNetwork::new();
    let keypair = Keypair::generate();
    let feed = keypair.public;

    let a = memory_peer(&network, &keypair, RoutingMode::SecureStream)?;
    let b = memory_peer(&network, &same_keypair(&keypair), RoutingMode::SecureStream)?;

    let node_a = a.bloom.join(feed, JoinOptions::light()).await?;
    let node_b = b.bloom.join(feed, JoinOptions::light()).await?;

    node_b.bulk_insert(values(&["from-b"])).await?;
    wait_for_value(&node_a, b"from-b").await?;

    a.bloom.close().await?;
    b.bloom.close().await?;
    Ok(())
}

/// Three peers on one feed: every value reaches everyone.
#[tokio::test]
async fn test_three_peers_converge() -> Result<()> {
    let network = MemoryNetwork::new();
    let keypair = Keypair::generate();
    let feed = keypair.public;

    let mut peers = Vec::new();
    let mut nodes = Vec::new();
    for _ in 0..3 {
        let peer = memory_peer(&network, &same_keypair(&keypair), RoutingMode::Preamble)?;
        nodes.push(peer.bloom.join(feed, JoinOptions::light()).await?);
        peers.push(peer);
    }

    for (i, node) in nodes.iter().enumerate() {
        node.bulk_insert(values(&[&format!("value-{i}")])).await?;
    }
    for node in &nodes {
        for i in 0..3 {
            wait_for_value(node, format!("value-{i}").as_bytes()).await?;
        }
    }

    for peer in &peers {
        peer.bloom.close().await?;
    }
    Ok(())
}

/// Over TCP: A listens, B bootstraps to A and dials on join.
#[tokio::test]
async fn test_tcp_replication() -> Result<()> {
    let keypair = Keypair::generate();
    let feed = keypair.public;

    let a = tcp_peer(&keypair, None)?;
    let port = a.bloom.listen(None).await?;
    let node_a = a.bloom.join(feed, JoinOptions::default()).await?;

    let b = tcp_peer(&same_keypair(&keypair), Some(SocketAddr::from(([127, 0, 0, 1], port))))?;
    let node_b = b.bloom.join(feed, JoinOptions::default()).await?;

    let mut watch = node_b.watch("a", "z");
    node_a.bulk_insert(values(&["hello"])).await?;
    watch_for(&mut watch, b"hello").await?;

    assert_eq!(a.bloom.stats().router.handed_off, 1);

    a.bloom.close().await?;
    b.bloom.close().await?;
    Ok(())
}

/// A connection for a feed the acceptor never joined is destroyed.
#[tokio::test]
async fn test_tcp_unknown_feed_is_destroyed() -> Result<()> {
    let a = tcp_peer(&Keypair::generate(), None)?;
    let port = a.bloom.listen(None).await?;

    let keypair_b = Keypair::generate();
    let b = tcp_peer(&keypair_b, Some(SocketAddr::from(([127, 0, 0, 1], port))))?;
    b.bloom.join(keypair_b.public, JoinOptions::light()).await?;

    eventually(|| a.bloom.stats().router.unknown_feed == 1, "unknown feed on A").await?;
    let stats = a.bloom.stats();
    assert_eq!(stats.router.destroyed, 1);
    assert_eq!(stats.router.handed_off, 0);
    assert_eq!(stats.feeds, 0);

    a.bloom.close().await?;
    b.bloom.close().await?;
    Ok(())
}
