use crate::*;

use bloom_core::crypto::discovery_key;
use bloom_services::{Link, TrustStore};
use hyperbloom::{BloomError, JoinOptions};

/// Leave withdraws the announce and closes the node; joining again builds a
/// fresh node that reloads what the full node persisted.
#[tokio::test]
async fn test_leave_then_rejoin_reloads_storage() -> Result<()> {
    let network = MemoryNetwork::new();
    let keypair = Keypair::generate();
    let feed = keypair.public;
    let dk = discovery_key(&feed);

    let a = memory_peer(&network, &keypair, RoutingMode::Preamble)?;
    let first = a.bloom.join(feed, JoinOptions::default()).await?;
    first.bulk_insert(values(&["kept"])).await?;
    assert_eq!(network.members(&dk), 1);

    let mut watch = first.watch("a", "z");
    a.bloom.leave(&feed).await;
    assert!(!a.bloom.is_joined(&feed));
    assert_eq!(network.members(&dk), 0);

    // The closed node's watch drains and ends.
    while watch.next().await.is_some() {}
    assert!(matches!(
        first.bulk_insert(values(&["late"])).await,
        Err(bloom_services::NodeError::Closed)
    ));

    let second = a.bloom.join(feed, JoinOptions::default()).await?;
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(second.has(b"kept"));
    assert_eq!(network.members(&dk), 1);

    // Leaving a feed that is not joined changes nothing.
    a.bloom.leave(&[7u8; 32]).await;
    assert!(a.bloom.is_joined(&feed));

    a.bloom.close().await?;
    Ok(())
}

/// Light nodes keep nothing across a leave.
#[tokio::test]
async fn test_light_node_forgets_on_leave() -> Result<()> {
    let network = MemoryNetwork::new();
    let keypair = Keypair::generate();
    let a = memory_peer(&network, &keypair, RoutingMode::Preamble)?;

    let node = a.bloom.join(keypair.public, JoinOptions::light()).await?;
    node.bulk_insert(values(&["gone"])).await?;
    a.bloom.leave(&keypair.public).await;

    let node = a.bloom.join(keypair.public, JoinOptions::light()).await?;
    assert!(node.is_empty());

    a.bloom.close().await?;
    Ok(())
}

/// A feed with no trust chain is never registered or announced.
#[tokio::test]
async fn test_unauthorized_feed_is_not_announced() -> Result<()> {
    let network = MemoryNetwork::new();
    let a = memory_peer(&network, &Keypair::generate(), RoutingMode::Preamble)?;
    let stranger = Keypair::generate().public;

    let err = a.bloom.join(stranger, JoinOptions::default()).await.unwrap_err();
    assert!(matches!(err, BloomError::Trust(_)), "unexpected error: {err}");
    assert!(!a.bloom.is_joined(&stranger));
    assert_eq!(network.members(&discovery_key(&stranger)), 0);

    // Once a link lands the same join succeeds.
    a.bloom.add_link(stranger, Link(b"delegation".to_vec()));
    let trust = a.trust.clone();
    let mut linked = false;
    for _ in 0..100 {
        if trust.get_chain(&stranger).await.is_ok() {
            linked = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(linked, "link never landed");
    let node = a.bloom.join(stranger, JoinOptions::default()).await?;
    assert_eq!(node.chain().links.len(), 1);
    assert_eq!(network.members(&discovery_key(&stranger)), 1);

    a.bloom.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_close_with_no_feeds() -> Result<()> {
    let network = MemoryNetwork::new();
    let a = memory_peer(&network, &Keypair::generate(), RoutingMode::Preamble)?;

    a.bloom.close().await?;
    a.bloom.close().await?;
    assert!(matches!(a.bloom.listen(None).await, Err(BloomError::Closed)));
    Ok(())
}

/// Close tears down every feed: announces are withdrawn, nodes close and
/// the trust store shuts.
#[tokio::test]
async fn test_close_with_many_feeds() -> Result<()> {
    let network = MemoryNetwork::new();
    let keypair = Keypair::generate();
    let a = memory_peer(&network, &keypair, RoutingMode::Preamble)?;

    let mut feeds = vec![keypair.public];
    for i in 1..=3u8 {
        let root = [i; 32];
        a.trust.add_chain(&root, vec![Link(vec![i])]).await?;
        feeds.push(root);
    }
    let mut nodes = Vec::new();
    for feed in &feeds {
        nodes.push(a.bloom.join(*feed, JoinOptions::default()).await?);
    }
    assert_eq!(a.bloom.stats().feeds, 4);

    a.bloom.close().await?;

    assert_eq!(a.bloom.stats().feeds, 0);
    for feed in &feeds {
        assert_eq!(network.members(&discovery_key(feed)), 0);
    }
    for node in &nodes {
        assert!(node.bulk_insert(values(&["x"])).await.is_err());
    }
    assert!(a.trust.get_chain(&keypair.public).await.is_err());
    assert!(matches!(
        a.bloom.join(keypair.public, JoinOptions::default()).await,
        Err(BloomError::Closed)
    ));
    Ok(())
}

/// The default constructor wires a TCP swarm and an in-memory chain store.
#[tokio::test]
async fn test_default_components() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let keypair = Keypair::generate();
    let bloom = HyperBloom::new(BloomOptions::new(dir.path(), &keypair)?, ValueNodeFactory)?;

    let port = bloom.listen(None).await?;
    assert_ne!(port, 0);
    let node = bloom.join(keypair.public, JoinOptions::default()).await?;
    node.bulk_insert(values(&["persisted"])).await?;
    bloom.close().await?;

    let stored = std::fs::read_to_string(dir.path().join(hex::encode(discovery_key(&keypair.public))))?;
    assert_eq!(stored.lines().count(), 1);
    Ok(())
}
