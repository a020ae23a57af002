//! Connection router.
//!
//! Every connection the swarm surfaces ends in exactly one of two states:
//! handed off to the node that owns its feed, or destroyed. Destroying means
//! dropping the transport; nothing is ever left half-routed, and every
//! attempt is bounded by the handshake timeout.
//!
//! Two routing modes:
//!
//!   Preamble      The router reads the plaintext open frame to learn the
//!                 feed, then gives the raw transport and the captured
//!                 preamble to `FeedNode::add_peer`. The node runs the
//!                 handshake.
//!
//!   SecureStream  The router runs the Noise handshake itself, reports the
//!                 peer's verified id to the swarm, exchanges the open frame
//!                 as the first encrypted message, and gives the stream to
//!                 `FeedNode::add_stream`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bloom_core::config::RoutingMode;
use bloom_core::crypto::{DiscoveryKey, SessionIdentity};
use bloom_core::wire::Progress;
use bloom_core::{
    short_hex, BoxTransport, OpenFrame, Preamble, PreambleError, PreambleParser, SecureError,
    SecureStream,
};
use bloom_services::{FeedEntry, FeedNode, FeedRegistry};
use tokio::io::AsyncReadExt;

use crate::swarm::{Connection, ConnectionHandle, ConnectionInfo, HandshakeVerdict};

/// Read size while looking for the open frame.
const PREAMBLE_READ: usize = 512;

#[derive(Debug)]
pub enum RouteOutcome {
    HandedOff { discovery_key: DiscoveryKey },
    Destroyed(ConnectionError),
}

impl RouteOutcome {
    pub fn is_handed_off(&self) -> bool {
        matches!(self, RouteOutcome::HandedOff { .. })
    }
}

/// Why a connection was destroyed.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("no joined feed for discovery key {0}")]
    UnknownFeed(String),

    #[error(transparent)]
    Preamble(#[from] PreambleError),

    #[error("handshake failed: {0}")]
    Handshake(#[from] SecureError),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("connection did not resolve a feed in time")]
    Timeout,

    #[error("outbound connection carries no channel")]
    MissingChannel,

    #[error("open frame names {declared}, substrate bound {hinted}")]
    ChannelMismatch { hinted: String, declared: String },

    #[error("duplicate connection to this peer")]
    Duplicate,
}

/// Router counters.
#[derive(Debug, Default)]
pub struct RouterStats {
    pub handed_off: AtomicU64,
    pub destroyed: AtomicU64,
    pub unknown_feed: AtomicU64,
    pub timed_out: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterSnapshot {
    pub handed_off: u64,
    pub destroyed: u64,
    pub unknown_feed: u64,
    pub timed_out: u64,
}

impl RouterStats {
    pub fn snapshot(&self) -> RouterSnapshot {
        RouterSnapshot {
            handed_off: self.handed_off.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
            unknown_feed: self.unknown_feed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }
}

pub struct Router<N> {
    registry: FeedRegistry<N>,
    identity: Arc<SessionIdentity>,
    mode: RoutingMode,
    handshake_timeout: Duration,
    stats: RouterStats,
}

impl<N: FeedNode> Router<N> {
    pub fn new(
        registry: FeedRegistry<N>,
        identity: Arc<SessionIdentity>,
        mode: RoutingMode,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            identity,
            mode,
            handshake_timeout,
            stats: RouterStats::default(),
        }
    }

    pub fn mode(&self) -> RoutingMode {
        self.mode
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    /// Route one connection to completion.
    pub async fn route(&self, connection: Connection) -> RouteOutcome {
        let Connection {
            transport,
            info,
            handle,
        } = connection;
        tracing::debug!(
            host = %info.host,
            port = info.port,
            initiator = info.initiator,
            hinted = info.channel.is_some(),
            "routing connection"
        );

        let resolve = async {
            match self.mode {
                RoutingMode::Preamble => self.route_preamble(transport, &info).await,
                RoutingMode::SecureStream => self.route_secure(transport, &info, &handle).await,
            }
        };
        // On timeout the future, and with it the transport, is dropped.
        let outcome = match tokio::time::timeout(self.handshake_timeout, resolve).await {
            Ok(Ok(discovery_key)) => RouteOutcome::HandedOff { discovery_key },
            Ok(Err(e)) => RouteOutcome::Destroyed(e),
            Err(_) => RouteOutcome::Destroyed(ConnectionError::Timeout),
        };
        self.record(&info, &outcome);
        outcome
    }

    fn record(&self, info: &ConnectionInfo, outcome: &RouteOutcome) {
        match outcome {
            RouteOutcome::HandedOff { discovery_key } => {
                self.stats.handed_off.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(host = %info.host, feed = short_hex(discovery_key), "connection handed off");
            }
            RouteOutcome::Destroyed(e) => {
                self.stats.destroyed.fetch_add(1, Ordering::Relaxed);
                match e {
                    ConnectionError::UnknownFeed(_) => {
                        self.stats.unknown_feed.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(host = %info.host, error = %e, "connection destroyed");
                    }
                    ConnectionError::Timeout => {
                        self.stats.timed_out.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(host = %info.host, error = %e, "connection destroyed");
                    }
                    ConnectionError::Duplicate => {
                        tracing::debug!(host = %info.host, "duplicate connection destroyed");
                    }
                    _ => tracing::warn!(host = %info.host, error = %e, "connection destroyed"),
                }
            }
        }
    }

    fn lookup(&self, channel: &DiscoveryKey) -> Result<FeedEntry<N>, ConnectionError> {
        self.registry
            .get(channel)
            .ok_or_else(|| ConnectionError::UnknownFeed(short_hex(channel)))
    }

    // ── Preamble mode ─────────────────────────────────────────────────────────

    async fn route_preamble(
        &self,
        mut transport: BoxTransport,
        info: &ConnectionInfo,
    ) -> Result<DiscoveryKey, ConnectionError> {
        match (info.channel, info.initiator) {
            // Our own dial: the node announces the feed and leads the handshake.
            (Some(channel), true) => self.hand_off_peer(channel, transport, None),
            (None, true) => Err(ConnectionError::MissingChannel),
            // The substrate bound the socket already. Reject unknown feeds
            // before reading anything, then consume the peer's open frame.
            (Some(hinted), false) => {
                self.lookup(&hinted)?;
                let preamble = read_preamble(&mut transport).await?;
                if preamble.open.discovery_key != hinted {
                    return Err(ConnectionError::ChannelMismatch {
                        hinted: short_hex(&hinted),
                        declared: short_hex(&preamble.open.discovery_key),
                    });
                }
                self.hand_off_peer(hinted, transport, Some(preamble))
            }
            (None, false) => {
                let preamble = read_preamble(&mut transport).await?;
                let channel = preamble.open.discovery_key;
                self.hand_off_peer(channel, transport, Some(preamble))
            }
        }
    }

    fn hand_off_peer(
        &self,
        channel: DiscoveryKey,
        transport: BoxTransport,
        preamble: Option<Preamble>,
    ) -> Result<DiscoveryKey, ConnectionError> {
        let entry = self.lookup(&channel)?;
        entry.node.add_peer(transport, preamble);
        Ok(channel)
    }

    // ── SecureStream mode ─────────────────────────────────────────────────────

    async fn route_secure(
        &self,
        transport: BoxTransport,
        info: &ConnectionInfo,
        handle: &ConnectionHandle,
    ) -> Result<DiscoveryKey, ConnectionError> {
        // Our own dial: ownership is known before any byte moves.
        let outbound = match (info.initiator, info.channel) {
            (true, Some(channel)) => Some((channel, self.lookup(&channel)?)),
            (true, None) => return Err(ConnectionError::MissingChannel),
            (false, _) => None,
        };

        let mut stream = SecureStream::handshake(transport, &self.identity, info.initiator).await?;
        if handle.handshake(stream.peer_id()) == HandshakeVerdict::Duplicate {
            return Err(ConnectionError::Duplicate);
        }

        if let Some((channel, entry)) = outbound {
            stream.send(&OpenFrame::new(channel).encode()?).await?;
            entry.node.add_stream(stream);
            return Ok(channel);
        }

        let message = stream.recv().await?.ok_or_else(|| {
            ConnectionError::Transport(std::io::ErrorKind::UnexpectedEof.into())
        })?;
        let open = OpenFrame::decode(&message)?;
        let channel = open.discovery_key;
        if let Some(hinted) = info.channel {
            if hinted != channel {
                return Err(ConnectionError::ChannelMismatch {
                    hinted: short_hex(&hinted),
                    declared: short_hex(&channel),
                });
            }
        }
        let entry = self.lookup(&channel)?;
        entry.node.add_stream(stream);
        Ok(channel)
    }
}

/// Read until one open frame is parsed. Bytes past it stay in the preamble.
async fn read_preamble(transport: &mut BoxTransport) -> Result<Preamble, ConnectionError> {
    let mut parser = PreambleParser::new();
    let mut buf = [0u8; PREAMBLE_READ];
    loop {
        let n = transport.read(&mut buf).await?;
        if n == 0 {
            return Err(ConnectionError::Transport(
                std::io::ErrorKind::UnexpectedEof.into(),
            ));
        }
        if let Progress::Done(preamble) = parser.push(&buf[..n])? {
            return Ok(preamble);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::HandshakeHook;
    use crate::testing::MockNode;
    use bloom_core::crypto::discovery_key;
    use bytes::Bytes;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    const FEED: [u8; 32] = [1u8; 32];

    fn router(mode: RoutingMode) -> (Router<MockNode>, Arc<MockNode>) {
        let registry = FeedRegistry::new();
        let node = Arc::new(MockNode::default());
        registry
            .insert_if_absent(FeedEntry {
                feed_key: FEED,
                discovery_key: discovery_key(&FEED),
                node: node.clone(),
                full: false,
                local_id: [0u8; 32],
            })
            .ok()
            .unwrap();
        let router = Router::new(
            registry,
            Arc::new(SessionIdentity::generate()),
            mode,
            Duration::from_millis(500),
        );
        (router, node)
    }

    fn connection(io: DuplexStream, initiator: bool, channel: Option<DiscoveryKey>) -> Connection {
        Connection {
            transport: Box::new(io),
            info: ConnectionInfo {
                host: "test".into(),
                port: 1,
                initiator,
                channel,
            },
            handle: ConnectionHandle::detached(),
        }
    }

    fn open_bytes(feed: &[u8; 32]) -> Vec<u8> {
        OpenFrame::new(discovery_key(feed)).encode().unwrap()
    }

    /// True once the far end of `peer` sees EOF, i.e. the router dropped it.
    async fn destroyed(peer: &mut DuplexStream) -> bool {
        let mut buf = [0u8; 8];
        matches!(peer.read(&mut buf).await, Ok(0))
    }

    #[tokio::test]
    async fn preamble_routes_to_owning_node() {
        let (router, node) = router(RoutingMode::Preamble);
        let (io, mut peer) = tokio::io::duplex(1024);

        let mut bytes = open_bytes(&FEED);
        bytes.extend_from_slice(b"handshake bytes");
        peer.write_all(&bytes).await.unwrap();

        let outcome = router.route(connection(io, false, None)).await;
        assert!(outcome.is_handed_off());

        let preambles = node.peers();
        assert_eq!(preambles.len(), 1);
        let preamble = preambles[0].clone().unwrap();
        assert_eq!(preamble.open.discovery_key, discovery_key(&FEED));
        assert_eq!(preamble.extra, Bytes::from_static(b"handshake bytes"));
        assert_eq!(router.stats().snapshot().handed_off, 1);
    }

    #[tokio::test]
    async fn unknown_feed_is_destroyed() {
        let (router, node) = router(RoutingMode::Preamble);
        let (io, mut peer) = tokio::io::duplex(1024);
        peer.write_all(&open_bytes(&[2u8; 32])).await.unwrap();

        let outcome = router.route(connection(io, false, None)).await;
        assert!(matches!(outcome, RouteOutcome::Destroyed(ConnectionError::UnknownFeed(_))));
        assert!(node.peers().is_empty());
        assert!(destroyed(&mut peer).await);

        let stats = router.stats().snapshot();
        assert_eq!((stats.destroyed, stats.unknown_feed), (1, 1));
    }

    #[tokio::test]
    async fn garbage_is_destroyed() {
        let (router, node) = router(RoutingMode::Preamble);
        let (io, mut peer) = tokio::io::duplex(1024);
        peer.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

        let outcome = router.route(connection(io, false, None)).await;
        assert!(matches!(
            outcome,
            RouteOutcome::Destroyed(ConnectionError::Preamble(PreambleError::BadMagic))
        ));
        assert!(node.peers().is_empty());
        assert!(destroyed(&mut peer).await);
    }

    #[tokio::test]
    async fn eof_before_open_frame_is_destroyed() {
        let (router, _node) = router(RoutingMode::Preamble);
        let (io, mut peer) = tokio::io::duplex(1024);
        peer.write_all(&open_bytes(&FEED)[..10]).await.unwrap();
        drop(peer);

        let outcome = router.route(connection(io, false, None)).await;
        assert!(matches!(outcome, RouteOutcome::Destroyed(ConnectionError::Transport(_))));
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (router, _node) = router(RoutingMode::Preamble);
        let (io, mut peer) = tokio::io::duplex(1024);

        let outcome = router.route(connection(io, false, None)).await;
        assert!(matches!(outcome, RouteOutcome::Destroyed(ConnectionError::Timeout)));
        assert!(destroyed(&mut peer).await);
        assert_eq!(router.stats().snapshot().timed_out, 1);
    }

    #[tokio::test]
    async fn own_dial_hands_off_without_preamble() {
        let (router, node) = router(RoutingMode::Preamble);
        let (io, _peer) = tokio::io::duplex(1024);

        let outcome = router
            .route(connection(io, true, Some(discovery_key(&FEED))))
            .await;
        assert!(outcome.is_handed_off());
        assert_eq!(node.peers(), vec![None]);
    }

    #[tokio::test]
    async fn own_dial_without_channel_is_destroyed() {
        let (router, _node) = router(RoutingMode::Preamble);
        let (io, _peer) = tokio::io::duplex(1024);
        let outcome = router.route(connection(io, true, None)).await;
        assert!(matches!(outcome, RouteOutcome::Destroyed(ConnectionError::MissingChannel)));
    }

    #[tokio::test]
    async fn hinted_unknown_channel_is_destroyed_without_reading() {
        let (router, _node) = router(RoutingMode::Preamble);
        let (io, _peer) = tokio::io::duplex(1024);
        // Nothing is written: the hint alone decides.
        let outcome = router
            .route(connection(io, false, Some(discovery_key(&[7u8; 32]))))
            .await;
        assert!(matches!(outcome, RouteOutcome::Destroyed(ConnectionError::UnknownFeed(_))));
    }

    #[tokio::test]
    async fn hint_must_match_open_frame() {
        let (router, node) = router(RoutingMode::Preamble);
        let (io, mut peer) = tokio::io::duplex(1024);
        peer.write_all(&open_bytes(&[5u8; 32])).await.unwrap();

        let outcome = router
            .route(connection(io, false, Some(discovery_key(&FEED))))
            .await;
        assert!(matches!(
            outcome,
            RouteOutcome::Destroyed(ConnectionError::ChannelMismatch { .. })
        ));
        assert!(node.peers().is_empty());
    }

    #[tokio::test]
    async fn secure_stream_routes_both_ends() {
        let (dialer, dialer_node) = router(RoutingMode::SecureStream);
        let (acceptor, acceptor_node) = router(RoutingMode::SecureStream);
        let (a, b) = tokio::io::duplex(4096);

        let (out, inn) = tokio::join!(
            dialer.route(connection(a, true, Some(discovery_key(&FEED)))),
            acceptor.route(connection(b, false, None)),
        );
        assert!(out.is_handed_off());
        assert!(inn.is_handed_off());

        let dialer_peer = dialer_node.stream_peers();
        let acceptor_peer = acceptor_node.stream_peers();
        assert_eq!(dialer_peer, vec![acceptor.identity.local_id]);
        assert_eq!(acceptor_peer, vec![dialer.identity.local_id]);
    }

    #[tokio::test]
    async fn secure_stream_unknown_feed_is_destroyed() {
        let (dialer, _) = router(RoutingMode::SecureStream);
        let acceptor = Router::<MockNode>::new(
            FeedRegistry::new(),
            Arc::new(SessionIdentity::generate()),
            RoutingMode::SecureStream,
            Duration::from_millis(500),
        );
        let (a, b) = tokio::io::duplex(4096);

        let (_, inn) = tokio::join!(
            dialer.route(connection(a, true, Some(discovery_key(&FEED)))),
            acceptor.route(connection(b, false, None)),
        );
        assert!(matches!(inn, RouteOutcome::Destroyed(ConnectionError::UnknownFeed(_))));
    }

    struct RejectAll;

    impl HandshakeHook for RejectAll {
        fn on_handshake(&self, _peer_id: &bloom_core::LocalId) -> HandshakeVerdict {
            HandshakeVerdict::Duplicate
        }
    }

    #[tokio::test]
    async fn duplicate_verdict_destroys_the_stream() {
        let (dialer, _) = router(RoutingMode::SecureStream);
        let (acceptor, acceptor_node) = router(RoutingMode::SecureStream);
        let (a, b) = tokio::io::duplex(4096);

        let mut inbound = connection(b, false, None);
        inbound.handle = ConnectionHandle::new(Arc::new(RejectAll));
        let (_, inn) = tokio::join!(
            dialer.route(connection(a, true, Some(discovery_key(&FEED)))),
            acceptor.route(inbound),
        );
        assert!(matches!(inn, RouteOutcome::Destroyed(ConnectionError::Duplicate)));
        assert!(acceptor_node.stream_peers().is_empty());
    }
}
