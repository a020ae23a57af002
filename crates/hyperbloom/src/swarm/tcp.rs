//! TCP swarm.
//!
//! Discovery is a static bootstrap list: joining a channel dials every
//! bootstrap address and delivers the socket as an initiator connection
//! bound to that channel. Accepted sockets carry no channel hint.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bloom_core::config::{ConfigError, DiscoveryConfig};
use bloom_core::crypto::DiscoveryKey;
use bloom_core::short_hex;
use dashmap::DashSet;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{Connection, ConnectionHandle, ConnectionInfo, Swarm, SwarmError, INCOMING_CAPACITY};

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after a failed `accept`, doubled per consecutive failure.
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

pub struct TcpSwarm {
    bootstrap: Vec<SocketAddr>,
    listen_fallback: bool,
    tx: mpsc::Sender<Connection>,
    rx: Mutex<Option<mpsc::Receiver<Connection>>>,
    joined: Arc<DashSet<DiscoveryKey>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl TcpSwarm {
    pub fn new(bootstrap: Vec<SocketAddr>, listen_fallback: bool) -> Self {
        let (tx, rx) = mpsc::channel(INCOMING_CAPACITY);
        Self {
            bootstrap,
            listen_fallback,
            tx,
            rx: Mutex::new(Some(rx)),
            joined: Arc::new(DashSet::new()),
            listener: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &DiscoveryConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(config.bootstrap_addrs()?, config.listen_fallback))
    }

    async fn bind(&self, port: u16) -> Result<TcpListener, SwarmError> {
        match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => Ok(listener),
            Err(e) if port != 0 && self.listen_fallback => {
                tracing::warn!(port, error = %e, "bind failed, retrying on an OS-assigned port");
                TcpListener::bind(("0.0.0.0", 0))
                    .await
                    .map_err(|source| SwarmError::Bind { port: 0, source })
            }
            Err(source) => Err(SwarmError::Bind { port, source }),
        }
    }
}

#[async_trait]
impl Swarm for TcpSwarm {
    async fn listen(&self, port: u16) -> Result<u16, SwarmError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SwarmError::Closed);
        }
        let listener = self.bind(port).await?;
        let bound = listener.local_addr()?.port();
        tracing::info!(port = bound, "tcp swarm listening");

        let tx = self.tx.clone();
        let task = tokio::spawn(accept_loop(listener, tx));
        if let Ok(mut slot) = self.listener.lock() {
            if let Some(previous) = slot.replace(task) {
                previous.abort();
            }
        }
        Ok(bound)
    }

    async fn join(&self, channel: DiscoveryKey) -> Result<(), SwarmError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SwarmError::Closed);
        }
        self.joined.insert(channel);
        for addr in self.bootstrap.iter().copied() {
            tokio::spawn(dial(addr, channel, self.tx.clone(), self.joined.clone()));
        }
        Ok(())
    }

    async fn leave(&self, channel: DiscoveryKey) -> Result<(), SwarmError> {
        self.joined.remove(&channel);
        Ok(())
    }

    async fn close(&self) -> Result<(), SwarmError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.joined.clear();
        if let Ok(mut slot) = self.listener.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
        Ok(())
    }

    fn incoming(&self) -> Option<mpsc::Receiver<Connection>> {
        self.rx.lock().ok().and_then(|mut rx| rx.take())
    }
}

impl Drop for TcpSwarm {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.listener.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

fn accept_backoff(failures: u32) -> Duration {
    ACCEPT_BACKOFF_MIN
        .saturating_mul(1u32 << failures.saturating_sub(1).min(16))
        .min(ACCEPT_BACKOFF_MAX)
}

async fn accept_loop(listener: TcpListener, tx: mpsc::Sender<Connection>) {
    let mut failures = 0u32;
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                // Errors like EMFILE persist; don't spin on them.
                failures = failures.saturating_add(1);
                let pause = accept_backoff(failures);
                tracing::warn!(error = %e, failures, pause_ms = pause.as_millis() as u64, "accept failed");
                tokio::time::sleep(pause).await;
                continue;
            }
        };
        failures = 0;
        let _ = stream.set_nodelay(true);
        tracing::debug!(%addr, "tcp connection accepted");

        let connection = Connection {
            transport: Box::new(stream),
            info: ConnectionInfo {
                host: addr.ip().to_string(),
                port: addr.port(),
                initiator: false,
                channel: None,
            },
            handle: ConnectionHandle::detached(),
        };
        if tx.send(connection).await.is_err() {
            break;
        }
    }
}

async fn dial(
    addr: SocketAddr,
    channel: DiscoveryKey,
    tx: mpsc::Sender<Connection>,
    joined: Arc<DashSet<DiscoveryKey>>,
) {
    let stream = match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::warn!(%addr, error = %e, "dial failed");
            return;
        }
        Err(_) => {
            tracing::warn!(%addr, "dial timed out");
            return;
        }
    };
    // Left while we were dialling.
    if !joined.contains(&channel) {
        return;
    }
    let _ = stream.set_nodelay(true);
    tracing::debug!(%addr, channel = short_hex(&channel), "tcp connection dialled");

    let connection = Connection {
        transport: Box::new(stream),
        info: ConnectionInfo {
            host: addr.ip().to_string(),
            port: addr.port(),
            initiator: true,
            channel: Some(channel),
        },
        handle: ConnectionHandle::detached(),
    };
    let _ = tx.send(connection).await;
}
