//! Value storage — durable records backing a full feed node.
//!
//! One storage unit per joined full feed, located at
//! `<storage root>/<hex(discovery key)>`. The on-disk form is one record
//! per line, `v` followed by the hex value, appended as values arrive. The
//! marker keeps an empty value distinct from a blank line.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bloom_core::crypto::DiscoveryKey;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const RECORD_MARKER: char = 'v';

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Every record stored so far, in insertion order.
    async fn load(&self) -> Result<Vec<Bytes>, StorageError>;

    /// Durably append `records`.
    async fn append(&self, records: &[Bytes]) -> Result<(), StorageError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O on {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("corrupt record at {path}:{line}")]
    Corrupt { path: PathBuf, line: usize },
}

// ── File Backend ──────────────────────────────────────────────────────────────

/// Newline-delimited hex records in a single file.
pub struct FileBackend {
    path: PathBuf,
    // Serializes appends so concurrent batches never interleave lines.
    write_lock: Mutex<()>,
}

impl FileBackend {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn load(&self) -> Result<Vec<Bytes>, StorageError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::Io(self.path.clone(), e)),
        };
        text.lines()
            .enumerate()
            .filter(|(_, line)| !line.is_empty())
            .map(|(i, line)| {
                line.strip_prefix(RECORD_MARKER)
                    .and_then(|hex| hex::decode(hex).ok())
                    .map(Bytes::from)
                    .ok_or_else(|| StorageError::Corrupt {
                        path: self.path.clone(),
                        line: i + 1,
                    })
            })
            .collect()
    }

    async fn append(&self, records: &[Bytes]) -> Result<(), StorageError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut chunk = String::new();
        for record in records {
            chunk.push(RECORD_MARKER);
            chunk.push_str(&hex::encode(record));
            chunk.push('\n');
        }

        let _guard = self.write_lock.lock().await;
        let io_err = |e| StorageError::Io(self.path.clone(), e);
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(io_err)?;
        file.write_all(chunk.as_bytes()).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        Ok(())
    }
}

// ── Memory Backend ────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryBackend {
    records: Mutex<Vec<Bytes>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn load(&self) -> Result<Vec<Bytes>, StorageError> {
        Ok(self.records.lock().await.clone())
    }

    async fn append(&self, records: &[Bytes]) -> Result<(), StorageError> {
        self.records.lock().await.extend_from_slice(records);
        Ok(())
    }
}

// ── Value Storage ─────────────────────────────────────────────────────────────

/// Handle to one feed's storage unit.
#[derive(Clone)]
pub struct ValueStorage {
    backend: Arc<dyn StorageBackend>,
}

impl ValueStorage {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// File-backed unit for `discovery_key` under `root`.
    pub fn open(root: &Path, discovery_key: &DiscoveryKey) -> Self {
        Self::new(Arc::new(FileBackend::new(root.join(hex::encode(discovery_key)))))
    }

    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub async fn load(&self) -> Result<Vec<Bytes>, StorageError> {
        self.backend.load().await
    }

    pub async fn append(&self, records: &[Bytes]) -> Result<(), StorageError> {
        self.backend.append(records).await
    }
}
