//! Shared fixtures for the transfer integration tests.

#![allow(dead_code)]

use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, Stream};
use lockbox_core::config::TransferConfig;
use lockbox_core::{FileId, FileMetadata, LockboxError, LockboxResult, UserId};
use lockbox_crypto::{KeyVault, MasterKey};
use lockbox_storage::{BlobStore, ByteStream, MemoryCatalog, MetadataStore, OperatorBlobStore};
use lockbox_transfer::Transfer;
use opendal::Operator;

pub fn memory_operator() -> Operator {
    Operator::new(opendal::services::Memory::default())
        .expect("memory operator")
        .finish()
}

pub fn small_blocks(block_size: usize) -> TransferConfig {
    TransferConfig {
        block_size,
        ..Default::default()
    }
}

pub struct Harness {
    pub transfer: Transfer,
    pub op: Operator,
    pub catalog: Arc<MemoryCatalog>,
    pub alice: UserId,
    pub bob: UserId,
}

/// Memory-backed transfer service with two enrolled users.
pub async fn harness(config: TransferConfig) -> Harness {
    let op = memory_operator();
    let blobs: Arc<dyn BlobStore> = Arc::new(OperatorBlobStore::new(op.clone()));
    let catalog = Arc::new(MemoryCatalog::new());
    harness_with(config, op, blobs, catalog.clone(), catalog).await
}

/// Like [`harness`] but with caller-chosen stores (for fault injection).
pub async fn harness_with(
    config: TransferConfig,
    op: Operator,
    blobs: Arc<dyn BlobStore>,
    catalog: Arc<MemoryCatalog>,
    metadata: Arc<dyn MetadataStore>,
) -> Harness {
    let vault = KeyVault::new(Arc::new(MasterKey::from_bytes([42u8; 32])), catalog.clone());
    let alice = UserId::new_random();
    let bob = UserId::new_random();
    vault.enroll(alice, "alice").await.expect("enroll alice");
    vault.enroll(bob, "bob").await.expect("enroll bob");

    let transfer = Transfer::new(blobs, metadata, vault, config).expect("valid config");
    Harness {
        transfer,
        op,
        catalog,
        alice,
        bob,
    }
}

/// Deterministic test payload
pub fn payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i.wrapping_mul(31) ^ (i >> 5)) as u8).collect()
}

pub fn chunked(data: &[u8], chunk: usize) -> impl Stream<Item = io::Result<Bytes>> + Unpin {
    let parts: Vec<io::Result<Bytes>> = data
        .chunks(chunk.max(1))
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    stream::iter(parts)
}

/// Download a file completely, checking the chunk size bound on the way.
pub async fn download_all(
    transfer: &Transfer,
    file_id: &FileId,
    requester: &UserId,
) -> LockboxResult<Vec<u8>> {
    let limit = transfer.config().download_chunk_size;
    let mut download = transfer.start_download(file_id, requester).await?;
    let mut out = Vec::new();
    while let Some(chunk) = download.next_chunk().await? {
        assert!(!chunk.is_empty() && chunk.len() <= limit, "chunk of {} bytes", chunk.len());
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

pub async fn blob_exists(op: &Operator, name: &str) -> bool {
    op.stat(name).await.is_ok()
}

// ── Fault injection ──────────────────────────────────────────────────────────

/// Ordered record of store calls shared between fakes.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .map(|e| e.split(':').next().unwrap_or_default().to_string())
            .collect()
    }
}

/// How [`LoggingBlobs::put`] behaves.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    /// Store normally
    Pass,
    /// Consume one chunk, then fail
    FailAfterFirst,
    /// Never read the source
    Stall,
    /// Wait before storing normally
    Slow,
}

/// How long [`PutMode::Slow`] waits before it starts reading
pub const SLOW_PUT_DELAY: std::time::Duration = std::time::Duration::from_millis(200);

/// Blob store that logs every call and can be told to misbehave.
pub struct LoggingBlobs {
    pub inner: OperatorBlobStore,
    pub log: EventLog,
    pub mode: PutMode,
}

#[async_trait]
impl BlobStore for LoggingBlobs {
    async fn put(&self, name: &str, mut data: ByteStream) -> LockboxResult<u64> {
        use futures::StreamExt;

        match self.mode {
            PutMode::Pass => {
                let stored = self.inner.put(name, data).await;
                self.log.push(format!("put:{name}"));
                stored
            }
            PutMode::FailAfterFirst => {
                let _ = data.next().await;
                self.log.push(format!("put-failed:{name}"));
                Err(LockboxError::Storage("injected blob write failure".into()))
            }
            PutMode::Slow => {
                tokio::time::sleep(SLOW_PUT_DELAY).await;
                let stored = self.inner.put(name, data).await;
                self.log.push(format!("put:{name}"));
                stored
            }
            PutMode::Stall => {
                self.log.push(format!("put-stalled:{name}"));
                std::future::pending::<LockboxResult<u64>>().await
            }
        }
    }

    async fn get(&self, name: &str) -> LockboxResult<ByteStream> {
        self.inner.get(name).await
    }

    async fn remove(&self, name: &str) -> LockboxResult<()> {
        self.log.push(format!("remove:{name}"));
        self.inner.remove(name).await
    }
}

/// Metadata store whose inserts always fail.
pub struct RejectingCatalog {
    pub log: EventLog,
}

#[async_trait]
impl MetadataStore for RejectingCatalog {
    async fn insert(&self, meta: FileMetadata) -> LockboxResult<()> {
        self.log.push(format!("insert:{}", meta.id));
        Err(LockboxError::Storage("injected insert failure".into()))
    }

    async fn get_by_id(&self, _id: &FileId) -> LockboxResult<Option<FileMetadata>> {
        Ok(None)
    }

    async fn delete(&self, id: &FileId, _owner: &UserId) -> LockboxResult<()> {
        Err(LockboxError::NotFound(format!("file {id}")))
    }

    async fn list_by_owner(&self, _owner: &UserId) -> LockboxResult<Vec<FileMetadata>> {
        Ok(Vec::new())
    }
}

/// Harness whose blob store logs calls and behaves per `mode`.
pub async fn logging_harness(config: TransferConfig, mode: PutMode) -> (Harness, EventLog) {
    let op = memory_operator();
    let log = EventLog::default();
    let blobs: Arc<dyn BlobStore> = Arc::new(LoggingBlobs {
        inner: OperatorBlobStore::new(op.clone()),
        log: log.clone(),
        mode,
    });
    let catalog = Arc::new(MemoryCatalog::new());
    let h = harness_with(config, op, blobs, catalog.clone(), catalog).await;
    (h, log)
}

/// Wait (bounded) until `log` contains an event of `kind`.
pub async fn wait_for_event(log: &EventLog, kind: &str) -> bool {
    for _ in 0..200 {
        if log.kinds().iter().any(|k| k == kind) {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    false
}
