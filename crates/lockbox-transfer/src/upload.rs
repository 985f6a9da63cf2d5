//! Upload pipeline: plaintext chunks in, committed file record out
//!
//! The caller's task runs the encoder; a spawned writer task streams the
//! resulting records into the blob store. The two are joined by a bounded
//! channel, so a slow blob store stalls `write` instead of growing a buffer.
//! The file record is inserted only after the writer task has been joined and
//! reported success.

use std::io;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use lockbox_core::{FileId, FileMetadata, LockboxError, LockboxResult, UserId};
use lockbox_crypto::FrameEncoder;
use lockbox_storage::{BlobStore, MetadataStore};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

/// Where an upload currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    /// Waiting for the next inbound chunk
    Receiving,
    /// Handing encrypted records to the blob writer
    Writing,
    /// Final record sent; waiting on the writer, then inserting the record
    Committing,
    Done,
    Failed,
}

/// An in-progress upload, owned by the request that started it.
///
/// Dropping the handle before [`commit`](Self::commit) aborts the upload:
/// the writer task is stopped and the partial blob is removed.
pub struct UploadHandle {
    owner: UserId,
    file_id: FileId,
    file_name: String,
    blob_name: String,
    state: UploadState,
    encoder: Option<FrameEncoder>,
    tx: Option<mpsc::Sender<io::Result<Bytes>>>,
    writer: Option<JoinHandle<LockboxResult<u64>>>,
    writer_cancel: CancellationToken,
    writer_guard: Option<DropGuard>,
    cancel: CancellationToken,
    blobs: Arc<dyn BlobStore>,
    catalog: Arc<dyn MetadataStore>,
}

pub(crate) struct UploadParts {
    pub owner: UserId,
    pub file_name: String,
    pub encoder: FrameEncoder,
    pub handoff_depth: usize,
    pub cancel: CancellationToken,
    pub blobs: Arc<dyn BlobStore>,
    pub catalog: Arc<dyn MetadataStore>,
}

impl UploadHandle {
    /// Allocate the blob name and spawn the writer task.
    pub(crate) fn start(parts: UploadParts) -> Self {
        let file_id = FileId::new_random();
        let blob_name = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(parts.handoff_depth);

        let writer_cancel = CancellationToken::new();
        let task_cancel = writer_cancel.clone();
        let task_blobs = parts.blobs.clone();
        let task_name = blob_name.clone();
        let writer = tokio::spawn(async move {
            let source = Box::pin(ReceiverStream::new(rx));
            tokio::select! {
                biased;
                _ = task_cancel.cancelled() => Err(LockboxError::Cancelled),
                stored = task_blobs.put(&task_name, source) => stored,
            }
        });

        debug!(
            file_id = %file_id,
            owner = %parts.owner,
            blob = %blob_name,
            "upload started"
        );

        Self {
            owner: parts.owner,
            file_id,
            file_name: parts.file_name,
            blob_name,
            state: UploadState::Receiving,
            encoder: Some(parts.encoder),
            tx: Some(tx),
            writer: Some(writer),
            writer_guard: Some(writer_cancel.clone().drop_guard()),
            writer_cancel,
            cancel: parts.cancel,
            blobs: parts.blobs,
            catalog: parts.catalog,
        }
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn blob_name(&self) -> &str {
        &self.blob_name
    }

    /// Plaintext bytes accepted so far
    pub fn bytes_received(&self) -> u64 {
        self.encoder.as_ref().map_or(0, |e| e.plaintext_len())
    }

    /// Encrypt `chunk` and hand every completed record to the blob writer.
    ///
    /// Waits while the writer is busy. Returns `Cancelled` if the request's
    /// token fires first. If this future is dropped before it completes, the
    /// upload can no longer be committed: the next `write` or `commit` fails
    /// it with `InvalidInput` and removes the partial blob.
    pub async fn write(&mut self, chunk: &[u8]) -> LockboxResult<()> {
        self.ensure_open()?;
        if self.cancel.is_cancelled() {
            return Err(self.abort(LockboxError::Cancelled).await);
        }
        self.ensure_not_interrupted().await?;

        self.state = UploadState::Writing;
        let records = match self.encoder.as_mut() {
            Some(encoder) => encoder.write(chunk),
            None => Err(LockboxError::InvalidInput("upload is closed".into())),
        };
        let records = match records {
            Ok(records) => records,
            Err(e) => return Err(self.abort(e).await),
        };

        // stays Writing until every record is handed off, so a write future
        // dropped mid-send is seen by the next call
        for record in records {
            self.send(record).await?;
        }
        self.state = UploadState::Receiving;
        Ok(())
    }

    /// Seal the final record, wait for the blob to be fully stored, then
    /// insert the file record.
    ///
    /// If the insert fails the blob is removed before the error is returned.
    pub async fn commit(mut self) -> LockboxResult<FileMetadata> {
        self.ensure_open()?;
        if self.cancel.is_cancelled() {
            return Err(self.abort(LockboxError::Cancelled).await);
        }
        self.ensure_not_interrupted().await?;

        self.state = UploadState::Committing;
        let Some(encoder) = self.encoder.take() else {
            return Err(self
                .abort(LockboxError::InvalidInput("upload is closed".into()))
                .await);
        };
        let file_size = encoder.plaintext_len();
        let last = match encoder.finish() {
            Ok(last) => last,
            Err(e) => return Err(self.abort(e).await),
        };
        self.send(last).await?;

        // closing the handoff lets the writer finish the blob
        self.tx = None;
        let blob_size = match self.join_writer().await {
            Ok(size) => size,
            Err(e) => return Err(self.abort(e).await),
        };

        let meta = FileMetadata {
            id: self.file_id,
            owner: self.owner,
            file_name: self.file_name.clone(),
            file_size,
            blob_name: self.blob_name.clone(),
            blob_size,
            created_at: unix_now(),
        };

        if let Err(e) = self.catalog.insert(meta.clone()).await {
            warn!(
                file_id = %self.file_id,
                blob = %self.blob_name,
                error = %e,
                "metadata insert failed, removing blob"
            );
            self.remove_blob().await;
            self.state = UploadState::Failed;
            return Err(e);
        }

        self.state = UploadState::Done;
        if let Some(guard) = self.writer_guard.take() {
            guard.disarm();
        }

        info!(
            file_id = %meta.id,
            owner = %meta.owner,
            blob = %meta.blob_name,
            bytes = meta.file_size,
            stored_bytes = meta.blob_size,
            "upload committed"
        );
        Ok(meta)
    }

    /// Abandon the upload with `reason`: stop the writer, remove the partial
    /// blob, and return the error to report.
    pub async fn abort(&mut self, reason: LockboxError) -> LockboxError {
        self.encoder = None;
        self.writer_cancel.cancel();
        self.tx = None;
        let _ = self.join_writer().await;
        self.remove_blob().await;
        self.state = UploadState::Failed;

        match &reason {
            LockboxError::Cancelled => {
                info!(file_id = %self.file_id, blob = %self.blob_name, "upload cancelled")
            }
            e => warn!(
                file_id = %self.file_id,
                blob = %self.blob_name,
                error = %e,
                "upload failed"
            ),
        }
        reason
    }

    fn ensure_open(&self) -> LockboxResult<()> {
        match self.state {
            UploadState::Receiving | UploadState::Writing => Ok(()),
            other => Err(LockboxError::InvalidInput(format!(
                "upload is not accepting data (state: {other:?})"
            ))),
        }
    }

    /// A handle left in `Writing` had a `write` future dropped before all of
    /// its records reached the writer; the blob is missing blocks.
    async fn ensure_not_interrupted(&mut self) -> LockboxResult<()> {
        if self.state != UploadState::Writing {
            return Ok(());
        }
        Err(self
            .abort(LockboxError::InvalidInput(
                "an earlier write was interrupted before its data was stored".into(),
            ))
            .await)
    }

    /// Push one record through the handoff, racing the request's token.
    async fn send(&mut self, record: Bytes) -> LockboxResult<()> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(self
                .abort(LockboxError::InvalidInput("upload is closed".into()))
                .await);
        };

        let sent = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(LockboxError::Cancelled),
            sent = tx.send(Ok(record)) => Ok(sent.is_ok()),
        };

        match sent {
            Ok(true) => Ok(()),
            // the writer hung up; its own result says why
            Ok(false) => {
                self.tx = None;
                let cause = match self.join_writer().await {
                    Err(e) => e,
                    Ok(_) => LockboxError::Storage("blob writer exited early".into()),
                };
                Err(self.abort(cause).await)
            }
            Err(e) => Err(self.abort(e).await),
        }
    }

    /// Wait for the writer task and return the blob size it reported.
    async fn join_writer(&mut self) -> LockboxResult<u64> {
        let Some(writer) = self.writer.take() else {
            return Err(LockboxError::Storage("blob writer already joined".into()));
        };
        match writer.await {
            Ok(result) => result,
            Err(e) => Err(LockboxError::Storage(format!("blob writer task failed: {e}"))),
        }
    }

    async fn remove_blob(&self) {
        if let Err(e) = self.blobs.remove(&self.blob_name).await {
            warn!(blob = %self.blob_name, error = %e, "failed to remove blob");
        }
    }
}

impl Drop for UploadHandle {
    fn drop(&mut self) {
        if matches!(self.state, UploadState::Done | UploadState::Failed) {
            return;
        }

        self.writer_cancel.cancel();
        self.tx = None;
        let writer = self.writer.take();
        let blobs = self.blobs.clone();
        let blob_name = self.blob_name.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                info!(file_id = %self.file_id, blob = %blob_name, "upload abandoned, cleaning up");
                rt.spawn(async move {
                    if let Some(writer) = writer {
                        let _ = writer.await;
                    }
                    if let Err(e) = blobs.remove(&blob_name).await {
                        warn!(blob = %blob_name, error = %e, "failed to remove abandoned blob");
                    }
                });
            }
            Err(_) => {
                warn!(blob = %blob_name, "upload abandoned outside a runtime, blob left behind");
            }
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
