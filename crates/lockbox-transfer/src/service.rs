//! The `Transfer` service: entry points for every file operation

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use lockbox_core::config::TransferConfig;
use lockbox_core::{FileId, FileMetadata, LockboxError, LockboxResult, UserId};
use lockbox_crypto::{FrameEncoder, KeyVault};
use lockbox_storage::{BlobStore, MetadataStore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::download::DownloadStream;
use crate::upload::{UploadHandle, UploadParts};

/// Longest accepted file name, in bytes
pub const MAX_FILE_NAME_LEN: usize = 255;

/// Owns the stores, the key vault and the transfer tuning. Cheap to clone.
#[derive(Clone)]
pub struct Transfer {
    blobs: Arc<dyn BlobStore>,
    catalog: Arc<dyn MetadataStore>,
    vault: KeyVault,
    config: TransferConfig,
}

impl Transfer {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        catalog: Arc<dyn MetadataStore>,
        vault: KeyVault,
        config: TransferConfig,
    ) -> LockboxResult<Self> {
        config.validate()?;
        Ok(Self {
            blobs,
            catalog,
            vault,
            config,
        })
    }

    pub fn vault(&self) -> &KeyVault {
        &self.vault
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Begin an upload for `owner`.
    ///
    /// The data key is resolved before any chunk is accepted, so an unknown
    /// user fails here rather than mid-stream.
    pub async fn start_upload(
        &self,
        owner: UserId,
        file_name: &str,
        cancel: CancellationToken,
    ) -> LockboxResult<UploadHandle> {
        let file_name = validate_file_name(file_name)?;
        let key = self.vault.resolve_user_key(&owner).await?;
        let encoder = FrameEncoder::new(&key, self.config.block_size)?;

        Ok(UploadHandle::start(UploadParts {
            owner,
            file_name,
            encoder,
            handoff_depth: self.config.handoff_depth,
            cancel,
            blobs: self.blobs.clone(),
            catalog: self.catalog.clone(),
        }))
    }

    /// Drive a whole inbound chunk stream through an upload and commit it.
    ///
    /// An error from `chunks`, or the token firing, fails the upload and
    /// leaves neither a blob nor a record behind.
    pub async fn upload_stream<S>(
        &self,
        owner: UserId,
        file_name: &str,
        mut chunks: S,
        cancel: CancellationToken,
    ) -> LockboxResult<FileMetadata>
    where
        S: Stream<Item = io::Result<Bytes>> + Unpin,
    {
        let mut upload = self.start_upload(owner, file_name, cancel.clone()).await?;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(upload.abort(LockboxError::Cancelled).await);
                }
                next = chunks.next() => next,
            };

            match next {
                Some(Ok(chunk)) => upload.write(&chunk).await?,
                Some(Err(e)) => return Err(upload.abort(LockboxError::Io(e)).await),
                None => break,
            }
        }

        upload.commit().await
    }

    /// Open a decrypted stream of `file_id` for `requester`.
    ///
    /// A file owned by someone else is `PermissionDenied`, which clients see
    /// as `NotFound`.
    pub async fn start_download(
        &self,
        file_id: &FileId,
        requester: &UserId,
    ) -> LockboxResult<DownloadStream> {
        let meta = self.owned_record(file_id, requester).await?;
        let key = self.vault.resolve_user_key(&meta.owner).await?;

        let blob = self.blobs.get(&meta.blob_name).await.map_err(|e| match e {
            LockboxError::NotFound(what) => {
                LockboxError::Storage(format!("{what} missing for file {file_id}"))
            }
            other => other,
        })?;

        info!(
            file_id = %meta.id,
            owner = %meta.owner,
            bytes = meta.file_size,
            "download started"
        );

        Ok(DownloadStream::new(
            meta,
            &key,
            blob,
            self.config.read_buffer_size,
            self.config.download_chunk_size,
        ))
    }

    /// Delete a file: record first, then its blob.
    ///
    /// Once the record is gone the file is unreachable; a failed blob removal
    /// is logged and leaves an orphan rather than failing the call.
    pub async fn delete_file(&self, file_id: &FileId, requester: &UserId) -> LockboxResult<()> {
        let meta = self.owned_record(file_id, requester).await?;
        self.catalog.delete(&meta.id, &meta.owner).await?;

        if let Err(e) = self.blobs.remove(&meta.blob_name).await {
            warn!(
                file_id = %meta.id,
                blob = %meta.blob_name,
                error = %e,
                "record deleted but blob removal failed"
            );
        }

        info!(file_id = %meta.id, owner = %meta.owner, "file deleted");
        Ok(())
    }

    /// Every file owned by `owner`, oldest first.
    pub async fn list_files(&self, owner: &UserId) -> LockboxResult<Vec<FileMetadata>> {
        self.catalog.list_by_owner(owner).await
    }

    async fn owned_record(&self, file_id: &FileId, requester: &UserId) -> LockboxResult<FileMetadata> {
        let meta = self
            .catalog
            .get_by_id(file_id)
            .await?
            .ok_or_else(|| LockboxError::NotFound(format!("file {file_id}")))?;

        if meta.owner != *requester {
            warn!(file_id = %file_id, requester = %requester, "access to foreign file denied");
            return Err(LockboxError::PermissionDenied(format!("file {file_id}")));
        }
        Ok(meta)
    }
}

fn validate_file_name(name: &str) -> LockboxResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(LockboxError::InvalidInput("file name must not be empty".into()));
    }
    if name.len() > MAX_FILE_NAME_LEN {
        return Err(LockboxError::InvalidInput(format!(
            "file name longer than {MAX_FILE_NAME_LEN} bytes"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(LockboxError::InvalidInput(
            "file name contains control characters".into(),
        ));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_file_name() {
        assert_eq!(validate_file_name("  report.pdf ").unwrap(), "report.pdf");
        assert!(validate_file_name("").is_err());
        assert!(validate_file_name("   ").is_err());
        assert!(validate_file_name("bad\nname").is_err());
        assert!(validate_file_name(&"x".repeat(MAX_FILE_NAME_LEN)).is_ok());
        assert!(validate_file_name(&"x".repeat(MAX_FILE_NAME_LEN + 1)).is_err());
    }
}
