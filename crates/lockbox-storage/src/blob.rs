//! Opaque blob storage

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use lockbox_core::{LockboxError, LockboxResult};
use opendal::{ErrorKind, Operator};
use tracing::{debug, warn};

/// A fallible stream of byte chunks moving into or out of a blob
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Named, write-once byte objects.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Consume `data` into a new object called `name`.
    ///
    /// Returns the number of bytes stored. If `data` yields an error the
    /// write is abandoned and no object becomes visible under `name`.
    async fn put(&self, name: &str, data: ByteStream) -> LockboxResult<u64>;

    /// Stream an existing object. A missing object is `NotFound`.
    async fn get(&self, name: &str) -> LockboxResult<ByteStream>;

    /// Delete an object. Removing a missing object succeeds.
    async fn remove(&self, name: &str) -> LockboxResult<()>;
}

fn map_opendal(name: &str, e: opendal::Error) -> LockboxError {
    if e.kind() == ErrorKind::NotFound {
        LockboxError::NotFound(format!("blob {name}"))
    } else {
        LockboxError::Storage(format!("blob {name}: {e}"))
    }
}

/// [`BlobStore`] over any OpenDAL operator (fs, s3, memory).
#[derive(Clone)]
pub struct OperatorBlobStore {
    op: Operator,
}

impl OperatorBlobStore {
    pub fn new(op: Operator) -> Self {
        Self { op }
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    /// Best-effort cleanup of a half-written object.
    async fn discard(&self, name: &str, mut writer: opendal::Writer) {
        if let Err(e) = writer.abort().await {
            debug!(blob = %name, error = %e, "writer abort failed");
        }
        if let Err(e) = self.op.delete(name).await {
            warn!(blob = %name, error = %e, "failed to delete abandoned blob");
        }
    }
}

#[async_trait]
impl BlobStore for OperatorBlobStore {
    async fn put(&self, name: &str, mut data: ByteStream) -> LockboxResult<u64> {
        let mut writer = self.op.writer(name).await.map_err(|e| map_opendal(name, e))?;
        let mut written = 0u64;

        while let Some(item) = data.next().await {
            let step = match item {
                Ok(chunk) => {
                    let len = chunk.len() as u64;
                    writer
                        .write(chunk)
                        .await
                        .map(|_| len)
                        .map_err(|e| map_opendal(name, e))
                }
                Err(e) => Err(LockboxError::Storage(format!(
                    "blob {name}: source failed: {e}"
                ))),
            };

            match step {
                Ok(len) => written += len,
                Err(e) => {
                    self.discard(name, writer).await;
                    return Err(e);
                }
            }
        }

        if let Err(e) = writer.close().await {
            if let Err(del) = self.op.delete(name).await {
                warn!(blob = %name, error = %del, "failed to delete blob after close error");
            }
            return Err(map_opendal(name, e));
        }

        debug!(blob = %name, bytes = written, "blob stored");
        Ok(written)
    }

    async fn get(&self, name: &str) -> LockboxResult<ByteStream> {
        let meta = self.op.stat(name).await.map_err(|e| map_opendal(name, e))?;
        debug!(blob = %name, bytes = meta.content_length(), "opening blob");

        let reader = self.op.reader(name).await.map_err(|e| map_opendal(name, e))?;
        let stream = reader
            .into_bytes_stream(..)
            .await
            .map_err(|e| map_opendal(name, e))?;
        Ok(stream.boxed())
    }

    async fn remove(&self, name: &str) -> LockboxResult<()> {
        self.op.delete(name).await.map_err(|e| map_opendal(name, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn memory_store() -> OperatorBlobStore {
        OperatorBlobStore::new(
            Operator::new(opendal::services::Memory::default())
                .unwrap()
                .finish(),
        )
    }

    fn chunks(parts: &[&'static [u8]]) -> ByteStream {
        let items: Vec<io::Result<Bytes>> = parts.iter().map(|p| Ok(Bytes::from_static(p))).collect();
        stream::iter(items).boxed()
    }

    async fn collect(stream: ByteStream) -> Vec<u8> {
        let parts: Vec<Bytes> = stream.map(|r| r.unwrap()).collect().await;
        parts.concat()
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let store = memory_store();

        let size = store
            .put("blob-a", chunks(&[b"cipher", b"text", b""]))
            .await
            .unwrap();
        assert_eq!(size, 10);

        let data = collect(store.get("blob-a").await.unwrap()).await;
        assert_eq!(data, b"ciphertext");

        store.remove("blob-a").await.unwrap();
        assert!(matches!(
            store.get("blob-a").await,
            Err(LockboxError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_missing_is_ok() {
        let store = memory_store();
        store.remove("never-written").await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_source_leaves_no_object() {
        let store = memory_store();
        let items: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "upstream went away")),
        ];

        let result = store.put("blob-b", stream::iter(items).boxed()).await;
        assert!(matches!(result, Err(LockboxError::Storage(_))));
        assert!(matches!(
            store.get("blob-b").await,
            Err(LockboxError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fs_backend_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let op = Operator::new(
            opendal::services::Fs::default().root(&dir.path().to_string_lossy()),
        )
        .unwrap()
        .finish();
        let store = OperatorBlobStore::new(op);

        store.put("nested/blob", chunks(&[b"abc", b"def"])).await.unwrap();
        assert_eq!(collect(store.get("nested/blob").await.unwrap()).await, b"abcdef");
        assert!(dir.path().join("nested/blob").exists());

        store.remove("nested/blob").await.unwrap();
        assert!(!dir.path().join("nested/blob").exists());
    }
}
