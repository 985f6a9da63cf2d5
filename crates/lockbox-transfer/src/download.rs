//! Download pipeline: blob ciphertext in, plaintext chunks out

use bytes::Bytes;
use futures::Stream;
use lockbox_core::{FileMetadata, LockboxError, LockboxResult};
use lockbox_crypto::{DataKey, FrameDecoder};
use lockbox_storage::ByteStream;
use tokio::io::BufReader;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

type BlobReader = BufReader<StreamReader<ByteStream, Bytes>>;

/// Decrypted view of one stored file.
///
/// Chunks are at most `download_chunk_size` bytes and do not line up with
/// the encryption blocks. After an error no further plaintext is produced.
pub struct DownloadStream {
    meta: FileMetadata,
    decoder: FrameDecoder<BlobReader>,
    chunk_size: usize,
    served: u64,
    finished: bool,
}

impl DownloadStream {
    pub(crate) fn new(
        meta: FileMetadata,
        key: &DataKey,
        blob: ByteStream,
        read_buffer_size: usize,
        chunk_size: usize,
    ) -> Self {
        let reader = BufReader::with_capacity(read_buffer_size, StreamReader::new(blob));
        Self {
            meta,
            decoder: FrameDecoder::new(key, reader),
            chunk_size,
            served: 0,
            finished: false,
        }
    }

    /// The file record this stream was opened for
    pub fn metadata(&self) -> &FileMetadata {
        &self.meta
    }

    /// Plaintext bytes produced so far
    pub fn bytes_served(&self) -> u64 {
        self.served
    }

    /// Next plaintext chunk, or `None` once the whole file has been verified
    /// and delivered.
    pub async fn next_chunk(&mut self) -> LockboxResult<Option<Bytes>> {
        if self.finished {
            return Ok(None);
        }

        match self.decoder.read(self.chunk_size).await {
            Ok(Some(chunk)) => {
                self.served += chunk.len() as u64;
                Ok(Some(chunk))
            }
            Ok(None) => {
                if self.served != self.meta.file_size {
                    let err = LockboxError::Framing(format!(
                        "decoded {} bytes, record says {}",
                        self.served, self.meta.file_size
                    ));
                    warn!(file_id = %self.meta.id, error = %err, "download failed");
                    return Err(err);
                }
                self.finished = true;
                debug!(file_id = %self.meta.id, bytes = self.served, "download complete");
                Ok(None)
            }
            Err(e) => {
                warn!(
                    file_id = %self.meta.id,
                    blob = %self.meta.blob_name,
                    served = self.served,
                    error = %e,
                    "download failed"
                );
                Err(e)
            }
        }
    }

    /// Adapt into a `Stream` of plaintext chunks that ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = LockboxResult<Bytes>> + Send {
        futures::stream::try_unfold(self, |mut download| async move {
            Ok(download.next_chunk().await?.map(|chunk| (chunk, download)))
        })
    }
}
