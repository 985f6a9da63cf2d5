//! Self-framing cipher streams
//!
//! A plaintext stream is cut into blocks of at most `block_size` bytes. Each
//! block is sealed independently and written as one record:
//!
//! ```text
//! [4 bytes BE header: bit 31 = FINAL, bits 0..31 = block length][block]
//! ```
//!
//! The encoder always closes the stream with a FINAL record (possibly
//! carrying an empty block). The decoder refuses to report end of stream
//! until it has seen that record and the source is exhausted, so a stream
//! cut at a record boundary is still detected as truncated.
//!
//! Blocks are sealed without associated data, so the header (FINAL bit and
//! length) and the position of a block in the stream are not covered by any
//! tag. Each block authenticates on its own. Anyone able to rewrite the
//! stored stream can drop or reorder non-final records: the decoder serves
//! the plaintext of every block that authenticates, a dropped record is only
//! caught when the caller compares the total against the expected length,
//! and a reordering is not detected at all.

use bytes::{BufMut, Bytes, BytesMut};
use lockbox_core::{LockboxError, LockboxResult};
use tokio::io::{AsyncRead, AsyncReadExt};
use zeroize::Zeroize;

use crate::block::BlockCodec;
use crate::keys::DataKey;
use crate::{BLOCK_OVERHEAD, MAX_BLOCK_SIZE};

/// Size of the record header
pub const HEADER_SIZE: usize = 4;

const FINAL_FLAG: u32 = 1 << 31;
const LENGTH_MASK: u32 = FINAL_FLAG - 1;

fn encode_record(block: &[u8], last: bool) -> Bytes {
    // block.len() <= MAX_BLOCK_SIZE + BLOCK_OVERHEAD, far below 2^31
    let mut header = block.len() as u32 & LENGTH_MASK;
    if last {
        header |= FINAL_FLAG;
    }

    let mut record = BytesMut::with_capacity(HEADER_SIZE + block.len());
    record.put_u32(header);
    record.put_slice(block);
    record.freeze()
}

// ── Encoder ──────────────────────────────────────────────────────────────────

/// Turns plaintext chunks of arbitrary size into frame records.
///
/// Block boundaries depend only on `block_size` and the total bytes written,
/// never on how the input was chunked.
pub struct FrameEncoder {
    codec: BlockCodec,
    block_size: usize,
    pending: BytesMut,
    plaintext_len: u64,
}

impl FrameEncoder {
    pub fn new(key: &DataKey, block_size: usize) -> LockboxResult<Self> {
        if block_size == 0 || block_size > MAX_BLOCK_SIZE {
            return Err(LockboxError::InvalidInput(format!(
                "block size must be between 1 and {MAX_BLOCK_SIZE}, got {block_size}"
            )));
        }

        Ok(Self {
            codec: BlockCodec::new(key),
            block_size,
            pending: BytesMut::with_capacity(block_size),
            plaintext_len: 0,
        })
    }

    /// Buffer `data` and seal every full block now available.
    ///
    /// Returns the finished records in stream order (possibly none).
    pub fn write(&mut self, data: &[u8]) -> LockboxResult<Vec<Bytes>> {
        self.pending.extend_from_slice(data);
        self.plaintext_len += data.len() as u64;

        let mut records = Vec::with_capacity(self.pending.len() / self.block_size);
        while self.pending.len() >= self.block_size {
            let mut chunk = self.pending.split_to(self.block_size);
            let sealed = self.codec.seal(&chunk);
            chunk[..].zeroize();
            records.push(encode_record(&sealed?, false));
        }
        Ok(records)
    }

    /// Seal whatever is buffered as the FINAL record.
    pub fn finish(self) -> LockboxResult<Bytes> {
        let sealed = self.codec.seal(&self.pending)?;
        Ok(encode_record(&sealed, true))
    }

    /// Plaintext bytes accepted so far
    pub fn plaintext_len(&self) -> u64 {
        self.plaintext_len
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }
}

impl Drop for FrameEncoder {
    fn drop(&mut self) {
        self.pending[..].zeroize();
    }
}

// ── Decoder ──────────────────────────────────────────────────────────────────

/// Error class remembered after the first failure.
#[derive(Debug, Clone)]
enum Poisoned {
    Authentication,
    Framing(String),
    Storage(String),
}

impl Poisoned {
    fn from_error(err: &LockboxError) -> Self {
        match err {
            LockboxError::Authentication => Self::Authentication,
            LockboxError::Framing(msg) => Self::Framing(msg.clone()),
            other => Self::Storage(other.to_string()),
        }
    }

    fn to_error(&self) -> LockboxError {
        match self {
            Self::Authentication => LockboxError::Authentication,
            Self::Framing(msg) => LockboxError::Framing(msg.clone()),
            Self::Storage(msg) => LockboxError::Storage(msg.clone()),
        }
    }
}

#[derive(Debug)]
enum DecodeState {
    /// More records expected
    Reading,
    /// FINAL record decoded and source verified exhausted
    Finished,
    Failed(Poisoned),
}

/// Reads frame records from `R` and serves the plaintext in caller-sized
/// pieces, independent of the block boundaries.
pub struct FrameDecoder<R> {
    reader: R,
    codec: BlockCodec,
    ready: Bytes,
    scratch: Vec<u8>,
    state: DecodeState,
    plaintext_len: u64,
}

impl<R: AsyncRead + Unpin> FrameDecoder<R> {
    pub fn new(key: &DataKey, reader: R) -> Self {
        Self {
            reader,
            codec: BlockCodec::new(key),
            ready: Bytes::new(),
            scratch: Vec::new(),
            state: DecodeState::Reading,
            plaintext_len: 0,
        }
    }

    /// Return between 1 and `max_len` plaintext bytes, or `None` once the
    /// FINAL record has been fully served and the source is exhausted.
    ///
    /// After any error the decoder is poisoned and keeps returning it.
    pub async fn read(&mut self, max_len: usize) -> LockboxResult<Option<Bytes>> {
        if max_len == 0 {
            return Err(LockboxError::InvalidInput(
                "read length must be at least 1".into(),
            ));
        }

        loop {
            if let DecodeState::Failed(poisoned) = &self.state {
                return Err(poisoned.to_error());
            }

            if !self.ready.is_empty() {
                let n = max_len.min(self.ready.len());
                return Ok(Some(self.ready.split_to(n)));
            }

            if matches!(self.state, DecodeState::Finished) {
                return Ok(None);
            }

            if let Err(e) = self.next_record().await {
                tracing::debug!(error = %e, "cipher stream rejected");
                self.state = DecodeState::Failed(Poisoned::from_error(&e));
                self.ready = Bytes::new();
                return Err(e);
            }
        }
    }

    /// Plaintext bytes decrypted so far
    pub fn plaintext_len(&self) -> u64 {
        self.plaintext_len
    }

    async fn next_record(&mut self) -> LockboxResult<()> {
        let mut header = [0u8; HEADER_SIZE];
        let got = read_full(&mut self.reader, &mut header).await?;
        if got == 0 {
            return Err(LockboxError::Framing(
                "stream truncated: missing final record".into(),
            ));
        }
        if got < HEADER_SIZE {
            return Err(LockboxError::Framing(format!(
                "stream truncated: partial record header ({got} of {HEADER_SIZE} bytes)"
            )));
        }

        let header = u32::from_be_bytes(header);
        let last = header & FINAL_FLAG != 0;
        let block_len = (header & LENGTH_MASK) as usize;

        if !(BLOCK_OVERHEAD..=BLOCK_OVERHEAD + MAX_BLOCK_SIZE).contains(&block_len) {
            return Err(LockboxError::Framing(format!(
                "invalid block length {block_len} (expected {BLOCK_OVERHEAD}..={})",
                BLOCK_OVERHEAD + MAX_BLOCK_SIZE
            )));
        }

        self.scratch.resize(block_len, 0);
        let got = read_full(&mut self.reader, &mut self.scratch).await?;
        if got < block_len {
            return Err(LockboxError::Framing(format!(
                "stream truncated: block cut short ({got} of {block_len} bytes)"
            )));
        }

        let plaintext = self.codec.open(&self.scratch)?;

        if last {
            let mut probe = [0u8; 1];
            if read_full(&mut self.reader, &mut probe).await? != 0 {
                return Err(LockboxError::Framing(
                    "unexpected data after final record".into(),
                ));
            }
            self.state = DecodeState::Finished;
        }

        self.plaintext_len += plaintext.len() as u64;
        self.ready = Bytes::from(plaintext);
        Ok(())
    }
}

/// Fill `buf` from `reader`, looping over short reads.
///
/// Returns the number of bytes read, which is less than `buf.len()` only at EOF.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> LockboxResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader
            .read(&mut buf[filled..])
            .await
            .map_err(LockboxError::storage)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
