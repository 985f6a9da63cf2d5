//! Single-block ChaCha20-Poly1305 sealing
//!
//! Encrypted block format (binary):
//! ```text
//! [12 bytes: random nonce][N bytes: ciphertext][16 bytes: Poly1305 tag]
//! ```
//!
//! Every block gets a fresh random nonce, so no counter state has to survive
//! across blocks or across the life of a file. There is no associated data.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use lockbox_core::{LockboxError, LockboxResult};
use rand::RngCore;

use crate::keys::DataKey;
use crate::{BLOCK_OVERHEAD, MAX_BLOCK_SIZE, NONCE_SIZE};

/// A data key bound to the block cipher.
///
/// Built once per stream so the key schedule is not redone for every block.
#[derive(Clone)]
pub struct BlockCodec {
    cipher: ChaCha20Poly1305,
}

impl BlockCodec {
    pub fn new(key: &DataKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.as_bytes().into()),
        }
    }

    /// Seal `plaintext` (at most `MAX_BLOCK_SIZE` bytes) under a fresh nonce.
    ///
    /// Returns: `[12-byte nonce][ciphertext][16-byte tag]`
    pub fn seal(&self, plaintext: &[u8]) -> LockboxResult<Vec<u8>> {
        if plaintext.len() > MAX_BLOCK_SIZE {
            return Err(LockboxError::InvalidInput(format!(
                "block plaintext too large: {} bytes (maximum {MAX_BLOCK_SIZE})",
                plaintext.len()
            )));
        }

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| LockboxError::Other(anyhow::anyhow!("block encryption failed: {e}")))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Open a block produced by [`seal`](Self::seal).
    ///
    /// A block too short to hold a nonce and tag is a framing error; a tag
    /// mismatch is an authentication error. No plaintext is returned on error.
    pub fn open(&self, block: &[u8]) -> LockboxResult<Vec<u8>> {
        if block.len() < BLOCK_OVERHEAD {
            return Err(LockboxError::Framing(format!(
                "encrypted block too short: {} bytes (minimum {BLOCK_OVERHEAD})",
                block.len()
            )));
        }

        let (nonce_bytes, ciphertext) = block.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| LockboxError::Authentication)
    }
}

/// Encrypt one block under `key` with a fresh random nonce.
pub fn encrypt_block(key: &DataKey, plaintext: &[u8]) -> LockboxResult<Vec<u8>> {
    BlockCodec::new(key).seal(plaintext)
}

/// Decrypt one block produced by [`encrypt_block`].
pub fn decrypt_block(key: &DataKey, block: &[u8]) -> LockboxResult<Vec<u8>> {
    BlockCodec::new(key).open(block)
}

/// Encrypted size of a block carrying `plaintext_len` bytes
pub const fn encrypted_block_len(plaintext_len: usize) -> usize {
    plaintext_len + BLOCK_OVERHEAD
}
