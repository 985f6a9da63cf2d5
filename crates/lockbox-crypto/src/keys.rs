//! Per-user data keys and their wrapping under the master key

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use lockbox_core::{LockboxError, LockboxResult};
use rand::RngCore;
use zeroize::Zeroize;

use crate::kdf::MasterKey;
use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// A per-user 256-bit data key. Zeroized on drop.
///
/// Only ever materialized for the duration of one request.
#[derive(Clone)]
pub struct DataKey {
    bytes: [u8; KEY_SIZE],
}

impl DataKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for DataKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Generate a random 256-bit data key.
pub fn generate_data_key() -> DataKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    DataKey::from_bytes(bytes)
}

/// Size of a wrapped data key: nonce + key + tag
pub const WRAPPED_KEY_SIZE: usize = NONCE_SIZE + KEY_SIZE + TAG_SIZE;

/// Wrap (encrypt) a data key using the master key.
///
/// Output: `[12-byte nonce][ciphertext + 16-byte tag]`
pub fn wrap_key(master: &MasterKey, data_key: &DataKey) -> LockboxResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(master.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, data_key.as_bytes().as_ref())
        .map_err(|e| LockboxError::Other(anyhow::anyhow!("key wrapping failed: {e}")))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Unwrap (decrypt) a data key using the master key.
///
/// Input: `[12-byte nonce][ciphertext + 16-byte tag]` (output of `wrap_key`).
/// Every failure is reported as `KeyResolution`.
pub fn unwrap_key(master: &MasterKey, wrapped: &[u8]) -> LockboxResult<DataKey> {
    if wrapped.len() != WRAPPED_KEY_SIZE {
        return Err(LockboxError::KeyResolution(format!(
            "wrapped key has wrong size: {} bytes (expected {WRAPPED_KEY_SIZE})",
            wrapped.len()
        )));
    }

    let (nonce_bytes, ciphertext) = wrapped.split_at(NONCE_SIZE);
    let nonce = Nonce::from_slice(nonce_bytes);
    let cipher = ChaCha20Poly1305::new(master.as_bytes().into());

    let mut plaintext = cipher.decrypt(nonce, ciphertext).map_err(|_| {
        LockboxError::KeyResolution(
            "key unwrapping failed: invalid master key or corrupted data".into(),
        )
    })?;

    let mut key_bytes = [0u8; KEY_SIZE];
    key_bytes.copy_from_slice(&plaintext);
    plaintext.zeroize();

    Ok(DataKey::from_bytes(key_bytes))
}
