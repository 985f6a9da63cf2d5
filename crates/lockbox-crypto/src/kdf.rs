//! Master key loading: raw hex material, or Argon2id passphrase → master key

use argon2::{Algorithm, Argon2, Params, Version};
use lockbox_core::{LockboxError, LockboxResult};
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroize;

use crate::KEY_SIZE;

/// The process-wide 256-bit key that wraps every user's data key.
///
/// Wiped from memory when dropped.
#[derive(Clone)]
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Parse a hex-encoded key (surrounding whitespace ignored).
    pub fn from_hex(encoded: &SecretString) -> LockboxResult<Self> {
        let mut raw = hex::decode(encoded.expose_secret().trim())
            .map_err(|e| LockboxError::Config(format!("master key is not valid hex: {e}")))?;

        if raw.len() != KEY_SIZE {
            let len = raw.len();
            raw.zeroize();
            return Err(LockboxError::Config(format!(
                "master key has wrong size: {len} bytes (expected {KEY_SIZE})"
            )));
        }

        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&raw);
        raw.zeroize();
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Argon2id cost settings, mirrored from `[vault]` in the config
#[derive(Debug, Clone)]
pub struct KdfParams {
    /// KiB of memory per hash (64 MiB by default)
    pub mem_cost_kib: u32,
    /// Passes over memory
    pub time_cost: u32,
    /// Lanes
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

/// Stretch an operator passphrase into the master key with Argon2id.
///
/// The salt is not secret; it lives in the server config next to the
/// passphrase source.
pub fn derive_master_key(
    passphrase: &SecretString,
    salt: &[u8],
    params: &KdfParams,
) -> LockboxResult<MasterKey> {
    let cost = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| LockboxError::Config(format!("invalid Argon2id params: {e}")))?;

    let mut key = [0u8; KEY_SIZE];
    Argon2::new(Algorithm::Argon2id, Version::V0x13, cost)
        .hash_password_into(passphrase.expose_secret().as_bytes(), salt, &mut key)
        .map_err(|e| LockboxError::Config(format!("Argon2id KDF failed: {e}")))?;

    Ok(MasterKey::from_bytes(key))
}
