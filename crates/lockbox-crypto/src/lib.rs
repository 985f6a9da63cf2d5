//! lockbox-crypto: envelope encryption for the lockbox file transport
//!
//! Key hierarchy:
//! ```text
//! Master Key (256-bit, loaded at startup: hex key file/env, or Argon2id from a passphrase)
//!   └── Data Key (per-user, 256-bit random, wrapped by the master key and stored on the user record)
//!       └── Block AEAD: ChaCha20-Poly1305 (key=data_key, nonce=random_96bit, no AAD)
//! ```
//!
//! Stream format (one blob object):
//! ```text
//! record := [4 bytes BE: FINAL flag (bit 31) | block length (bits 0..31)][block]
//! block  := [12 bytes: nonce][N bytes: ciphertext][16 bytes: Poly1305 tag]
//! ```
//! The last record, and only the last, carries the FINAL flag.

pub mod block;
pub mod frame;
pub mod kdf;
pub mod keys;
pub mod vault;

pub use block::{decrypt_block, encrypt_block, BlockCodec};
pub use frame::{FrameDecoder, FrameEncoder};
pub use kdf::{derive_master_key, KdfParams, MasterKey};
pub use keys::{generate_data_key, unwrap_key, wrap_key, DataKey};
pub use vault::{KeyVault, UserKeyStore};

/// Size of master and data keys in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of a ChaCha20-Poly1305 nonce (96-bit)
pub const NONCE_SIZE: usize = 12;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Bytes an encrypted block adds on top of its plaintext
pub const BLOCK_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// Default plaintext bytes per block
pub const DEFAULT_BLOCK_SIZE: usize = 1024;

/// Largest plaintext a single block may carry
pub const MAX_BLOCK_SIZE: usize = lockbox_core::config::MAX_BLOCK_SIZE;
