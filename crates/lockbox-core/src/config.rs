use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{LockboxError, LockboxResult};

/// Top-level configuration (loaded from lockbox.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LockboxConfig {
    pub storage: StorageConfig,
    pub vault: VaultConfig,
    pub transfer: TransferConfig,
    pub log: LogConfig,
}

/// Blob storage backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Local directory (OpenDAL fs service)
    Fs,
    /// S3-compatible object store
    S3,
    /// Process memory; contents vanish on exit
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Root directory for the fs backend, key prefix for s3
    pub root: PathBuf,
    /// S3 endpoint
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    /// Bucket name
    pub bucket: String,
    /// Enforce HTTPS for S3 connections (error on HTTP endpoints)
    pub enforce_tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// JSON catalog holding user records and file metadata
    pub catalog: PathBuf,
    /// File holding the hex-encoded master key (or passphrase, see `kdf_salt`)
    pub master_key_file: Option<PathBuf>,
    /// Environment variable consulted when `master_key_file` is unset
    pub master_key_env: String,
    /// Hex salt. When set, the master key source is a passphrase run through Argon2id.
    pub kdf_salt: Option<String>,
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
}

/// Streaming transport tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Plaintext bytes per encrypted block
    pub block_size: usize,
    /// Frames allowed in flight between the encoder and the blob writer
    pub handoff_depth: usize,
    /// Buffer used when pulling ciphertext from the blob store
    pub read_buffer_size: usize,
    /// Maximum plaintext bytes per outbound download message
    pub download_chunk_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

/// Largest block the codec accepts; mirrors `lockbox_crypto::MAX_BLOCK_SIZE`.
pub const MAX_BLOCK_SIZE: usize = 64 * 1024;

impl TransferConfig {
    pub fn validate(&self) -> LockboxResult<()> {
        if self.block_size == 0 || self.block_size > MAX_BLOCK_SIZE {
            return Err(LockboxError::Config(format!(
                "transfer.block_size must be in 1..={MAX_BLOCK_SIZE}, got {}",
                self.block_size
            )));
        }
        if self.handoff_depth == 0 {
            return Err(LockboxError::Config(
                "transfer.handoff_depth must be at least 1".into(),
            ));
        }
        if self.read_buffer_size == 0 {
            return Err(LockboxError::Config(
                "transfer.read_buffer_size must be non-zero".into(),
            ));
        }
        if self.download_chunk_size == 0 {
            return Err(LockboxError::Config(
                "transfer.download_chunk_size must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Fs,
            root: PathBuf::from("~/.local/share/lockbox/blobs"),
            endpoint: "http://localhost:9000".into(),
            region: "us-east-1".into(),
            bucket: "lockbox".into(),
            enforce_tls: false,
        }
    }
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            catalog: PathBuf::from("~/.local/share/lockbox/catalog.json"),
            master_key_file: None,
            master_key_env: "LOCKBOX_MASTER_KEY".into(),
            kdf_salt: None,
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            block_size: 1024,
            handoff_depth: 1,
            read_buffer_size: 8 * 1024,
            download_chunk_size: 4 * 1024,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[storage]
backend = "s3"
endpoint = "https://s3.example.com"
region = "eu-central-1"
bucket = "vault-blobs"
enforce_tls = true

[vault]
catalog = "/var/lib/lockbox/catalog.json"
master_key_file = "/etc/lockbox/master.key"
kdf_salt = "00112233445566778899aabbccddeeff"
argon2_mem_cost_kib = 131072

[transfer]
block_size = 4096
handoff_depth = 2
read_buffer_size = 16384
download_chunk_size = 1000

[log]
level = "debug"
format = "json"
"#;
        let config: LockboxConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.storage.backend, StorageBackend::S3);
        assert_eq!(config.storage.bucket, "vault-blobs");
        assert!(config.storage.enforce_tls);
        assert_eq!(
            config.vault.master_key_file,
            Some(PathBuf::from("/etc/lockbox/master.key"))
        );
        assert_eq!(config.vault.argon2_mem_cost_kib, 131072);
        assert_eq!(config.vault.argon2_time_cost, 3);
        assert_eq!(config.transfer.block_size, 4096);
        assert_eq!(config.transfer.download_chunk_size, 1000);
        assert_eq!(config.log.format, "json");
        config.transfer.validate().unwrap();
    }

    #[test]
    fn test_parse_defaults() {
        let config: LockboxConfig = toml::from_str("").unwrap();

        assert_eq!(config.storage.backend, StorageBackend::Fs);
        assert_eq!(config.storage.region, "us-east-1");
        assert_eq!(config.vault.master_key_env, "LOCKBOX_MASTER_KEY");
        assert!(config.vault.kdf_salt.is_none());
        assert_eq!(config.transfer.block_size, 1024);
        assert_eq!(config.transfer.handoff_depth, 1);
        assert_eq!(config.log.level, "info");
        config.transfer.validate().unwrap();
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[transfer]
block_size = 16
"#;
        let config: LockboxConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.transfer.block_size, 16);
        assert_eq!(config.transfer.read_buffer_size, 8192);
        assert_eq!(config.storage.bucket, "lockbox");
    }

    #[test]
    fn test_validate_rejects_bad_transfer() {
        let mut transfer = TransferConfig::default();
        transfer.block_size = 0;
        assert!(transfer.validate().is_err());

        transfer.block_size = MAX_BLOCK_SIZE + 1;
        assert!(transfer.validate().is_err());

        transfer.block_size = MAX_BLOCK_SIZE;
        transfer.handoff_depth = 0;
        let err = transfer.validate().unwrap_err();
        assert!(err.to_string().contains("handoff_depth"));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = LockboxConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: LockboxConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.storage.backend, parsed.storage.backend);
        assert_eq!(config.vault.catalog, parsed.vault.catalog);
        assert_eq!(config.transfer.block_size, parsed.transfer.block_size);
    }
}
