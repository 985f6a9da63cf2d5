//! Process setup: config, logging, master key, and the assembled transfer service

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::ValueEnum;
use lockbox_core::config::{LockboxConfig, StorageBackend, VaultConfig};
use lockbox_crypto::{derive_master_key, KdfParams, KeyVault, MasterKey};
use lockbox_storage::{
    build_operator, check_health, BlobStore, JsonCatalog, MemoryCatalog, MetadataStore,
    OperatorBlobStore, S3Credentials, UserKeyStore,
};
use lockbox_transfer::Transfer;
use secrecy::{ExposeSecret, SecretString};

#[derive(Clone, Debug, ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}

pub fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

/// Load the config file, or defaults if it does not exist.
///
/// Returns whether a file was found so the caller can warn once logging is up.
pub async fn load_config(path: &Path) -> Result<(LockboxConfig, bool)> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((LockboxConfig::default(), false))
    }
}

/// Expand `~` in path to the user's home directory
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    match s.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_default();
            PathBuf::from(home).join(rest)
        }
        None => path.to_path_buf(),
    }
}

/// Load the master key from `vault.master_key_file` or the `vault.master_key_env`
/// variable.
///
/// Without `kdf_salt` the value is a hex-encoded 32-byte key; with it, the
/// value is a passphrase stretched through Argon2id.
pub fn load_master_key(vault: &VaultConfig) -> Result<MasterKey> {
    let material = match &vault.master_key_file {
        Some(path) => {
            let path = expand_tilde(path);
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("reading master key file: {}", path.display()))?;
            SecretString::from(content)
        }
        None => {
            let value = std::env::var(&vault.master_key_env).with_context(|| {
                format!(
                    "master key not configured\n\
                     Set vault.master_key_file in the config, or export {}.",
                    vault.master_key_env
                )
            })?;
            SecretString::from(value)
        }
    };

    match &vault.kdf_salt {
        Some(salt_hex) => {
            let salt = hex::decode(salt_hex.trim()).context("vault.kdf_salt is not valid hex")?;
            let passphrase = SecretString::from(
                material
                    .expose_secret()
                    .trim_end_matches(['\r', '\n'])
                    .to_string(),
            );
            let params = KdfParams {
                mem_cost_kib: vault.argon2_mem_cost_kib,
                time_cost: vault.argon2_time_cost,
                parallelism: vault.argon2_parallelism,
            };
            Ok(derive_master_key(&passphrase, &salt, &params)?)
        }
        None => Ok(MasterKey::from_hex(&material)?),
    }
}

/// S3 credentials from the standard environment variables.
fn s3_credentials_from_env() -> Result<S3Credentials> {
    let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
        .or_else(|_| std::env::var("LOCKBOX_ACCESS_KEY_ID"))
        .context(
            "S3 credentials not set\n\
             Set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY environment variables.",
        )?;
    let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
        .or_else(|_| std::env::var("LOCKBOX_SECRET_ACCESS_KEY"))
        .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
    Ok(S3Credentials {
        access_key_id,
        secret_access_key,
    })
}

/// Wire up blob store, catalog, key vault and transfer service from config.
pub async fn open_transfer(config: &LockboxConfig) -> Result<Transfer> {
    let master = Arc::new(load_master_key(&config.vault)?);

    let mut storage = config.storage.clone();
    let credentials = match storage.backend {
        StorageBackend::S3 => Some(s3_credentials_from_env()?),
        StorageBackend::Fs => {
            storage.root = expand_tilde(&storage.root);
            None
        }
        StorageBackend::Memory => None,
    };
    let op = build_operator(&storage, credentials.as_ref()).context("building storage operator")?;
    if storage.backend == StorageBackend::S3 {
        check_health(&op).await.context("storage is unreachable")?;
    }
    let blobs: Arc<dyn BlobStore> = Arc::new(OperatorBlobStore::new(op));

    let (catalog, users): (Arc<dyn MetadataStore>, Arc<dyn UserKeyStore>) =
        match storage.backend {
            StorageBackend::Memory => {
                tracing::warn!("memory backend: blobs and records vanish when the process exits");
                let catalog = Arc::new(MemoryCatalog::new());
                let users: Arc<dyn UserKeyStore> = catalog.clone();
                let files: Arc<dyn MetadataStore> = catalog;
                (files, users)
            }
            StorageBackend::Fs | StorageBackend::S3 => {
                let path = expand_tilde(&config.vault.catalog);
                let catalog = Arc::new(
                    JsonCatalog::open(&path)
                        .with_context(|| format!("opening catalog: {}", path.display()))?,
                );
                let users: Arc<dyn UserKeyStore> = catalog.clone();
                let files: Arc<dyn MetadataStore> = catalog;
                (files, users)
            }
        };

    let vault = KeyVault::new(master, users);
    Ok(Transfer::new(blobs, catalog, vault, config.transfer.clone())?)
}
