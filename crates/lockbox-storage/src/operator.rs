//! OpenDAL Operator factory for lockbox blob backends

use lockbox_core::config::{StorageBackend, StorageConfig};
use lockbox_core::{LockboxError, LockboxResult};
use opendal::Operator;

/// Credentials for the S3 backend, loaded outside the config file
#[derive(Clone)]
pub struct S3Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl std::fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .finish()
    }
}

/// Build an OpenDAL Operator for the configured backend.
///
/// If `enforce_tls` is true and an S3 endpoint uses HTTP, this returns an
/// error. Otherwise, a warning is logged for non-HTTPS endpoints.
pub fn build_operator(
    storage: &StorageConfig,
    credentials: Option<&S3Credentials>,
) -> LockboxResult<Operator> {
    match storage.backend {
        StorageBackend::Memory => {
            let op = Operator::new(opendal::services::Memory::default())
                .map_err(|e| LockboxError::Config(format!("creating memory operator: {e}")))?
                .finish();
            Ok(op)
        }
        StorageBackend::Fs => {
            let root = storage.root.to_string_lossy();
            let builder = opendal::services::Fs::default().root(&root);
            let op = Operator::new(builder)
                .map_err(|e| LockboxError::Config(format!("creating fs operator at {root}: {e}")))?
                .layer(opendal::layers::LoggingLayer::default())
                .finish();
            Ok(op)
        }
        StorageBackend::S3 => build_s3(storage, credentials),
    }
}

fn build_s3(storage: &StorageConfig, credentials: Option<&S3Credentials>) -> LockboxResult<Operator> {
    if storage.endpoint.starts_with("http://") {
        if storage.enforce_tls {
            return Err(LockboxError::Config(format!(
                "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                 Use an HTTPS endpoint or set storage.enforce_tls = false for local development.",
                storage.endpoint
            )));
        }
        tracing::warn!(
            endpoint = %storage.endpoint,
            "S3 endpoint uses plaintext HTTP, credentials are transmitted unencrypted. \
             Set storage.enforce_tls = true and use HTTPS in production."
        );
    }

    let credentials = credentials.ok_or_else(|| {
        LockboxError::Config(
            "S3 backend needs credentials (AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY)".into(),
        )
    })?;

    // opendal 0.55: S3 builder uses consuming pattern (methods take `self`, return `Self`)
    let root = storage.root.to_string_lossy();
    let builder = opendal::services::S3::default()
        .root(&root)
        .endpoint(&storage.endpoint)
        .region(&storage.region)
        .bucket(&storage.bucket)
        .access_key_id(&credentials.access_key_id)
        .secret_access_key(&credentials.secret_access_key);

    let op = Operator::new(builder)
        .map_err(|e| LockboxError::Config(format!("creating S3 operator: {e}")))?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(5)
                .with_jitter(),
        )
        .finish();

    Ok(op)
}
