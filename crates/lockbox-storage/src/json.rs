//! JSON-file catalog: users and file records in one document
//!
//! The whole catalog is loaded into memory on open. Every mutation is flushed
//! atomically (write temp file, then rename) before the call returns; if the
//! flush fails the in-memory change is rolled back, so a caller never sees a
//! record that is not on disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use lockbox_core::{FileId, FileMetadata, LockboxError, LockboxResult, UserId, UserRecord};
use lockbox_crypto::UserKeyStore;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::catalog::{self, MetadataStore};

const CATALOG_VERSION: u32 = 1;

/// On-disk layout
#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogFile {
    version: u32,
    #[serde(default)]
    users: Vec<UserRecord>,
    #[serde(default)]
    files: Vec<FileMetadata>,
}

#[derive(Default)]
struct Entries {
    users: HashMap<UserId, UserRecord>,
    files: HashMap<FileId, FileMetadata>,
}

impl Entries {
    fn to_file(&self) -> CatalogFile {
        let mut users: Vec<UserRecord> = self.users.values().cloned().collect();
        users.sort_by(|a, b| a.login.cmp(&b.login));
        let mut files: Vec<FileMetadata> = self.files.values().cloned().collect();
        files.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.0.cmp(&b.id.0)));
        CatalogFile {
            version: CATALOG_VERSION,
            users,
            files,
        }
    }
}

pub struct JsonCatalog {
    path: PathBuf,
    entries: Mutex<Entries>,
}

impl JsonCatalog {
    /// Open or create a catalog at the given path.
    pub fn open(path: &Path) -> LockboxResult<Self> {
        let entries = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let file: CatalogFile = serde_json::from_str(&content).map_err(|e| {
                LockboxError::Storage(format!("parsing catalog {}: {e}", path.display()))
            })?;
            if file.version != CATALOG_VERSION {
                return Err(LockboxError::Storage(format!(
                    "catalog {} has unsupported version {}",
                    path.display(),
                    file.version
                )));
            }
            Entries {
                users: file.users.into_iter().map(|u| (u.id, u)).collect(),
                files: file.files.into_iter().map(|f| (f.id, f)).collect(),
            }
        } else {
            Entries::default()
        };

        debug!(
            path = %path.display(),
            users = entries.users.len(),
            files = entries.files.len(),
            "catalog loaded"
        );

        Ok(Self {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the catalog to disk atomically (temp file, then rename).
    async fn flush(&self, entries: &Entries) -> LockboxResult<()> {
        let json = serde_json::to_string_pretty(&entries.to_file())
            .map_err(|e| LockboxError::Storage(format!("serializing catalog: {e}")))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, json.as_bytes())
            .await
            .map_err(|e| {
                LockboxError::Storage(format!("writing catalog temp {}: {e}", tmp_path.display()))
            })?;
        tokio::fs::rename(&tmp_path, &self.path).await.map_err(|e| {
            LockboxError::Storage(format!("renaming catalog into {}: {e}", self.path.display()))
        })?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for JsonCatalog {
    async fn insert(&self, meta: FileMetadata) -> LockboxResult<()> {
        let mut entries = self.entries.lock().await;
        let id = meta.id;
        catalog::insert_file(&mut entries.files, meta)?;
        if let Err(e) = self.flush(&entries).await {
            entries.files.remove(&id);
            return Err(e);
        }
        Ok(())
    }

    async fn get_by_id(&self, id: &FileId) -> LockboxResult<Option<FileMetadata>> {
        Ok(self.entries.lock().await.files.get(id).cloned())
    }

    async fn delete(&self, id: &FileId, owner: &UserId) -> LockboxResult<()> {
        let mut entries = self.entries.lock().await;
        let removed = catalog::delete_owned(&mut entries.files, id, owner)?;
        if let Err(e) = self.flush(&entries).await {
            entries.files.insert(removed.id, removed);
            return Err(e);
        }
        Ok(())
    }

    async fn list_by_owner(&self, owner: &UserId) -> LockboxResult<Vec<FileMetadata>> {
        Ok(catalog::owned_by(&self.entries.lock().await.files, owner))
    }
}

#[async_trait]
impl UserKeyStore for JsonCatalog {
    async fn wrapped_key(&self, user: &UserId) -> LockboxResult<Option<Vec<u8>>> {
        Ok(self
            .entries
            .lock()
            .await
            .users
            .get(user)
            .map(|u| u.wrapped_key.clone()))
    }

    async fn insert_user(&self, record: UserRecord) -> LockboxResult<()> {
        let mut entries = self.entries.lock().await;
        let id = record.id;
        catalog::insert_user(&mut entries.users, record)?;
        if let Err(e) = self.flush(&entries).await {
            entries.users.remove(&id);
            return Err(e);
        }
        Ok(())
    }
}
