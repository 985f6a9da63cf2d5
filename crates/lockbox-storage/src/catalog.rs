//! File metadata records

use std::collections::HashMap;

use async_trait::async_trait;
use lockbox_core::{FileId, FileMetadata, LockboxError, LockboxResult, UserId, UserRecord};
use lockbox_crypto::UserKeyStore;
use tokio::sync::RwLock;

/// Persistent file records, keyed by file id.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Add a record. Fails if the id already exists.
    async fn insert(&self, meta: FileMetadata) -> LockboxResult<()>;

    async fn get_by_id(&self, id: &FileId) -> LockboxResult<Option<FileMetadata>>;

    /// Remove the record for `id` if it belongs to `owner`.
    ///
    /// `NotFound` when no such record exists for that owner.
    async fn delete(&self, id: &FileId, owner: &UserId) -> LockboxResult<()>;

    /// All records owned by `owner`, oldest first.
    async fn list_by_owner(&self, owner: &UserId) -> LockboxResult<Vec<FileMetadata>>;
}

/// Records held in process memory. Used by tests and the `memory` backend.
#[derive(Default)]
pub struct MemoryCatalog {
    files: RwLock<HashMap<FileId, FileMetadata>>,
    users: RwLock<HashMap<UserId, UserRecord>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn file_count(&self) -> usize {
        self.files.read().await.len()
    }
}

pub(crate) fn insert_file(
    files: &mut HashMap<FileId, FileMetadata>,
    meta: FileMetadata,
) -> LockboxResult<()> {
    if files.contains_key(&meta.id) {
        return Err(LockboxError::Storage(format!(
            "file record {} already exists",
            meta.id
        )));
    }
    files.insert(meta.id, meta);
    Ok(())
}

pub(crate) fn delete_owned(
    files: &mut HashMap<FileId, FileMetadata>,
    id: &FileId,
    owner: &UserId,
) -> LockboxResult<FileMetadata> {
    match files.get(id) {
        Some(meta) if meta.owner == *owner => files
            .remove(id)
            .ok_or_else(|| LockboxError::NotFound(format!("file {id}"))),
        _ => Err(LockboxError::NotFound(format!("file {id}"))),
    }
}

pub(crate) fn owned_by(files: &HashMap<FileId, FileMetadata>, owner: &UserId) -> Vec<FileMetadata> {
    let mut owned: Vec<FileMetadata> = files
        .values()
        .filter(|m| m.owner == *owner)
        .cloned()
        .collect();
    owned.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.file_name.cmp(&b.file_name))
    });
    owned
}

pub(crate) fn insert_user(
    users: &mut HashMap<UserId, UserRecord>,
    record: UserRecord,
) -> LockboxResult<()> {
    if users.contains_key(&record.id) {
        return Err(LockboxError::InvalidInput(format!(
            "user {} already exists",
            record.id
        )));
    }
    if users.values().any(|u| u.login == record.login) {
        return Err(LockboxError::InvalidInput(format!(
            "login {:?} already taken",
            record.login
        )));
    }
    users.insert(record.id, record);
    Ok(())
}

#[async_trait]
impl MetadataStore for MemoryCatalog {
    async fn insert(&self, meta: FileMetadata) -> LockboxResult<()> {
        insert_file(&mut *self.files.write().await, meta)
    }

    async fn get_by_id(&self, id: &FileId) -> LockboxResult<Option<FileMetadata>> {
        Ok(self.files.read().await.get(id).cloned())
    }

    async fn delete(&self, id: &FileId, owner: &UserId) -> LockboxResult<()> {
        delete_owned(&mut *self.files.write().await, id, owner).map(|_| ())
    }

    async fn list_by_owner(&self, owner: &UserId) -> LockboxResult<Vec<FileMetadata>> {
        Ok(owned_by(&*self.files.read().await, owner))
    }
}

#[async_trait]
impl UserKeyStore for MemoryCatalog {
    async fn wrapped_key(&self, user: &UserId) -> LockboxResult<Option<Vec<u8>>> {
        Ok(self
            .users
            .read()
            .await
            .get(user)
            .map(|u| u.wrapped_key.clone()))
    }

    async fn insert_user(&self, record: UserRecord) -> LockboxResult<()> {
        insert_user(&mut *self.users.write().await, record)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample(owner: UserId, name: &str, created_at: u64) -> FileMetadata {
        FileMetadata {
            id: FileId::new_random(),
            owner,
            file_name: name.into(),
            file_size: 11,
            blob_name: format!("blob-{name}"),
            blob_size: 4 * 3 + 3 * 28 + 11,
            created_at,
        }
    }

    #[tokio::test]
    async fn test_insert_get() {
        let catalog = MemoryCatalog::new();
        let meta = sample(UserId::new_random(), "a.txt", 1);

        catalog.insert(meta.clone()).await.unwrap();
        assert_eq!(catalog.get_by_id(&meta.id).await.unwrap(), Some(meta.clone()));
        assert!(catalog.insert(meta).await.is_err(), "duplicate id must fail");
        assert!(catalog
            .get_by_id(&FileId::new_random())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_delete_checks_owner() {
        let catalog = MemoryCatalog::new();
        let owner = UserId::new_random();
        let meta = sample(owner, "b.bin", 1);
        catalog.insert(meta.clone()).await.unwrap();

        let err = catalog
            .delete(&meta.id, &UserId::new_random())
            .await
            .unwrap_err();
        assert!(matches!(err, LockboxError::NotFound(_)));
        assert_eq!(catalog.file_count().await, 1);

        catalog.delete(&meta.id, &owner).await.unwrap();
        assert_eq!(catalog.file_count().await, 0);
        assert!(matches!(
            catalog.delete(&meta.id, &owner).await,
            Err(LockboxError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_by_owner_sorted() {
        let catalog = MemoryCatalog::new();
        let alice = UserId::new_random();
        let bob = UserId::new_random();
        catalog.insert(sample(alice, "second", 20)).await.unwrap();
        catalog.insert(sample(bob, "other", 5)).await.unwrap();
        catalog.insert(sample(alice, "first", 10)).await.unwrap();

        let names: Vec<String> = catalog
            .list_by_owner(&alice)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.file_name)
            .collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_users() {
        let catalog = MemoryCatalog::new();
        let record = UserRecord {
            id: UserId::new_random(),
            login: "alice".into(),
            wrapped_key: vec![1, 2, 3],
        };
        catalog.insert_user(record.clone()).await.unwrap();
        assert_eq!(
            catalog.wrapped_key(&record.id).await.unwrap(),
            Some(vec![1, 2, 3])
        );

        let dup_login = UserRecord {
            id: UserId::new_random(),
            ..record
        };
        assert!(matches!(
            catalog.insert_user(dup_login).await,
            Err(LockboxError::InvalidInput(_))
        ));
        assert!(catalog
            .wrapped_key(&UserId::new_random())
            .await
            .unwrap()
            .is_none());
    }
}
