//! KeyVault: per-request resolution of a user's data key
//!
//! The vault holds the master key and a handle to wherever wrapped user keys
//! live. It never caches unwrapped keys; each call produces a fresh `DataKey`
//! owned by the caller for the duration of one request.

use std::sync::Arc;

use async_trait::async_trait;
use lockbox_core::{LockboxError, LockboxResult, UserId, UserRecord};
use tracing::{debug, info, warn};

use crate::kdf::MasterKey;
use crate::keys::{generate_data_key, unwrap_key, wrap_key, DataKey};

/// Lookup of wrapped data keys by user
#[async_trait]
pub trait UserKeyStore: Send + Sync {
    /// The wrapped key stored on the user's record, if the user exists.
    async fn wrapped_key(&self, user: &UserId) -> LockboxResult<Option<Vec<u8>>>;

    /// Store a new user record. Fails if the id is already taken.
    async fn insert_user(&self, record: UserRecord) -> LockboxResult<()>;
}

#[derive(Clone)]
pub struct KeyVault {
    master: Arc<MasterKey>,
    users: Arc<dyn UserKeyStore>,
}

impl KeyVault {
    pub fn new(master: Arc<MasterKey>, users: Arc<dyn UserKeyStore>) -> Self {
        Self { master, users }
    }

    /// Fetch and unwrap the data key of `user`.
    ///
    /// A missing user or a wrapped key that does not open under the master
    /// key is a `KeyResolution` error.
    pub async fn resolve_user_key(&self, user: &UserId) -> LockboxResult<DataKey> {
        let wrapped = self
            .users
            .wrapped_key(user)
            .await?
            .ok_or_else(|| LockboxError::KeyResolution(format!("no key for user {user}")))?;

        unwrap_key(&self.master, &wrapped).inspect_err(|e| {
            warn!(user = %user, error = %e, "wrapped user key did not open");
        })
    }

    /// Create a fresh data key for a new user and persist it wrapped.
    pub async fn enroll(&self, id: UserId, login: &str) -> LockboxResult<UserRecord> {
        let login = login.trim();
        if login.is_empty() {
            return Err(LockboxError::InvalidInput("login must not be empty".into()));
        }

        let data_key = generate_data_key();
        let record = UserRecord {
            id,
            login: login.to_string(),
            wrapped_key: wrap_key(&self.master, &data_key)?,
        };

        self.users.insert_user(record.clone()).await?;
        info!(user = %id, login = %record.login, "enrolled user");
        debug!(user = %id, wrapped_len = record.wrapped_key.len(), "stored wrapped data key");
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KEY_SIZE;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MapStore {
        users: Mutex<HashMap<UserId, UserRecord>>,
    }

    #[async_trait]
    impl UserKeyStore for MapStore {
        async fn wrapped_key(&self, user: &UserId) -> LockboxResult<Option<Vec<u8>>> {
            Ok(self
                .users
                .lock()
                .unwrap()
                .get(user)
                .map(|r| r.wrapped_key.clone()))
        }

        async fn insert_user(&self, record: UserRecord) -> LockboxResult<()> {
            let mut users = self.users.lock().unwrap();
            if users.contains_key(&record.id) {
                return Err(LockboxError::InvalidInput("duplicate user".into()));
            }
            users.insert(record.id, record);
            Ok(())
        }
    }

    fn vault_with(master: [u8; KEY_SIZE], store: Arc<MapStore>) -> KeyVault {
        KeyVault::new(Arc::new(MasterKey::from_bytes(master)), store)
    }

    #[tokio::test]
    async fn test_enroll_then_resolve() {
        let store = Arc::new(MapStore::default());
        let vault = vault_with([9u8; KEY_SIZE], store.clone());
        let id = UserId::new_random();

        let record = vault.enroll(id, " alice ").await.unwrap();
        assert_eq!(record.login, "alice");

        let k1 = vault.resolve_user_key(&id).await.unwrap();
        let k2 = vault.resolve_user_key(&id).await.unwrap();
        assert_eq!(k1.as_bytes(), k2.as_bytes(), "same user, same data key");
    }

    #[tokio::test]
    async fn test_users_get_distinct_keys() {
        let store = Arc::new(MapStore::default());
        let vault = vault_with([9u8; KEY_SIZE], store);
        let (a, b) = (UserId::new_random(), UserId::new_random());
        vault.enroll(a, "a").await.unwrap();
        vault.enroll(b, "b").await.unwrap();

        let ka = vault.resolve_user_key(&a).await.unwrap();
        let kb = vault.resolve_user_key(&b).await.unwrap();
        assert_ne!(ka.as_bytes(), kb.as_bytes());
    }

    #[tokio::test]
    async fn test_unknown_user() {
        let vault = vault_with([9u8; KEY_SIZE], Arc::new(MapStore::default()));
        let err = vault.resolve_user_key(&UserId::new_random()).await.unwrap_err();
        assert!(matches!(err, LockboxError::KeyResolution(_)));
    }

    #[tokio::test]
    async fn test_wrong_master_key() {
        let store = Arc::new(MapStore::default());
        let id = UserId::new_random();
        vault_with([1u8; KEY_SIZE], store.clone())
            .enroll(id, "bob")
            .await
            .unwrap();

        let other = vault_with([2u8; KEY_SIZE], store);
        assert!(matches!(
            other.resolve_user_key(&id).await,
            Err(LockboxError::KeyResolution(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupted_wrapped_key() {
        let store = Arc::new(MapStore::default());
        let vault = vault_with([3u8; KEY_SIZE], store.clone());
        let id = UserId::new_random();
        vault.enroll(id, "carol").await.unwrap();

        store
            .users
            .lock()
            .unwrap()
            .get_mut(&id)
            .unwrap()
            .wrapped_key[20] ^= 0x40;

        assert!(matches!(
            vault.resolve_user_key(&id).await,
            Err(LockboxError::KeyResolution(_))
        ));
    }

    #[tokio::test]
    async fn test_enroll_rejects_empty_login() {
        let vault = vault_with([3u8; KEY_SIZE], Arc::new(MapStore::default()));
        assert!(matches!(
            vault.enroll(UserId::new_random(), "   ").await,
            Err(LockboxError::InvalidInput(_))
        ));
    }
}
