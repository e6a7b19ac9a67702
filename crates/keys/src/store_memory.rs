//! In-memory key store for tests and embedding.

use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;

use crate::{
    store::{KeyStore, StoreError, StoreResult, check_transition},
    types::{EncryptionKey, KeyPurpose, KeyStatus},
};

/// In-memory store backed by `HashMap`s. No persistence.
pub struct MemoryKeyStore {
    keys: Mutex<HashMap<String, EncryptionKey>>,
    material: Mutex<HashMap<String, String>>,
    unavailable: AtomicBool,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            material: Mutex::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Overwrite stored material without any checks, to simulate corruption.
    pub fn replace_wrapped_material(&self, key_id: &str, wrapped: &str) {
        let mut material = self.material.lock().unwrap_or_else(|e| e.into_inner());
        material.insert(key_id.to_string(), wrapped.to_string());
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked unavailable".into()));
        }
        Ok(())
    }
}

impl Default for MemoryKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn create_key_metadata(&self, key: &EncryptionKey) -> StoreResult<()> {
        self.check_available()?;
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        let duplicate = keys.values().any(|k| {
            k.tenant_id == key.tenant_id && k.purpose == key.purpose && k.version == key.version
        });
        if duplicate || keys.contains_key(&key.key_id) {
            return Err(StoreError::Conflict(format!(
                "version {} already exists for {}/{}",
                key.version, key.tenant_id, key.purpose
            )));
        }
        keys.insert(key.key_id.clone(), key.clone());
        Ok(())
    }

    async fn update_key_status(
        &self,
        key_id: &str,
        expected: KeyStatus,
        status: KeyStatus,
        retired_at_ms: Option<u64>,
    ) -> StoreResult<()> {
        self.check_available()?;
        check_transition(key_id, expected, status)?;
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        let key = keys
            .get_mut(key_id)
            .ok_or_else(|| StoreError::NotFound(format!("key {key_id}")))?;
        if key.status != expected {
            return Err(StoreError::Conflict(format!(
                "key {key_id} is {}, expected {expected}",
                key.status
            )));
        }
        key.status = status;
        if retired_at_ms.is_some() {
            key.retired_at_ms = retired_at_ms;
        }
        Ok(())
    }

    async fn get_active_key_metadata(
        &self,
        tenant_id: &str,
        purpose: KeyPurpose,
    ) -> StoreResult<Option<EncryptionKey>> {
        self.check_available()?;
        let keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        Ok(keys
            .values()
            .filter(|k| {
                k.tenant_id == tenant_id && k.purpose == purpose && k.status == KeyStatus::Active
            })
            .max_by_key(|k| k.version)
            .cloned())
    }

    async fn get_key_metadata_by_version(
        &self,
        tenant_id: &str,
        purpose: KeyPurpose,
        version: u32,
    ) -> StoreResult<Option<EncryptionKey>> {
        self.check_available()?;
        let keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        Ok(keys
            .values()
            .find(|k| k.tenant_id == tenant_id && k.purpose == purpose && k.version == version)
            .cloned())
    }

    async fn get_key_metadata(&self, key_id: &str) -> StoreResult<Option<EncryptionKey>> {
        self.check_available()?;
        let keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        Ok(keys.get(key_id).cloned())
    }

    async fn list_keys(
        &self,
        tenant_id: &str,
        purpose: KeyPurpose,
    ) -> StoreResult<Vec<EncryptionKey>> {
        self.check_available()?;
        let keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        let mut found: Vec<EncryptionKey> = keys
            .values()
            .filter(|k| k.tenant_id == tenant_id && k.purpose == purpose)
            .cloned()
            .collect();
        found.sort_by_key(|k| k.version);
        Ok(found)
    }

    async fn store_wrapped_material(&self, key_id: &str, wrapped: &str) -> StoreResult<()> {
        self.check_available()?;
        let mut material = self.material.lock().unwrap_or_else(|e| e.into_inner());
        if material.contains_key(key_id) {
            return Err(StoreError::Conflict(format!(
                "material already stored for key {key_id}"
            )));
        }
        material.insert(key_id.to_string(), wrapped.to_string());
        Ok(())
    }

    async fn get_wrapped_material(&self, key_id: &str) -> StoreResult<Option<String>> {
        self.check_available()?;
        let material = self.material.lock().unwrap_or_else(|e| e.into_inner());
        Ok(material.get(key_id).cloned())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn key(version: u32) -> EncryptionKey {
        EncryptionKey::new("acme", KeyPurpose::Pii, version, "xchacha20-poly1305")
    }

    #[tokio::test]
    async fn duplicate_version_conflicts() {
        let store = MemoryKeyStore::new();
        store.create_key_metadata(&key(1)).await.unwrap();
        let result = store.create_key_metadata(&key(1)).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
        assert_eq!(store.list_keys("acme", KeyPurpose::Pii).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn active_lookup_prefers_highest_version() {
        let store = MemoryKeyStore::new();
        store.create_key_metadata(&key(1)).await.unwrap();
        store.create_key_metadata(&key(2)).await.unwrap();

        let active = store
            .get_active_key_metadata("acme", KeyPurpose::Pii)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.version, 2);
    }

    #[tokio::test]
    async fn status_update_is_compare_and_set() {
        let store = MemoryKeyStore::new();
        let k = key(1);
        store.create_key_metadata(&k).await.unwrap();

        store
            .update_key_status(&k.key_id, KeyStatus::Active, KeyStatus::Rotating, None)
            .await
            .unwrap();
        let again = store
            .update_key_status(&k.key_id, KeyStatus::Active, KeyStatus::Rotating, None)
            .await;
        assert!(matches!(again, Err(StoreError::Conflict(_))));

        let missing = store
            .update_key_status("nope", KeyStatus::Active, KeyStatus::Rotating, None)
            .await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn illegal_status_moves_are_refused() {
        let store = MemoryKeyStore::new();
        let k = key(1);
        store.create_key_metadata(&k).await.unwrap();

        // Skipping rotating is refused even though the expected status matches.
        let skip = store
            .update_key_status(&k.key_id, KeyStatus::Active, KeyStatus::Retired, Some(1))
            .await;
        assert!(matches!(skip, Err(StoreError::Conflict(_))));

        store
            .update_key_status(&k.key_id, KeyStatus::Active, KeyStatus::Rotating, None)
            .await
            .unwrap();
        store
            .update_key_status(&k.key_id, KeyStatus::Rotating, KeyStatus::Retired, Some(2))
            .await
            .unwrap();

        let revive = store
            .update_key_status(&k.key_id, KeyStatus::Retired, KeyStatus::Active, None)
            .await;
        assert!(matches!(revive, Err(StoreError::Conflict(_))));

        let stored = store.get_key_metadata(&k.key_id).await.unwrap().unwrap();
        assert_eq!(stored.status, KeyStatus::Retired);
        assert_eq!(stored.retired_at_ms, Some(2));
    }

    #[tokio::test]
    async fn material_is_write_once() {
        let store = MemoryKeyStore::new();
        store.store_wrapped_material("k1", "blob").await.unwrap();
        assert!(store.store_wrapped_material("k1", "other").await.is_err());
        assert_eq!(
            store.get_wrapped_material("k1").await.unwrap().as_deref(),
            Some("blob")
        );
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = MemoryKeyStore::new();
        store.set_unavailable(true);
        let result = store.get_active_key_metadata("acme", KeyPurpose::Pii).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
