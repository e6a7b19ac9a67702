//! SQLite-backed key store using sqlx.

use {
    anyhow::Context,
    async_trait::async_trait,
    sqlx::{
        Row, SqlitePool,
        sqlite::{SqlitePoolOptions, SqliteRow},
    },
};

use crate::{
    KeyError,
    store::{KeyStore, StoreError, StoreResult, check_transition},
    types::{EncryptionKey, KeyPurpose, KeyStatus},
};

const KEY_COLUMNS: &str =
    "key_id, tenant_id, purpose, version, status, algorithm, created_at_ms, retired_at_ms";

/// SQLite-backed persistence for key metadata and wrapped material.
pub struct SqliteKeyStore {
    pool: SqlitePool,
}

impl SqliteKeyStore {
    /// Create a store with its own connection pool and run migrations.
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("failed to connect to SQLite")?;

        crate::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    /// Create a store on an existing pool. Call [`crate::run_migrations`] first.
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn unique_violation_as_conflict(err: sqlx::Error, context: impl FnOnce() -> String) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(context()),
        _ => StoreError::Database(err),
    }
}

fn row_to_key(row: &SqliteRow) -> StoreResult<EncryptionKey> {
    let key_id: String = row.get("key_id");
    let purpose: String = row.get("purpose");
    let status: String = row.get("status");
    let corrupt = |e: KeyError| StoreError::Corrupt(format!("key {key_id}: {e}"));
    Ok(EncryptionKey {
        purpose: purpose.parse::<KeyPurpose>().map_err(corrupt)?,
        status: status.parse::<KeyStatus>().map_err(corrupt)?,
        key_id: key_id.clone(),
        tenant_id: row.get("tenant_id"),
        version: row.get::<i64, _>("version") as u32,
        created_at_ms: row.get::<i64, _>("created_at_ms") as u64,
        retired_at_ms: row
            .get::<Option<i64>, _>("retired_at_ms")
            .map(|v| v as u64),
        algorithm: row.get("algorithm"),
    })
}

#[async_trait]
impl KeyStore for SqliteKeyStore {
    async fn create_key_metadata(&self, key: &EncryptionKey) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO encryption_keys (key_id, tenant_id, purpose, version, status, algorithm, created_at_ms, retired_at_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&key.key_id)
        .bind(&key.tenant_id)
        .bind(key.purpose.as_str())
        .bind(i64::from(key.version))
        .bind(key.status.as_str())
        .bind(&key.algorithm)
        .bind(key.created_at_ms as i64)
        .bind(key.retired_at_ms.map(|v| v as i64))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            unique_violation_as_conflict(e, || {
                format!(
                    "version {} already exists for {}/{}",
                    key.version, key.tenant_id, key.purpose
                )
            })
        })?;
        Ok(())
    }

    async fn update_key_status(
        &self,
        key_id: &str,
        expected: KeyStatus,
        status: KeyStatus,
        retired_at_ms: Option<u64>,
    ) -> StoreResult<()> {
        check_transition(key_id, expected, status)?;
        let result = sqlx::query(
            "UPDATE encryption_keys
             SET status = ?, retired_at_ms = COALESCE(?, retired_at_ms)
             WHERE key_id = ? AND status = ?",
        )
        .bind(status.as_str())
        .bind(retired_at_ms.map(|v| v as i64))
        .bind(key_id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get_key_metadata(key_id).await? {
                Some(current) => Err(StoreError::Conflict(format!(
                    "key {key_id} is {}, expected {expected}",
                    current.status
                ))),
                None => Err(StoreError::NotFound(format!("key {key_id}"))),
            };
        }
        Ok(())
    }

    async fn get_active_key_metadata(
        &self,
        tenant_id: &str,
        purpose: KeyPurpose,
    ) -> StoreResult<Option<EncryptionKey>> {
        let row = sqlx::query(&format!(
            "SELECT {KEY_COLUMNS} FROM encryption_keys
             WHERE tenant_id = ? AND purpose = ? AND status = 'active'
             ORDER BY version DESC
             LIMIT 1"
        ))
        .bind(tenant_id)
        .bind(purpose.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_key).transpose()
    }

    async fn get_key_metadata_by_version(
        &self,
        tenant_id: &str,
        purpose: KeyPurpose,
        version: u32,
    ) -> StoreResult<Option<EncryptionKey>> {
        let row = sqlx::query(&format!(
            "SELECT {KEY_COLUMNS} FROM encryption_keys
             WHERE tenant_id = ? AND purpose = ? AND version = ?"
        ))
        .bind(tenant_id)
        .bind(purpose.as_str())
        .bind(i64::from(version))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_key).transpose()
    }

    async fn get_key_metadata(&self, key_id: &str) -> StoreResult<Option<EncryptionKey>> {
        let row = sqlx::query(&format!(
            "SELECT {KEY_COLUMNS} FROM encryption_keys WHERE key_id = ?"
        ))
        .bind(key_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_key).transpose()
    }

    async fn list_keys(
        &self,
        tenant_id: &str,
        purpose: KeyPurpose,
    ) -> StoreResult<Vec<EncryptionKey>> {
        let rows = sqlx::query(&format!(
            "SELECT {KEY_COLUMNS} FROM encryption_keys
             WHERE tenant_id = ? AND purpose = ?
             ORDER BY version ASC"
        ))
        .bind(tenant_id)
        .bind(purpose.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_key).collect()
    }

    async fn store_wrapped_material(&self, key_id: &str, wrapped: &str) -> StoreResult<()> {
        sqlx::query("INSERT INTO wrapped_key_material (key_id, wrapped) VALUES (?, ?)")
            .bind(key_id)
            .bind(wrapped)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                unique_violation_as_conflict(e, || {
                    format!("material already stored for key {key_id}")
                })
            })?;
        Ok(())
    }

    async fn get_wrapped_material(&self, key_id: &str) -> StoreResult<Option<String>> {
        let row = sqlx::query("SELECT wrapped FROM wrapped_key_material WHERE key_id = ?")
            .bind(key_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("wrapped")))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> SqliteKeyStore {
        // A single connection keeps every query on the same in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::run_migrations(&pool).await.unwrap();
        SqliteKeyStore::with_pool(pool)
    }

    fn key(tenant: &str, version: u32) -> EncryptionKey {
        EncryptionKey::new(tenant, KeyPurpose::Credentials, version, "xchacha20-poly1305")
    }

    #[tokio::test]
    async fn create_and_fetch_round_trip() {
        let store = test_store().await;
        let k = key("acme", 1);
        store.create_key_metadata(&k).await.unwrap();

        let by_id = store.get_key_metadata(&k.key_id).await.unwrap().unwrap();
        assert_eq!(by_id, k);

        let by_version = store
            .get_key_metadata_by_version("acme", KeyPurpose::Credentials, 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_version.key_id, k.key_id);

        assert!(
            store
                .get_key_metadata_by_version("acme", KeyPurpose::Credentials, 2)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn duplicate_version_is_conflict() {
        let store = test_store().await;
        store.create_key_metadata(&key("acme", 1)).await.unwrap();
        let result = store.create_key_metadata(&key("acme", 1)).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));

        // Same version under another tenant is fine.
        store.create_key_metadata(&key("globex", 1)).await.unwrap();
    }

    #[tokio::test]
    async fn active_lookup_prefers_highest_version() {
        let store = test_store().await;
        let v1 = key("acme", 1);
        let v2 = key("acme", 2);
        store.create_key_metadata(&v1).await.unwrap();
        store.create_key_metadata(&v2).await.unwrap();

        let active = store
            .get_active_key_metadata("acme", KeyPurpose::Credentials)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.key_id, v2.key_id);

        store
            .update_key_status(&v1.key_id, KeyStatus::Active, KeyStatus::Rotating, None)
            .await
            .unwrap();
        let versions: Vec<u32> = store
            .list_keys("acme", KeyPurpose::Credentials)
            .await
            .unwrap()
            .iter()
            .map(|k| k.version)
            .collect();
        assert_eq!(versions, vec![1, 2]);
    }

    #[tokio::test]
    async fn status_update_compare_and_set() {
        let store = test_store().await;
        let k = key("acme", 1);
        store.create_key_metadata(&k).await.unwrap();

        let stale = store
            .update_key_status(&k.key_id, KeyStatus::Rotating, KeyStatus::Retired, Some(5))
            .await;
        assert!(matches!(stale, Err(StoreError::Conflict(_))));

        store
            .update_key_status(&k.key_id, KeyStatus::Active, KeyStatus::Rotating, None)
            .await
            .unwrap();
        store
            .update_key_status(&k.key_id, KeyStatus::Rotating, KeyStatus::Retired, Some(5))
            .await
            .unwrap();
        let retired = store.get_key_metadata(&k.key_id).await.unwrap().unwrap();
        assert_eq!(retired.status, KeyStatus::Retired);
        assert_eq!(retired.retired_at_ms, Some(5));

        let missing = store
            .update_key_status("nope", KeyStatus::Active, KeyStatus::Rotating, None)
            .await;
        assert!(matches!(missing, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn illegal_status_moves_are_refused() {
        let store = test_store().await;
        let k = key("acme", 1);
        store.create_key_metadata(&k).await.unwrap();

        let skip = store
            .update_key_status(&k.key_id, KeyStatus::Active, KeyStatus::Retired, Some(5))
            .await;
        assert!(matches!(skip, Err(StoreError::Conflict(_))));
        let unchanged = store.get_key_metadata(&k.key_id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, KeyStatus::Active);
        assert_eq!(unchanged.retired_at_ms, None);

        store
            .update_key_status(&k.key_id, KeyStatus::Active, KeyStatus::Rotating, None)
            .await
            .unwrap();
        store
            .update_key_status(&k.key_id, KeyStatus::Rotating, KeyStatus::Retired, Some(5))
            .await
            .unwrap();
        let revive = store
            .update_key_status(&k.key_id, KeyStatus::Retired, KeyStatus::Active, None)
            .await;
        assert!(matches!(revive, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn undecodable_row_is_corrupt() {
        let store = test_store().await;
        sqlx::query(
            "INSERT INTO encryption_keys (key_id, tenant_id, purpose, version, status, algorithm, created_at_ms)
             VALUES ('bad', 'acme', 'billing', 1, 'active', 'xchacha20-poly1305', 0)",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let result = store.get_key_metadata("bad").await;
        assert!(matches!(result, Err(StoreError::Corrupt(_))));
    }

    #[tokio::test]
    async fn wrapped_material_round_trip() {
        let store = test_store().await;
        store.store_wrapped_material("k1", "blob").await.unwrap();
        assert_eq!(
            store.get_wrapped_material("k1").await.unwrap().as_deref(),
            Some("blob")
        );
        assert!(matches!(
            store.store_wrapped_material("k1", "again").await,
            Err(StoreError::Conflict(_))
        ));
        assert!(store.get_wrapped_material("k2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_backed_store_runs_migrations() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("keys.db").display());
        let store = SqliteKeyStore::new(&url).await.unwrap();
        store.create_key_metadata(&key("acme", 1)).await.unwrap();
        assert_eq!(
            store
                .list_keys("acme", KeyPurpose::Credentials)
                .await
                .unwrap()
                .len(),
            1
        );
    }
}
