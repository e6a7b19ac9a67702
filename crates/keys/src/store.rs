//! Persistence contract for key metadata and wrapped key material.

use async_trait::async_trait;

use crate::types::{EncryptionKey, KeyPurpose, KeyStatus};

/// Errors a [`KeyStore`] reports. The lifecycle manager translates them into
/// [`KeyError`](crate::KeyError).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write (a concurrent writer won),
    /// or a compare-and-set status update saw a different current status.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The addressed row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The backend could not be reached or failed mid-operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored row could not be decoded. Retrying reads the same bytes.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Reject status moves outside `active -> rotating -> retired`.
pub(crate) fn check_transition(
    key_id: &str,
    expected: KeyStatus,
    status: KeyStatus,
) -> StoreResult<()> {
    if expected.can_transition_to(status) {
        return Ok(());
    }
    Err(StoreError::Conflict(format!(
        "key {key_id} cannot move from {expected} to {status}"
    )))
}

/// Narrow persistence backend for the lifecycle manager.
///
/// Implementations must guarantee:
/// - `(tenant_id, purpose, version)` is unique; a duplicate insert fails with
///   [`StoreError::Conflict`] and writes nothing.
/// - [`get_active_key_metadata`](Self::get_active_key_metadata) returns the
///   highest-version `active` row. Rotation inserts the new version before
///   demoting the old one, so this rule is what makes the flip atomic.
/// - [`update_key_status`](Self::update_key_status) is a compare-and-set on
///   the current status, and refuses moves that
///   [`KeyStatus::can_transition_to`] forbids with [`StoreError::Conflict`].
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn create_key_metadata(&self, key: &EncryptionKey) -> StoreResult<()>;

    async fn update_key_status(
        &self,
        key_id: &str,
        expected: KeyStatus,
        status: KeyStatus,
        retired_at_ms: Option<u64>,
    ) -> StoreResult<()>;

    async fn get_active_key_metadata(
        &self,
        tenant_id: &str,
        purpose: KeyPurpose,
    ) -> StoreResult<Option<EncryptionKey>>;

    async fn get_key_metadata_by_version(
        &self,
        tenant_id: &str,
        purpose: KeyPurpose,
        version: u32,
    ) -> StoreResult<Option<EncryptionKey>>;

    async fn get_key_metadata(&self, key_id: &str) -> StoreResult<Option<EncryptionKey>>;

    /// All versions for a pair, oldest first.
    async fn list_keys(&self, tenant_id: &str, purpose: KeyPurpose)
    -> StoreResult<Vec<EncryptionKey>>;

    /// Insert wrapped material. A second write for the same key id conflicts.
    async fn store_wrapped_material(&self, key_id: &str, wrapped: &str) -> StoreResult<()>;

    async fn get_wrapped_material(&self, key_id: &str) -> StoreResult<Option<String>>;
}
