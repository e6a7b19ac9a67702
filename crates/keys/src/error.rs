//! Error taxonomy for cryptographic and lifecycle operations.
//!
//! Messages carry identifiers (tenant, purpose, key id, version) only. They
//! never include plaintext or key bytes.

use crate::store::StoreError;

/// Errors produced by the key-management core.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// The master key is missing or malformed. Crypto operations must be refused.
    #[error("fatal configuration error: {0}")]
    FatalConfiguration(String),

    /// The key store failed in a way the caller may retry.
    #[error("key store unavailable: {0}")]
    TransientStore(String),

    /// Authentication tag verification failed (tampering or wrong key).
    /// Retrying with identical inputs cannot succeed.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// The requested key or key version does not exist for this tenant.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// A concurrent lifecycle change won the race; re-read and retry.
    #[error("lifecycle conflict: {0}")]
    Conflict(String),

    /// Malformed input: wrong key/IV/tag length, unknown purpose, empty tenant.
    #[error("invalid parameter: {0}")]
    Parameter(String),
}

impl KeyError {
    /// Stable label used in audit events and metric labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FatalConfiguration(_) => "fatal_configuration",
            Self::TransientStore(_) => "transient_store",
            Self::Integrity(_) => "integrity",
            Self::KeyNotFound(_) => "key_not_found",
            Self::Conflict(_) => "conflict",
            Self::Parameter(_) => "parameter",
        }
    }

    /// Whether the caller may retry the same call after re-reading state.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientStore(_) | Self::Conflict(_))
    }
}

impl From<StoreError> for KeyError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => Self::Conflict(msg),
            StoreError::NotFound(msg) => Self::KeyNotFound(msg),
            StoreError::Unavailable(msg) => Self::TransientStore(msg),
            StoreError::Corrupt(msg) => Self::Integrity(msg),
            StoreError::Database(
                e @ (sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. }),
            ) => Self::Integrity(e.to_string()),
            StoreError::Database(e) => Self::TransientStore(e.to_string()),
        }
    }
}

pub type Result<T, E = KeyError> = std::result::Result<T, E>;
