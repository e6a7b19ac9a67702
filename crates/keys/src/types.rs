//! Core data types: key metadata, purposes, statuses and encrypted payloads.

use std::{
    fmt,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::error::KeyError;

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Reject tenant ids that cannot be used as an isolation boundary.
pub(crate) fn validate_tenant_id(tenant_id: &str) -> Result<(), KeyError> {
    if tenant_id.trim().is_empty() {
        return Err(KeyError::Parameter("tenant id must not be empty".into()));
    }
    if tenant_id.contains('|') {
        return Err(KeyError::Parameter(
            "tenant id must not contain '|'".into(),
        ));
    }
    Ok(())
}

/// Logical category partitioning keys. Each purpose has its own key chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyPurpose {
    Pii,
    Credentials,
    Tokens,
    General,
}

impl KeyPurpose {
    pub const ALL: [KeyPurpose; 4] = [Self::Pii, Self::Credentials, Self::Tokens, Self::General];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pii => "pii",
            Self::Credentials => "credentials",
            Self::Tokens => "tokens",
            Self::General => "general",
        }
    }
}

impl fmt::Display for KeyPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown purposes are rejected rather than mapped to `general`.
impl FromStr for KeyPurpose {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pii" => Ok(Self::Pii),
            "credentials" => Ok(Self::Credentials),
            "tokens" => Ok(Self::Tokens),
            "general" => Ok(Self::General),
            other => Err(KeyError::Parameter(format!("unknown key purpose: {other}"))),
        }
    }
}

/// Lifecycle state of one key version.
///
/// Transitions only move forward: `active → rotating → retired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    /// Used for new encryptions and for decryption.
    Active,
    /// Superseded; decrypt-only while the re-encryption worker migrates data.
    Rotating,
    /// Migration finished. Kept so historical payloads stay decryptable.
    Retired,
}

impl KeyStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Rotating => "rotating",
            Self::Retired => "retired",
        }
    }

    #[must_use]
    pub fn can_transition_to(&self, next: KeyStatus) -> bool {
        matches!(
            (self, next),
            (Self::Active, Self::Rotating) | (Self::Rotating, Self::Retired)
        )
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyStatus {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "rotating" => Ok(Self::Rotating),
            "retired" => Ok(Self::Retired),
            other => Err(KeyError::Parameter(format!("unknown key status: {other}"))),
        }
    }
}

/// Metadata for one DEK version. The key material itself is stored
/// separately, wrapped under the master key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionKey {
    pub key_id: String,
    pub tenant_id: String,
    pub purpose: KeyPurpose,
    pub version: u32,
    pub status: KeyStatus,
    pub created_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retired_at_ms: Option<u64>,
    pub algorithm: String,
}

impl EncryptionKey {
    /// A fresh `active` record with a random key id.
    pub fn new(tenant_id: &str, purpose: KeyPurpose, version: u32, algorithm: &str) -> Self {
        Self {
            key_id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            purpose,
            version,
            status: KeyStatus::Active,
            created_at_ms: now_ms(),
            retired_at_ms: None,
            algorithm: algorithm.to_string(),
        }
    }
}

/// Caller-supplied context for [`KeyService::encrypt`](crate::KeyService::encrypt).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionContext {
    pub tenant_id: String,
    pub purpose: KeyPurpose,
    pub field_name: Option<String>,
}

impl EncryptionContext {
    pub fn new(tenant_id: impl Into<String>, purpose: KeyPurpose) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            purpose,
            field_name: None,
        }
    }

    #[must_use]
    pub fn with_field(mut self, field_name: impl Into<String>) -> Self {
        self.field_name = Some(field_name.into());
        self
    }
}

/// Non-secret context recorded next to the ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadMetadata {
    pub purpose: KeyPurpose,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_name: Option<String>,
    pub timestamp_ms: u64,
}

/// Result of an encryption. Binary fields are standard base64.
///
/// Only the exact `(tenant, purpose, key_version)` the payload was sealed
/// under can open it; all identifying fields are bound into the AEAD
/// associated data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedPayload {
    pub ciphertext: String,
    pub key_id: String,
    pub key_version: u32,
    pub algorithm: String,
    pub iv: String,
    pub auth_tag: String,
    pub metadata: PayloadMetadata,
}
