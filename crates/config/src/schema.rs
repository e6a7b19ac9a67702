//! Config schema types (master key, store, cache, audit, pii, metrics).
use std::{collections::HashMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

pub const DEFAULT_MASTER_KEY_VAR: &str = "KEYWARD_MASTER_KEY";
pub const DEFAULT_PASSPHRASE_VAR: &str = "KEYWARD_MASTER_PASSPHRASE";
pub const DEFAULT_HASH_SALT_VAR: &str = "KEYWARD_HASH_SALT";
pub const DEFAULT_DATABASE_URL: &str = "sqlite:keyward.db?mode=rwc";

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeywardConfig {
    pub master_key: MasterKeyConfig,
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub audit: AuditConfig,
    pub pii: PiiConfig,
    pub metrics: MetricsConfig,
}

/// Where the master key comes from.
///
/// ```toml
/// [master_key]
/// source = "file"
/// path = "/run/secrets/keyward-master-key"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum MasterKeyConfig {
    /// Base64 key in an environment variable.
    Env {
        #[serde(default = "default_master_key_var")]
        var: String,
    },
    /// Base64 key in a file, e.g. a mounted secret.
    File { path: PathBuf },
    /// Argon2id over a passphrase in an environment variable. `salt` is
    /// base64 and must never change once data is encrypted.
    Passphrase {
        #[serde(default = "default_passphrase_var")]
        var: String,
        salt: String,
    },
}

impl Default for MasterKeyConfig {
    fn default() -> Self {
        Self::Env {
            var: default_master_key_var(),
        }
    }
}

fn default_master_key_var() -> String {
    DEFAULT_MASTER_KEY_VAR.into()
}

fn default_passphrase_var() -> String {
    DEFAULT_PASSPHRASE_VAR.into()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// sqlx SQLite URL for key metadata, wrapped material and the audit log.
    pub database_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Seconds an unwrapped key stays cached. `0` keeps keys until restart.
    pub ttl_secs: u64,
}

impl CacheConfig {
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSinkKind {
    /// Structured `tracing` events on target `keyward::audit`.
    #[default]
    Tracing,
    /// Append-only `key_audit_log` table in the store database.
    Sqlite,
    /// Discard events.
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub sink: AuditSinkKind,
    /// Bound of the queue in front of the SQLite writer.
    pub queue_capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            sink: AuditSinkKind::default(),
            queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PiiConfig {
    /// Environment variable holding the identifier hashing salt.
    pub hash_salt_var: String,
}

impl Default for PiiConfig {
    fn default() -> Self {
        Self {
            hash_salt_var: DEFAULT_HASH_SALT_VAR.into(),
        }
    }
}

/// Metrics and observability configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Whether to dump the Prometheus exposition to stderr when a command ends.
    #[serde(default)]
    pub prometheus: bool,
    /// Additional labels to add to all metrics.
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prometheus: false,
            labels: HashMap::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        let cfg: KeywardConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, KeywardConfig::default());
        assert_eq!(cfg.master_key, MasterKeyConfig::Env {
            var: "KEYWARD_MASTER_KEY".into()
        });
        assert_eq!(cfg.store.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(cfg.audit.sink, AuditSinkKind::Tracing);
        assert!(cfg.metrics.enabled);
    }

    #[test]
    fn master_key_sources_parse() {
        let cfg: KeywardConfig = toml::from_str(
            r#"
            [master_key]
            source = "passphrase"
            salt = "c2FsdHNhbHRzYWx0c2FsdA=="
            "#,
        )
        .unwrap();
        assert_eq!(cfg.master_key, MasterKeyConfig::Passphrase {
            var: DEFAULT_PASSPHRASE_VAR.into(),
            salt: "c2FsdHNhbHRzYWx0c2FsdA==".into(),
        });

        let cfg: KeywardConfig = toml::from_str(
            r#"
            [master_key]
            source = "file"
            path = "/run/secrets/mk"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.master_key, MasterKeyConfig::File {
            path: "/run/secrets/mk".into()
        });
    }

    #[test]
    fn unknown_master_key_source_is_an_error() {
        let result: Result<KeywardConfig, _> = toml::from_str(
            r#"
            [master_key]
            source = "hsm"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn cache_ttl_converts() {
        let cache = CacheConfig { ttl_secs: 90 };
        assert_eq!(cache.ttl(), Duration::from_secs(90));
    }
}
