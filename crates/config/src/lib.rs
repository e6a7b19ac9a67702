//! Configuration loading, env substitution and validation for keyward.
//!
//! Config files: `keyward.toml`, `keyward.yaml`, `keyward.yml` or `keyward.json`.
//! Searched in `./` then the user config directory (`~/.config/keyward/`).
//!
//! Supports `${ENV_VAR}` and `${ENV_VAR:-default}` substitution in the raw
//! text before parsing. Secrets themselves never live in the file: the config
//! only names the environment variables or files that hold them.

pub mod env_subst;
pub mod error;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    error::ConfigError,
    loader::{config_dir, discover_and_load, find_config_file, load_config},
    schema::{
        AuditConfig, AuditSinkKind, CacheConfig, KeywardConfig, MasterKeyConfig, MetricsConfig,
        PiiConfig, StoreConfig,
    },
    validate::{Diagnostic, Severity, ValidationResult, validate},
};
