//! Semantic checks on a parsed configuration.
//!
//! Parsing already rejects unknown enum values and wrong types; these checks
//! catch combinations that parse but cannot work at runtime.

use std::fmt;

use crate::schema::{AuditSinkKind, KeywardConfig, MasterKeyConfig};

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Dotted path, e.g. "audit.queue_capacity"
    pub path: String,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}: {}", self.severity, self.path, self.message)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    fn push(&mut self, severity: Severity, path: &str, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            severity,
            path: path.to_string(),
            message: message.into(),
        });
    }
}

pub fn validate(config: &KeywardConfig) -> ValidationResult {
    let mut result = ValidationResult::default();

    match &config.master_key {
        MasterKeyConfig::Env { var } if var.trim().is_empty() => {
            result.push(Severity::Error, "master_key.var", "variable name is empty");
        },
        MasterKeyConfig::File { path } if path.is_relative() => {
            result.push(
                Severity::Warning,
                "master_key.path",
                format!(
                    "{} is relative to the working directory",
                    path.display()
                ),
            );
        },
        MasterKeyConfig::Passphrase { var, salt } => {
            if var.trim().is_empty() {
                result.push(Severity::Error, "master_key.var", "variable name is empty");
            }
            if salt.trim().is_empty() {
                result.push(
                    Severity::Error,
                    "master_key.salt",
                    "a passphrase master key needs a fixed salt",
                );
            }
        },
        _ => {},
    }

    if !config.store.database_url.starts_with("sqlite:") {
        result.push(
            Severity::Error,
            "store.database_url",
            "only sqlite: URLs are supported",
        );
    }

    if config.audit.sink == AuditSinkKind::Sqlite && config.audit.queue_capacity == 0 {
        result.push(
            Severity::Error,
            "audit.queue_capacity",
            "the sqlite audit queue needs a capacity of at least 1",
        );
    }
    if config.audit.sink == AuditSinkKind::None {
        result.push(
            Severity::Warning,
            "audit.sink",
            "audit trail is disabled; cryptographic operations will not be recorded",
        );
    }

    if config.pii.hash_salt_var.trim().is_empty() {
        result.push(Severity::Error, "pii.hash_salt_var", "variable name is empty");
    }

    if config.metrics.prometheus && !config.metrics.enabled {
        result.push(
            Severity::Warning,
            "metrics.prometheus",
            "has no effect while metrics.enabled is false",
        );
    }

    result
}
