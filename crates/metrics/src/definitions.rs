//! Metric name and label definitions.
//!
//! Every metric emitted by keyward is named here so the exported surface is
//! documented in one place.

/// Encrypt / decrypt operations
pub mod crypto {
    /// Total encrypt and decrypt calls, labelled by operation, purpose and outcome
    pub const OPERATIONS_TOTAL: &str = "keyward_crypto_operations_total";
    /// Failed encrypt and decrypt calls, labelled by error kind
    pub const OPERATION_ERRORS_TOTAL: &str = "keyward_crypto_operation_errors_total";
    /// End-to-end duration of encrypt and decrypt calls in seconds
    pub const OPERATION_DURATION_SECONDS: &str = "keyward_crypto_operation_duration_seconds";
}

/// Key lifecycle
pub mod keys {
    /// DEKs created on first use
    pub const CREATED_TOTAL: &str = "keyward_keys_created_total";
    /// Completed rotations
    pub const ROTATIONS_TOTAL: &str = "keyward_key_rotations_total";
    /// Keys moved from rotating to retired
    pub const RETIRED_TOTAL: &str = "keyward_keys_retired_total";
    /// Lifecycle races lost to a concurrent writer
    pub const CONFLICTS_TOTAL: &str = "keyward_key_conflicts_total";
    /// Re-encryption tasks handed to the migration worker
    pub const REENCRYPTION_TASKS_TOTAL: &str = "keyward_reencryption_tasks_total";
}

/// DEK cache
pub mod cache {
    /// Lookups served from memory
    pub const HITS_TOTAL: &str = "keyward_key_cache_hits_total";
    /// Lookups that fell through to the store
    pub const MISSES_TOTAL: &str = "keyward_key_cache_misses_total";
    /// Active-slot invalidations after rotation
    pub const INVALIDATIONS_TOTAL: &str = "keyward_key_cache_invalidations_total";
}

/// Audit trail
pub mod audit {
    /// Events accepted by the audit sink
    pub const EVENTS_TOTAL: &str = "keyward_audit_events_total";
    /// Events the sink failed to record (side channel for audit failures)
    pub const WRITE_FAILURES_TOTAL: &str = "keyward_audit_write_failures_total";
}

/// Common label keys
pub mod labels {
    pub const OPERATION: &str = "operation";
    pub const PURPOSE: &str = "purpose";
    pub const OUTCOME: &str = "outcome";
    pub const ERROR_TYPE: &str = "error_type";
    pub const SLOT: &str = "slot";
}

/// Standard histogram buckets
pub mod buckets {
    use once_cell::sync::Lazy;

    /// Crypto operation duration buckets (in seconds).
    /// Cache hits finish in microseconds; store round-trips take milliseconds.
    pub static CRYPTO_DURATION: Lazy<Vec<f64>> = Lazy::new(|| {
        vec![
            0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.5, 1.0,
        ]
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_share_prefix() {
        for name in [
            crypto::OPERATIONS_TOTAL,
            crypto::OPERATION_ERRORS_TOTAL,
            crypto::OPERATION_DURATION_SECONDS,
            keys::CREATED_TOTAL,
            keys::ROTATIONS_TOTAL,
            keys::RETIRED_TOTAL,
            keys::CONFLICTS_TOTAL,
            keys::REENCRYPTION_TASKS_TOTAL,
            cache::HITS_TOTAL,
            cache::MISSES_TOTAL,
            cache::INVALIDATIONS_TOTAL,
            audit::EVENTS_TOTAL,
            audit::WRITE_FAILURES_TOTAL,
        ] {
            assert!(name.starts_with("keyward_"), "{name}");
        }
    }

    #[test]
    fn duration_buckets_are_sorted() {
        assert!(buckets::CRYPTO_DURATION.windows(2).all(|w| w[0] < w[1]));
    }
}
