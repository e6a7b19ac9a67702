//! Metrics for the keyward key-management core.
//!
//! Library crates record through the `metrics` facade macros re-exported here,
//! using the names in [`crypto`], [`keys`], [`cache`] and [`audit`]. Nothing
//! is exported until a binary calls [`init_metrics`]; with the `prometheus`
//! feature the returned [`MetricsHandle`] renders the text exposition format.
//!
//! ```rust,ignore
//! use keyward_metrics::{counter, crypto, labels};
//!
//! counter!(crypto::OPERATIONS_TOTAL, labels::OPERATION => "encrypt").increment(1);
//! ```
//!
//! Labels never carry tenant ids: tenants are unbounded and would explode
//! series cardinality. Purposes and operations are closed sets and are safe.

mod definitions;
mod recorder;

pub use {
    definitions::*,
    recorder::{MetricsHandle, MetricsRecorderConfig, init_metrics},
};

// Re-export metrics macros for convenience
pub use metrics::{counter, gauge, histogram};
