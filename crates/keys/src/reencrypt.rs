//! Outbound signal asking an external worker to migrate data to a new key.
//!
//! The core never runs the migration itself. The worker re-encrypts data
//! sealed under `old_key_id` and, when done, calls
//! [`KeyService::complete_rotation`](crate::KeyService::complete_rotation).

use {
    serde::{Deserialize, Serialize},
    tokio::sync::mpsc,
    tracing::{debug, warn},
};

use crate::types::KeyPurpose;

/// One pending migration from a superseded key to the new active key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReencryptionTask {
    pub tenant_id: String,
    pub purpose: KeyPurpose,
    pub old_key_id: String,
    pub old_version: u32,
    pub new_key_id: String,
    pub new_version: u32,
}

/// Fire-and-forget sink for re-encryption tasks. Must not block.
pub trait ReencryptionSink: Send + Sync {
    fn emit_reencryption_task(&self, task: ReencryptionTask);
}

/// Drops tasks. The superseded key then stays `rotating` until an operator
/// completes the rotation by hand.
#[derive(Debug, Default)]
pub struct NoopReencryptionSink;

impl ReencryptionSink for NoopReencryptionSink {
    fn emit_reencryption_task(&self, task: ReencryptionTask) {
        debug!(
            tenant_id = %task.tenant_id,
            purpose = %task.purpose,
            old_key_id = %task.old_key_id,
            new_key_id = %task.new_key_id,
            "re-encryption task dropped (no worker configured)"
        );
    }
}

/// Hands tasks to an in-process worker over an unbounded channel.
pub struct ChannelReencryptionSink {
    tx: mpsc::UnboundedSender<ReencryptionTask>,
}

impl ChannelReencryptionSink {
    /// Returns the sink and the receiver the worker drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ReencryptionTask>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ReencryptionSink for ChannelReencryptionSink {
    fn emit_reencryption_task(&self, task: ReencryptionTask) {
        let old_key_id = task.old_key_id.clone();
        if self.tx.send(task).is_err() {
            warn!(%old_key_id, "re-encryption worker is gone, task dropped");
            return;
        }

        #[cfg(feature = "metrics")]
        keyward_metrics::counter!(keyward_metrics::keys::REENCRYPTION_TASKS_TOTAL).increment(1);
    }
}
