//! Append-only audit trail of cryptographic operations.
//!
//! [`AuditLogger::log`] never fails: a sink error is reported on the side
//! channel (an `error!` event plus the audit failure counter) and the
//! cryptographic result that triggered the event is returned untouched.

use std::sync::{Arc, Mutex};

use {
    serde::{Deserialize, Serialize},
    sqlx::SqlitePool,
    tokio::{sync::mpsc, task::JoinHandle},
    tracing::{error, info},
};

use crate::{error::KeyError, types::now_ms};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Encrypt,
    Decrypt,
    Rotate,
    CreateKey,
    RetireKey,
}

impl AuditOperation {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Encrypt => "encrypt",
            Self::Decrypt => "decrypt",
            Self::Rotate => "rotate",
            Self::CreateKey => "create_key",
            Self::RetireKey => "retire_key",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
}

impl AuditOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// One audit record. Identifiers only; never plaintext or key bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub tenant_id: String,
    pub operation: AuditOperation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    pub outcome: AuditOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    pub timestamp_ms: u64,
}

impl AuditEvent {
    pub fn success(
        tenant_id: &str,
        operation: AuditOperation,
        key_id: &str,
        version: u32,
    ) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            operation,
            key_id: Some(key_id.to_string()),
            version: Some(version),
            outcome: AuditOutcome::Success,
            error_kind: None,
            timestamp_ms: now_ms(),
        }
    }

    pub fn failure(
        tenant_id: &str,
        operation: AuditOperation,
        key_id: Option<&str>,
        version: Option<u32>,
        err: &KeyError,
    ) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            operation,
            key_id: key_id.map(str::to_string),
            version,
            outcome: AuditOutcome::Failure,
            error_kind: Some(err.kind().to_string()),
            timestamp_ms: now_ms(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit queue is full")]
    QueueFull,

    #[error("audit sink is closed")]
    Closed,

    #[error("audit sink failure: {0}")]
    Sink(String),
}

/// Destination for audit events. `record` must not block on I/O.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError>;
}

/// Front door for audit writes. Cheap to clone.
#[derive(Clone)]
pub struct AuditLogger {
    sink: Arc<dyn AuditSink>,
}

impl AuditLogger {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    /// Record `event`. Failures go to the side channel, never to the caller.
    pub fn log(&self, event: AuditEvent) {
        let operation = event.operation;
        let tenant_id = event.tenant_id.clone();

        match self.sink.record(event) {
            Ok(()) => {
                #[cfg(feature = "metrics")]
                keyward_metrics::counter!(
                    keyward_metrics::audit::EVENTS_TOTAL,
                    keyward_metrics::labels::OPERATION => operation.as_str()
                )
                .increment(1);
            },
            Err(e) => {
                error!(
                    %tenant_id,
                    operation = operation.as_str(),
                    error = %e,
                    "failed to record audit event"
                );

                #[cfg(feature = "metrics")]
                keyward_metrics::counter!(
                    keyward_metrics::audit::WRITE_FAILURES_TOTAL,
                    keyward_metrics::labels::OPERATION => operation.as_str()
                )
                .increment(1);
            },
        }
    }
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new(Arc::new(TracingAuditSink))
    }
}

/// Emits each event as a structured `tracing` event on target `keyward::audit`.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        info!(
            target: "keyward::audit",
            tenant_id = %event.tenant_id,
            operation = event.operation.as_str(),
            key_id = event.key_id.as_deref().unwrap_or(""),
            version = event.version.unwrap_or(0),
            outcome = event.outcome.as_str(),
            error_kind = event.error_kind.as_deref().unwrap_or(""),
            timestamp_ms = event.timestamp_ms,
            "audit"
        );
        Ok(())
    }
}

/// Discards every event. For deployments that audit elsewhere.
#[derive(Debug, Default)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn record(&self, _event: AuditEvent) -> Result<(), AuditError> {
        Ok(())
    }
}

/// Keeps events in memory, oldest first.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
        Ok(())
    }
}

/// Persists events to the append-only `key_audit_log` table.
///
/// `record` only enqueues; a background task owns the database writes, so a
/// slow database never stalls an encrypt or decrypt call. Dropping every clone
/// of the sink closes the queue and lets the writer drain and exit.
pub struct SqliteAuditSink {
    tx: mpsc::Sender<AuditEvent>,
}

impl SqliteAuditSink {
    /// Spawn the writer task on the current tokio runtime.
    ///
    /// Run [`crate::run_migrations`] on `pool` first.
    pub fn spawn(pool: SqlitePool, queue_capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<AuditEvent>(queue_capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = insert_event(&pool, &event).await {
                    error!(
                        tenant_id = %event.tenant_id,
                        operation = event.operation.as_str(),
                        error = %e,
                        "failed to persist audit event"
                    );

                    #[cfg(feature = "metrics")]
                    keyward_metrics::counter!(
                        keyward_metrics::audit::WRITE_FAILURES_TOTAL,
                        keyward_metrics::labels::OPERATION => event.operation.as_str()
                    )
                    .increment(1);
                }
            }
        });
        (Self { tx }, handle)
    }
}

impl AuditSink for SqliteAuditSink {
    fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => AuditError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => AuditError::Closed,
        })
    }
}

async fn insert_event(pool: &SqlitePool, event: &AuditEvent) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO key_audit_log (tenant_id, operation, key_id, version, outcome, error_kind, timestamp_ms)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&event.tenant_id)
    .bind(event.operation.as_str())
    .bind(&event.key_id)
    .bind(event.version.map(i64::from))
    .bind(event.outcome.as_str())
    .bind(&event.error_kind)
    .bind(event.timestamp_ms as i64)
    .execute(pool)
    .await?;
    Ok(())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, sqlx::sqlite::SqlitePoolOptions};

    struct BrokenSink;

    impl AuditSink for BrokenSink {
        fn record(&self, _event: AuditEvent) -> Result<(), AuditError> {
            Err(AuditError::Sink("disk full".into()))
        }
    }

    #[test]
    fn logger_swallows_sink_failures() {
        let logger = AuditLogger::new(Arc::new(BrokenSink));
        logger.log(AuditEvent::success("acme", AuditOperation::Encrypt, "k1", 1));
    }

    #[test]
    fn memory_sink_keeps_order() {
        let sink = Arc::new(MemoryAuditSink::new());
        let logger = AuditLogger::new(sink.clone());
        logger.log(AuditEvent::success("acme", AuditOperation::CreateKey, "k1", 1));
        logger.log(AuditEvent::failure(
            "acme",
            AuditOperation::Decrypt,
            Some("k1"),
            Some(1),
            &KeyError::Integrity("tag".into()),
        ));

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].operation, AuditOperation::CreateKey);
        assert_eq!(events[1].outcome, AuditOutcome::Failure);
        assert_eq!(events[1].error_kind.as_deref(), Some("integrity"));
    }

    #[test]
    fn event_json_omits_empty_fields() {
        let event = AuditEvent::failure(
            "acme",
            AuditOperation::Encrypt,
            None,
            None,
            &KeyError::TransientStore("down".into()),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["operation"], "encrypt");
        assert_eq!(json["errorKind"], "transient_store");
        assert!(json.get("keyId").is_none());
    }

    #[tokio::test]
    async fn sqlite_sink_persists_and_table_is_append_only() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::run_migrations(&pool).await.unwrap();

        let (sink, writer) = SqliteAuditSink::spawn(pool.clone(), 16);
        sink.record(AuditEvent::success("acme", AuditOperation::Rotate, "k2", 2))
            .unwrap();
        drop(sink);
        writer.await.unwrap();

        let rows: Vec<(String, String, Option<i64>, String)> = sqlx::query_as(
            "SELECT tenant_id, operation, version, outcome FROM key_audit_log",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(rows, vec![(
            "acme".to_string(),
            "rotate".to_string(),
            Some(2),
            "success".to_string()
        )]);

        assert!(sqlx::query("DELETE FROM key_audit_log").execute(&pool).await.is_err());
        assert!(
            sqlx::query("UPDATE key_audit_log SET outcome = 'failure'")
                .execute(&pool)
                .await
                .is_err()
        );
    }

    #[test]
    fn full_or_closed_queue_reports_error() {
        let (tx, rx) = mpsc::channel(1);
        let sink = SqliteAuditSink { tx };
        sink.record(AuditEvent::success("acme", AuditOperation::Encrypt, "k1", 1))
            .unwrap();
        let result = sink.record(AuditEvent::success("acme", AuditOperation::Encrypt, "k1", 1));
        assert!(matches!(result, Err(AuditError::QueueFull)));

        drop(rx);
        let result = sink.record(AuditEvent::success("acme", AuditOperation::Encrypt, "k1", 1));
        assert!(matches!(result, Err(AuditError::Closed)));
    }
}
