//! Per-tenant envelope encryption.
//!
//! Every (tenant, purpose) pair owns a versioned chain of random DEKs (Data
//! Encryption Keys). DEKs are wrapped under a process-wide master key and
//! persisted through a [`KeyStore`]; decrypted DEKs live only in the
//! [`KeyCache`]. [`KeyService`] is the entry point the rest of a system uses:
//! it encrypts fields into [`EncryptedPayload`]s, decrypts them by the exact key
//! version they were sealed under, and records every operation through the
//! [`AuditLogger`].
//!
//! The [`pii`] module holds the non-reversible helpers (salted identifier
//! hashing and display masking) that sit next to encryption but never use it.

pub mod audit;
pub mod cache;
pub mod error;
pub mod key_wrap;
pub mod manager;
pub mod master_key;
pub mod pii;
pub mod reencrypt;
pub mod service;
pub mod store;
pub mod store_memory;
pub mod store_sqlite;
pub mod traits;
pub mod types;
pub mod xchacha20;

pub use {
    audit::{
        AuditError, AuditEvent, AuditLogger, AuditOperation, AuditOutcome, AuditSink,
        MemoryAuditSink, NoopAuditSink, SqliteAuditSink, TracingAuditSink,
    },
    cache::{CachedKey, KeyCache, KeySlot},
    error::{KeyError, Result},
    manager::KeyManager,
    master_key::{
        EnvMasterKey, FileMasterKey, MasterKeySource, PassphraseCost, PassphraseMasterKey,
        StaticMasterKey,
    },
    pii::{MaskType, hash_identifier, mask_for_display},
    reencrypt::{ChannelReencryptionSink, NoopReencryptionSink, ReencryptionSink, ReencryptionTask},
    service::KeyService,
    store::{KeyStore, StoreError},
    store_memory::MemoryKeyStore,
    store_sqlite::SqliteKeyStore,
    traits::{Cipher, SealedData},
    types::{
        EncryptedPayload, EncryptionContext, EncryptionKey, KeyPurpose, KeyStatus,
        PayloadMetadata,
    },
    xchacha20::XChaCha20Poly1305Cipher,
};

/// Run database migrations for the keys crate.
///
/// Creates the `encryption_keys`, `wrapped_key_material` and `key_audit_log`
/// tables. Call once at startup before building a [`SqliteKeyStore`] or a
/// [`SqliteAuditSink`] on a shared pool.
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .set_ignore_missing(true)
        .run(pool)
        .await?;
    Ok(())
}
