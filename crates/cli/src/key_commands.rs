use std::{
    io::{Read, Write},
    sync::Arc,
};

use {
    keyward_config::{AuditSinkKind, KeywardConfig, MasterKeyConfig},
    keyward_keys::{
        AuditLogger, AuditSink, ChannelReencryptionSink, EncryptedPayload, EncryptionContext,
        EnvMasterKey, FileMasterKey, KeyCache, KeyManager, KeyPurpose, KeyService,
        MasterKeySource, NoopAuditSink, PassphraseMasterKey, ReencryptionTask, SqliteAuditSink,
        SqliteKeyStore, TracingAuditSink,
    },
    tokio::{sync::mpsc, task::JoinHandle},
    tracing::debug,
};

pub(crate) fn master_key_source(config: &MasterKeyConfig) -> anyhow::Result<Box<dyn MasterKeySource>> {
    Ok(match config {
        MasterKeyConfig::Env { var } => Box::new(EnvMasterKey::new(var)),
        MasterKeyConfig::File { path } => Box::new(FileMasterKey::new(path)),
        MasterKeyConfig::Passphrase { var, salt } => Box::new(PassphraseMasterKey::new(var, salt)?),
    })
}

/// A wired-up service for one command invocation.
struct Runtime {
    service: KeyService,
    tasks: mpsc::UnboundedReceiver<ReencryptionTask>,
    audit_writer: Option<JoinHandle<()>>,
}

impl Runtime {
    async fn open(config: &KeywardConfig) -> anyhow::Result<Self> {
        let store = SqliteKeyStore::new(&config.store.database_url).await?;

        let mut audit_writer = None;
        let audit_sink: Arc<dyn AuditSink> = match config.audit.sink {
            AuditSinkKind::Tracing => Arc::new(TracingAuditSink),
            AuditSinkKind::None => Arc::new(NoopAuditSink),
            AuditSinkKind::Sqlite => {
                let (sink, writer) =
                    SqliteAuditSink::spawn(store.pool().clone(), config.audit.queue_capacity);
                audit_writer = Some(writer);
                Arc::new(sink)
            },
        };

        let (reencryption, tasks) = ChannelReencryptionSink::new();
        let source = master_key_source(&config.master_key)?;
        let manager = KeyManager::new(Arc::new(store), &*source)?
            .with_cache(Arc::new(KeyCache::with_ttl(config.cache.ttl())))
            .with_audit(AuditLogger::new(audit_sink))
            .with_reencryption_sink(Arc::new(reencryption));

        Ok(Self {
            service: KeyService::new(Arc::new(manager)),
            tasks,
            audit_writer,
        })
    }

    /// Drop the service and wait for queued audit events to reach the database.
    async fn finish(self) -> anyhow::Result<Vec<ReencryptionTask>> {
        let Self {
            service,
            mut tasks,
            audit_writer,
        } = self;
        drop(service);

        let mut pending = Vec::new();
        while let Some(task) = tasks.recv().await {
            pending.push(task);
        }
        if let Some(writer) = audit_writer {
            writer.await?;
            debug!("audit writer drained");
        }
        Ok(pending)
    }
}

fn read_stdin() -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    std::io::stdin().read_to_end(&mut buf)?;
    Ok(buf)
}

pub async fn encrypt(
    config: &KeywardConfig,
    tenant: &str,
    purpose: KeyPurpose,
    field: Option<String>,
) -> anyhow::Result<()> {
    let plaintext = read_stdin()?;
    let mut ctx = EncryptionContext::new(tenant, purpose);
    if let Some(field) = field {
        ctx = ctx.with_field(field);
    }

    let rt = Runtime::open(config).await?;
    let result = rt.service.encrypt(&plaintext, &ctx).await;
    rt.finish().await?;

    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}

pub async fn decrypt(config: &KeywardConfig, tenant: &str) -> anyhow::Result<()> {
    let payload: EncryptedPayload = serde_json::from_slice(&read_stdin()?)?;

    let rt = Runtime::open(config).await?;
    let result = rt.service.decrypt(&payload, tenant).await;
    rt.finish().await?;

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&result?)?;
    stdout.flush()?;
    Ok(())
}

pub async fn rotate(config: &KeywardConfig, tenant: &str, purpose: KeyPurpose) -> anyhow::Result<()> {
    let rt = Runtime::open(config).await?;
    let result = rt.service.rotate(tenant, purpose).await;
    let tasks = rt.finish().await?;

    let version = result?;
    eprintln!("{tenant}/{purpose} is now at version {version}");
    for task in tasks {
        println!("{}", serde_json::to_string(&task)?);
    }
    Ok(())
}

pub async fn complete_rotation(
    config: &KeywardConfig,
    tenant: &str,
    purpose: KeyPurpose,
    key_id: &str,
) -> anyhow::Result<()> {
    let rt = Runtime::open(config).await?;
    let result = rt.service.complete_rotation(tenant, purpose, key_id).await;
    rt.finish().await?;

    result?;
    eprintln!("key {key_id} retired");
    Ok(())
}

pub async fn list_keys(
    config: &KeywardConfig,
    tenant: &str,
    purpose: Option<KeyPurpose>,
) -> anyhow::Result<()> {
    let purposes = match purpose {
        Some(p) => vec![p],
        None => KeyPurpose::ALL.to_vec(),
    };

    let rt = Runtime::open(config).await?;
    let mut keys = Vec::new();
    for purpose in purposes {
        keys.extend(rt.service.manager().list_keys(tenant, purpose).await?);
    }
    rt.finish().await?;

    if keys.is_empty() {
        eprintln!("no keys for tenant {tenant}");
    }
    for key in &keys {
        println!(
            "{:<12} v{:<4} {:<9} {}",
            key.purpose, key.version, key.status, key.key_id
        );
    }
    Ok(())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, keyward_keys::KeyError};

    #[test]
    fn env_source_reports_missing_variable() {
        let source = master_key_source(&MasterKeyConfig::Env {
            var: "KEYWARD_CLI_TEST_UNSET_4B7C".into(),
        })
        .unwrap();
        assert!(matches!(
            source.master_key(),
            Err(KeyError::FatalConfiguration(_))
        ));
    }

    #[test]
    fn passphrase_source_needs_valid_salt() {
        let result = master_key_source(&MasterKeyConfig::Passphrase {
            var: "PW".into(),
            salt: "not base64!".into(),
        });
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn runtime_round_trip_with_file_key_and_sqlite_audit() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("master.key");
        std::fs::write(
            &key_path,
            keyward_keys::master_key::generate_master_key().as_str(),
        )
        .unwrap();

        let mut config = KeywardConfig::default();
        config.master_key = MasterKeyConfig::File { path: key_path };
        config.store.database_url =
            format!("sqlite:{}?mode=rwc", dir.path().join("keys.db").display());
        config.audit.sink = AuditSinkKind::Sqlite;

        let rt = Runtime::open(&config).await.unwrap();
        let ctx = EncryptionContext::new("acme", KeyPurpose::Pii);
        let payload = rt.service.encrypt(b"hello", &ctx).await.unwrap();
        rt.service.rotate("acme", KeyPurpose::Pii).await.unwrap();
        let tasks = rt.finish().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].old_key_id, payload.key_id);

        let rt = Runtime::open(&config).await.unwrap();
        assert_eq!(rt.service.decrypt(&payload, "acme").await.unwrap(), b"hello");
        rt.finish().await.unwrap();
    }
}
