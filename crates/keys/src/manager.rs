//! Key lifecycle: lazy creation, resolution by version, rotation and retirement.
//!
//! [`KeyManager`] is the only component that creates keys or changes their
//! status. Within a process, creation and rotation for one (tenant, purpose)
//! pair are serialized by a per-pair async mutex. Across processes sharing a
//! store, the store's `(tenant, purpose, version)` uniqueness decides the
//! winner and the loser re-reads the head instead of writing a duplicate.

use std::sync::Arc;

use {
    dashmap::DashMap,
    rand::RngCore,
    tokio::sync::Mutex,
    tracing::{debug, error, info, warn},
    zeroize::Zeroizing,
};

use crate::{
    audit::{AuditEvent, AuditLogger, AuditOperation},
    cache::{CachedKey, KeyCache, KeySlot},
    error::{KeyError, Result},
    key_wrap,
    master_key::MasterKeySource,
    reencrypt::{NoopReencryptionSink, ReencryptionSink, ReencryptionTask},
    store::KeyStore,
    traits::Cipher,
    types::{EncryptionKey, KeyPurpose, KeyStatus, now_ms, validate_tenant_id},
    xchacha20::XChaCha20Poly1305Cipher,
};

type PairKey = (String, KeyPurpose);

/// What a `rotate` call did to the pair.
enum Rotation {
    /// A new version was created and the previous head demoted.
    Rotated(CachedKey),
    /// The pair had no keys; version 1 was created (or a racing creator's
    /// version 1 was adopted).
    Created(CachedKey),
    /// A concurrent rotation moved the head past what this call observed.
    AlreadyAdvanced(CachedKey),
}

/// Sole authority over key creation, retrieval and rotation.
///
/// Generic over [`Cipher`] but defaults to [`XChaCha20Poly1305Cipher`]. The
/// master key is read once at construction and held for the life of the
/// manager.
pub struct KeyManager<C: Cipher = XChaCha20Poly1305Cipher> {
    store: Arc<dyn KeyStore>,
    cache: Arc<KeyCache>,
    cipher: C,
    master_key: Zeroizing<[u8; 32]>,
    reencryption: Arc<dyn ReencryptionSink>,
    audit: AuditLogger,
    locks: DashMap<PairKey, Arc<Mutex<()>>>,
}

impl KeyManager<XChaCha20Poly1305Cipher> {
    /// Build a manager with the default XChaCha20-Poly1305 cipher.
    ///
    /// Fails with [`KeyError::FatalConfiguration`] when the master key cannot
    /// be read; no crypto operation is possible without it.
    pub fn new(store: Arc<dyn KeyStore>, master_key: &dyn MasterKeySource) -> Result<Self> {
        Self::with_cipher(store, master_key, XChaCha20Poly1305Cipher)
    }
}

impl<C: Cipher> KeyManager<C> {
    pub fn with_cipher(
        store: Arc<dyn KeyStore>,
        master_key: &dyn MasterKeySource,
        cipher: C,
    ) -> Result<Self> {
        let master_key = master_key.master_key().map_err(|e| match e {
            KeyError::FatalConfiguration(msg) => KeyError::FatalConfiguration(msg),
            other => KeyError::FatalConfiguration(other.to_string()),
        })?;

        Ok(Self {
            store,
            cache: Arc::new(KeyCache::new()),
            cipher,
            master_key,
            reencryption: Arc::new(NoopReencryptionSink),
            audit: AuditLogger::default(),
            locks: DashMap::new(),
        })
    }

    #[must_use]
    pub fn with_cache(mut self, cache: Arc<KeyCache>) -> Self {
        self.cache = cache;
        self
    }

    #[must_use]
    pub fn with_reencryption_sink(mut self, sink: Arc<dyn ReencryptionSink>) -> Self {
        self.reencryption = sink;
        self
    }

    #[must_use]
    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        self.audit = audit;
        self
    }

    pub fn cipher(&self) -> &C {
        &self.cipher
    }

    pub fn cache(&self) -> &Arc<KeyCache> {
        &self.cache
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    fn pair_lock(&self, tenant_id: &str, purpose: KeyPurpose) -> Arc<Mutex<()>> {
        self.locks
            .entry((tenant_id.to_string(), purpose))
            .or_default()
            .clone()
    }

    /// The active key for a pair, creating version 1 on first use.
    ///
    /// A cached active key is served only while the store still names it as
    /// the head, so a rotation by another process is picked up on the next
    /// call. Only the metadata lookup is repeated; material comes from cache.
    pub async fn get_or_create_active_key(
        &self,
        tenant_id: &str,
        purpose: KeyPurpose,
    ) -> Result<CachedKey> {
        validate_tenant_id(tenant_id)?;

        if let Some(cached) = self.cache.get(tenant_id, purpose, KeySlot::Active) {
            let head = self.store.get_active_key_metadata(tenant_id, purpose).await?;
            if head.as_ref().is_some_and(|h| h.key_id == cached.key_id) {
                return Ok(cached);
            }
            debug!(
                tenant_id,
                %purpose,
                cached_version = cached.version,
                "cached active key superseded in store"
            );
            self.cache.invalidate_active(tenant_id, purpose);
        }
        if let Some(key) = self.fetch_active(tenant_id, purpose).await? {
            return Ok(key);
        }

        let lock = self.pair_lock(tenant_id, purpose);
        let _guard = lock.lock().await;

        // Another caller may have created it while we waited for the lock.
        if let Some(key) = self.fetch_active(tenant_id, purpose).await? {
            return Ok(key);
        }
        self.create_first_key(tenant_id, purpose).await
    }

    /// Resolve an exact version for decryption. Superseded versions resolve
    /// like active ones; retention is indefinite.
    pub async fn get_key_by_version(
        &self,
        tenant_id: &str,
        purpose: KeyPurpose,
        version: u32,
    ) -> Result<CachedKey> {
        validate_tenant_id(tenant_id)?;

        if let Some(key) = self.cache.get(tenant_id, purpose, KeySlot::Version(version)) {
            return Ok(key);
        }

        let meta = self
            .store
            .get_key_metadata_by_version(tenant_id, purpose, version)
            .await?
            .ok_or_else(|| {
                KeyError::KeyNotFound(format!("{tenant_id}/{purpose} has no key version {version}"))
            })?;
        self.resolve(&meta).await
    }

    /// Create the next version as `active`, demote the previous head to
    /// `rotating` and signal the re-encryption worker. Returns the head
    /// version after the call.
    ///
    /// If another rotation advanced the head while this call waited, no new
    /// version is created and the current head is returned. A pair without
    /// keys gets version 1. Only a call that created a successor is audited
    /// as `rotate`; a first version is audited as `create_key`.
    pub async fn rotate(&self, tenant_id: &str, purpose: KeyPurpose) -> Result<u32> {
        validate_tenant_id(tenant_id)?;

        match self.rotate_inner(tenant_id, purpose).await {
            Ok(Rotation::Rotated(head)) => {
                self.audit.log(AuditEvent::success(
                    tenant_id,
                    AuditOperation::Rotate,
                    &head.key_id,
                    head.version,
                ));
                Ok(head.version)
            },
            Ok(Rotation::Created(head) | Rotation::AlreadyAdvanced(head)) => Ok(head.version),
            Err(e) => {
                warn!(tenant_id, %purpose, error = %e, "key rotation failed");
                self.audit.log(AuditEvent::failure(
                    tenant_id,
                    AuditOperation::Rotate,
                    None,
                    None,
                    &e,
                ));
                Err(e)
            },
        }
    }

    /// Retire a superseded key once its data has been migrated.
    ///
    /// Driven by the re-encryption worker's completion signal. Retiring an
    /// already retired key is a no-op; retiring the current active key is a
    /// [`KeyError::Conflict`].
    pub async fn complete_rotation(
        &self,
        tenant_id: &str,
        purpose: KeyPurpose,
        old_key_id: &str,
    ) -> Result<()> {
        validate_tenant_id(tenant_id)?;

        match self.retire_inner(tenant_id, purpose, old_key_id).await {
            Ok(Some(version)) => {
                self.audit.log(AuditEvent::success(
                    tenant_id,
                    AuditOperation::RetireKey,
                    old_key_id,
                    version,
                ));
                Ok(())
            },
            Ok(None) => Ok(()),
            Err(e) => {
                self.audit.log(AuditEvent::failure(
                    tenant_id,
                    AuditOperation::RetireKey,
                    Some(old_key_id),
                    None,
                    &e,
                ));
                Err(e)
            },
        }
    }

    /// Metadata of every version of a pair, oldest first.
    pub async fn list_keys(&self, tenant_id: &str, purpose: KeyPurpose) -> Result<Vec<EncryptionKey>> {
        validate_tenant_id(tenant_id)?;
        Ok(self.store.list_keys(tenant_id, purpose).await?)
    }

    async fn fetch_active(&self, tenant_id: &str, purpose: KeyPurpose) -> Result<Option<CachedKey>> {
        let epoch = self.cache.active_epoch(tenant_id, purpose);
        let Some(meta) = self.store.get_active_key_metadata(tenant_id, purpose).await? else {
            return Ok(None);
        };
        let key = self.resolve(&meta).await?;
        self.cache.put_active(tenant_id, purpose, key.clone(), epoch);
        Ok(Some(key))
    }

    /// Replace the cached active pointer with `meta`, a head read under the
    /// pair lock.
    async fn install_head(
        &self,
        tenant_id: &str,
        purpose: KeyPurpose,
        meta: &EncryptionKey,
    ) -> Result<CachedKey> {
        let key = self.resolve(meta).await?;
        self.cache.invalidate_active(tenant_id, purpose);
        let epoch = self.cache.active_epoch(tenant_id, purpose);
        self.cache.put_active(tenant_id, purpose, key.clone(), epoch);
        Ok(key)
    }

    /// Material for `meta`, from the version cache or unwrapped from the store.
    async fn resolve(&self, meta: &EncryptionKey) -> Result<CachedKey> {
        let slot = KeySlot::Version(meta.version);
        if let Some(key) = self.cache.get(&meta.tenant_id, meta.purpose, slot)
            && key.key_id == meta.key_id
        {
            return Ok(key);
        }
        let key = self.load_key(meta).await?;
        self.cache.put_version(&meta.tenant_id, meta.purpose, key.clone());
        Ok(key)
    }

    async fn load_key(&self, meta: &EncryptionKey) -> Result<CachedKey> {
        let wrapped = self
            .store
            .get_wrapped_material(&meta.key_id)
            .await?
            .ok_or_else(|| {
                KeyError::KeyNotFound(format!("no wrapped material for key {}", meta.key_id))
            })?;
        let dek = key_wrap::unwrap_dek(&self.cipher, &self.master_key, &wrapped, &meta.key_id)?;
        Ok(CachedKey::new(meta.key_id.clone(), meta.version, dek))
    }

    async fn next_version(&self, tenant_id: &str, purpose: KeyPurpose) -> Result<u32> {
        let keys = self.store.list_keys(tenant_id, purpose).await?;
        Ok(keys.iter().map(|k| k.version).max().unwrap_or(0) + 1)
    }

    /// Generate, wrap and persist a new `active` version. Material is written
    /// before metadata so a visible row always has its key.
    async fn create_version(
        &self,
        tenant_id: &str,
        purpose: KeyPurpose,
        version: u32,
    ) -> Result<CachedKey> {
        let meta = EncryptionKey::new(tenant_id, purpose, version, self.cipher.algorithm());

        let mut dek = Zeroizing::new([0u8; 32]);
        rand::rng().fill_bytes(dek.as_mut());

        let wrapped = key_wrap::wrap_dek(&self.cipher, &self.master_key, &dek, &meta.key_id)?;
        self.store
            .store_wrapped_material(&meta.key_id, &wrapped)
            .await?;
        self.store.create_key_metadata(&meta).await?;

        Ok(CachedKey::new(meta.key_id, version, dek))
    }

    /// Caller holds the pair lock.
    async fn create_first_key(&self, tenant_id: &str, purpose: KeyPurpose) -> Result<CachedKey> {
        let epoch = self.cache.active_epoch(tenant_id, purpose);
        let version = self.next_version(tenant_id, purpose).await?;

        match self.create_version(tenant_id, purpose, version).await {
            Ok(key) => {
                info!(tenant_id, %purpose, key_id = %key.key_id, version, "created encryption key");
                self.audit.log(AuditEvent::success(
                    tenant_id,
                    AuditOperation::CreateKey,
                    &key.key_id,
                    version,
                ));

                #[cfg(feature = "metrics")]
                keyward_metrics::counter!(
                    keyward_metrics::keys::CREATED_TOTAL,
                    keyward_metrics::labels::PURPOSE => purpose.as_str()
                )
                .increment(1);

                self.cache.put_active(tenant_id, purpose, key.clone(), epoch);
                Ok(key)
            },
            Err(KeyError::Conflict(msg)) => {
                debug!(tenant_id, %purpose, %msg, "lost key creation race, re-reading winner");
                record_conflict();
                self.fetch_active(tenant_id, purpose).await?.ok_or_else(|| {
                    KeyError::Conflict(format!(
                        "{tenant_id}/{purpose} version {version} exists but no key is active"
                    ))
                })
            },
            Err(e) => {
                self.audit.log(AuditEvent::failure(
                    tenant_id,
                    AuditOperation::CreateKey,
                    None,
                    Some(version),
                    &e,
                ));
                Err(e)
            },
        }
    }

    async fn rotate_inner(&self, tenant_id: &str, purpose: KeyPurpose) -> Result<Rotation> {
        let observed = self
            .store
            .get_active_key_metadata(tenant_id, purpose)
            .await?
            .map(|k| k.key_id);

        let lock = self.pair_lock(tenant_id, purpose);
        let _guard = lock.lock().await;

        let Some(current) = self.store.get_active_key_metadata(tenant_id, purpose).await? else {
            return Ok(Rotation::Created(self.create_first_key(tenant_id, purpose).await?));
        };

        // Also covers an empty pair whose first key appeared while we waited.
        if observed.as_deref() != Some(current.key_id.as_str()) {
            debug!(
                tenant_id,
                %purpose,
                version = current.version,
                "head already advanced by a concurrent rotation"
            );
            let head = self.install_head(tenant_id, purpose, &current).await?;
            return Ok(Rotation::AlreadyAdvanced(head));
        }

        let version = self.next_version(tenant_id, purpose).await?;
        let new_key = match self.create_version(tenant_id, purpose, version).await {
            Ok(key) => key,
            Err(KeyError::Conflict(msg)) => {
                debug!(tenant_id, %purpose, %msg, "lost rotation race, re-reading head");
                record_conflict();
                let head = self
                    .store
                    .get_active_key_metadata(tenant_id, purpose)
                    .await?
                    .ok_or_else(|| {
                        KeyError::Conflict(format!("{tenant_id}/{purpose} has no active key"))
                    })?;
                let head = self.install_head(tenant_id, purpose, &head).await?;
                return Ok(Rotation::AlreadyAdvanced(head));
            },
            Err(e) => return Err(e),
        };

        // The new row already wins active resolution. A failed demotion
        // leaves the old row marked active but never selected again.
        if let Err(e) = self
            .store
            .update_key_status(&current.key_id, KeyStatus::Active, KeyStatus::Rotating, None)
            .await
        {
            error!(
                tenant_id,
                %purpose,
                key_id = %current.key_id,
                error = %e,
                "failed to demote superseded key"
            );
        }

        self.cache.invalidate_active(tenant_id, purpose);
        let epoch = self.cache.active_epoch(tenant_id, purpose);
        self.cache
            .put_active(tenant_id, purpose, new_key.clone(), epoch);
        self.cache.put_version(tenant_id, purpose, new_key.clone());

        self.reencryption.emit_reencryption_task(ReencryptionTask {
            tenant_id: tenant_id.to_string(),
            purpose,
            old_key_id: current.key_id.clone(),
            old_version: current.version,
            new_key_id: new_key.key_id.clone(),
            new_version: version,
        });

        info!(
            tenant_id,
            %purpose,
            old_version = current.version,
            new_version = version,
            "rotated encryption key"
        );

        #[cfg(feature = "metrics")]
        keyward_metrics::counter!(
            keyward_metrics::keys::ROTATIONS_TOTAL,
            keyward_metrics::labels::PURPOSE => purpose.as_str()
        )
        .increment(1);

        Ok(Rotation::Rotated(new_key))
    }

    /// `Ok(None)` when the key was already retired.
    async fn retire_inner(
        &self,
        tenant_id: &str,
        purpose: KeyPurpose,
        old_key_id: &str,
    ) -> Result<Option<u32>> {
        let lock = self.pair_lock(tenant_id, purpose);
        let _guard = lock.lock().await;

        let meta = self
            .store
            .get_key_metadata(old_key_id)
            .await?
            .filter(|k| k.tenant_id == tenant_id && k.purpose == purpose)
            .ok_or_else(|| {
                KeyError::KeyNotFound(format!("key {old_key_id} not found for {tenant_id}/{purpose}"))
            })?;

        match meta.status {
            KeyStatus::Retired => {
                debug!(tenant_id, %purpose, key_id = old_key_id, "key already retired");
                return Ok(None);
            },
            KeyStatus::Active => {
                let head = self.store.get_active_key_metadata(tenant_id, purpose).await?;
                if head.is_some_and(|h| h.key_id == meta.key_id) {
                    return Err(KeyError::Conflict(format!(
                        "key {old_key_id} is the active key for {tenant_id}/{purpose}"
                    )));
                }
                // Superseded but never demoted (a rotation's demotion failed).
                self.store
                    .update_key_status(&meta.key_id, KeyStatus::Active, KeyStatus::Rotating, None)
                    .await?;
            },
            KeyStatus::Rotating => {},
        }

        self.store
            .update_key_status(
                &meta.key_id,
                KeyStatus::Rotating,
                KeyStatus::Retired,
                Some(now_ms()),
            )
            .await?;

        info!(tenant_id, %purpose, key_id = old_key_id, version = meta.version, "retired encryption key");

        #[cfg(feature = "metrics")]
        keyward_metrics::counter!(
            keyward_metrics::keys::RETIRED_TOTAL,
            keyward_metrics::labels::PURPOSE => purpose.as_str()
        )
        .increment(1);

        Ok(Some(meta.version))
    }
}

fn record_conflict() {
    #[cfg(feature = "metrics")]
    keyward_metrics::counter!(keyward_metrics::keys::CONFLICTS_TOTAL).increment(1);
}
