//! Field encryption entry point.

use std::{sync::Arc, time::Instant};

use {base64::Engine, tracing::debug};

use crate::{
    audit::{AuditEvent, AuditOperation},
    error::{KeyError, Result},
    manager::KeyManager,
    traits::Cipher,
    types::{
        EncryptedPayload, EncryptionContext, KeyPurpose, PayloadMetadata, now_ms,
        validate_tenant_id,
    },
    xchacha20::XChaCha20Poly1305Cipher,
};

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Associated data for a field payload.
///
/// The field name goes last: every other component is `|`-free (tenant ids
/// reject it) so the encoding stays unambiguous.
fn data_aad(
    tenant_id: &str,
    purpose: KeyPurpose,
    version: u32,
    key_id: &str,
    field_name: Option<&str>,
) -> Vec<u8> {
    format!(
        "{tenant_id}|{purpose}|{version}|{key_id}|{}",
        field_name.unwrap_or("")
    )
    .into_bytes()
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>> {
    B64.decode(value)
        .map_err(|_| KeyError::Integrity(format!("payload {name} is not valid base64")))
}

/// Encrypts and decrypts fields for tenants, auditing every call.
pub struct KeyService<C: Cipher = XChaCha20Poly1305Cipher> {
    manager: Arc<KeyManager<C>>,
}

impl<C: Cipher> Clone for KeyService<C> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
        }
    }
}

impl<C: Cipher> KeyService<C> {
    pub fn new(manager: Arc<KeyManager<C>>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<KeyManager<C>> {
        &self.manager
    }

    /// Seal `plaintext` under the pair's active key.
    pub async fn encrypt(
        &self,
        plaintext: &[u8],
        ctx: &EncryptionContext,
    ) -> Result<EncryptedPayload> {
        let started = Instant::now();
        let result = self.encrypt_inner(plaintext, ctx).await;

        match &result {
            Ok(payload) => self.manager.audit().log(AuditEvent::success(
                &ctx.tenant_id,
                AuditOperation::Encrypt,
                &payload.key_id,
                payload.key_version,
            )),
            Err(e) => self.manager.audit().log(AuditEvent::failure(
                &ctx.tenant_id,
                AuditOperation::Encrypt,
                None,
                None,
                e,
            )),
        }
        record_operation(AuditOperation::Encrypt, ctx.purpose, started, result.as_ref().err());
        result
    }

    /// Open a payload for `tenant_id` using the exact key version it names.
    ///
    /// A payload from another tenant fails with [`KeyError::KeyNotFound`] (no
    /// such version, or a different key id) or [`KeyError::Integrity`].
    pub async fn decrypt(&self, payload: &EncryptedPayload, tenant_id: &str) -> Result<Vec<u8>> {
        let started = Instant::now();
        let result = self.decrypt_inner(payload, tenant_id).await;

        match &result {
            Ok(_) => self.manager.audit().log(AuditEvent::success(
                tenant_id,
                AuditOperation::Decrypt,
                &payload.key_id,
                payload.key_version,
            )),
            Err(e) => self.manager.audit().log(AuditEvent::failure(
                tenant_id,
                AuditOperation::Decrypt,
                Some(&payload.key_id),
                Some(payload.key_version),
                e,
            )),
        }
        record_operation(
            AuditOperation::Decrypt,
            payload.metadata.purpose,
            started,
            result.as_ref().err(),
        );
        result
    }

    pub async fn encrypt_string(
        &self,
        plaintext: &str,
        ctx: &EncryptionContext,
    ) -> Result<EncryptedPayload> {
        self.encrypt(plaintext.as_bytes(), ctx).await
    }

    pub async fn decrypt_string(&self, payload: &EncryptedPayload, tenant_id: &str) -> Result<String> {
        let bytes = self.decrypt(payload, tenant_id).await?;
        String::from_utf8(bytes)
            .map_err(|_| KeyError::Parameter("decrypted payload is not valid UTF-8".into()))
    }

    pub async fn rotate(&self, tenant_id: &str, purpose: KeyPurpose) -> Result<u32> {
        self.manager.rotate(tenant_id, purpose).await
    }

    pub async fn complete_rotation(
        &self,
        tenant_id: &str,
        purpose: KeyPurpose,
        old_key_id: &str,
    ) -> Result<()> {
        self.manager
            .complete_rotation(tenant_id, purpose, old_key_id)
            .await
    }

    async fn encrypt_inner(
        &self,
        plaintext: &[u8],
        ctx: &EncryptionContext,
    ) -> Result<EncryptedPayload> {
        validate_tenant_id(&ctx.tenant_id)?;

        let key = self
            .manager
            .get_or_create_active_key(&ctx.tenant_id, ctx.purpose)
            .await?;
        let aad = data_aad(
            &ctx.tenant_id,
            ctx.purpose,
            key.version,
            &key.key_id,
            ctx.field_name.as_deref(),
        );
        let cipher = self.manager.cipher();
        let sealed = cipher.encrypt(key.bytes(), plaintext, &aad)?;

        Ok(EncryptedPayload {
            ciphertext: B64.encode(&sealed.ciphertext),
            key_id: key.key_id.clone(),
            key_version: key.version,
            algorithm: cipher.algorithm().to_string(),
            iv: B64.encode(&sealed.iv),
            auth_tag: B64.encode(&sealed.auth_tag),
            metadata: PayloadMetadata {
                purpose: ctx.purpose,
                field_name: ctx.field_name.clone(),
                timestamp_ms: now_ms(),
            },
        })
    }

    async fn decrypt_inner(&self, payload: &EncryptedPayload, tenant_id: &str) -> Result<Vec<u8>> {
        validate_tenant_id(tenant_id)?;

        let cipher = self.manager.cipher();
        if payload.algorithm != cipher.algorithm() {
            return Err(KeyError::Parameter(format!(
                "unsupported algorithm {}, expected {}",
                payload.algorithm,
                cipher.algorithm()
            )));
        }

        let purpose = payload.metadata.purpose;
        let key = self
            .manager
            .get_key_by_version(tenant_id, purpose, payload.key_version)
            .await?;
        if key.key_id != payload.key_id {
            debug!(
                tenant_id,
                %purpose,
                version = payload.key_version,
                "payload key id does not match the resolved key"
            );
            return Err(KeyError::KeyNotFound(format!(
                "key {} is not version {} of {tenant_id}/{purpose}",
                payload.key_id, payload.key_version
            )));
        }

        let ciphertext = decode_field("ciphertext", &payload.ciphertext)?;
        let iv = decode_field("iv", &payload.iv)?;
        let auth_tag = decode_field("auth tag", &payload.auth_tag)?;
        let aad = data_aad(
            tenant_id,
            purpose,
            key.version,
            &key.key_id,
            payload.metadata.field_name.as_deref(),
        );

        cipher.decrypt(key.bytes(), &ciphertext, &iv, &auth_tag, &aad)
    }
}

#[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
fn record_operation(
    operation: AuditOperation,
    purpose: KeyPurpose,
    started: Instant,
    error: Option<&KeyError>,
) {
    #[cfg(feature = "metrics")]
    {
        use keyward_metrics::{counter, crypto, histogram, labels};

        let outcome = if error.is_some() { "failure" } else { "success" };
        counter!(
            crypto::OPERATIONS_TOTAL,
            labels::OPERATION => operation.as_str(),
            labels::PURPOSE => purpose.as_str(),
            labels::OUTCOME => outcome
        )
        .increment(1);
        histogram!(
            crypto::OPERATION_DURATION_SECONDS,
            labels::OPERATION => operation.as_str()
        )
        .record(started.elapsed().as_secs_f64());

        if let Some(e) = error {
            counter!(
                crypto::OPERATION_ERRORS_TOTAL,
                labels::OPERATION => operation.as_str(),
                labels::ERROR_TYPE => e.kind()
            )
            .increment(1);
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            audit::{AuditLogger, AuditOutcome, MemoryAuditSink},
            master_key::StaticMasterKey,
            store_memory::MemoryKeyStore,
        },
    };

    fn service() -> (KeyService, Arc<MemoryAuditSink>) {
        let audit = Arc::new(MemoryAuditSink::new());
        let manager = KeyManager::new(
            Arc::new(MemoryKeyStore::new()),
            &StaticMasterKey::new([3; 32]),
        )
        .unwrap()
        .with_audit(AuditLogger::new(audit.clone()));
        (KeyService::new(Arc::new(manager)), audit)
    }

    #[tokio::test]
    async fn round_trip_with_field() {
        let (svc, _) = service();
        let ctx = EncryptionContext::new("acme", KeyPurpose::Pii).with_field("email");

        let payload = svc.encrypt_string("ada@example.com", &ctx).await.unwrap();
        assert_eq!(payload.key_version, 1);
        assert_eq!(payload.algorithm, "xchacha20-poly1305");
        assert_eq!(payload.metadata.field_name.as_deref(), Some("email"));
        assert!(!payload.ciphertext.contains("ada"));

        assert_eq!(
            svc.decrypt_string(&payload, "acme").await.unwrap(),
            "ada@example.com"
        );
    }

    #[tokio::test]
    async fn empty_plaintext_round_trips() {
        let (svc, _) = service();
        let ctx = EncryptionContext::new("acme", KeyPurpose::General);
        let payload = svc.encrypt(b"", &ctx).await.unwrap();
        assert!(svc.decrypt(&payload, "acme").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn field_name_is_bound() {
        let (svc, _) = service();
        let ctx = EncryptionContext::new("acme", KeyPurpose::Pii).with_field("ssn");
        let mut payload = svc.encrypt_string("123-45-6789", &ctx).await.unwrap();

        payload.metadata.field_name = Some("phone".into());
        let err = svc.decrypt(&payload, "acme").await.unwrap_err();
        assert!(matches!(err, KeyError::Integrity(_)));
    }

    #[tokio::test]
    async fn tampered_ciphertext_is_rejected() {
        let (svc, _) = service();
        let ctx = EncryptionContext::new("acme", KeyPurpose::Credentials);
        let mut payload = svc.encrypt_string("hunter2", &ctx).await.unwrap();

        let mut ct = B64.decode(&payload.ciphertext).unwrap();
        ct[0] ^= 0x80;
        payload.ciphertext = B64.encode(&ct);

        let err = svc.decrypt(&payload, "acme").await.unwrap_err();
        assert!(matches!(err, KeyError::Integrity(_)));
    }

    #[tokio::test]
    async fn foreign_algorithm_is_rejected() {
        let (svc, _) = service();
        let ctx = EncryptionContext::new("acme", KeyPurpose::Tokens);
        let mut payload = svc.encrypt_string("tok", &ctx).await.unwrap();
        payload.algorithm = "aes-256-gcm".into();

        let err = svc.decrypt(&payload, "acme").await.unwrap_err();
        assert!(matches!(err, KeyError::Parameter(_)));
    }

    #[tokio::test]
    async fn other_tenant_cannot_decrypt() {
        let (svc, _) = service();
        let payload = svc
            .encrypt_string("secret", &EncryptionContext::new("acme", KeyPurpose::Pii))
            .await
            .unwrap();

        // Tenant without any key for the purpose.
        let err = svc.decrypt(&payload, "globex").await.unwrap_err();
        assert!(matches!(err, KeyError::KeyNotFound(_)));

        // Tenant with its own version 1.
        svc.encrypt_string("x", &EncryptionContext::new("globex", KeyPurpose::Pii))
            .await
            .unwrap();
        let err = svc.decrypt(&payload, "globex").await.unwrap_err();
        assert!(matches!(err, KeyError::KeyNotFound(_) | KeyError::Integrity(_)));
    }

    #[tokio::test]
    async fn every_call_is_audited_once() {
        let (svc, audit) = service();
        let ctx = EncryptionContext::new("acme", KeyPurpose::Pii);
        let payload = svc.encrypt_string("v", &ctx).await.unwrap();
        svc.decrypt(&payload, "acme").await.unwrap();
        let _ = svc.decrypt(&payload, "globex").await;

        let ops: Vec<_> = audit
            .events()
            .iter()
            .map(|e| (e.operation, e.outcome))
            .collect();
        assert_eq!(ops, vec![
            (AuditOperation::CreateKey, AuditOutcome::Success),
            (AuditOperation::Encrypt, AuditOutcome::Success),
            (AuditOperation::Decrypt, AuditOutcome::Success),
            (AuditOperation::Decrypt, AuditOutcome::Failure),
        ]);
    }

    #[test]
    fn aad_includes_every_component() {
        let aad = data_aad("acme", KeyPurpose::Pii, 3, "k", Some("email"));
        assert_eq!(aad, b"acme|pii|3|k|email");
        assert_eq!(data_aad("acme", KeyPurpose::Pii, 3, "k", None), b"acme|pii|3|k|");
    }
}
