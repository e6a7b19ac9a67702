//! Cipher trait for swappable authenticated encryption backends.

use crate::error::KeyError;

/// Output of one AEAD sealing operation, with the tag kept apart from the
/// ciphertext so each part can be stored and validated separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedData {
    pub ciphertext: Vec<u8>,
    pub iv: Vec<u8>,
    pub auth_tag: Vec<u8>,
}

/// Authenticated encryption with associated data (AEAD) over raw 256-bit keys.
///
/// Implementations can be swapped without touching the lifecycle manager.
/// The [`algorithm`](Self::algorithm) string is recorded in key metadata and
/// payloads; the [`version_tag`](Self::version_tag) prefixes wrapped key blobs.
pub trait Cipher: Send + Sync {
    /// Algorithm identifier stored with keys and payloads.
    fn algorithm(&self) -> &'static str;

    /// Unique one-byte tag for this cipher.
    fn version_tag(&self) -> u8;

    /// Length in bytes of the IV each [`encrypt`](Self::encrypt) produces.
    fn iv_len(&self) -> usize;

    /// Length in bytes of the authentication tag.
    fn tag_len(&self) -> usize;

    /// Encrypt `plaintext` under `key` with `aad`.
    ///
    /// Every call draws a fresh random IV. Fails with
    /// [`KeyError::Parameter`] if `key` is not exactly 32 bytes.
    fn encrypt(&self, key: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<SealedData, KeyError>;

    /// Decrypt and verify.
    ///
    /// Fails with [`KeyError::Parameter`] on a wrong key, IV or tag length and
    /// with [`KeyError::Integrity`] when the tag does not verify.
    fn decrypt(
        &self,
        key: &[u8],
        ciphertext: &[u8],
        iv: &[u8],
        auth_tag: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, KeyError>;
}
