//! DEK wrapping and unwrapping under the master key.
//!
//! A DEK is sealed with the same [`Cipher`] used for data. The AAD is
//! `"dek-wrap:<key_id>"`, which domain-separates key wrapping from data
//! encryption and pins each wrapped blob to its metadata row: material copied
//! onto another key id fails verification.
//!
//! Blob layout (base64): `[version tag: 1][iv][auth tag][wrapped DEK: 32]`.
//! IV and tag widths come from the cipher.

use {base64::Engine, zeroize::Zeroizing};

use crate::{error::KeyError, traits::Cipher};

const DEK_LEN: usize = 32;

fn wrap_aad(key_id: &str) -> Vec<u8> {
    format!("dek-wrap:{key_id}").into_bytes()
}

/// Wrap (encrypt) a DEK for storage.
pub fn wrap_dek<C: Cipher>(
    cipher: &C,
    master_key: &[u8; 32],
    dek: &[u8; 32],
    key_id: &str,
) -> Result<String, KeyError> {
    let sealed = cipher.encrypt(master_key, dek, &wrap_aad(key_id))?;

    let mut blob =
        Vec::with_capacity(1 + sealed.iv.len() + sealed.auth_tag.len() + sealed.ciphertext.len());
    blob.push(cipher.version_tag());
    blob.extend_from_slice(&sealed.iv);
    blob.extend_from_slice(&sealed.auth_tag);
    blob.extend_from_slice(&sealed.ciphertext);

    Ok(base64::engine::general_purpose::STANDARD.encode(blob))
}

/// Unwrap (decrypt) a DEK previously produced by [`wrap_dek`] for `key_id`.
///
/// A malformed or tampered blob, a foreign cipher tag and a wrong master key
/// all surface as [`KeyError::Integrity`].
pub fn unwrap_dek<C: Cipher>(
    cipher: &C,
    master_key: &[u8; 32],
    wrapped_b64: &str,
    key_id: &str,
) -> Result<Zeroizing<[u8; 32]>, KeyError> {
    let blob = base64::engine::general_purpose::STANDARD
        .decode(wrapped_b64)
        .map_err(|_| KeyError::Integrity(format!("wrapped key {key_id} is not valid base64")))?;

    let (iv_len, tag_len) = (cipher.iv_len(), cipher.tag_len());
    if blob.len() != 1 + iv_len + tag_len + DEK_LEN {
        return Err(KeyError::Integrity(format!(
            "wrapped key {key_id} has unexpected length {}",
            blob.len()
        )));
    }

    let version = blob[0];
    if version != cipher.version_tag() {
        return Err(KeyError::Integrity(format!(
            "wrapped key {key_id} uses cipher version {version:#04x}, expected {:#04x}",
            cipher.version_tag()
        )));
    }

    let (iv, rest) = blob[1..].split_at(iv_len);
    let (tag, ciphertext) = rest.split_at(tag_len);
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(master_key, ciphertext, iv, tag, &wrap_aad(key_id))
            .map_err(|e| match e {
                KeyError::Integrity(_) => {
                    KeyError::Integrity(format!("wrapped key {key_id} failed verification"))
                },
                other => other,
            })?,
    );

    let mut dek = Zeroizing::new([0u8; DEK_LEN]);
    dek.copy_from_slice(&plaintext);
    Ok(dek)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            traits::SealedData,
            xchacha20::{IV_LEN, TAG_LEN, XChaCha20Poly1305Cipher},
        },
        chacha20poly1305::{
            ChaCha20Poly1305, Nonce, Tag,
            aead::{AeadInPlace, KeyInit},
        },
    };

    const MASTER: [u8; 32] = [0xAA; 32];
    const DEK: [u8; 32] = [0xBB; 32];

    /// ChaCha20-Poly1305 with a 96-bit nonce, narrower than the default cipher.
    struct ShortNonceCipher;

    impl Cipher for ShortNonceCipher {
        fn algorithm(&self) -> &'static str {
            "chacha20-poly1305"
        }

        fn version_tag(&self) -> u8 {
            0x02
        }

        fn iv_len(&self) -> usize {
            12
        }

        fn tag_len(&self) -> usize {
            16
        }

        #[allow(deprecated)]
        fn encrypt(&self, key: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<SealedData, KeyError> {
            let cipher = ChaCha20Poly1305::new_from_slice(key).unwrap();
            let iv = [7u8; 12];
            let mut buffer = plaintext.to_vec();
            let tag = cipher
                .encrypt_in_place_detached(Nonce::from_slice(&iv), aad, &mut buffer)
                .unwrap();
            Ok(SealedData {
                ciphertext: buffer,
                iv: iv.to_vec(),
                auth_tag: tag.to_vec(),
            })
        }

        #[allow(deprecated)]
        fn decrypt(
            &self,
            key: &[u8],
            ciphertext: &[u8],
            iv: &[u8],
            auth_tag: &[u8],
            aad: &[u8],
        ) -> Result<Vec<u8>, KeyError> {
            let cipher = ChaCha20Poly1305::new_from_slice(key).unwrap();
            let mut buffer = ciphertext.to_vec();
            cipher
                .decrypt_in_place_detached(
                    Nonce::from_slice(iv),
                    aad,
                    &mut buffer,
                    Tag::from_slice(auth_tag),
                )
                .map_err(|_| KeyError::Integrity("authentication tag mismatch".into()))?;
            Ok(buffer)
        }
    }

    #[test]
    fn round_trip() {
        let wrapped = wrap_dek(&XChaCha20Poly1305Cipher, &MASTER, &DEK, "k1").unwrap();
        let unwrapped = unwrap_dek(&XChaCha20Poly1305Cipher, &MASTER, &wrapped, "k1").unwrap();
        assert_eq!(*unwrapped, DEK);
    }

    #[test]
    fn wrong_master_key_fails() {
        let wrapped = wrap_dek(&XChaCha20Poly1305Cipher, &MASTER, &DEK, "k1").unwrap();
        let result = unwrap_dek(&XChaCha20Poly1305Cipher, &[0xCC; 32], &wrapped, "k1");
        assert!(matches!(result, Err(KeyError::Integrity(_))));
    }

    #[test]
    fn material_is_bound_to_key_id() {
        let wrapped = wrap_dek(&XChaCha20Poly1305Cipher, &MASTER, &DEK, "k1").unwrap();
        let result = unwrap_dek(&XChaCha20Poly1305Cipher, &MASTER, &wrapped, "k2");
        assert!(matches!(result, Err(KeyError::Integrity(_))));
    }

    #[test]
    fn tampered_wrapped_fails() {
        let wrapped = wrap_dek(&XChaCha20Poly1305Cipher, &MASTER, &DEK, "k1").unwrap();
        let mut blob = base64::engine::general_purpose::STANDARD
            .decode(&wrapped)
            .unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        let tampered = base64::engine::general_purpose::STANDARD.encode(&blob);

        let result = unwrap_dek(&XChaCha20Poly1305Cipher, &MASTER, &tampered, "k1");
        assert!(matches!(result, Err(KeyError::Integrity(_))));
    }

    #[test]
    fn truncated_blob_fails() {
        let result = unwrap_dek(&XChaCha20Poly1305Cipher, &MASTER, "AQID", "k1");
        assert!(matches!(result, Err(KeyError::Integrity(_))));
    }

    #[test]
    fn wrapped_blob_has_version_prefix() {
        let wrapped = wrap_dek(&XChaCha20Poly1305Cipher, &MASTER, &DEK, "k1").unwrap();
        let blob = base64::engine::general_purpose::STANDARD
            .decode(&wrapped)
            .unwrap();
        assert_eq!(blob[0], 0x01);
        assert_eq!(blob.len(), 1 + IV_LEN + TAG_LEN + DEK_LEN);
    }

    #[test]
    fn layout_follows_cipher_iv_and_tag_width() {
        let wrapped = wrap_dek(&ShortNonceCipher, &MASTER, &DEK, "k1").unwrap();
        let blob = base64::engine::general_purpose::STANDARD
            .decode(&wrapped)
            .unwrap();
        assert_eq!(blob.len(), 1 + 12 + 16 + DEK_LEN);

        let unwrapped = unwrap_dek(&ShortNonceCipher, &MASTER, &wrapped, "k1").unwrap();
        assert_eq!(*unwrapped, DEK);

        // Each cipher rejects the other's blobs.
        let result = unwrap_dek(&XChaCha20Poly1305Cipher, &MASTER, &wrapped, "k1");
        assert!(matches!(result, Err(KeyError::Integrity(_))));
    }
}
