//! XChaCha20-Poly1305 implementation of the [`Cipher`] trait.

#[allow(deprecated)] // upstream generic-array 0.x deprecation
use chacha20poly1305::{
    Tag, XChaCha20Poly1305, XNonce,
    aead::{AeadInPlace, KeyInit},
};
use rand::RngCore;

use crate::{
    error::KeyError,
    traits::{Cipher, SealedData},
};

/// Version tag for the XChaCha20-Poly1305 cipher.
pub const VERSION_TAG: u8 = 0x01;

/// Algorithm identifier recorded in key metadata and payloads.
pub const ALGORITHM: &str = "xchacha20-poly1305";

/// Required key size (256 bits).
pub const KEY_LEN: usize = 32;

/// Nonce size for XChaCha20-Poly1305 (24 bytes).
pub const IV_LEN: usize = 24;

/// Poly1305 tag size (128 bits).
pub const TAG_LEN: usize = 16;

/// XChaCha20-Poly1305 AEAD cipher.
///
/// The 192-bit nonce is drawn from the OS-seeded thread RNG on every call, so
/// random nonces are safe for the lifetime of a key.
#[derive(Debug, Clone, Copy, Default)]
pub struct XChaCha20Poly1305Cipher;

fn check_key(key: &[u8]) -> Result<XChaCha20Poly1305, KeyError> {
    if key.len() != KEY_LEN {
        return Err(KeyError::Parameter(format!(
            "key must be {KEY_LEN} bytes, got {}",
            key.len()
        )));
    }
    XChaCha20Poly1305::new_from_slice(key).map_err(|e| KeyError::Parameter(e.to_string()))
}

impl Cipher for XChaCha20Poly1305Cipher {
    fn algorithm(&self) -> &'static str {
        ALGORITHM
    }

    fn version_tag(&self) -> u8 {
        VERSION_TAG
    }

    fn iv_len(&self) -> usize {
        IV_LEN
    }

    fn tag_len(&self) -> usize {
        TAG_LEN
    }

    #[allow(deprecated)]
    fn encrypt(&self, key: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<SealedData, KeyError> {
        let cipher = check_key(key)?;

        let mut iv = [0u8; IV_LEN];
        rand::rng().fill_bytes(&mut iv);

        let mut buffer = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(XNonce::from_slice(&iv), aad, &mut buffer)
            .map_err(|_| KeyError::Parameter("plaintext too large for cipher".into()))?;

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
        let cipher = check_key(key)?;
        if iv.len() != IV_LEN {
            return Err(KeyError::Parameter(format!(
                "iv must be {IV_LEN} bytes, got {}",
                iv.len()
            )));
        }
        if auth_tag.len() != TAG_LEN {
            return Err(KeyError::Parameter(format!(
                "auth tag must be {TAG_LEN} bytes, got {}",
                auth_tag.len()
            )));
        }

        let mut buffer = ciphertext.to_vec();
        cipher
            .decrypt_in_place_detached(
                XNonce::from_slice(iv),
                aad,
                &mut buffer,
                Tag::from_slice(auth_tag),
            )
            .map_err(|_| KeyError::Integrity("authentication tag mismatch".into()))?;
        Ok(buffer)
    }
}
