//! Sources for the root key that wraps every DEK.
//!
//! The master key must stay stable for the life of a process. It is read once
//! when the [`KeyManager`](crate::KeyManager) is built; any failure here is
//! [`KeyError::FatalConfiguration`] and the manager refuses to start.

use std::path::PathBuf;

use {
    argon2::{Algorithm, Argon2, Params, Version},
    base64::Engine,
    rand::RngCore,
    zeroize::Zeroizing,
};

use crate::error::KeyError;

const MIN_SALT_LEN: usize = 8;

/// Supplies the 256-bit master key.
pub trait MasterKeySource: Send + Sync {
    fn master_key(&self) -> Result<Zeroizing<[u8; 32]>, KeyError>;
}

/// Decode a base64 master key and check it is exactly 32 bytes.
pub fn decode_master_key(b64: &str) -> Result<Zeroizing<[u8; 32]>, KeyError> {
    let bytes = Zeroizing::new(
        base64::engine::general_purpose::STANDARD
            .decode(b64.trim())
            .map_err(|_| KeyError::FatalConfiguration("master key is not valid base64".into()))?,
    );
    if bytes.len() != 32 {
        return Err(KeyError::FatalConfiguration(format!(
            "master key must decode to 32 bytes, got {}",
            bytes.len()
        )));
    }
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Generate a fresh random master key, base64-encoded.
pub fn generate_master_key() -> Zeroizing<String> {
    let mut key = Zeroizing::new([0u8; 32]);
    rand::rng().fill_bytes(key.as_mut());
    Zeroizing::new(base64::engine::general_purpose::STANDARD.encode(&key[..]))
}

/// A master key held directly in memory.
pub struct StaticMasterKey {
    key: Zeroizing<[u8; 32]>,
}

impl StaticMasterKey {
    pub fn new(key: [u8; 32]) -> Self {
        Self {
            key: Zeroizing::new(key),
        }
    }

    pub fn from_base64(b64: &str) -> Result<Self, KeyError> {
        Ok(Self {
            key: decode_master_key(b64)?,
        })
    }
}

impl MasterKeySource for StaticMasterKey {
    fn master_key(&self) -> Result<Zeroizing<[u8; 32]>, KeyError> {
        Ok(self.key.clone())
    }
}

/// Base64 master key read from an environment variable.
pub struct EnvMasterKey {
    var: String,
}

impl EnvMasterKey {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl MasterKeySource for EnvMasterKey {
    fn master_key(&self) -> Result<Zeroizing<[u8; 32]>, KeyError> {
        let value = Zeroizing::new(std::env::var(&self.var).map_err(|_| {
            KeyError::FatalConfiguration(format!("environment variable {} is not set", self.var))
        })?);
        decode_master_key(&value)
    }
}

/// Base64 master key read from a file (e.g. a mounted secret).
pub struct FileMasterKey {
    path: PathBuf,
}

impl FileMasterKey {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MasterKeySource for FileMasterKey {
    fn master_key(&self) -> Result<Zeroizing<[u8; 32]>, KeyError> {
        let contents = Zeroizing::new(std::fs::read_to_string(&self.path).map_err(|e| {
            KeyError::FatalConfiguration(format!(
                "failed to read master key file {}: {e}",
                self.path.display()
            ))
        })?);
        decode_master_key(&contents)
    }
}

/// Argon2id cost for [`PassphraseMasterKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassphraseCost {
    pub memory_kib: u32,
    pub iterations: u32,
    pub lanes: u32,
}

impl Default for PassphraseCost {
    fn default() -> Self {
        Self {
            memory_kib: 64 * 1024,
            iterations: 3,
            lanes: 1,
        }
    }
}

/// Master key derived with Argon2id from a passphrase in an environment
/// variable and a fixed, configured salt. The salt must never change, or
/// every wrapped DEK becomes unreadable.
pub struct PassphraseMasterKey {
    var: String,
    salt: Vec<u8>,
    cost: PassphraseCost,
}

impl PassphraseMasterKey {
    /// `salt_b64` is the base64 salt from configuration, at least 8 bytes.
    pub fn new(var: impl Into<String>, salt_b64: &str) -> Result<Self, KeyError> {
        let salt = base64::engine::general_purpose::STANDARD
            .decode(salt_b64.trim())
            .map_err(|_| KeyError::FatalConfiguration("master key salt is not valid base64".into()))?;
        if salt.len() < MIN_SALT_LEN {
            return Err(KeyError::FatalConfiguration(format!(
                "master key salt must be at least {MIN_SALT_LEN} bytes, got {}",
                salt.len()
            )));
        }
        Ok(Self {
            var: var.into(),
            salt,
            cost: PassphraseCost::default(),
        })
    }

    #[must_use]
    pub fn with_cost(mut self, cost: PassphraseCost) -> Self {
        self.cost = cost;
        self
    }

    fn derive(&self, passphrase: &str) -> Result<Zeroizing<[u8; 32]>, KeyError> {
        if passphrase.is_empty() {
            return Err(KeyError::FatalConfiguration(format!(
                "passphrase in {} is empty",
                self.var
            )));
        }
        let params = Params::new(
            self.cost.memory_kib,
            self.cost.iterations,
            self.cost.lanes,
            Some(32),
        )
        .map_err(|e| KeyError::FatalConfiguration(format!("invalid argon2 cost: {e}")))?;

        let mut key = Zeroizing::new([0u8; 32]);
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
            .hash_password_into(passphrase.as_bytes(), &self.salt, key.as_mut())
            .map_err(|e| KeyError::FatalConfiguration(format!("master key derivation failed: {e}")))?;
        Ok(key)
    }
}

impl MasterKeySource for PassphraseMasterKey {
    fn master_key(&self) -> Result<Zeroizing<[u8; 32]>, KeyError> {
        let passphrase = Zeroizing::new(std::env::var(&self.var).map_err(|_| {
            KeyError::FatalConfiguration(format!("environment variable {} is not set", self.var))
        })?);
        self.derive(&passphrase)
    }
}
