//! Secret sealing — AES-256-GCM with an Argon2id-derived key.
//!
//! Key secrets are sealed before they reach the database and opened
//! only when the pool is loaded. The master passphrase comes from the
//! environment or from a 0600 file in the data directory.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::Context;
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use std::fs;
use std::io::Write;
use std::path::Path;
use thiserror::Error;
use zeroize::{Zeroize, Zeroizing};

const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MASTER_KEY_BYTES: usize = 32;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("key derivation failed: {0}")]
    Derive(String),
    #[error("sealed value too short")]
    Truncated,
    #[error("cipher failure: wrong master key or corrupted data")]
    Cipher,
}

/// Seals and opens secrets under one master passphrase.
pub struct Sealer {
    passphrase: Zeroizing<Vec<u8>>,
    params: Params,
}

impl Sealer {
    /// Sealer with the Argon2id default cost.
    pub fn new(passphrase: impl Into<Vec<u8>>) -> Self {
        Self {
            passphrase: Zeroizing::new(passphrase.into()),
            params: Params::default(),
        }
    }

    /// Sealer with an explicit Argon2id cost. Values sealed under one cost
    /// can only be opened under the same cost.
    pub fn with_cost(
        passphrase: impl Into<Vec<u8>>,
        memory_kib: u32,
        iterations: u32,
    ) -> Result<Self, VaultError> {
        let params = Params::new(memory_kib, iterations, 1, Some(32))
            .map_err(|e| VaultError::Derive(e.to_string()))?;
        Ok(Self { passphrase: Zeroizing::new(passphrase.into()), params })
    }

    fn derive(&self, salt: &[u8]) -> Result<Zeroizing<[u8; 32]>, VaultError> {
        let mut key = Zeroizing::new([0u8; 32]);
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
            .hash_password_into(&self.passphrase, salt, &mut key[..])
            .map_err(|e| VaultError::Derive(e.to_string()))?;
        Ok(key)
    }

    /// Returns `salt (32) || nonce (12) || ciphertext`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, VaultError> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let key = self.derive(&salt)?;
        let cipher = Aes256Gcm::new_from_slice(&key[..]).map_err(|_| VaultError::Cipher)?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| VaultError::Cipher)?;

        let mut sealed = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&salt);
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Inverse of [`Sealer::seal`].
    pub fn open(&self, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        if sealed.len() < SALT_LEN + NONCE_LEN + TAG_LEN {
            return Err(VaultError::Truncated);
        }
        let (salt, rest) = sealed.split_at(SALT_LEN);
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);

        let key = self.derive(salt)?;
        let cipher = Aes256Gcm::new_from_slice(&key[..]).map_err(|_| VaultError::Cipher)?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| VaultError::Cipher)?;
        Ok(Zeroizing::new(plaintext))
    }
}

// ── Master Key File ─────────────────────────────────────────────────

/// Read the master passphrase from `path`, creating it if missing.
pub fn load_or_create_master_key(path: &Path) -> anyhow::Result<Zeroizing<String>> {
    match fs::read_to_string(path) {
        Ok(content) => {
            let trimmed = content.trim();
            if trimmed.is_empty() {
                anyhow::bail!("master key file {} is empty", path.display());
            }
            Ok(Zeroizing::new(trimmed.to_string()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let mut bytes = [0u8; MASTER_KEY_BYTES];
            OsRng.fill_bytes(&mut bytes);
            let key = Zeroizing::new(hex::encode(bytes));
            bytes.zeroize();
            atomic_write_secret_file(path, &key)?;
            tracing::info!(path = %path.display(), "Generated new master key file (0600)");
            Ok(key)
        }
        Err(e) => Err(e).with_context(|| format!("failed to read master key {}", path.display())),
    }
}

/// Write to `<path>.tmp`, fsync, then rename over `path`.
fn atomic_write_secret_file(path: &Path, contents: &str) -> anyhow::Result<()> {
    let tmp_path = path.with_extension("tmp");
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    {
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(&tmp_path)
            .with_context(|| format!("failed to create {}", tmp_path.display()))?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
    }

    fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to move master key into {}", path.display()))?;
    Ok(())
}
