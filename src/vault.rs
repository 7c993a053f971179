use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{Context, Result};
use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use keyring::Entry;

const APP_NAME: &str = "gpilot";
const KEY_ENTRY: &str = "credential_vault_key";

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("invalid key length: {0} bytes (expected {KEY_LEN})")]
    InvalidKeyLength(usize),
    #[error("encryption failed: {0}")]
    Encrypt(String),
    #[error("decryption failed: {0}")]
    Decrypt(String),
}

/// Symmetric AES-256-GCM vault for credential bytes.
///
/// Ciphertext layout is `nonce (12 bytes) || sealed payload`. The key length
/// is checked on every call so a misconfigured key fails both directions.
pub struct Vault {
    key: Vec<u8>,
}

impl Vault {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let key = B64
            .decode(encoded.trim())
            .context("Vault key is not valid base64")?;
        Ok(Self::new(key))
    }

    fn cipher(&self) -> Result<Aes256Gcm, VaultError> {
        if self.key.len() != KEY_LEN {
            return Err(VaultError::InvalidKeyLength(self.key.len()));
        }
        Aes256Gcm::new_from_slice(&self.key).map_err(|_| VaultError::InvalidKeyLength(self.key.len()))
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, VaultError> {
        let cipher = self.cipher()?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| VaultError::Encrypt(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, VaultError> {
        let cipher = self.cipher()?;
        if ciphertext.len() < NONCE_LEN {
            return Err(VaultError::Decrypt(format!(
                "ciphertext too short: {} bytes",
                ciphertext.len()
            )));
        }
        let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|e| VaultError::Decrypt(e.to_string()))
    }

    pub fn encrypt_str(&self, plaintext: &str) -> Result<Vec<u8>, VaultError> {
        self.encrypt(plaintext.as_bytes())
    }

    pub fn decrypt_str(&self, ciphertext: &[u8]) -> Result<String, VaultError> {
        let bytes = self.decrypt(ciphertext)?;
        String::from_utf8(bytes)
            .map_err(|e| VaultError::Decrypt(format!("invalid UTF-8 in decrypted data: {}", e)))
    }
}

/// Loads the vault key from the OS keyring, generating and storing one on first run.
pub fn load_or_create_keyring_key() -> Result<Vec<u8>> {
    let entry = Entry::new(APP_NAME, KEY_ENTRY)
        .map_err(|e| anyhow::anyhow!("Keyring error: {}", e))?;

    match entry.get_password() {
        Ok(encoded) => {
            let key = B64
                .decode(encoded.trim())
                .context("Stored vault key is not valid base64")?;
            if key.len() != KEY_LEN {
                anyhow::bail!("Stored vault key has wrong length: {} (expected {})", key.len(), KEY_LEN);
            }
            tracing::info!("Vault key loaded from OS keyring");
            Ok(key)
        }
        Err(keyring::Error::NoEntry) => {
            let key = Aes256Gcm::generate_key(OsRng).to_vec();
            entry
                .set_password(&B64.encode(&key))
                .map_err(|e| anyhow::anyhow!("Keyring error: {}", e))?;
            tracing::info!("New vault key generated and stored in OS keyring");
            Ok(key)
        }
        Err(e) => Err(anyhow::anyhow!("Keyring error: {}", e)),
    }
}
