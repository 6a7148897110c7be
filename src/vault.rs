//! Credential encryption at rest
//!
//! Server secrets (SSH private keys, admin API tokens) are stored encrypted
//! with AES-256-GCM. The key is injected once at startup and never changes for
//! the lifetime of the process.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use secrecy::SecretString;
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

/// Length of encryption key in bytes (256 bits)
pub const KEY_LENGTH: usize = 32;
/// Length of nonce in bytes (96 bits)
const NONCE_LENGTH: usize = 12;
/// Marker shown in place of a masked secret
pub const MASK_MARKER: &str = "***";
/// Number of trailing characters a masked secret keeps
const MASK_VISIBLE_CHARS: usize = 4;

/// Errors produced by the vault
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("encryption key not set ({0})")]
    MissingKey(String),

    #[error("invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("ciphertext is malformed: {0}")]
    Malformed(String),

    #[error("decryption failed: ciphertext was tampered with or the key is wrong")]
    Authentication,

    #[error("encryption failed")]
    Encryption,
}

/// Symmetric vault for stored credentials.
///
/// Ciphertext format is `base64(nonce || ciphertext || tag)`.
pub struct CredentialVault {
    cipher: Aes256Gcm,
}

impl CredentialVault {
    /// Create a vault from raw key bytes
    pub fn from_key(bytes: &[u8]) -> Result<Self, VaultError> {
        if bytes.len() != KEY_LENGTH {
            return Err(VaultError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_LENGTH,
                bytes.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(bytes)
            .map_err(|e| VaultError::InvalidKey(e.to_string()))?;

        Ok(Self { cipher })
    }

    /// Create a vault from a 64-character hex key
    pub fn from_hex(encoded: &str) -> Result<Self, VaultError> {
        let bytes = Zeroizing::new(hex::decode(encoded.trim()).map_err(|e| {
            VaultError::InvalidKey(format!("key must be {} hex characters: {}", KEY_LENGTH * 2, e))
        })?);
        Self::from_key(&bytes)
    }

    /// Create a vault from the hex key stored in an environment variable.
    ///
    /// A missing variable is an error; the vault never operates without a key.
    pub fn from_env(var: &str) -> Result<Self, VaultError> {
        let value = Zeroizing::new(std::env::var(var).map_err(|_| VaultError::MissingKey(var.to_string()))?);
        if value.trim().is_empty() {
            return Err(VaultError::MissingKey(var.to_string()));
        }
        let vault = Self::from_hex(&value)?;
        debug!(var, "Credential vault initialized from environment");
        Ok(vault)
    }

    /// Generate a fresh random key, hex encoded
    pub fn generate_key_hex() -> String {
        let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
        OsRng.fill_bytes(&mut key[..]);
        hex::encode(&key[..])
    }

    /// Encrypt a secret value. Every call uses a fresh nonce.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| VaultError::Encryption)?;

        let mut sealed = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);

        Ok(STANDARD.encode(sealed))
    }

    /// Decrypt a value produced by [`encrypt`](Self::encrypt)
    pub fn decrypt(&self, encoded: &str) -> Result<SecretString, VaultError> {
        let sealed = STANDARD
            .decode(encoded.trim())
            .map_err(|e| VaultError::Malformed(e.to_string()))?;

        if sealed.len() < NONCE_LENGTH {
            return Err(VaultError::Malformed("ciphertext too short".to_string()));
        }

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LENGTH);
        let plaintext = Zeroizing::new(
            self.cipher
                .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
                .map_err(|_| VaultError::Authentication)?,
        );

        let text = std::str::from_utf8(&plaintext)
            .map_err(|_| VaultError::Malformed("decrypted value is not UTF-8".to_string()))?;

        Ok(SecretString::new(text.to_string()))
    }
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault").finish_non_exhaustive()
    }
}

/// Mask a secret for display: the marker plus the final four characters.
///
/// Secrets of four characters or fewer are shown as the marker only.
pub fn mask(secret: &str) -> String {
    let count = secret.chars().count();
    if count <= MASK_VISIBLE_CHARS {
        return MASK_MARKER.to_string();
    }
    let tail: String = secret.chars().skip(count - MASK_VISIBLE_CHARS).collect();
    format!("{}{}", MASK_MARKER, tail)
}
