//! At-rest encryption for secret record fields
//!
//! Host passwords and private keys may be stored encrypted. The stored form is
//! `base64(nonce || ciphertext || tag)` using ChaCha20-Poly1305 with a key derived
//! from the configured secret by SHA-256. An empty configured secret disables encryption.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, KeyInit, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed (wrong key or corrupted data)")]
    DecryptionFailed,

    #[error("Stored value is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("Stored value is too short to be a ciphertext")]
    Truncated,

    #[error("Decrypted value is not valid UTF-8")]
    NotUtf8,
}

/// Symmetric box for secret fields
#[derive(Clone)]
pub struct SecretBox {
    key: Option<Zeroizing<[u8; 32]>>,
}

impl SecretBox {
    pub fn new(secret: &str) -> Self {
        if secret.is_empty() {
            return Self { key: None };
        }

        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&Sha256::digest(secret.as_bytes()));
        Self { key: Some(key) }
    }

    pub fn disabled() -> Self {
        Self { key: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    pub fn encrypt(&self, plain: &str) -> Result<String, CryptoError> {
        let Some(key) = &self.key else {
            return Ok(plain.to_string());
        };

        let cipher =
            ChaCha20Poly1305::new_from_slice(&**key).map_err(|_| CryptoError::EncryptionFailed)?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plain.as_bytes())
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(sealed))
    }

    pub fn decrypt(&self, stored: &str) -> Result<Zeroizing<String>, CryptoError> {
        let Some(key) = &self.key else {
            return Ok(Zeroizing::new(stored.to_string()));
        };

        let sealed = STANDARD.decode(stored.trim())?;
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Truncated);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);

        let cipher =
            ChaCha20Poly1305::new_from_slice(&**key).map_err(|_| CryptoError::DecryptionFailed)?;
        let plain = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)?;

        String::from_utf8(plain)
            .map(Zeroizing::new)
            .map_err(|_| CryptoError::NotUtf8)
    }

    /// Decrypt, or hand back the stored value if it was never encrypted.
    ///
    /// Records written before a key was configured keep working after one is.
    pub fn decrypt_or_raw(&self, stored: &str) -> Zeroizing<String> {
        match self.decrypt(stored) {
            Ok(plain) => plain,
            Err(e) => {
                tracing::debug!("Secret field is not a ciphertext ({}), using raw value", e);
                Zeroizing::new(stored.to_string())
            }
        }
    }
}

impl std::fmt::Debug for SecretBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretBox")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
