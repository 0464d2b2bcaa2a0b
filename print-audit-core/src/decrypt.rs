//! Fernet decryption of captured print-stream files.
//!
//! Each file on the drop server is one Fernet token (URL-safe base64 text).

use tracing::debug;

use crate::contract::{DecryptionError, Decryptor};

pub struct FernetDecryptor {
    fernet: fernet::Fernet,
}

impl std::fmt::Debug for FernetDecryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FernetDecryptor { .. }")
    }
}

impl FernetDecryptor {
    /// `key` is the 32-byte key in URL-safe base64, as produced by Fernet key generation.
    pub fn new(key: &str) -> Result<Self, DecryptionError> {
        let fernet = fernet::Fernet::new(key.trim()).ok_or_else(|| {
            DecryptionError::InvalidKey("expected 32 bytes of URL-safe base64".to_string())
        })?;
        Ok(Self { fernet })
    }
}

impl Decryptor for FernetDecryptor {
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, DecryptionError> {
        let token = std::str::from_utf8(ciphertext).map_err(|_| DecryptionError::InvalidCiphertext)?;
        let plaintext = self
            .fernet
            .decrypt(token.trim())
            .map_err(|_| DecryptionError::InvalidCiphertext)?;
        debug!(ciphertext = ciphertext.len(), plaintext = plaintext.len(), "Decrypted token");
        Ok(plaintext)
    }
}
