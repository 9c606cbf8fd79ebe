//! At-rest encryption for captured browser state.
//!
//! AES-256-GCM with a random 96-bit nonce per message. The stored form is
//! base64(nonce || ciphertext+tag); the GCM tag makes any bit flip a
//! [`CipherError::Tamper`].

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroize;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("ciphertext failed integrity check")]
    Tamper,
    #[error("ciphertext is not valid base64 or too short")]
    Encoding,
    #[error("encryption key is empty")]
    InvalidKey,
    #[error("encryption failed")]
    Encrypt,
}

/// encrypt(plaintext) -> ciphertext, decrypt(ciphertext) -> plaintext | Tamper.
pub trait StateCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<String, CipherError>;
    fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>, CipherError>;
}

pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    /// Derive a 256-bit key from an operator-supplied secret.
    pub fn from_secret(secret: &str) -> Result<Self, CipherError> {
        if secret.is_empty() {
            return Err(CipherError::InvalidKey);
        }
        let mut key: [u8; 32] = Sha256::digest(secret.as_bytes()).into();
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CipherError::InvalidKey);
        key.zeroize();
        Ok(Self { cipher: cipher? })
    }
}

impl StateCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<String, CipherError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CipherError::Encrypt)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(sealed))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>, CipherError> {
        let sealed = STANDARD.decode(ciphertext).map_err(|_| CipherError::Encoding)?;
        if sealed.len() <= NONCE_LEN {
            return Err(CipherError::Encoding);
        }
        let (nonce, body) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| CipherError::Tamper)
    }
}
