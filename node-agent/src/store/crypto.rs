//! Sealing primitives: AES-256-GCM payloads and SHA-256 checksums

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Size of the AES-GCM nonce in bytes
pub const NONCE_SIZE: usize = 12;

/// Size of a data or master key in bytes
pub const KEY_SIZE: usize = 32;

pub type KeyBytes = [u8; KEY_SIZE];

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("sealed payload too short ({0} bytes)")]
    Truncated(usize),
}

/// Generate a fresh random key
pub fn generate_key() -> KeyBytes {
    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    key
}

/// Random URL-safe token, used for session keys
pub fn random_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    OsRng.fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

/// Encrypt `plaintext`, returning `nonce || ciphertext`
pub fn seal(key: &KeyBytes, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypt a payload produced by [`seal`]
pub fn open(key: &KeyBytes, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_SIZE {
        return Err(CryptoError::Truncated(sealed.len()));
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);

    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| CryptoError::Decryption(e.to_string()))?;

    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::Decryption("authentication tag mismatch".to_string()))
}

/// Lowercase hex SHA-256 over the sealed bytes
pub fn checksum(sealed: &[u8]) -> String {
    hex::encode(Sha256::digest(sealed))
}

/// Digest used to journal consumed registration tokens
pub fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}
