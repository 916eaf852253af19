//! AES-256-GCM encryption for credential secrets.
//!
//! Each secret is encrypted with a fresh random nonce. The master key is
//! 32 bytes, base64-encoded, and lives only in memory (from an env var).

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;

/// Decode and validate the base64 master key (must be exactly 32 bytes).
pub fn validate_key(key_base64: &str) -> Result<Vec<u8>> {
    let key_bytes = BASE64
        .decode(key_base64)
        .context("Failed to decode base64 encryption key")?;

    if key_bytes.len() != KEY_SIZE {
        return Err(anyhow!(
            "Encryption key must be {} bytes, got {}",
            KEY_SIZE,
            key_bytes.len()
        ));
    }

    Ok(key_bytes)
}

/// Encrypt a secret, returning base64 (ciphertext, nonce).
pub fn encrypt(plaintext: &str, key: &[u8]) -> Result<(String, String)> {
    if key.len() != KEY_SIZE {
        return Err(anyhow!("Encryption key must be {} bytes", KEY_SIZE));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;

    let nonce_bytes = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext_bytes = cipher
        .encrypt(&nonce_bytes, plaintext.as_bytes())
        .map_err(|e| anyhow!("Encryption failed: {}", e))?;

    Ok((BASE64.encode(&ciphertext_bytes), BASE64.encode(&nonce_bytes)))
}

/// Decrypt a base64 ciphertext with its nonce.
pub fn decrypt(ciphertext: &str, nonce: &str, key: &[u8]) -> Result<String> {
    if key.len() != KEY_SIZE {
        return Err(anyhow!("Encryption key must be {} bytes", KEY_SIZE));
    }

    let ciphertext_bytes = BASE64
        .decode(ciphertext)
        .context("Failed to decode ciphertext")?;
    let nonce_bytes = BASE64.decode(nonce).context("Failed to decode nonce")?;

    if nonce_bytes.len() != NONCE_SIZE {
        return Err(anyhow!(
            "Invalid nonce size: expected {}, got {}",
            NONCE_SIZE,
            nonce_bytes.len()
        ));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;

    let plaintext_bytes = cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext_bytes.as_ref())
        .map_err(|e| anyhow!("Decryption failed (wrong key or corrupted data): {}", e))?;

    String::from_utf8(plaintext_bytes).context("Decrypted data is not valid UTF-8")
}
