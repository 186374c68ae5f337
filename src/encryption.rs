//! Crypto codec for stored license keys.
//!
//! Every plaintext key is persisted twice:
//! - AES-256-GCM ciphertext (random nonce, Base64) so the key can be shown again
//! - HMAC-SHA256 digest (hex) used as the unique lookup value
//!
//! Ciphertext is never compared; only digests are. Two encryptions of the same
//! key are expected to differ.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};

use rand::rngs::OsRng;
use rand::TryRngCore;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;

use ring::hmac;
use sha2::{Digest, Sha256};

use crate::config::CryptoConfig;
use crate::errors::{LicenseError, LicenseResult};

/// AES-256 key size in bytes.
pub const KEY_SIZE: usize = 32;

/// GCM nonce size in bytes (96-bit).
pub const NONCE_SIZE: usize = 12;

/// Generate a new random 256-bit key.
///
/// Caller is responsible for storing this safely.
pub fn generate_key() -> LicenseResult<[u8; KEY_SIZE]> {
    let mut key = [0u8; KEY_SIZE];
    OsRng
        .try_fill_bytes(&mut key)
        .map_err(|e| LicenseError::EncryptionError(format!("OS random source failed: {e}")))?;
    Ok(key)
}

/// Encrypt arbitrary bytes using AES-256-GCM.
///
/// Output format:
///   [nonce (12 bytes)] || [ciphertext+tag]
pub fn encrypt_bytes(plaintext: &[u8], key: &[u8]) -> LicenseResult<Vec<u8>> {
    if key.len() != KEY_SIZE {
        return Err(LicenseError::EncryptionError(format!(
            "invalid key length: expected {} bytes, got {}",
            KEY_SIZE,
            key.len()
        )));
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng
        .try_fill_bytes(&mut nonce_bytes)
        .map_err(|e| LicenseError::EncryptionError(format!("OS random source failed: {e}")))?;
    let nonce = Nonce::from_slice(&nonce_bytes);

    let mut ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| LicenseError::EncryptionError(format!("encryption failed: {e}")))?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.append(&mut ciphertext);

    Ok(output)
}

/// Decrypt bytes produced by `encrypt_bytes`.
pub fn decrypt_bytes(ciphertext: &[u8], key: &[u8]) -> LicenseResult<Vec<u8>> {
    if key.len() != KEY_SIZE {
        return Err(LicenseError::DecryptError(format!(
            "invalid key length: expected {} bytes, got {}",
            KEY_SIZE,
            key.len()
        )));
    }

    if ciphertext.len() <= NONCE_SIZE {
        return Err(LicenseError::DecryptError("ciphertext too short".to_string()));
    }

    let (nonce_bytes, ct) = ciphertext.split_at(NONCE_SIZE);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ct)
        .map_err(|e| LicenseError::DecryptError(format!("decryption failed: {e}")))
}

/// Reversible encryption plus deterministic digest of license keys.
#[derive(Clone)]
pub struct KeyCodec {
    cipher_key: [u8; KEY_SIZE],
    hash_key: hmac::Key,
}

impl fmt::Debug for KeyCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyCodec").finish_non_exhaustive()
    }
}

impl KeyCodec {
    /// Build a codec from a raw AES-256 key and an HMAC secret.
    pub fn new(cipher_key: [u8; KEY_SIZE], hash_secret: &[u8]) -> LicenseResult<Self> {
        if hash_secret.is_empty() {
            return Err(LicenseError::ConfigError(
                "hash secret cannot be empty".to_string(),
            ));
        }

        Ok(Self {
            cipher_key,
            hash_key: hmac::Key::new(hmac::HMAC_SHA256, hash_secret),
        })
    }

    /// Build a codec from configured secrets.
    ///
    /// A 64 character hex `encryption_key` is decoded as the raw key,
    /// anything else is treated as a passphrase and stretched with SHA-256.
    pub fn from_config(config: &CryptoConfig) -> LicenseResult<Self> {
        if config.encryption_key.is_empty() {
            return Err(LicenseError::ConfigError(
                "encryption key cannot be empty".to_string(),
            ));
        }

        let mut cipher_key = [0u8; KEY_SIZE];
        match hex::decode(&config.encryption_key) {
            Ok(raw) if raw.len() == KEY_SIZE => cipher_key.copy_from_slice(&raw),
            _ => cipher_key.copy_from_slice(&Sha256::digest(config.encryption_key.as_bytes())),
        }

        Self::new(cipher_key, config.hash_secret.as_bytes())
    }

    /// Encrypt a plaintext key into a Base64 string.
    pub fn encrypt(&self, plaintext: &str) -> LicenseResult<String> {
        let encrypted = encrypt_bytes(plaintext.as_bytes(), &self.cipher_key)?;
        Ok(B64.encode(encrypted))
    }

    /// Decrypt a string produced by [`KeyCodec::encrypt`].
    pub fn decrypt(&self, ciphertext: &str) -> LicenseResult<String> {
        let decoded = B64
            .decode(ciphertext)
            .map_err(|e| LicenseError::DecryptError(format!("base64 decode failed: {e}")))?;
        let plaintext = decrypt_bytes(&decoded, &self.cipher_key)?;
        String::from_utf8(plaintext)
            .map_err(|e| LicenseError::DecryptError(format!("plaintext is not UTF-8: {e}")))
    }

    /// Deterministic, non-reversible digest used for lookups and uniqueness.
    pub fn hash(&self, plaintext: &str) -> String {
        hex::encode(hmac::sign(&self.hash_key, plaintext.as_bytes()).as_ref())
    }
}
