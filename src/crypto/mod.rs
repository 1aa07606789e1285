//! Password-based authenticated encryption
//!
//! Seals opaque byte payloads with AES-256-GCM under a key derived from
//! the caller's password via PBKDF2-HMAC-SHA256. Shared by the
//! credential fallback store and the backup engine, so both produce the
//! same on-disk layout: `[32B salt][12B nonce][ciphertext || 16B tag]`.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use pbkdf2::pbkdf2_hmac;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use thiserror::Error;

use crate::types::error::TideError;

/// Salt size for key derivation (256 bits / 32 bytes)
const SALT_SIZE: usize = 32;

/// Nonce size for AES-GCM (96 bits / 12 bytes)
const NONCE_SIZE: usize = 12;

/// Authentication tag size appended by AES-GCM (128 bits / 16 bytes)
const TAG_SIZE: usize = 16;

/// PBKDF2 iteration count
const KDF_ROUNDS: u32 = 100_000;

/// Encryption errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Wrong password and corrupted data are indistinguishable on
    /// purpose: the authentication tag is the only signal for both.
    #[error("Invalid password or corrupted data")]
    InvalidPasswordOrData,
}

impl From<CryptoError> for TideError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::InvalidInput(msg) => TideError::InvalidInput(msg),
            CryptoError::InvalidPasswordOrData => TideError::Crypto,
        }
    }
}

/// Derive a 256-bit key from a password and salt
fn derive_key(password: &str, salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, KDF_ROUNDS, &mut key);
    key
}

/// Encrypt a payload under a password
///
/// Returns `salt || nonce || ciphertext || tag`, with a fresh random
/// salt and nonce per call.
pub fn encrypt(plaintext: &[u8], password: &str) -> Result<Vec<u8>, CryptoError> {
    if password.is_empty() {
        return Err(CryptoError::InvalidInput(
            "password must not be empty".to_string(),
        ));
    }
    if plaintext.is_empty() {
        return Err(CryptoError::InvalidInput(
            "cannot encrypt an empty payload".to_string(),
        ));
    }

    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);

    let key = derive_key(password, &salt);
    let cipher = Aes256Gcm::new(&key.into());
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| CryptoError::InvalidInput(format!("AES-GCM encryption failed: {}", e)))?;

    let mut out = Vec::with_capacity(SALT_SIZE + NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a payload produced by [`encrypt`]
///
/// Re-derives the key from the embedded salt. Fails closed on any tag
/// mismatch; no plaintext is ever returned for data that does not
/// authenticate.
pub fn decrypt(data: &[u8], password: &str) -> Result<Vec<u8>, CryptoError> {
    if password.is_empty() {
        return Err(CryptoError::InvalidInput(
            "password must not be empty".to_string(),
        ));
    }
    if data.len() < SALT_SIZE + NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::InvalidInput(format!(
            "ciphertext too short: {} bytes",
            data.len()
        )));
    }

    let (salt, rest) = data.split_at(SALT_SIZE);
    let (nonce_bytes, ciphertext) = rest.split_at(NONCE_SIZE);

    let key = derive_key(password, salt);
    let cipher = Aes256Gcm::new(&key.into());
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::InvalidPasswordOrData)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let plaintext = b"my_secret_payload_123!";
        let encrypted = encrypt(plaintext, "hunter2hunter2").unwrap();

        assert_ne!(&encrypted[..], &plaintext[..]);
        assert_eq!(
            encrypted.len(),
            SALT_SIZE + NONCE_SIZE + plaintext.len() + TAG_SIZE
        );

        let decrypted = decrypt(&encrypted, "hunter2hunter2").unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_same_plaintext_different_ciphertext() {
        let encrypted1 = encrypt(b"same_payload", "password").unwrap();
        let encrypted2 = encrypt(b"same_payload", "password").unwrap();

        // Fresh salt and nonce per call
        assert_ne!(encrypted1, encrypted2);
        assert_eq!(decrypt(&encrypted1, "password").unwrap(), b"same_payload");
        assert_eq!(decrypt(&encrypted2, "password").unwrap(), b"same_payload");
    }

    #[test]
    fn test_wrong_password_fails() {
        let encrypted = encrypt(b"payload", "correct password").unwrap();
        let err = decrypt(&encrypted, "wrong password").unwrap_err();
        assert!(matches!(err, CryptoError::InvalidPasswordOrData));
    }

    #[test]
    fn test_any_single_byte_mutation_fails() {
        let encrypted = encrypt(b"integrity matters", "password").unwrap();

        for i in 0..encrypted.len() {
            let mut tampered = encrypted.clone();
            tampered[i] ^= 0x01;
            assert!(
                decrypt(&tampered, "password").is_err(),
                "mutation at byte {} was not detected",
                i
            );
        }
    }

    #[test]
    fn test_empty_inputs_rejected() {
        assert!(matches!(
            encrypt(b"", "password"),
            Err(CryptoError::InvalidInput(_))
        ));
        assert!(matches!(
            encrypt(b"payload", ""),
            Err(CryptoError::InvalidInput(_))
        ));
        assert!(matches!(
            decrypt(&[0u8; 64], ""),
            Err(CryptoError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_short_ciphertext_rejected() {
        // One byte short of salt + nonce + tag
        let short = vec![0u8; SALT_SIZE + NONCE_SIZE + TAG_SIZE - 1];
        assert!(matches!(
            decrypt(&short, "password"),
            Err(CryptoError::InvalidInput(_))
        ));
    }
}
