//! Secure credential storage
//!
//! Holds the single mail-account secret in the OS vault (Keychain on
//! macOS, Credential Manager on Windows, Secret Service on Linux).
//!
//! Minimal or headless non-Windows systems may have no usable vault. In
//! that case the secret is encrypted under the machine identity and
//! written to an owner-only file in the config directory, so the blob
//! cannot be lifted onto another host. On Windows the vault is assumed
//! always available and a failure there is a hard error.

use std::fs;
use std::path::PathBuf;

use keyring::Entry;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::APP_DIR;
use crate::crypto;
use crate::types::error::TideError;

/// File name of the encrypted fallback blob inside the config directory
const FALLBACK_FILE_NAME: &str = "credentials.enc";

/// Errors that can occur during credential operations
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Vault error: {0}")]
    Vault(String),

    #[error("Credential not found: {0}")]
    NotFound(String),

    #[error("Fallback store error: {0}")]
    Fallback(String),
}

impl From<keyring::Error> for CredentialError {
    fn from(err: keyring::Error) -> Self {
        match err {
            keyring::Error::NoEntry => CredentialError::NotFound("no entry found".to_string()),
            _ => CredentialError::Vault(err.to_string()),
        }
    }
}

impl From<CredentialError> for TideError {
    fn from(err: CredentialError) -> Self {
        TideError::Credential(err.to_string())
    }
}

/// Credential store holding the single mail-account secret
pub struct CredentialStore {
    service: String,
    user: String,
    fallback_path: PathBuf,
}

impl CredentialStore {
    /// Create a credential store for the given vault entry
    pub fn new(service: &str, user: &str) -> Self {
        let fallback_path = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join(FALLBACK_FILE_NAME);
        Self::with_fallback_path(service, user, fallback_path)
    }

    /// Create a credential store with an explicit fallback file location
    pub fn with_fallback_path(service: &str, user: &str, fallback_path: PathBuf) -> Self {
        Self {
            service: service.to_string(),
            user: user.to_string(),
            fallback_path,
        }
    }

    /// Store the secret in the vault, falling back to the encrypted file
    pub fn save(&self, secret: &str) -> Result<(), CredentialError> {
        match Entry::new(&self.service, &self.user).and_then(|e| e.set_password(secret)) {
            Ok(()) => {
                info!("Stored credential for {} in the vault", self.service);
                Ok(())
            }
            Err(err) if cfg!(windows) => Err(err.into()),
            Err(err) => {
                warn!("Vault unavailable ({}), using encrypted fallback file", err);
                self.save_fallback(secret)
            }
        }
    }

    /// Retrieve the secret from the vault or the fallback file
    pub fn get(&self) -> Result<String, CredentialError> {
        match Entry::new(&self.service, &self.user).and_then(|e| e.get_password()) {
            Ok(secret) => {
                debug!("Retrieved credential for {} from the vault", self.service);
                Ok(secret)
            }
            Err(err) if cfg!(windows) => Err(err.into()),
            Err(err) => {
                if self.fallback_path.exists() {
                    self.get_fallback()
                } else {
                    Err(err.into())
                }
            }
        }
    }

    /// Delete the secret from the vault and the fallback file
    pub fn delete(&self) -> Result<(), CredentialError> {
        match Entry::new(&self.service, &self.user).and_then(|e| e.delete_credential()) {
            Ok(()) => {
                let _ = fs::remove_file(&self.fallback_path);
                info!("Deleted credential for {}", self.service);
                Ok(())
            }
            Err(err) if cfg!(windows) => Err(err.into()),
            Err(err) => {
                if self.fallback_path.exists() {
                    self.delete_fallback()
                } else {
                    Err(err.into())
                }
            }
        }
    }

    /// Check if a secret exists in either location
    pub fn exists(&self) -> bool {
        self.get().is_ok()
    }

    // ========================================================================
    // Encrypted fallback file
    // ========================================================================

    /// Stable machine identifier used as the fallback encryption password
    fn machine_key() -> Result<String, CredentialError> {
        machine_uid::get()
            .map_err(|e| CredentialError::Fallback(format!("failed to read machine id: {}", e)))
    }

    fn save_fallback(&self, secret: &str) -> Result<(), CredentialError> {
        self.save_fallback_with_key(secret, &Self::machine_key()?)
    }

    fn save_fallback_with_key(&self, secret: &str, key: &str) -> Result<(), CredentialError> {
        let blob = crypto::encrypt(secret.as_bytes(), key)
            .map_err(|e| CredentialError::Fallback(e.to_string()))?;

        if let Some(parent) = self.fallback_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| CredentialError::Fallback(format!("create config dir: {}", e)))?;
        }
        fs::write(&self.fallback_path, &blob)
            .map_err(|e| CredentialError::Fallback(format!("write fallback file: {}", e)))?;
        restrict_permissions(&self.fallback_path)
            .map_err(|e| CredentialError::Fallback(format!("set fallback permissions: {}", e)))?;

        info!("Stored credential in fallback file {:?}", self.fallback_path);
        Ok(())
    }

    fn get_fallback(&self) -> Result<String, CredentialError> {
        self.get_fallback_with_key(&Self::machine_key()?)
    }

    fn get_fallback_with_key(&self, key: &str) -> Result<String, CredentialError> {
        let blob = fs::read(&self.fallback_path).map_err(|e| {
            CredentialError::NotFound(format!("fallback file unreadable: {}", e))
        })?;
        let plaintext = crypto::decrypt(&blob, key)
            .map_err(|e| CredentialError::Fallback(e.to_string()))?;
        String::from_utf8(plaintext)
            .map_err(|_| CredentialError::Fallback("decrypted secret is not valid UTF-8".to_string()))
    }

    fn delete_fallback(&self) -> Result<(), CredentialError> {
        fs::remove_file(&self.fallback_path)
            .map_err(|e| CredentialError::Fallback(format!("remove fallback file: {}", e)))?;
        info!("Deleted credential fallback file {:?}", self.fallback_path);
        Ok(())
    }
}

/// Owner-only permissions for the fallback file
#[cfg(unix)]
fn restrict_permissions(path: &std::path::Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &std::path::Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &std::path::Path) -> CredentialStore {
        CredentialStore::with_fallback_path(
            "tide.mail.test",
            "mail-account",
            dir.join(FALLBACK_FILE_NAME),
        )
    }

    #[test]
    fn test_fallback_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        store
            .save_fallback_with_key("mail-secret-123", "machine-a")
            .unwrap();
        let secret = store.get_fallback_with_key("machine-a").unwrap();
        assert_eq!(secret, "mail-secret-123");
    }

    #[test]
    fn test_fallback_is_machine_bound() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        store
            .save_fallback_with_key("mail-secret-123", "machine-a")
            .unwrap();
        assert!(store.get_fallback_with_key("machine-b").is_err());
    }

    #[test]
    fn test_delete_fallback_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());

        store
            .save_fallback_with_key("mail-secret-123", "machine-a")
            .unwrap();
        assert!(store.fallback_path.exists());

        store.delete_fallback().unwrap();
        assert!(!store.fallback_path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_fallback_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store
            .save_fallback_with_key("mail-secret-123", "machine-a")
            .unwrap();

        let mode = fs::metadata(&store.fallback_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
