//! Encrypted configuration backups
//!
//! A backup is a versioned JSON envelope, a flattened snapshot of the
//! configuration plus an optional base64 copy of the mail database,
//! sealed with the password-based cipher from `crypto`. The same file
//! restores a whole installation: settings, credential, and mailbox.

use std::fs;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{Local, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{ConfigStore, Configuration, NetworkPeer, Theme};
use crate::credentials::CredentialStore;
use crate::crypto;
use crate::events::{AppEvent, EventBus};
use crate::types::error::{Result, TideError};

/// Envelope format version; restore rejects anything else
pub const BACKUP_VERSION: &str = "1.0";

/// Conventional backup file extension
pub const BACKUP_EXTENSION: &str = "tb";

/// Minimum backup password length
const MIN_PASSWORD_LEN: usize = 8;

/// Versioned container wrapping one backup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupEnvelope {
    pub version: String,
    pub timestamp: String,
    pub config: BackupConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    pub includes_database: bool,
}

/// Flattened configuration snapshot carried inside the envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    pub peers: Vec<NetworkPeer>,
    pub smtp_address: String,
    pub imap_address: String,
    pub database_path: String,
    pub theme: Theme,
    pub language: String,
    pub auto_start: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Builds and restores encrypted snapshots of the installation
pub struct BackupManager {
    config: Arc<ConfigStore>,
    credentials: Arc<CredentialStore>,
    events: Arc<EventBus>,
}

impl BackupManager {
    pub fn new(
        config: Arc<ConfigStore>,
        credentials: Arc<CredentialStore>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            credentials,
            events,
        }
    }

    /// Conventional file name for a backup created now
    pub fn backup_file_name() -> String {
        format!(
            "tbackup-{}.{}",
            Local::now().format("%d-%m-%y"),
            BACKUP_EXTENSION
        )
    }

    /// Build an encrypted backup of the current installation
    ///
    /// A database that cannot be read does not fail the backup; the
    /// envelope just records that it is not included. A missing stored
    /// credential is tolerated the same way.
    pub fn create_backup(&self, include_database: bool, password: &str) -> Result<Vec<u8>> {
        if password.len() < MIN_PASSWORD_LEN {
            return Err(TideError::InvalidInput(format!(
                "backup password must be at least {} characters",
                MIN_PASSWORD_LEN
            )));
        }

        self.backup_progress(0, "Collecting settings...");
        let snapshot = self.config.snapshot()?;

        let (database, includes_database) = if include_database {
            match fs::read(&snapshot.service_settings.database_path) {
                Ok(bytes) => {
                    self.backup_progress(25, "Copying mail database...");
                    (Some(BASE64.encode(bytes)), true)
                }
                Err(err) => {
                    warn!("Could not read mail database, continuing without it: {}", err);
                    (None, false)
                }
            }
        } else {
            (None, false)
        };

        let credential = self.credentials.get().ok();

        self.backup_progress(50, "Packing settings...");
        let envelope = BackupEnvelope {
            version: BACKUP_VERSION.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            config: BackupConfig {
                peers: snapshot.network_peers,
                smtp_address: snapshot.service_settings.smtp_address,
                imap_address: snapshot.service_settings.imap_address,
                database_path: snapshot
                    .service_settings
                    .database_path
                    .to_string_lossy()
                    .into_owned(),
                theme: snapshot.ui_preferences.theme,
                language: snapshot.ui_preferences.language,
                auto_start: snapshot.ui_preferences.auto_start,
                credential,
            },
            database,
            includes_database,
        };

        let serialized = serde_json::to_vec(&envelope)?;
        self.backup_progress(75, "Encrypting backup...");
        let sealed = crypto::encrypt(&serialized, password)?;

        self.backup_progress(100, "Backup ready");
        info!(
            "Created backup ({} bytes, database included: {})",
            sealed.len(),
            includes_database
        );
        Ok(sealed)
    }

    /// Decrypt and unpack a backup
    ///
    /// Returns the rehydrated configuration and the raw database bytes
    /// if the backup carried them. The configuration still points at
    /// the backed-up database path; [`BackupManager::apply_restore`]
    /// substitutes the current one.
    pub fn restore_backup(
        &self,
        data: &[u8],
        password: &str,
    ) -> Result<(Configuration, Option<Vec<u8>>)> {
        self.restore_progress(0, "Decrypting backup...");
        let plaintext = crypto::decrypt(data, password)?;

        let envelope: BackupEnvelope = serde_json::from_slice(&plaintext)?;
        if envelope.version != BACKUP_VERSION {
            return Err(TideError::VersionMismatch(envelope.version));
        }

        self.restore_progress(25, "Restoring settings...");
        let mut config = Configuration::default();
        config.network_peers = envelope.config.peers;
        config.service_settings.smtp_address = envelope.config.smtp_address;
        config.service_settings.imap_address = envelope.config.imap_address;
        config.service_settings.database_path = envelope.config.database_path.into();
        config.ui_preferences.theme = envelope.config.theme;
        config.ui_preferences.language = envelope.config.language;
        config.ui_preferences.auto_start = envelope.config.auto_start;
        config.apply_defaults();

        if let Some(secret) = &envelope.config.credential {
            if let Err(err) = self.credentials.save(secret) {
                warn!("Could not restore credential, continuing: {}", err);
            }
        }

        let database = envelope
            .database
            .map(|blob| BASE64.decode(blob))
            .transpose()
            .map_err(|e| TideError::Parse(format!("invalid database blob: {}", e)))?;

        self.restore_progress(50, "Backup unpacked");
        Ok((config, database))
    }

    /// Apply a restored configuration and database to this installation
    ///
    /// Sequencing is load-bearing: the current database path is
    /// substituted first, the database bytes hit the disk before the
    /// configuration is persisted, and onboarding is marked complete
    /// only at the very end. A crash mid-restore then leaves the old
    /// configuration pointing at a self-consistent database.
    pub fn apply_restore(
        &self,
        restored: Configuration,
        database: Option<Vec<u8>>,
    ) -> Result<()> {
        let result = self.apply_restore_inner(restored, database);
        self.events.emit(AppEvent::ConfigRestored {
            success: result.is_ok(),
        });
        result
    }

    fn apply_restore_inner(
        &self,
        mut restored: Configuration,
        database: Option<Vec<u8>>,
    ) -> Result<()> {
        let current = self.config.service_settings()?;
        restored.service_settings.database_path = current.database_path.clone();

        if let Some(bytes) = database {
            self.restore_progress(60, "Writing mail database...");
            if let Some(parent) = current.database_path.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| TideError::Io(format!("create database dir: {}", e)))?;
            }
            fs::write(&current.database_path, &bytes)
                .map_err(|e| TideError::Io(format!("write database: {}", e)))?;
        }

        self.restore_progress(80, "Saving configuration...");
        self.config.replace(restored)?;
        self.config.save()?;
        // Reload what was actually persisted so memory and disk agree
        self.config.reload()?;

        self.config.set_onboarding_complete(true)?;
        self.config.save()?;

        self.restore_progress(100, "Restore complete");
        info!("Restore applied");
        Ok(())
    }

    fn backup_progress(&self, progress: u8, message: &str) {
        self.events.emit(AppEvent::BackupProgress {
            progress,
            message: message.to_string(),
        });
    }

    fn restore_progress(&self, progress: u8, message: &str) {
        self.events.emit(AppEvent::RestoreProgress {
            progress,
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn manager_in(dir: &Path) -> (BackupManager, Arc<ConfigStore>, Arc<EventBus>) {
        let config = Arc::new(ConfigStore::load_from(dir.join("config.toml")).unwrap());
        config.set_database_path(dir.join("mailbox.db")).unwrap();
        let credentials = Arc::new(CredentialStore::with_fallback_path(
            "tide.mail.test",
            "mail-account",
            dir.join("credentials.enc"),
        ));
        let events = Arc::new(EventBus::new());
        (
            BackupManager::new(config.clone(), credentials, events.clone()),
            config,
            events,
        )
    }

    #[test]
    fn test_backup_restore_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, config, _) = manager_in(dir.path());

        config.add_peer("quic://peer.example.net:4433").unwrap();
        config.disable_peer("tls://relay2.tidemail.net:443").unwrap();
        config.set_theme(Theme::Dark).unwrap();
        config.set_language("de").unwrap();
        config.set_auto_start(true).unwrap();

        let sealed = manager.create_backup(false, "long enough password").unwrap();
        let (restored, database) = manager
            .restore_backup(&sealed, "long enough password")
            .unwrap();

        assert!(database.is_none());
        assert_eq!(restored.network_peers, config.peers().unwrap());
        assert_eq!(restored.ui_preferences.theme, Theme::Dark);
        assert_eq!(restored.ui_preferences.language, "de");
        assert!(restored.ui_preferences.auto_start);
    }

    #[test]
    fn test_backup_includes_database_bytes_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _config, _) = manager_in(dir.path());

        let db_bytes: Vec<u8> = (0u16..2048).map(|i| (i % 251) as u8).collect();
        fs::write(dir.path().join("mailbox.db"), &db_bytes).unwrap();

        let sealed = manager.create_backup(true, "long enough password").unwrap();
        let (_, database) = manager
            .restore_backup(&sealed, "long enough password")
            .unwrap();

        assert_eq!(database.unwrap(), db_bytes);
    }

    #[test]
    fn test_unreadable_database_degrades_gracefully() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _, _) = manager_in(dir.path());

        // No mailbox.db on disk
        let sealed = manager.create_backup(true, "long enough password").unwrap();
        let (_, database) = manager
            .restore_backup(&sealed, "long enough password")
            .unwrap();
        assert!(database.is_none());
    }

    #[test]
    fn test_short_password_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _, _) = manager_in(dir.path());

        assert!(matches!(
            manager.create_backup(false, "short"),
            Err(TideError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_wrong_password_is_one_error_class() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _, _) = manager_in(dir.path());

        let sealed = manager.create_backup(false, "long enough password").unwrap();

        // Wrong password and corruption must be indistinguishable
        let err = manager.restore_backup(&sealed, "another password").unwrap_err();
        assert_eq!(err, TideError::Crypto);

        let mut corrupted = sealed.clone();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0x01;
        let err = manager
            .restore_backup(&corrupted, "long enough password")
            .unwrap_err();
        assert_eq!(err, TideError::Crypto);
    }

    #[test]
    fn test_version_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _, _) = manager_in(dir.path());

        let envelope = BackupEnvelope {
            version: "0.9".to_string(),
            timestamp: Utc::now().to_rfc3339(),
            config: BackupConfig {
                peers: vec![],
                smtp_address: "127.0.0.1:1025".to_string(),
                imap_address: "127.0.0.1:1143".to_string(),
                database_path: "mailbox.db".to_string(),
                theme: Theme::System,
                language: "en".to_string(),
                auto_start: false,
                credential: None,
            },
            database: None,
            includes_database: false,
        };
        let sealed = crypto::encrypt(
            &serde_json::to_vec(&envelope).unwrap(),
            "long enough password",
        )
        .unwrap();

        let err = manager
            .restore_backup(&sealed, "long enough password")
            .unwrap_err();
        assert!(matches!(err, TideError::VersionMismatch(v) if v == "0.9"));
    }

    #[test]
    fn test_apply_restore_lands_at_current_database_path() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, config, _) = manager_in(dir.path());

        let mut restored = Configuration::default();
        // The backed-up install kept its database somewhere else
        restored.service_settings.database_path = "/somewhere/else/mailbox.db".into();
        restored.ui_preferences.language = "fr".to_string();
        restored.apply_defaults();

        let db_bytes = b"restored mailbox".to_vec();
        manager.apply_restore(restored, Some(db_bytes.clone())).unwrap();

        let current = dir.path().join("mailbox.db");
        assert_eq!(fs::read(current).unwrap(), db_bytes);

        let settings = config.service_settings().unwrap();
        assert_eq!(settings.database_path, dir.path().join("mailbox.db"));
        assert!(config.onboarding_complete().unwrap());
        assert_eq!(config.language().unwrap(), "fr");
    }

    #[test]
    fn test_progress_events_reach_the_bus() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _, events) = manager_in(dir.path());
        let rx = events.subscribe();

        manager.create_backup(false, "long enough password").unwrap();

        let mut kinds = Vec::new();
        let mut final_progress = 0;
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.kind());
            if let AppEvent::BackupProgress { progress, .. } = event {
                final_progress = progress;
            }
        }
        assert!(kinds.contains(&"backup:progress"));
        assert_eq!(final_progress, 100);
    }

    #[test]
    fn test_backup_file_name_convention() {
        let name = BackupManager::backup_file_name();
        assert!(name.starts_with("tbackup-"));
        assert!(name.ends_with(".tb"));
        // tbackup-DD-MM-YY.tb
        assert_eq!(name.len(), "tbackup-00-00-00.tb".len());
    }

    #[test]
    fn test_restored_config_is_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _, _) = manager_in(dir.path());

        // An empty peer list inside the envelope is refilled on restore
        let envelope = BackupEnvelope {
            version: BACKUP_VERSION.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            config: BackupConfig {
                peers: vec![],
                smtp_address: "127.0.0.1:1025".to_string(),
                imap_address: "127.0.0.1:1143".to_string(),
                database_path: "mailbox.db".to_string(),
                theme: Theme::Light,
                language: String::new(),
                auto_start: false,
                credential: None,
            },
            database: None,
            includes_database: false,
        };
        let sealed = crypto::encrypt(
            &serde_json::to_vec(&envelope).unwrap(),
            "long enough password",
        )
        .unwrap();

        let (restored, _) = manager
            .restore_backup(&sealed, "long enough password")
            .unwrap();
        assert!(!restored.network_peers.is_empty());
        assert_eq!(restored.ui_preferences.language, "en");
        // The discovery cache never travels in a backup
        assert!(restored.cached_discovered_peers.is_empty());
    }
}
