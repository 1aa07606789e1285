//! Application configuration management
//!
//! The single durable record of user settings: engine addresses, the
//! ordered overlay peer list, UI preferences, and the discovered-peer
//! cache. Stored as a human-editable TOML file with owner-only
//! permissions. All access goes through [`ConfigStore`], which guards
//! the record with a reader/writer lock; mutation and persistence are
//! separate steps, so callers decide when to hit the disk.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use crate::types::error::{Result, TideError};

/// Directory name under the platform config/data dirs
pub(crate) const APP_DIR: &str = "tidemail";

/// Config file name inside the app config directory
const CONFIG_FILE_NAME: &str = "config.toml";

/// Window dimension bounds applied on load and on every explicit save
const MIN_WINDOW_WIDTH: u32 = 640;
const MIN_WINDOW_HEIGHT: u32 = 480;
const MAX_WINDOW_WIDTH: u32 = 7680;
const MAX_WINDOW_HEIGHT: u32 = 4320;

/// Validity window for cached peer-discovery results
const DISCOVERY_CACHE_TTL_SECS: i64 = 24 * 60 * 60;

/// URI schemes accepted for overlay peer addresses
const PEER_SCHEMES: &[&str] = &["tls", "quic", "ws", "wss"];

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Configuration {
    /// Whether initial account setup has finished
    pub onboarding_complete: bool,

    /// Mail engine connection settings
    pub service_settings: ServiceSettings,

    /// Ordered overlay peer list; insertion order is user-visible
    pub network_peers: Vec<NetworkPeer>,

    /// UI preferences persisted for the shell
    pub ui_preferences: UiPreferences,

    /// Last peer-discovery results, valid for 24 hours
    pub cached_discovered_peers: Vec<DiscoveredPeer>,

    /// Unix seconds of the last discovery run; 0 means never
    pub cache_timestamp: i64,
}

/// Mail engine connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceSettings {
    /// Local SMTP bridge address
    pub smtp_address: String,

    /// Local IMAP bridge address
    pub imap_address: String,

    /// Mail database file used by the engine
    pub database_path: PathBuf,

    /// Maximum outgoing message size passed to the engine
    pub max_message_size_mb: u32,

    /// Whether the engine has been seeded with the stored credential
    pub password_initialized: bool,
}

/// A single overlay peer entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkPeer {
    pub address: String,
    pub enabled: bool,
}

/// A peer candidate returned by discovery
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveredPeer {
    pub address: String,
    pub rtt_ms: Option<u64>,
}

/// UI preferences persisted for the shell
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UiPreferences {
    pub theme: Theme,
    pub language: String,
    pub auto_start: bool,
    pub window_state: WindowState,
}

/// Color scheme selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    Dark,
    System,
}

/// Persisted window geometry; `-1` for `x`/`y` means "center on screen"
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WindowState {
    pub width: u32,
    pub height: u32,
    pub x: i32,
    pub y: i32,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            onboarding_complete: false,
            service_settings: ServiceSettings::default(),
            network_peers: default_network_peers(),
            ui_preferences: UiPreferences::default(),
            cached_discovered_peers: Vec::new(),
            cache_timestamp: 0,
        }
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            smtp_address: "127.0.0.1:1025".to_string(),
            imap_address: "127.0.0.1:1143".to_string(),
            database_path: default_database_path(),
            max_message_size_mb: 25,
            password_initialized: false,
        }
    }
}

impl Default for UiPreferences {
    fn default() -> Self {
        Self {
            theme: Theme::System,
            language: "en".to_string(),
            auto_start: false,
            window_state: WindowState::default(),
        }
    }
}

impl Default for Theme {
    fn default() -> Self {
        Theme::System
    }
}

impl Default for WindowState {
    fn default() -> Self {
        Self {
            width: 1200,
            height: 800,
            x: -1,
            y: -1,
        }
    }
}

fn default_network_peers() -> Vec<NetworkPeer> {
    vec![
        NetworkPeer {
            address: "tls://relay1.tidemail.net:443".to_string(),
            enabled: true,
        },
        NetworkPeer {
            address: "tls://relay2.tidemail.net:443".to_string(),
            enabled: true,
        },
    ]
}

fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("mailbox.db")
}

impl Configuration {
    /// Normalize a parsed or rehydrated record
    ///
    /// Fills anything an older or hand-edited file may lack: the peer
    /// list is never left empty, window dimensions are clamped into
    /// bounds, and the language falls back to the default. Peer
    /// addresses are deliberately not re-validated here so a
    /// hand-edited file still loads.
    pub(crate) fn apply_defaults(&mut self) {
        if self.network_peers.is_empty() {
            self.network_peers = default_network_peers();
        }
        if self.ui_preferences.language.is_empty() {
            self.ui_preferences.language = "en".to_string();
        }
        let ws = &mut self.ui_preferences.window_state;
        ws.width = ws.width.clamp(MIN_WINDOW_WIDTH, MAX_WINDOW_WIDTH);
        ws.height = ws.height.clamp(MIN_WINDOW_HEIGHT, MAX_WINDOW_HEIGHT);
        ws.x = ws.x.max(-1);
        ws.y = ws.y.max(-1);
    }
}

/// Validate an overlay peer address against the accepted URI grammars
fn validate_peer_address(address: &str) -> Result<()> {
    let parsed = Url::parse(address)
        .map_err(|e| TideError::InvalidInput(format!("invalid peer address '{}': {}", address, e)))?;
    if !PEER_SCHEMES.contains(&parsed.scheme()) {
        return Err(TideError::InvalidInput(format!(
            "unsupported peer scheme '{}', expected one of {:?}",
            parsed.scheme(),
            PEER_SCHEMES
        )));
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(TideError::InvalidInput(format!(
            "peer address '{}' has no host",
            address
        )));
    }
    if parsed.port_or_known_default().is_none() {
        return Err(TideError::InvalidInput(format!(
            "peer address '{}' has no port",
            address
        )));
    }
    Ok(())
}

/// Thread-safe owner of the durable configuration record
pub struct ConfigStore {
    inner: RwLock<Configuration>,
    path: PathBuf,
}

impl ConfigStore {
    /// Default config file location under the platform config directory
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join(CONFIG_FILE_NAME)
    }

    /// Load the configuration from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(Self::default_path())
    }

    /// Load the configuration from an explicit path
    ///
    /// A missing file is not an error: defaults are synthesized and
    /// persisted immediately so the file exists from first run on.
    pub fn load_from(path: PathBuf) -> Result<Self> {
        let config = if path.exists() {
            let content = fs::read_to_string(&path)
                .map_err(|e| TideError::Config(format!("failed to read config: {}", e)))?;
            let mut config: Configuration = toml::from_str(&content)?;
            config.apply_defaults();
            config
        } else {
            info!("No config file at {:?}, writing defaults", path);
            let mut config = Configuration::default();
            config.apply_defaults();
            Self::persist(&path, &config)?;
            config
        };

        Ok(Self {
            inner: RwLock::new(config),
            path,
        })
    }

    /// Persist the in-memory record to disk
    pub fn save(&self) -> Result<()> {
        let snapshot = self.read()?.clone();
        Self::persist(&self.path, &snapshot)
    }

    /// Re-read the persisted file, discarding in-memory state
    pub fn reload(&self) -> Result<()> {
        let content = fs::read_to_string(&self.path)
            .map_err(|e| TideError::Config(format!("failed to read config: {}", e)))?;
        let mut config: Configuration = toml::from_str(&content)?;
        config.apply_defaults();
        *self.write()? = config;
        Ok(())
    }

    /// Clone of the full record
    pub fn snapshot(&self) -> Result<Configuration> {
        Ok(self.read()?.clone())
    }

    /// Swap in a new record (does not persist)
    pub(crate) fn replace(&self, config: Configuration) -> Result<()> {
        *self.write()? = config;
        Ok(())
    }

    fn persist(path: &Path, config: &Configuration) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| TideError::Io(format!("create config dir: {}", e)))?;
        }
        let content = toml::to_string_pretty(config)?;
        fs::write(path, content).map_err(|e| TideError::Io(format!("write config: {}", e)))?;
        restrict_permissions(path).map_err(|e| TideError::Io(format!("chmod config: {}", e)))?;
        Ok(())
    }

    // ========================================================================
    // Peer list
    // ========================================================================

    /// Add an overlay peer, enabled
    ///
    /// Re-adding an existing address is not an error: a disabled entry
    /// is re-enabled, an enabled one is left untouched.
    pub fn add_peer(&self, address: &str) -> Result<()> {
        validate_peer_address(address)?;
        let mut config = self.write()?;
        if let Some(peer) = config.network_peers.iter_mut().find(|p| p.address == address) {
            peer.enabled = true;
            return Ok(());
        }
        config.network_peers.push(NetworkPeer {
            address: address.to_string(),
            enabled: true,
        });
        Ok(())
    }

    /// Remove a peer by address
    pub fn remove_peer(&self, address: &str) -> Result<()> {
        let mut config = self.write()?;
        let idx = config
            .network_peers
            .iter()
            .position(|p| p.address == address)
            .ok_or_else(|| TideError::PeerNotFound(address.to_string()))?;
        config.network_peers.remove(idx);
        Ok(())
    }

    pub fn enable_peer(&self, address: &str) -> Result<()> {
        self.set_peer_enabled(address, true)
    }

    pub fn disable_peer(&self, address: &str) -> Result<()> {
        self.set_peer_enabled(address, false)
    }

    fn set_peer_enabled(&self, address: &str, enabled: bool) -> Result<()> {
        let mut config = self.write()?;
        let peer = config
            .network_peers
            .iter_mut()
            .find(|p| p.address == address)
            .ok_or_else(|| TideError::PeerNotFound(address.to_string()))?;
        peer.enabled = enabled;
        Ok(())
    }

    /// Addresses of enabled peers, in insertion order
    pub fn enabled_peers(&self) -> Result<Vec<String>> {
        let config = self.read()?;
        Ok(config
            .network_peers
            .iter()
            .filter(|p| p.enabled)
            .map(|p| p.address.clone())
            .collect())
    }

    /// Snapshot of the full peer list
    pub fn peers(&self) -> Result<Vec<NetworkPeer>> {
        Ok(self.read()?.network_peers.clone())
    }

    // ========================================================================
    // Discovered-peer cache
    // ========================================================================

    /// Replace the discovery cache and stamp it with the current time
    pub fn cache_discovered_peers(&self, peers: Vec<DiscoveredPeer>) -> Result<()> {
        let mut config = self.write()?;
        config.cached_discovered_peers = peers;
        config.cache_timestamp = Utc::now().timestamp();
        Ok(())
    }

    /// Cached discovery results, or empty once older than 24 hours
    ///
    /// Stale entries stay on disk until explicitly cleared; they are
    /// just never handed out.
    pub fn cached_discovered_peers(&self) -> Result<Vec<DiscoveredPeer>> {
        let config = self.read()?;
        if config.cache_timestamp == 0 {
            return Ok(Vec::new());
        }
        let age = Utc::now().timestamp() - config.cache_timestamp;
        if age >= DISCOVERY_CACHE_TTL_SECS {
            return Ok(Vec::new());
        }
        Ok(config.cached_discovered_peers.clone())
    }

    pub fn clear_cached_discovered_peers(&self) -> Result<()> {
        let mut config = self.write()?;
        config.cached_discovered_peers.clear();
        config.cache_timestamp = 0;
        Ok(())
    }

    // ========================================================================
    // Window state and UI preferences
    // ========================================================================

    /// Store window geometry, clamped into the supported bounds
    pub fn save_window_state(&self, width: u32, height: u32, x: i32, y: i32) -> Result<()> {
        let mut config = self.write()?;
        let ws = &mut config.ui_preferences.window_state;
        ws.width = width.clamp(MIN_WINDOW_WIDTH, MAX_WINDOW_WIDTH);
        ws.height = height.clamp(MIN_WINDOW_HEIGHT, MAX_WINDOW_HEIGHT);
        // -1 stays as the "center on screen" sentinel
        ws.x = x.max(-1);
        ws.y = y.max(-1);
        Ok(())
    }

    pub fn window_state(&self) -> Result<WindowState> {
        Ok(self.read()?.ui_preferences.window_state)
    }

    pub fn theme(&self) -> Result<Theme> {
        Ok(self.read()?.ui_preferences.theme)
    }

    pub fn set_theme(&self, theme: Theme) -> Result<()> {
        self.write()?.ui_preferences.theme = theme;
        Ok(())
    }

    pub fn language(&self) -> Result<String> {
        Ok(self.read()?.ui_preferences.language.clone())
    }

    pub fn set_language(&self, language: &str) -> Result<()> {
        if language.is_empty() {
            return Err(TideError::InvalidInput("language must not be empty".to_string()));
        }
        self.write()?.ui_preferences.language = language.to_string();
        Ok(())
    }

    pub fn auto_start(&self) -> Result<bool> {
        Ok(self.read()?.ui_preferences.auto_start)
    }

    pub fn set_auto_start(&self, auto_start: bool) -> Result<()> {
        self.write()?.ui_preferences.auto_start = auto_start;
        Ok(())
    }

    // ========================================================================
    // Service settings and onboarding
    // ========================================================================

    pub fn service_settings(&self) -> Result<ServiceSettings> {
        Ok(self.read()?.service_settings.clone())
    }

    pub fn set_database_path(&self, path: PathBuf) -> Result<()> {
        self.write()?.service_settings.database_path = path;
        Ok(())
    }

    pub fn onboarding_complete(&self) -> Result<bool> {
        Ok(self.read()?.onboarding_complete)
    }

    pub fn set_onboarding_complete(&self, complete: bool) -> Result<()> {
        self.write()?.onboarding_complete = complete;
        Ok(())
    }

    pub fn password_initialized(&self) -> Result<bool> {
        Ok(self.read()?.service_settings.password_initialized)
    }

    /// Flip the password-initialized flag and persist it immediately
    ///
    /// The flag guards a one-time engine seeding, so it must survive a
    /// crash right after the seed call.
    pub fn mark_password_initialized(&self) -> Result<()> {
        self.write()?.service_settings.password_initialized = true;
        self.save()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Configuration>> {
        self.inner
            .read()
            .map_err(|_| TideError::Config("configuration lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Configuration>> {
        self.inner
            .write()
            .map_err(|_| TideError::Config("configuration lock poisoned".to_string()))
    }

    #[cfg(test)]
    fn set_cache_timestamp(&self, timestamp: i64) {
        self.inner.write().unwrap().cache_timestamp = timestamp;
    }
}

/// Owner-only permissions for the config file
#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
