//! Mail engine control surface
//!
//! The actual mail engine (message storage, the IMAP/SMTP bridge, and
//! the overlay network transport) ships outside this crate. The
//! coordinator drives it through [`MailEngine`] and receives its three
//! push-style event streams over bounded channels, so shells and tests
//! plug in their own implementations through an [`EngineFactory`].

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use flume::Receiver;
use serde::{Deserialize, Serialize};

use crate::types::error::Result;

/// Per-handle buffer size for each engine event stream
pub const ENGINE_EVENT_BUFFER: usize = 64;

/// Settings an engine handle is bound to at construction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineSettings {
    pub database_path: PathBuf,
    pub smtp_address: String,
    pub imap_address: String,
}

/// Engine-reported health
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EngineStatus {
    Stopped,
    Starting,
    Running,
    Failed,
}

/// Per-peer connection statistics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerStat {
    pub address: String,
    pub connected: bool,
    pub rtt_ms: Option<u64>,
}

/// One line of engine-internal logging
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEvent {
    pub level: String,
    pub message: String,
}

/// Notification of newly arrived mail
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MailEvent {
    pub from: String,
    pub subject: String,
}

/// Overlay connection state change
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionEvent {
    pub peer: String,
    pub connected: bool,
}

/// Receivers for the engine's push-style event streams
pub struct EngineEvents {
    pub log: Receiver<LogEvent>,
    pub mail: Receiver<MailEvent>,
    pub connection: Receiver<ConnectionEvent>,
}

/// Control surface consumed from the external mail engine
#[async_trait]
pub trait MailEngine: Send + Sync {
    /// Prepare the engine (open the database, bind the bridge ports)
    async fn initialize(&self) -> Result<()>;

    /// Start the engine with the given overlay peers
    ///
    /// An empty peer list is valid and means local-only mode.
    async fn start(&self, peers: &[String]) -> Result<()>;

    /// Stop the engine
    async fn stop(&self) -> Result<()>;

    /// Release the handle; the engine must not be used afterwards
    async fn close(&self) -> Result<()>;

    /// Set the mail-account password
    async fn set_password(&self, secret: &str) -> Result<()>;

    /// Replace the active overlay peer set
    async fn update_peers(&self, peers: &[String]) -> Result<()>;

    /// Apply the outgoing message size limit
    async fn set_max_message_size_mb(&self, limit: u32) -> Result<()>;

    /// Current engine-reported health
    fn status(&self) -> EngineStatus;

    /// The account's mail address
    fn mail_address(&self) -> String;

    /// Connection statistics for the active peer set
    async fn peer_stats(&self) -> Result<Vec<PeerStat>>;

    /// Subscribe to the engine's event streams
    fn events(&self) -> EngineEvents;
}

/// Builds a fresh engine handle bound to the given settings
pub type EngineFactory = Arc<dyn Fn(EngineSettings) -> Result<Arc<dyn MailEngine>> + Send + Sync>;

#[cfg(test)]
pub(crate) mod mock {
    //! In-process engine double for lifecycle tests

    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    use flume::Sender;

    /// Shared behavior knobs and call counters for every `MockEngine`
    /// built by one [`mock_factory`]
    #[derive(Default)]
    pub struct MockState {
        pub init_count: AtomicU32,
        pub start_count: AtomicU32,
        pub stop_count: AtomicU32,
        pub close_count: AtomicU32,
        pub max_message_size: AtomicU32,
        /// When set, `status()` reports `Failed`
        pub fail_status: AtomicBool,
        pub password: Mutex<Option<String>>,
        pub last_peers: Mutex<Vec<String>>,
        /// Sender of the most recently built engine's log stream
        pub log_tx: Mutex<Option<Sender<LogEvent>>>,
    }

    pub struct MockEngine {
        state: Arc<MockState>,
        running: AtomicBool,
        log_rx: Receiver<LogEvent>,
        mail_rx: Receiver<MailEvent>,
        connection_rx: Receiver<ConnectionEvent>,
        _mail_tx: Sender<MailEvent>,
        _connection_tx: Sender<ConnectionEvent>,
    }

    impl MockEngine {
        pub fn new(state: Arc<MockState>) -> Self {
            let (log_tx, log_rx) = flume::bounded(ENGINE_EVENT_BUFFER);
            let (mail_tx, mail_rx) = flume::bounded(ENGINE_EVENT_BUFFER);
            let (connection_tx, connection_rx) = flume::bounded(ENGINE_EVENT_BUFFER);
            *state.log_tx.lock().unwrap() = Some(log_tx);
            Self {
                state,
                running: AtomicBool::new(false),
                log_rx,
                mail_rx,
                connection_rx,
                _mail_tx: mail_tx,
                _connection_tx: connection_tx,
            }
        }
    }

    #[async_trait]
    impl MailEngine for MockEngine {
        async fn initialize(&self) -> Result<()> {
            self.state.init_count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn start(&self, peers: &[String]) -> Result<()> {
            self.state.start_count.fetch_add(1, Ordering::SeqCst);
            *self.state.last_peers.lock().unwrap() = peers.to_vec();
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.state.stop_count.fetch_add(1, Ordering::SeqCst);
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.state.close_count.fetch_add(1, Ordering::SeqCst);
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn set_password(&self, secret: &str) -> Result<()> {
            *self.state.password.lock().unwrap() = Some(secret.to_string());
            Ok(())
        }

        async fn update_peers(&self, peers: &[String]) -> Result<()> {
            *self.state.last_peers.lock().unwrap() = peers.to_vec();
            Ok(())
        }

        async fn set_max_message_size_mb(&self, limit: u32) -> Result<()> {
            self.state.max_message_size.store(limit, Ordering::SeqCst);
            Ok(())
        }

        fn status(&self) -> EngineStatus {
            if self.state.fail_status.load(Ordering::SeqCst) {
                EngineStatus::Failed
            } else if self.running.load(Ordering::SeqCst) {
                EngineStatus::Running
            } else {
                EngineStatus::Stopped
            }
        }

        fn mail_address(&self) -> String {
            "user@tidemail.local".to_string()
        }

        async fn peer_stats(&self) -> Result<Vec<PeerStat>> {
            Ok(self
                .state
                .last_peers
                .lock()
                .unwrap()
                .iter()
                .map(|address| PeerStat {
                    address: address.clone(),
                    connected: self.running.load(Ordering::SeqCst),
                    rtt_ms: None,
                })
                .collect())
        }

        fn events(&self) -> EngineEvents {
            EngineEvents {
                log: self.log_rx.clone(),
                mail: self.mail_rx.clone(),
                connection: self.connection_rx.clone(),
            }
        }
    }

    /// Factory handing every built engine the same shared [`MockState`]
    pub fn mock_factory(state: Arc<MockState>) -> EngineFactory {
        Arc::new(move |_settings| Ok(Arc::new(MockEngine::new(state.clone())) as Arc<dyn MailEngine>))
    }
}
