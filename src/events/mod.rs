//! Application event channels
//!
//! Everything the shell needs to observe (engine log/mail/connection
//! traffic, service status transitions, backup and restore progress)
//! flows through one bounded bus. Sends never block: a full buffer
//! drops the event, because every event kind here is latest-value-wins
//! and a slow consumer must not stall the service.

use flume::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::{ConnectionEvent, LogEvent, MailEvent};
use crate::service::ServiceStatus;

/// Bus buffer size
const EVENT_BUFFER: usize = 256;

/// Event published to shell consumers
///
/// The `kind()` strings are a fixed contract with UI consumers; do not
/// rename them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "payload")]
pub enum AppEvent {
    ServiceLog(LogEvent),
    ServiceMail(MailEvent),
    ServiceConnection(ConnectionEvent),
    ServiceStatus { status: ServiceStatus },
    BackupProgress { progress: u8, message: String },
    RestoreProgress { progress: u8, message: String },
    ConfigRestored { success: bool },
}

impl AppEvent {
    /// Machine-friendly discriminator for shell consumers
    pub fn kind(&self) -> &'static str {
        match self {
            AppEvent::ServiceLog(_) => "service:log",
            AppEvent::ServiceMail(_) => "service:mail",
            AppEvent::ServiceConnection(_) => "service:connection",
            AppEvent::ServiceStatus { .. } => "service:status",
            AppEvent::BackupProgress { .. } => "backup:progress",
            AppEvent::RestoreProgress { .. } => "restore:progress",
            AppEvent::ConfigRestored { .. } => "config:restored",
        }
    }
}

/// Bounded, non-blocking event bus
pub struct EventBus {
    tx: Sender<AppEvent>,
    rx: Receiver<AppEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_BUFFER)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = flume::bounded(capacity);
        Self { tx, rx }
    }

    /// Publish an event without blocking; drops on a full buffer
    pub fn emit(&self, event: AppEvent) {
        if let Err(TrySendError::Full(event)) = self.tx.try_send(event) {
            debug!("event buffer full, dropping {}", event.kind());
        }
    }

    /// Subscribe to the bus
    ///
    /// The bus is a queue, not a broadcast: with several receivers,
    /// each event is consumed by exactly one of them. The shell is
    /// expected to run a single consumer task.
    pub fn subscribe(&self) -> Receiver<AppEvent> {
        self.rx.clone()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
