//! Service lifecycle coordination
//!
//! [`ServiceManager`] owns the external mail engine handle and the
//! autoconfig responder. It drives the
//! `Stopped -> Starting -> Running -> Stopping -> Stopped` state
//! machine (with `Error` reachable from any active state), republishes
//! the engine's event streams on the application bus, and runs a
//! background monitor that auto-restarts a failed engine with bounded
//! backoff.
//!
//! Locking rule: no lock is ever held across a call into the engine.
//! State is snapshotted under the lock, the engine is called, and the
//! result is committed under the lock again.

mod autoconfig;
mod restart;

pub use autoconfig::{AutoconfigResponder, DEFAULT_AUTOCONFIG_PORT};
pub use restart::RestartPolicy;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ConfigStore;
use crate::credentials::CredentialStore;
use crate::engine::{EngineEvents, EngineFactory, EngineSettings, EngineStatus, MailEngine, PeerStat};
use crate::events::{AppEvent, EventBus};
use crate::types::error::{Result, TideError};

/// Poll interval of the background status monitor
pub const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Grace period between dropping peers and stopping during a soft stop
const SOFT_STOP_GRACE: Duration = Duration::from_secs(2);

/// Settle delay between stop and re-initialize during a restart
const RESTART_GRACE: Duration = Duration::from_millis(500);

/// Bounded wait for "engine fully stopped" during a restart
const STOP_WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const STOP_WAIT_POLL: Duration = Duration::from_millis(100);

/// Coordinator-reported service state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

/// Tunables for the coordinator
pub struct ServiceOptions {
    pub autoconfig_port: u16,
    pub poll_interval: Duration,
    pub soft_stop_grace: Duration,
    pub restart_policy: RestartPolicy,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            autoconfig_port: DEFAULT_AUTOCONFIG_PORT,
            poll_interval: STATUS_POLL_INTERVAL,
            soft_stop_grace: SOFT_STOP_GRACE,
            restart_policy: RestartPolicy::default(),
        }
    }
}

struct ManagerState {
    status: ServiceStatus,
    running: bool,
}

/// Owns the engine handle and supervises its lifecycle
pub struct ServiceManager {
    config: Arc<ConfigStore>,
    credentials: Arc<CredentialStore>,
    events: Arc<EventBus>,
    engine_factory: EngineFactory,

    state: RwLock<ManagerState>,
    engine: RwLock<Option<Arc<dyn MailEngine>>>,
    responder: AsyncMutex<Option<AutoconfigResponder>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    monitor_shutdown: Mutex<Option<watch::Sender<bool>>>,
    restart_policy: Mutex<RestartPolicy>,

    /// One-way latch; once set, no state transition is allowed
    shutdown: AtomicBool,
    auto_restart: AtomicBool,

    autoconfig_port: u16,
    poll_interval: Duration,
    soft_stop_grace: Duration,
}

impl ServiceManager {
    pub fn new(
        config: Arc<ConfigStore>,
        credentials: Arc<CredentialStore>,
        events: Arc<EventBus>,
        engine_factory: EngineFactory,
    ) -> Arc<Self> {
        Self::with_options(config, credentials, events, engine_factory, ServiceOptions::default())
    }

    pub fn with_options(
        config: Arc<ConfigStore>,
        credentials: Arc<CredentialStore>,
        events: Arc<EventBus>,
        engine_factory: EngineFactory,
        options: ServiceOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            credentials,
            events,
            engine_factory,
            state: RwLock::new(ManagerState {
                status: ServiceStatus::Stopped,
                running: false,
            }),
            engine: RwLock::new(None),
            responder: AsyncMutex::new(None),
            monitor: Mutex::new(None),
            monitor_shutdown: Mutex::new(None),
            restart_policy: Mutex::new(options.restart_policy),
            shutdown: AtomicBool::new(false),
            auto_restart: AtomicBool::new(true),
            autoconfig_port: options.autoconfig_port,
            poll_interval: options.poll_interval,
            soft_stop_grace: options.soft_stop_grace,
        })
    }

    // ========================================================================
    // Lifecycle operations
    // ========================================================================

    /// Build a fresh engine handle from the current configuration
    ///
    /// Idempotent: any previous engine and responder are torn down
    /// first, which is what `restart()` relies on. Rejected while the
    /// service is running.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        self.ensure_not_shutdown()?;
        if self.state_read()?.running {
            return Err(TideError::State(
                "cannot initialize while the service is running".to_string(),
            ));
        }
        match self.initialize_inner().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.set_status(ServiceStatus::Error);
                Err(err)
            }
        }
    }

    async fn initialize_inner(self: &Arc<Self>) -> Result<()> {
        self.teardown_engine().await;
        self.stop_responder().await;

        let settings = self.config.service_settings()?;
        let engine = (self.engine_factory)(EngineSettings {
            database_path: settings.database_path.clone(),
            smtp_address: settings.smtp_address.clone(),
            imap_address: settings.imap_address.clone(),
        })?;
        engine.initialize().await?;

        // One-time password seeding, flagged durably so it never repeats
        if !settings.password_initialized {
            match self.credentials.get() {
                Ok(secret) => {
                    engine.set_password(&secret).await?;
                    self.config.mark_password_initialized()?;
                }
                Err(err) => warn!("No stored credential to seed the engine with: {}", err),
            }
        }

        engine
            .set_max_message_size_mb(settings.max_message_size_mb)
            .await?;

        self.spawn_event_forwarder(engine.events());
        *self.engine_write()? = Some(engine);

        let responder = AutoconfigResponder::start(
            self.autoconfig_port,
            &settings.smtp_address,
            &settings.imap_address,
        )
        .await?;
        *self.responder.lock().await = Some(responder);

        self.spawn_monitor();
        info!("Service initialized");
        Ok(())
    }

    /// Start the engine with the enabled peer set
    ///
    /// Auto-initializes on first use. An empty peer list is valid and
    /// means local-only mode.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.ensure_not_shutdown()?;
        {
            let mut state = self.state_write()?;
            if state.running || state.status == ServiceStatus::Starting {
                return Err(TideError::State("service is already running".to_string()));
            }
            state.status = ServiceStatus::Starting;
        }
        self.events.emit(AppEvent::ServiceStatus {
            status: ServiceStatus::Starting,
        });

        let result = self.start_inner().await;
        if result.is_err() {
            self.set_status(ServiceStatus::Error);
        }
        result
    }

    async fn start_inner(self: &Arc<Self>) -> Result<()> {
        if self.current_engine().is_none() {
            self.initialize_inner().await?;
        }
        let engine = self.current_engine().ok_or_else(|| {
            TideError::State("engine unavailable after initialization".to_string())
        })?;

        let peers = self.config.enabled_peers()?;
        engine.start(&peers).await?;

        self.state_write()?.running = true;
        self.set_status(ServiceStatus::Running);
        info!("Service started with {} enabled peers", peers.len());
        Ok(())
    }

    /// Stop the engine, then the responder (freeing its port)
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state_write()?;
            if !state.running {
                return Err(TideError::State("service is not running".to_string()));
            }
            if state.status == ServiceStatus::Stopping {
                return Err(TideError::State("service is already stopping".to_string()));
            }
            state.status = ServiceStatus::Stopping;
        }
        self.events.emit(AppEvent::ServiceStatus {
            status: ServiceStatus::Stopping,
        });

        let engine = match self.current_engine() {
            Some(engine) => engine,
            None => {
                self.set_status(ServiceStatus::Error);
                return Err(TideError::State("service is not initialized".to_string()));
            }
        };
        let result = engine.stop().await;
        self.state_write()?.running = false;

        match result {
            Ok(()) => {
                self.stop_responder().await;
                self.set_status(ServiceStatus::Stopped);
                info!("Service stopped");
                Ok(())
            }
            Err(err) => {
                self.set_status(ServiceStatus::Error);
                Err(err)
            }
        }
    }

    /// Preferred shutdown path: disconnect peers, wait, then stop
    ///
    /// Updating to an empty peer set first avoids the engine's
    /// "connection forcibly closed" failure mode during an ordinary
    /// shutdown.
    pub async fn soft_stop(&self) -> Result<()> {
        if !self.state_read()?.running {
            return Err(TideError::State("service is not running".to_string()));
        }
        let engine = self
            .current_engine()
            .ok_or_else(|| TideError::State("service is not initialized".to_string()))?;

        engine.update_peers(&[]).await?;
        tokio::time::sleep(self.soft_stop_grace).await;
        self.stop().await
    }

    /// Full stop / re-initialize / start cycle
    ///
    /// Any failing step aborts the whole restart.
    pub async fn restart(self: &Arc<Self>) -> Result<()> {
        self.ensure_not_shutdown()?;
        info!("Restarting service");
        if self.state_read()?.running {
            self.stop().await?;
        }
        self.wait_until_stopped().await?;
        tokio::time::sleep(RESTART_GRACE).await;
        self.initialize().await?;
        self.start().await
    }

    /// Terminal teardown; safe to call more than once
    ///
    /// Does not return until the background monitor has exited, so no
    /// task can race the closing handles.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already performed");
            return Ok(());
        }
        info!("Shutting down service");

        let running = self.state_read().map(|s| s.running).unwrap_or(false);
        if running {
            if let Err(err) = self.soft_stop().await {
                warn!("Soft stop failed during shutdown, forcing stop: {}", err);
                if let Err(err) = self.stop().await {
                    warn!("Stop failed during shutdown: {}", err);
                }
            }
        }

        let signal = self.monitor_shutdown.lock().ok().and_then(|mut g| g.take());
        if let Some(signal) = signal {
            let _ = signal.send(true);
        }
        let handle = self.monitor.lock().ok().and_then(|mut g| g.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.stop_responder().await;
        self.teardown_engine().await;
        self.set_status(ServiceStatus::Stopped);
        info!("Service shut down");
        Ok(())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn status(&self) -> ServiceStatus {
        self.state
            .read()
            .map(|s| s.status)
            .unwrap_or(ServiceStatus::Error)
    }

    pub fn is_running(&self) -> bool {
        self.state.read().map(|s| s.running).unwrap_or(false)
    }

    pub fn set_auto_restart(&self, enabled: bool) {
        self.auto_restart.store(enabled, Ordering::SeqCst);
    }

    pub fn mail_address(&self) -> Result<String> {
        let engine = self
            .current_engine()
            .ok_or_else(|| TideError::State("service is not initialized".to_string()))?;
        Ok(engine.mail_address())
    }

    pub async fn peer_stats(&self) -> Result<Vec<PeerStat>> {
        let engine = self
            .current_engine()
            .ok_or_else(|| TideError::State("service is not initialized".to_string()))?;
        engine.peer_stats().await
    }

    /// Address of the running autoconfig responder, if any
    pub async fn autoconfig_addr(&self) -> Option<SocketAddr> {
        self.responder.lock().await.as_ref().map(|r| r.local_addr())
    }

    // ========================================================================
    // Background monitor
    // ========================================================================

    fn spawn_monitor(self: &Arc<Self>) {
        let (tx, rx) = watch::channel(false);
        let previous = self
            .monitor_shutdown
            .lock()
            .ok()
            .and_then(|mut g| g.replace(tx));
        if let Some(previous) = previous {
            let _ = previous.send(true);
        }

        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move { manager.monitor_loop(rx).await });
        if let Ok(mut guard) = self.monitor.lock() {
            // A replaced task has already been signalled; its handle can go
            guard.replace(handle);
        }
    }

    async fn monitor_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        debug!("Status monitor started");
        let mut ticker = tokio::time::interval(self.poll_interval);
        let mut gave_up = false;
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = ticker.tick() => {}
            }
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let Some(engine) = self.current_engine() else {
                continue;
            };
            let engine_status = engine.status();
            let running = self.state_read().map(|s| s.running).unwrap_or(false);

            if engine_status != EngineStatus::Failed || !running {
                if engine_status == EngineStatus::Running {
                    gave_up = false;
                }
                continue;
            }

            self.set_status(ServiceStatus::Error);
            if !self.auto_restart.load(Ordering::SeqCst) {
                continue;
            }

            let now = Instant::now();
            let delay = match self.restart_policy.lock() {
                Ok(mut policy) => {
                    if policy.should_restart(now) {
                        let delay = policy.next_delay();
                        policy.record_attempt(now);
                        Some(delay)
                    } else {
                        None
                    }
                }
                Err(_) => None,
            };
            let Some(delay) = delay else {
                if !gave_up {
                    warn!("Engine keeps failing, giving up on automatic restarts");
                    gave_up = true;
                }
                continue;
            };

            info!("Engine failure detected, restarting in {:?}", delay);
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            if let Err(err) = self.restart().await {
                warn!("Automatic restart failed: {}", err);
            }
        }
        debug!("Status monitor exited");
    }

    /// Republish the engine's event streams on the application bus
    ///
    /// The forwarder exits when the engine side closes its channels,
    /// i.e. on teardown of the handle it belongs to.
    fn spawn_event_forwarder(&self, streams: EngineEvents) {
        let events = self.events.clone();
        tokio::spawn(async move {
            let EngineEvents {
                log,
                mail,
                connection,
            } = streams;
            loop {
                tokio::select! {
                    received = log.recv_async() => match received {
                        Ok(event) => events.emit(AppEvent::ServiceLog(event)),
                        Err(_) => break,
                    },
                    received = mail.recv_async() => match received {
                        Ok(event) => events.emit(AppEvent::ServiceMail(event)),
                        Err(_) => break,
                    },
                    received = connection.recv_async() => match received {
                        Ok(event) => events.emit(AppEvent::ServiceConnection(event)),
                        Err(_) => break,
                    },
                }
            }
            debug!("Engine event forwarder exited");
        });
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn wait_until_stopped(&self) -> Result<()> {
        let deadline = Instant::now() + STOP_WAIT_TIMEOUT;
        loop {
            let still_up = self
                .current_engine()
                .map(|e| matches!(e.status(), EngineStatus::Starting | EngineStatus::Running))
                .unwrap_or(false);
            if !still_up {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(TideError::State(
                    "timed out waiting for the service to stop".to_string(),
                ));
            }
            tokio::time::sleep(STOP_WAIT_POLL).await;
        }
    }

    async fn teardown_engine(&self) {
        let engine = self.engine.write().ok().and_then(|mut slot| slot.take());
        if let Some(engine) = engine {
            if let Err(err) = engine.close().await {
                warn!("Engine close failed: {}", err);
            }
        }
    }

    async fn stop_responder(&self) {
        let responder = self.responder.lock().await.take();
        if let Some(responder) = responder {
            responder.stop().await;
        }
    }

    fn current_engine(&self) -> Option<Arc<dyn MailEngine>> {
        self.engine.read().ok().and_then(|slot| slot.clone())
    }

    fn set_status(&self, status: ServiceStatus) {
        if let Ok(mut state) = self.state.write() {
            state.status = status;
        }
        self.events.emit(AppEvent::ServiceStatus { status });
    }

    fn ensure_not_shutdown(&self) -> Result<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(TideError::State(
                "service manager has been shut down".to_string(),
            ));
        }
        Ok(())
    }

    fn state_read(&self) -> Result<RwLockReadGuard<'_, ManagerState>> {
        self.state
            .read()
            .map_err(|_| TideError::State("service state lock poisoned".to_string()))
    }

    fn state_write(&self) -> Result<RwLockWriteGuard<'_, ManagerState>> {
        self.state
            .write()
            .map_err(|_| TideError::State("service state lock poisoned".to_string()))
    }

    fn engine_write(&self) -> Result<RwLockWriteGuard<'_, Option<Arc<dyn MailEngine>>>> {
        self.engine
            .write()
            .map_err(|_| TideError::State("engine slot lock poisoned".to_string()))
    }
}
