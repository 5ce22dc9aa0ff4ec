//! [`ConnectionManager`]: the process-wide owner of the broker connection.
//!
//! Every change reaches the broker through [`update`](ConnectionManager::update):
//! startup, configuration reloads and watchdog ticks all call it, and it
//! decides whether to open, keep, replace or drop the connection. The
//! manager also answers "are we connected" for everyone else.
//!
//! # Concurrency
//!
//! - `update` and `shutdown_with_wait` are each serialized by an async
//!   mutex; neither is reentrant.
//! - The current-connection slot is a short `std::sync::Mutex` section,
//!   never held across an `.await`.
//! - Connection events arrive on broker tasks and are matched against the
//!   current connection, so events from a replaced connection are ignored.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use roborabbit_domain::{BrokerChannelPtr, BrokerConnector, BrokerError, Result};

use super::connection::{ConnectionEvent, ConnectionListener, ConnectionSettings};
use super::{
    // ---
    ConfigError,
    ConfigSource,
    ConnectionHandle,
    ConnectionMonitor,
    LifecycleState,
    ManagerError,
    MessageRouter,
    PublishChannelHandle,
    ServerOperators,
    DEFAULT_WATCHDOG_PERIOD,
};

/// How long `shutdown_with_wait` waits for the broker to confirm a close.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// ManagerContext
// ---------------------------------------------------------------------------

/// Collaborators shared by the manager and every connection it creates.
#[derive(Clone, Default)]
pub struct ManagerContext {
    // ---
    pub router: Arc<MessageRouter>,
    pub operators: Arc<ServerOperators>,
    pub monitor: Arc<ConnectionMonitor>,
}

// ---------------------------------------------------------------------------
// ConnectionManager
// ---------------------------------------------------------------------------

pub struct ConnectionManager {
    // ---
    me: Weak<ConnectionManager>,

    source: Arc<dyn ConfigSource>,
    connector: Arc<dyn BrokerConnector>,
    ctx: ManagerContext,
    close_timeout: Duration,

    connection: Mutex<Option<Arc<ConnectionHandle>>>,
    open: AtomicBool,
    watchdog_period_ms: AtomicU64,

    // ---
    update_serial: tokio::sync::Mutex<()>,
    shutdown_serial: tokio::sync::Mutex<()>,
    close_gate: Mutex<Option<oneshot::Sender<()>>>,
}

// ---

impl ConnectionManager {
    // ---
    pub fn new(
        source: Arc<dyn ConfigSource>,
        connector: Arc<dyn BrokerConnector>,
        ctx: ManagerContext,
        close_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            source,
            connector,
            ctx,
            close_timeout,
            connection: Mutex::new(None),
            open: AtomicBool::new(false),
            watchdog_period_ms: AtomicU64::new(millis(DEFAULT_WATCHDOG_PERIOD)),
            update_serial: tokio::sync::Mutex::new(()),
            shutdown_serial: tokio::sync::Mutex::new(()),
            close_gate: Mutex::new(None),
        })
    }

    // --- accessors ---------------------------------------------------------

    fn slot(&self) -> MutexGuard<'_, Option<Arc<ConnectionHandle>>> {
        self.connection.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn gate(&self) -> MutexGuard<'_, Option<oneshot::Sender<()>>> {
        self.close_gate.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// The current connection, in whatever state it is.
    pub fn connection(&self) -> Option<Arc<ConnectionHandle>> {
        self.slot().clone()
    }

    fn is_current(&self, connection: &Arc<ConnectionHandle>) -> bool {
        self.slot()
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, connection))
    }

    /// Clear the slot if it still holds `connection`.
    fn release(&self, connection: &Arc<ConnectionHandle>) {
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|c| Arc::ptr_eq(c, connection)) {
            *slot = None;
        }
    }

    pub fn config_source(&self) -> &Arc<dyn ConfigSource> {
        &self.source
    }

    pub fn context(&self) -> &ManagerContext {
        &self.ctx
    }

    pub fn monitor(&self) -> &Arc<ConnectionMonitor> {
        &self.ctx.monitor
    }

    /// Period of the live connection's watchdog; the default until a
    /// connection has opened.
    pub fn watchdog_period(&self) -> Duration {
        Duration::from_millis(self.watchdog_period_ms.load(Ordering::Acquire))
    }

    pub fn consumer_enabled(&self) -> std::result::Result<bool, ConfigError> {
        Ok(self.source.load()?.enable_consumer)
    }

    // --- queries -----------------------------------------------------------

    /// `true` once a connection has opened and until it closes.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && self.connection().is_some_and(|c| c.is_open())
    }

    /// The current connection while the manager is open.
    fn open_connection(&self) -> Option<Arc<ConnectionHandle>> {
        if !self.is_open() {
            return None;
        }
        self.connection()
    }

    /// `true` when the manager is open and `queue_name` is being consumed.
    pub fn channel_status(&self, queue_name: &str) -> bool {
        self.open_connection()
            .is_some_and(|c| c.consume_channel_status(queue_name))
    }

    /// `None` unless the manager is open.
    pub fn publish_channel(&self) -> Option<Arc<PublishChannelHandle>> {
        self.open_connection()?.publish_channel()
    }

    /// A raw channel on the current connection, not managed by anything;
    /// the caller closes it. Fails unless the manager is open.
    pub async fn channel(&self) -> Result<BrokerChannelPtr> {
        match self.open_connection() {
            Some(connection) => connection.create_pure_channel().await,
            None => Err(BrokerError::Connection("not connected".into())),
        }
    }

    // --- update ------------------------------------------------------------

    /// Bring the connection in line with the current configuration.
    ///
    /// Never fails: configuration and connection problems are logged and
    /// retried on the next call.
    pub async fn update(&self) {
        // ---
        let _serial = self.update_serial.lock().await;

        let config = match self.source.load().and_then(|c| c.resolve()) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("configuration rejected, update skipped: {e}");
                return;
            }
        };

        let service_uri = match (config.enable_consumer, &config.service_uri) {
            (true, Some(uri)) => uri.clone(),
            _ => {
                if self.connection().is_some() {
                    tracing::info!("consumer disabled or no service URI, disconnecting");
                    self.discard_connection().await;
                }
                return;
            }
        };

        if let Some(current) = self.connection() {
            if !current.matches(&service_uri, &config.username, &config.password) {
                tracing::info!(
                    from = current.service_uri(),
                    to = %service_uri,
                    "connection settings changed, reconnecting",
                );
                self.discard_connection().await;
            }
        }

        match self.connection() {
            Some(current) => {
                current
                    .update_channels(Some(&config.consume_items), config.enable_debug)
                    .await
            }
            None => {
                let settings = ConnectionSettings {
                    service_uri,
                    username: config.username,
                    password: config.password,
                    watchdog_period: config.watchdog_period,
                };
                self.connect(settings).await;
            }
        }
    }

    // ---

    async fn connect(&self, settings: ConnectionSettings) {
        // ---
        let connection = ConnectionHandle::new(
            settings,
            Arc::clone(&self.connector),
            Arc::clone(&self.ctx.router),
            Arc::clone(&self.ctx.monitor),
        );
        if let Some(me) = self.me.upgrade() {
            let listener: Arc<dyn ConnectionListener> = me;
            connection.add_listener(&listener);
        }

        // Installed before opening so the OPEN event is recognised.
        *self.slot() = Some(Arc::clone(&connection));

        if let Err(e) = connection.open().await {
            tracing::warn!(uri = connection.service_uri(), "cannot open broker connection: {e}");
            self.release(&connection);
        }
    }

    async fn discard_connection(&self) {
        // ---
        if let Err(e) = self.shutdown_with_wait().await {
            tracing::warn!("{e}");
        }
        *self.slot() = None;
        self.open.store(false, Ordering::Release);
    }

    // --- shutdown ----------------------------------------------------------

    /// Close the connection if it is open, without waiting for the broker
    /// to confirm.
    pub async fn shutdown(&self) {
        // ---
        let Some(connection) = self.connection() else {
            return;
        };
        if connection.state() != LifecycleState::Connected {
            return;
        }

        self.open.store(false, Ordering::Release);
        if let Err(e) = connection.close().await {
            tracing::warn!(uri = connection.service_uri(), "connection close failed: {e}");
        }
    }

    // ---

    /// Close the connection and wait, up to the close timeout, for the
    /// broker to confirm. On timeout the close is completed locally and
    /// [`ManagerError::ShutdownTimeout`] is returned. Returns at once when
    /// there is no connection.
    pub async fn shutdown_with_wait(&self) -> std::result::Result<(), ManagerError> {
        // ---
        let _serial = self.shutdown_serial.lock().await;

        let Some(connection) = self.connection() else {
            return Ok(());
        };
        if connection.state() == LifecycleState::Disconnected {
            self.release(&connection);
            self.open.store(false, Ordering::Release);
            return Ok(());
        }

        let (gate, confirmed) = oneshot::channel();
        *self.gate() = Some(gate);

        self.shutdown().await;

        let result = match tokio::time::timeout(self.close_timeout, confirmed).await {
            Ok(_) => Ok(()),
            Err(_) => {
                tracing::warn!(
                    uri = connection.service_uri(),
                    timeout = ?self.close_timeout,
                    "close not confirmed, completing locally",
                );
                connection.complete_locally().await;
                Err(ManagerError::ShutdownTimeout(self.close_timeout))
            }
        };

        self.gate().take();
        self.release(&connection);
        self.open.store(false, Ordering::Release);
        result
    }

    // --- connection events -------------------------------------------------

    /// The current connection opened: prepare broker state, open channels.
    pub async fn on_open(&self, connection: &Arc<ConnectionHandle>) {
        // ---
        if !self.is_current(connection) {
            tracing::debug!(uri = connection.service_uri(), "open from a replaced connection ignored");
            return;
        }

        self.ctx.monitor.set_activated(false);
        self.ctx.monitor.touch();
        self.watchdog_period_ms
            .store(millis(connection.watchdog_period()), Ordering::Release);

        self.ctx.operators.fire_on_open(connection).await;

        match self.source.load() {
            Ok(config) => {
                connection
                    .update_channels(Some(&config.consume_items), config.enable_debug)
                    .await
            }
            Err(e) => {
                tracing::warn!("configuration unreadable, consume channels deferred: {e}");
                connection.update_channels(Some(&[]), false).await;
            }
        }

        self.open.store(true, Ordering::Release);
        tracing::info!(uri = connection.service_uri(), "broker connection ready");
    }

    /// The current connection finished closing.
    pub async fn on_close_completed(&self, connection: &Arc<ConnectionHandle>) {
        // ---
        if !self.is_current(connection) {
            tracing::debug!(uri = connection.service_uri(), "close from a replaced connection ignored");
            return;
        }

        self.release(connection);
        self.ctx
            .operators
            .fire_on_close_completed(connection.service_uri())
            .await;
        self.open.store(false, Ordering::Release);

        if let Some(gate) = self.gate().take() {
            let _ = gate.send(());
        }
    }
}

// ---

#[async_trait]
impl ConnectionListener for ConnectionManager {
    // ---
    async fn on_connection_event(&self, connection: &Arc<ConnectionHandle>, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Open => self.on_open(connection).await,
            ConnectionEvent::CloseCompleted => self.on_close_completed(connection).await,
        }
    }
}

// ---

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
