//! [`ConnectionHandle`]: one logical broker connection and the channel
//! handles multiplexed over it.
//!
//! The handle owns exactly one [`PublishChannelHandle`] and one
//! [`ConsumeChannelHandle`] per configured queue. [`update_channels`]
//! reconciles that set against the configured consume items; a broker-side
//! shutdown tears everything down and reports CLOSE_COMPLETED to the
//! connection's listeners (the manager), which decides what happens next.
//!
//! [`update_channels`]: ConnectionHandle::update_channels

use std::collections::BTreeSet;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;

use roborabbit_domain::{
    // ---
    BrokerChannelPtr,
    BrokerConnectionPtr,
    BrokerConnector,
    BrokerError,
    ConnectParams,
    ConsumeItem,
    Result,
    Secret,
    ShutdownSignal,
    CONTENT_NONE,
};

use super::channel::{open_channel, ChannelEvent, ChannelHandle, ChannelId, ChannelListener};
use super::notify::{next_shutdown, pending_shutdown, Listeners};
use super::{
    // ---
    ConnectionMonitor,
    ConsumeChannelHandle,
    LifecycleState,
    MessageRouter,
    PublishChannelHandle,
};

/// Upper bound on establishing the broker connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// ConnectionEvent / ConnectionListener
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    // ---
    Open,
    CloseCompleted,
}

#[async_trait]
pub trait ConnectionListener: Send + Sync {
    // ---
    async fn on_connection_event(&self, connection: &Arc<ConnectionHandle>, event: ConnectionEvent);
}

// ---------------------------------------------------------------------------
// ConnectionSettings
// ---------------------------------------------------------------------------

/// Identity of a connection. A change to any field means a new connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    // ---
    pub service_uri: String,
    pub username: String,
    pub password: Secret,
    pub watchdog_period: Duration,
}

// ---------------------------------------------------------------------------
// TrackedChannel
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub enum TrackedChannel {
    // ---
    Publish(Arc<PublishChannelHandle>),
    Consume(Arc<ConsumeChannelHandle>),
}

impl TrackedChannel {
    // ---
    pub fn id(&self) -> ChannelId {
        self.handle().id()
    }

    pub fn handle(&self) -> Arc<dyn ChannelHandle> {
        match self {
            Self::Publish(h) => Arc::clone(h) as Arc<dyn ChannelHandle>,
            Self::Consume(h) => Arc::clone(h) as Arc<dyn ChannelHandle>,
        }
    }
}

// ---------------------------------------------------------------------------
// ConnectionHandle
// ---------------------------------------------------------------------------

struct ConnState {
    // ---
    lifecycle: LifecycleState,
    connection: Option<BrokerConnectionPtr>,
    generation: u64,
}

pub struct ConnectionHandle {
    // ---
    me: Weak<ConnectionHandle>,
    settings: ConnectionSettings,

    connector: Arc<dyn BrokerConnector>,
    router: Arc<MessageRouter>,
    monitor: Arc<ConnectionMonitor>,

    state: Mutex<ConnState>,
    tracked: Mutex<Vec<TrackedChannel>>,
    listeners: Listeners<dyn ConnectionListener>,
}

// ---

impl ConnectionHandle {
    // ---
    pub fn new(
        settings: ConnectionSettings,
        connector: Arc<dyn BrokerConnector>,
        router: Arc<MessageRouter>,
        monitor: Arc<ConnectionMonitor>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            settings,
            connector,
            router,
            monitor,
            state: Mutex::new(ConnState {
                lifecycle: LifecycleState::Disconnected,
                connection: None,
                generation: 0,
            }),
            tracked: Mutex::new(Vec::new()),
            listeners: Listeners::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_tracked(&self) -> MutexGuard<'_, Vec<TrackedChannel>> {
        self.tracked.lock().unwrap_or_else(|p| p.into_inner())
    }

    // --- accessors ---------------------------------------------------------

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn service_uri(&self) -> &str {
        &self.settings.service_uri
    }

    pub fn username(&self) -> &str {
        &self.settings.username
    }

    pub fn watchdog_period(&self) -> Duration {
        self.settings.watchdog_period
    }

    pub fn state(&self) -> LifecycleState {
        self.lock().lifecycle
    }

    /// `CONNECTED` and the broker connection still up.
    pub fn is_open(&self) -> bool {
        self.live_connection().is_some()
    }

    /// `true` if this connection was opened with exactly these settings.
    pub fn matches(&self, service_uri: &str, username: &str, password: &Secret) -> bool {
        self.settings.service_uri == service_uri
            && self.settings.username == username
            && &self.settings.password == password
    }

    fn live_connection(&self) -> Option<BrokerConnectionPtr> {
        // ---
        let st = self.lock();
        match (&st.lifecycle, &st.connection) {
            (LifecycleState::Connected, Some(c)) if c.is_open() => Some(Arc::clone(c)),
            _ => None,
        }
    }

    // --- listeners ---------------------------------------------------------

    pub fn add_listener(&self, listener: &Arc<dyn ConnectionListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ConnectionListener>) {
        self.listeners.remove(listener);
    }

    async fn notify(&self, event: ConnectionEvent) {
        // ---
        let Some(me) = self.me.upgrade() else {
            return;
        };
        for listener in self.listeners.snapshot() {
            listener.on_connection_event(&me, event).await;
        }
    }

    // --- open / close ------------------------------------------------------

    fn connect_params(&self) -> ConnectParams {
        ConnectParams {
            uri: self.settings.service_uri.clone(),
            username: Some(self.settings.username.clone()).filter(|u| !u.is_empty()),
            password: Some(self.settings.password.clone()).filter(|p| !p.is_empty()),
        }
    }

    /// Connect to the broker.
    ///
    /// Fails unless `DISCONNECTED`. Connection failures, including the
    /// connect timeout, come back as [`BrokerError::Io`]. On success the
    /// handle is `CONNECTED` and OPEN has been delivered to its listeners.
    pub async fn open(&self) -> Result<()> {
        // ---
        let state = self.state();
        if state != LifecycleState::Disconnected {
            return Err(BrokerError::Connection(format!(
                "connection to {} is {state:?}",
                self.settings.service_uri
            )));
        }

        let params = self.connect_params();
        let connection =
            match tokio::time::timeout(CONNECT_TIMEOUT, self.connector.connect(&params)).await {
                Ok(Ok(connection)) => connection,
                Ok(Err(e)) => return Err(io_class(e)),
                Err(_) => {
                    return Err(BrokerError::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no connection within {CONNECT_TIMEOUT:?}"),
                    )))
                }
            };

        let rx = connection.shutdown_rx();
        let generation = {
            let mut st = self.lock();
            if st.lifecycle == LifecycleState::Disconnected {
                st.lifecycle = LifecycleState::Connected;
                st.connection = Some(Arc::clone(&connection));
                st.generation += 1;
                Some(st.generation)
            } else {
                None
            }
        };

        let Some(generation) = generation else {
            tracing::warn!(uri = %self.settings.service_uri, "connection opened twice, discarding the second");
            let _ = connection.close().await;
            return Err(BrokerError::Io(io::Error::other("connection opened concurrently")));
        };

        let me = self.me.clone();
        tokio::spawn(async move {
            // ---
            let Some(signal) = next_shutdown(rx).await else {
                return;
            };
            if let Some(handle) = me.upgrade() {
                handle.shutdown_completed(generation, signal).await;
            }
        });

        tracing::info!(uri = %self.settings.service_uri, user = %self.settings.username, "connection open");
        self.notify(ConnectionEvent::Open).await;
        Ok(())
    }

    // ---

    /// Request a graceful close.
    ///
    /// Only effective when `CONNECTED`. A close the broker rejects for a
    /// reason other than an application shutdown completes the handle
    /// locally before the error is returned.
    pub async fn close(&self) -> Result<()> {
        // ---
        let (connection, generation) = {
            let mut st = self.lock();
            match (&st.lifecycle, &st.connection) {
                (LifecycleState::Connected, Some(c)) => {
                    let c = Arc::clone(c);
                    st.lifecycle = LifecycleState::ClosePending;
                    (c, st.generation)
                }
                _ => {
                    tracing::warn!(state = ?st.lifecycle, "close ignored, connection not connected");
                    return Ok(());
                }
            }
        };

        match connection.close().await {
            Ok(()) => {
                if let Some(signal) = pending_shutdown(&connection.shutdown_rx()) {
                    self.shutdown_completed(generation, signal).await;
                }
                Ok(())
            }
            Err(e) => {
                if !e.is_application_shutdown() {
                    tracing::warn!(uri = %self.settings.service_uri, "close failed, completing locally: {e}");
                    self.complete(generation).await;
                }
                Err(e)
            }
        }
    }

    // ---

    /// Complete the current open without waiting for the broker; used when
    /// a close is never confirmed.
    pub async fn complete_locally(&self) {
        let generation = self.lock().generation;
        self.complete(generation).await;
    }

    async fn shutdown_completed(&self, generation: u64, signal: ShutdownSignal) {
        // ---
        let live = {
            let st = self.lock();
            st.generation == generation && st.lifecycle != LifecycleState::Disconnected
        };
        if live && !signal.initiated_by_application {
            tracing::warn!(uri = %self.settings.service_uri, "connection suddenly closed: {signal}");
            self.monitor.set_activated(true);
        }
        self.complete(generation).await;
    }

    async fn complete(&self, generation: u64) {
        // ---
        let connection = {
            let mut st = self.lock();
            if st.generation != generation || st.lifecycle == LifecycleState::Disconnected {
                return;
            }
            st.lifecycle = LifecycleState::Disconnected;
            st.connection.take()
        };

        self.close_all_channels().await;
        tracing::info!(uri = %self.settings.service_uri, "connection closed");
        self.notify(ConnectionEvent::CloseCompleted).await;
        drop(connection);
    }

    // --- channels ----------------------------------------------------------

    fn track(&self, channel: TrackedChannel) {
        // ---
        let listener: Option<Arc<dyn ChannelListener>> =
            self.me.upgrade().map(|me| me as Arc<dyn ChannelListener>);
        if let Some(listener) = &listener {
            channel.handle().core().add_listener(listener);
        }
        self.lock_tracked().push(channel);
    }

    fn untrack(&self, id: ChannelId) {
        self.lock_tracked().retain(|c| c.id() != id);
    }

    pub fn channels(&self) -> Vec<TrackedChannel> {
        self.lock_tracked().clone()
    }

    pub fn consume_channels(&self) -> Vec<Arc<ConsumeChannelHandle>> {
        self.lock_tracked()
            .iter()
            .filter_map(|c| match c {
                TrackedChannel::Consume(h) => Some(Arc::clone(h)),
                TrackedChannel::Publish(_) => None,
            })
            .collect()
    }

    pub fn consume_channel(&self, queue_name: &str) -> Option<Arc<ConsumeChannelHandle>> {
        self.consume_channels()
            .into_iter()
            .find(|h| h.queue_name() == queue_name)
    }

    pub fn publish_channel(&self) -> Option<Arc<PublishChannelHandle>> {
        self.lock_tracked().iter().find_map(|c| match c {
            TrackedChannel::Publish(h) => Some(Arc::clone(h)),
            TrackedChannel::Consume(_) => None,
        })
    }

    /// `true` once the consume channel for `queue_name` is consuming.
    pub fn consume_channel_status(&self, queue_name: &str) -> bool {
        self.consume_channel(queue_name)
            .is_some_and(|h| h.is_consume_started())
    }

    /// A raw broker channel outside the tracked set; the caller closes it.
    pub async fn create_pure_channel(&self) -> Result<BrokerChannelPtr> {
        // ---
        let connection = self
            .live_connection()
            .ok_or_else(|| BrokerError::Connection("connection is not open".into()))?;
        connection.create_channel().await
    }

    // ---

    async fn close_all_channels(&self) {
        // ---
        let channels = std::mem::take(&mut *self.lock_tracked());
        for channel in channels {
            let handle = channel.handle();
            if handle.state() != LifecycleState::Connected {
                continue;
            }
            if let Err(e) = handle.close().await {
                tracing::debug!(channel = %handle.id(), "close during teardown failed: {e}");
            }
        }
    }

    // ---

    /// Reconcile the channel set with `items`.
    ///
    /// - The publish channel is created if missing.
    /// - `None` closes every consume channel; otherwise consume channels
    ///   whose queue is no longer configured are closed.
    /// - Each configured queue without a channel gets one serving the union
    ///   of its app ids (the `-` placeholder excluded); queues left with no
    ///   app id get none.
    ///
    /// Running it twice with the same items changes nothing the second time.
    pub async fn update_channels(&self, items: Option<&[ConsumeItem]>, debug: bool) {
        // ---
        if self.publish_channel().is_none() {
            if let Some(connection) = self.live_connection() {
                let handle = Arc::new(PublishChannelHandle::new());
                self.track(TrackedChannel::Publish(Arc::clone(&handle)));
                if let Err(e) = open_channel(&handle, &connection).await {
                    tracing::warn!("cannot open publish channel: {e}");
                    self.untrack(handle.id());
                }
            }
        }

        let desired: BTreeSet<&str> = items
            .unwrap_or_default()
            .iter()
            .filter_map(ConsumeItem::queue_name)
            .collect();

        // --- close what is no longer wanted
        for handle in self.consume_channels() {
            if items.is_some() && desired.contains(handle.queue_name()) {
                continue;
            }
            tracing::info!(queue = handle.queue_name(), "closing consume channel");
            if let Err(e) = handle.close().await {
                tracing::warn!(queue = handle.queue_name(), "consume channel close failed: {e}");
            }
            self.untrack(handle.id());
        }

        // --- open what is missing
        let Some(items) = items else {
            return;
        };
        for queue in desired {
            // ---
            if self.consume_channel(queue).is_some() {
                continue;
            }

            let app_ids: BTreeSet<String> = items
                .iter()
                .filter(|item| item.queue_name() == Some(queue))
                .filter_map(ConsumeItem::app_id)
                .filter(|id| *id != CONTENT_NONE)
                .map(str::to_owned)
                .collect();
            if app_ids.is_empty() {
                tracing::debug!(queue, "no app id configured, queue skipped");
                continue;
            }

            let Some(connection) = self.live_connection() else {
                tracing::debug!(queue, "connection not open, consume channels deferred");
                return;
            };

            let handle = Arc::new(ConsumeChannelHandle::new(
                queue,
                app_ids,
                debug,
                Arc::clone(&self.router),
            ));
            self.track(TrackedChannel::Consume(Arc::clone(&handle)));
            if let Err(e) = open_channel(&handle, &connection).await {
                tracing::warn!(queue, "cannot open consume channel: {e}");
                self.untrack(handle.id());
            }
        }
    }
}

// ---

#[async_trait]
impl ChannelListener for ConnectionHandle {
    // ---
    async fn on_channel_event(&self, channel: ChannelId, event: ChannelEvent) {
        // ---
        match event {
            ChannelEvent::Open => {
                let consume = self
                    .consume_channels()
                    .into_iter()
                    .find(|h| h.id() == channel);
                if let Some(handle) = consume {
                    if let Err(e) = handle.consume().await {
                        tracing::warn!(queue = handle.queue_name(), "cannot start consuming: {e}");
                    }
                }
            }
            ChannelEvent::CloseCompleted => self.untrack(channel),
        }
    }
}

// ---

fn io_class(e: BrokerError) -> BrokerError {
    match e {
        BrokerError::Io(_) => e,
        other => BrokerError::Io(io::Error::other(other.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::testing::{ConnectionLog, RecordingListener};
    use roborabbit_broker_sim::{SimBroker, SimConfig};

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            service_uri: "amqp://sim:5672".into(),
            username: "ci".into(),
            password: Secret::from("pw"),
            watchdog_period: Duration::from_secs(60),
        }
    }

    fn item(queue: &str, app_id: &str) -> ConsumeItem {
        ConsumeItem::new(Some(app_id), Some(queue))
    }

    struct Fixture {
        broker: SimBroker,
        conn: Arc<ConnectionHandle>,
        monitor: Arc<ConnectionMonitor>,
        log: Arc<ConnectionLog>,
    }

    fn fixture(broker: SimBroker) -> Fixture {
        // ---
        let router = Arc::new(MessageRouter::new());
        for app_id in ["a", "b", "c"] {
            router.register(RecordingListener::new(app_id));
        }
        let monitor = Arc::new(ConnectionMonitor::new());
        let conn = ConnectionHandle::new(
            settings(),
            Arc::new(broker.connector()),
            router,
            Arc::clone(&monitor),
        );
        let log = ConnectionLog::new();
        let listener: Arc<dyn ConnectionListener> = log.clone();
        conn.add_listener(&listener);
        Fixture {
            broker,
            conn,
            monitor,
            log,
        }
    }

    fn queues(conn: &ConnectionHandle) -> Vec<String> {
        let mut q: Vec<String> = conn
            .consume_channels()
            .iter()
            .map(|h| h.queue_name().to_owned())
            .collect();
        q.sort();
        q
    }

    #[tokio::test]
    async fn open_applies_credentials_and_notifies() {
        // ---
        let f = fixture(SimBroker::new(SimConfig::default()));
        f.conn.open().await.unwrap();

        assert!(f.conn.is_open());
        assert_eq!(f.conn.state(), LifecycleState::Connected);
        assert_eq!(f.log.events(), vec![ConnectionEvent::Open]);

        let params = f.broker.last_params().unwrap();
        assert_eq!(params.username.as_deref(), Some("ci"));
        assert_eq!(params.password, Some(Secret::from("pw")));

        let err = f.conn.open().await.unwrap_err();
        assert!(matches!(err, BrokerError::Connection(_)));
        assert_eq!(f.broker.connect_count(), 1);
    }

    // ---

    #[tokio::test]
    async fn refused_connection_is_an_io_error() {
        // ---
        let f = fixture(SimBroker::new(SimConfig::unreachable()));
        let err = f.conn.open().await.unwrap_err();
        assert!(matches!(err, BrokerError::Io(_)));
        assert_eq!(f.conn.state(), LifecycleState::Disconnected);
        assert!(f.log.events().is_empty());
    }

    // ---

    #[tokio::test]
    async fn update_channels_reconciles_and_is_idempotent() {
        // ---
        let f = fixture(SimBroker::new(SimConfig::default()));
        f.conn.open().await.unwrap();

        let initial = [item("A", "a"), item("C", "c")];
        f.conn.update_channels(Some(&initial), false).await;
        assert_eq!(queues(&f.conn), vec!["A", "C"]);
        assert!(f.conn.publish_channel().is_some());
        let a_before = f.conn.consume_channel("A").unwrap();

        let desired = [item("A", "a"), item("B", "b")];
        f.conn.update_channels(Some(&desired), false).await;
        assert_eq!(queues(&f.conn), vec!["A", "B"]);
        assert!(Arc::ptr_eq(&a_before, &f.conn.consume_channel("A").unwrap()));
        assert!(f.conn.consume_channel_status("B"));
        assert!(!f.conn.consume_channel_status("C"));

        let publish = f.conn.publish_channel().unwrap();
        let channels = f.conn.channels().len();
        f.conn.update_channels(Some(&desired), false).await;
        assert_eq!(f.conn.channels().len(), channels);
        assert!(Arc::ptr_eq(&publish, &f.conn.publish_channel().unwrap()));
        assert_eq!(f.broker.consumer_count("A"), 1);
        assert_eq!(f.broker.consumer_count("B"), 1);
        assert_eq!(f.broker.consumer_count("C"), 0);
    }

    // ---

    #[tokio::test]
    async fn app_ids_are_merged_per_queue() {
        // ---
        let f = fixture(SimBroker::new(SimConfig::default()));
        f.conn.open().await.unwrap();

        let items = [
            item("builds", "a"),
            item("builds", "b"),
            item("builds", CONTENT_NONE),
            item("idle", CONTENT_NONE),
            ConsumeItem::new(Some("a"), None),
        ];
        f.conn.update_channels(Some(&items), true).await;

        assert_eq!(queues(&f.conn), vec!["builds"]);
        let builds = f.conn.consume_channel("builds").unwrap();
        let ids: Vec<&str> = builds.app_ids().iter().map(String::as_str).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(builds.debug());
    }

    // ---

    #[tokio::test]
    async fn none_closes_every_consume_channel() {
        // ---
        let f = fixture(SimBroker::new(SimConfig::default()));
        f.conn.open().await.unwrap();

        f.conn.update_channels(Some(&[item("A", "a")]), false).await;
        f.conn.update_channels(None, false).await;

        assert!(f.conn.consume_channels().is_empty());
        assert!(f.conn.publish_channel().is_some());
        assert_eq!(f.broker.consumer_count("A"), 0);
    }

    // ---

    #[tokio::test]
    async fn channel_that_fails_to_close_is_still_dropped() {
        // ---
        let f = fixture(SimBroker::new(SimConfig::default()));
        f.conn.open().await.unwrap();
        f.conn.update_channels(Some(&[item("A", "a")]), false).await;

        f.broker.set_fail_channel_close(true);
        f.conn.update_channels(Some(&[]), false).await;
        assert!(f.conn.consume_channels().is_empty());
    }

    // ---

    #[tokio::test]
    async fn refused_consume_channel_is_skipped() {
        // ---
        let f = fixture(SimBroker::new(SimConfig::default()));
        f.conn.open().await.unwrap();
        f.conn.update_channels(Some(&[]), false).await;

        f.broker.set_refuse_channels(true);
        f.conn.update_channels(Some(&[item("A", "a")]), false).await;
        assert!(f.conn.consume_channels().is_empty());

        f.broker.set_refuse_channels(false);
        f.conn.update_channels(Some(&[item("A", "a")]), false).await;
        assert!(f.conn.consume_channel_status("A"));
    }

    // ---

    #[tokio::test]
    async fn graceful_close_tears_down_channels() {
        // ---
        let f = fixture(SimBroker::new(SimConfig::default()));
        f.conn.open().await.unwrap();
        f.conn.update_channels(Some(&[item("A", "a")]), false).await;

        f.conn.close().await.unwrap();
        assert_eq!(f.conn.state(), LifecycleState::Disconnected);
        assert!(f.conn.channels().is_empty());
        assert!(!f.monitor.is_activated());
        assert_eq!(f.log.events(), vec![ConnectionEvent::Open, ConnectionEvent::CloseCompleted]);
        assert_eq!(f.broker.live_connections(), 0);
    }

    // ---

    #[tokio::test]
    async fn dropped_connection_raises_the_monitor() {
        // ---
        let f = fixture(SimBroker::new(SimConfig::default()));
        f.conn.open().await.unwrap();
        f.conn.update_channels(Some(&[item("A", "a")]), false).await;

        f.broker.drop_connections();
        tokio::time::timeout(Duration::from_secs(1), async {
            while f.log.events().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(f.monitor.is_activated());
        assert_eq!(f.conn.state(), LifecycleState::Disconnected);
        assert!(f.conn.channels().is_empty());
        assert!(f.conn.create_pure_channel().await.is_err());
    }

    // ---

    #[tokio::test]
    async fn pure_channel_is_not_tracked() {
        // ---
        let f = fixture(SimBroker::new(SimConfig::default()));
        f.conn.open().await.unwrap();

        let raw = f.conn.create_pure_channel().await.unwrap();
        assert!(raw.is_open());
        assert!(f.conn.channels().is_empty());
        raw.close().await.unwrap();
    }
}
