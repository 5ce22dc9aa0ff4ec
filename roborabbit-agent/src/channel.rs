//! Shared channel lifecycle: [`ChannelCore`] holds the state machine,
//! [`ChannelHandle`] layers open/close/shutdown behaviour on top of it.
//!
//! ```text
//!              open()                   close()
//! DISCONNECTED ──────▶ CONNECTED ──────────────▶ CLOSE_PENDING
//!      ▲                   │                          │
//!      │   shutdown signal │                          │ shutdown signal
//!      └───────────────────┴──────────────────────────┘  (or failed close)
//! ```
//!
//! Every transition back to `DISCONNECTED` goes through
//! [`ChannelHandle::shutdown_completed`], which is guarded so the watcher
//! task and a synchronous close path cannot both complete the same open.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use serde::Serialize;

use roborabbit_domain::{
    // ---
    BrokerChannelPtr,
    BrokerConnectionPtr,
    Result,
    ShutdownSignal,
};

use super::notify::{next_shutdown, pending_shutdown, Listeners};

// ---------------------------------------------------------------------------
// LifecycleState / ChannelEvent
// ---------------------------------------------------------------------------

/// Lifecycle state shared by channel and connection handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    // ---
    Disconnected,
    Connected,
    ClosePending,
}

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    // ---
    Open,
    CloseCompleted,
}

// ---------------------------------------------------------------------------
// ChannelId
// ---------------------------------------------------------------------------

/// Process-unique identity of a channel handle. Broker channel numbers are
/// reused across connections, so handles are tracked by this instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ChannelListener
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ChannelListener: Send + Sync {
    // ---
    async fn on_channel_event(&self, channel: ChannelId, event: ChannelEvent);
}

// ---------------------------------------------------------------------------
// ChannelCore
// ---------------------------------------------------------------------------

struct CoreState {
    // ---
    lifecycle: LifecycleState,
    channel: Option<BrokerChannelPtr>,
    /// Bumped on every successful open; a shutdown only completes the open
    /// it was raised for.
    generation: u64,
}

/// State machine and listener list embedded in every channel handle.
pub struct ChannelCore {
    // ---
    id: ChannelId,
    state: Mutex<CoreState>,
    listeners: Listeners<dyn ChannelListener>,
}

// ---

impl ChannelCore {
    // ---
    pub fn new() -> Self {
        Self {
            id: ChannelId::next(),
            state: Mutex::new(CoreState {
                lifecycle: LifecycleState::Disconnected,
                channel: None,
                generation: 0,
            }),
            listeners: Listeners::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    // ---

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn state(&self) -> LifecycleState {
        self.lock().lifecycle
    }

    /// The broker channel, while one is attached.
    pub fn channel(&self) -> Option<BrokerChannelPtr> {
        self.lock().channel.clone()
    }

    /// The broker channel if this handle is `CONNECTED` and the broker
    /// still reports it open.
    pub fn live_channel(&self) -> Option<BrokerChannelPtr> {
        // ---
        let st = self.lock();
        match (&st.lifecycle, &st.channel) {
            (LifecycleState::Connected, Some(ch)) if ch.is_open() => Some(Arc::clone(ch)),
            _ => None,
        }
    }

    // ---

    pub fn add_listener(&self, listener: &Arc<dyn ChannelListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ChannelListener>) {
        self.listeners.remove(listener);
    }

    pub async fn notify(&self, event: ChannelEvent) {
        for listener in self.listeners.snapshot() {
            listener.on_channel_event(self.id, event).await;
        }
    }

    // ---

    /// Attach a freshly created broker channel. `None` if another open got
    /// there first.
    fn attach(&self, channel: &BrokerChannelPtr) -> Option<u64> {
        // ---
        let mut st = self.lock();
        if st.lifecycle != LifecycleState::Disconnected {
            return None;
        }
        st.lifecycle = LifecycleState::Connected;
        st.channel = Some(Arc::clone(channel));
        st.generation += 1;
        Some(st.generation)
    }

    /// `CONNECTED` → `CLOSE_PENDING`, handing back the channel to close.
    fn begin_close(&self) -> Option<(BrokerChannelPtr, u64)> {
        // ---
        let mut st = self.lock();
        if st.lifecycle != LifecycleState::Connected {
            return None;
        }
        let channel = st.channel.clone()?;
        st.lifecycle = LifecycleState::ClosePending;
        Some((channel, st.generation))
    }

    /// Move to `DISCONNECTED` and drop the channel reference.
    ///
    /// Returns `false` when `generation` is no longer the live open or the
    /// handle is already disconnected; the caller must then do nothing.
    pub fn mark_disconnected(&self, generation: u64) -> bool {
        // ---
        let mut st = self.lock();
        if st.generation != generation || st.lifecycle == LifecycleState::Disconnected {
            return false;
        }
        st.lifecycle = LifecycleState::Disconnected;
        st.channel = None;
        true
    }

    fn generation(&self) -> u64 {
        self.lock().generation
    }
}

impl Default for ChannelCore {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// ChannelHandle
// ---------------------------------------------------------------------------

/// A purpose-specific wrapper around one broker channel.
///
/// Implementors supply [`core`](Self::core) and optionally
/// [`on_closed`](Self::on_closed); the lifecycle itself is provided.
/// Opening lives in the free function [`open_channel`] because the shutdown
/// watcher it spawns needs a weak reference to the concrete handle.
#[async_trait]
pub trait ChannelHandle: Send + Sync + 'static {
    // ---
    fn core(&self) -> &ChannelCore;

    /// Runs once per completed shutdown, after the handle is marked
    /// disconnected and before CLOSE_COMPLETED is emitted.
    async fn on_closed(&self) {}

    // ---

    fn id(&self) -> ChannelId {
        self.core().id()
    }

    fn state(&self) -> LifecycleState {
        self.core().state()
    }

    fn is_open(&self) -> bool {
        self.core().live_channel().is_some()
    }

    // ---

    /// Request a broker-side close.
    ///
    /// A no-op unless `CONNECTED`. When the broker refuses the close for any
    /// reason other than an application shutdown, the handle is completed
    /// locally. The broker error is returned either way.
    async fn close(&self) -> Result<()> {
        // ---
        let Some((channel, generation)) = self.core().begin_close() else {
            tracing::warn!(channel = %self.id(), state = ?self.state(), "close ignored, channel not connected");
            return Ok(());
        };

        // The broker may have closed it already; the watcher just has not
        // run yet.
        if let Some(signal) = pending_shutdown(&channel.shutdown_rx()) {
            self.shutdown_completed(generation, signal).await;
            return Ok(());
        }

        match channel.close().await {
            Ok(()) => {
                if let Some(signal) = pending_shutdown(&channel.shutdown_rx()) {
                    self.shutdown_completed(generation, signal).await;
                }
                Ok(())
            }
            Err(e) => {
                if !e.is_application_shutdown() {
                    tracing::warn!(channel = %self.id(), "close failed, completing locally: {e}");
                    self.complete(generation).await;
                }
                Err(e)
            }
        }
    }

    // ---

    /// React to the broker channel's shutdown signal.
    async fn shutdown_completed(&self, generation: u64, signal: ShutdownSignal) {
        // ---
        if !signal.initiated_by_application && self.core().generation() == generation {
            tracing::warn!(channel = %self.id(), "channel suddenly closed: {signal}");
        }
        self.complete(generation).await;
    }

    /// Complete the open `generation` without waiting for a broker signal.
    async fn complete(&self, generation: u64) {
        // ---
        if !self.core().mark_disconnected(generation) {
            return;
        }
        self.on_closed().await;
        tracing::debug!(channel = %self.id(), "channel closed");
        self.core().notify(ChannelEvent::CloseCompleted).await;
    }
}

// ---------------------------------------------------------------------------
// open_channel
// ---------------------------------------------------------------------------

/// Open `handle` on `connection`.
///
/// A no-op with a warning unless the handle is `DISCONNECTED`; the channel
/// it already holds is kept. On success the handle is `CONNECTED`, its
/// shutdown signal is watched, and OPEN has been delivered to its listeners
/// by the time this returns.
pub async fn open_channel<H>(handle: &Arc<H>, connection: &BrokerConnectionPtr) -> Result<()>
where
    H: ChannelHandle,
{
    // ---
    let core = handle.core();
    if core.state() != LifecycleState::Disconnected {
        tracing::warn!(channel = %core.id(), state = ?core.state(), "open ignored, channel already open");
        return Ok(());
    }

    let channel = connection.create_channel().await?;

    // Subscribe before attaching so a close that races the attach is seen.
    let rx = channel.shutdown_rx();

    let Some(generation) = core.attach(&channel) else {
        tracing::warn!(channel = %core.id(), "open raced another open, discarding broker channel");
        let _ = channel.close().await;
        return Ok(());
    };

    let weak: Weak<H> = Arc::downgrade(handle);
    tokio::spawn(async move {
        // ---
        let Some(signal) = next_shutdown(rx).await else {
            return;
        };
        if let Some(handle) = weak.upgrade() {
            handle.shutdown_completed(generation, signal).await;
        }
    });

    tracing::debug!(channel = %core.id(), number = channel.channel_number(), "channel open");
    core.notify(ChannelEvent::Open).await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::testing::EventLog;
    use roborabbit_broker_sim::{SimBroker, SimConfig};
    use roborabbit_domain::{BrokerConnector, BrokerError, ConnectParams};
    use std::time::Duration;

    struct Plain {
        core: ChannelCore,
    }

    impl ChannelHandle for Plain {
        fn core(&self) -> &ChannelCore {
            &self.core
        }
    }

    async fn setup() -> (SimBroker, BrokerConnectionPtr, Arc<Plain>, Arc<EventLog>) {
        // ---
        let broker = SimBroker::new(SimConfig::default());
        let conn = broker
            .connector()
            .connect(&ConnectParams {
                uri: "amqp://sim".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let handle = Arc::new(Plain {
            core: ChannelCore::new(),
        });
        let log = EventLog::new();
        let listener: Arc<dyn ChannelListener> = log.clone();
        handle.core().add_listener(&listener);
        (broker, conn, handle, log)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn open_close_walks_the_state_machine() {
        // ---
        let (_broker, conn, handle, log) = setup().await;
        assert_eq!(handle.state(), LifecycleState::Disconnected);

        open_channel(&handle, &conn).await.unwrap();
        assert_eq!(handle.state(), LifecycleState::Connected);
        assert!(handle.is_open());

        handle.close().await.unwrap();
        assert_eq!(handle.state(), LifecycleState::Disconnected);
        assert!(handle.core().channel().is_none());

        settle().await;
        assert_eq!(log.events(), vec![ChannelEvent::Open, ChannelEvent::CloseCompleted]);
    }

    // ---

    #[tokio::test]
    async fn double_open_keeps_the_first_channel() {
        // ---
        let (_broker, conn, handle, log) = setup().await;

        open_channel(&handle, &conn).await.unwrap();
        let first = handle.core().channel().unwrap();

        open_channel(&handle, &conn).await.unwrap();
        let second = handle.core().channel().unwrap();

        assert_eq!(first.channel_number(), second.channel_number());
        assert!(first.is_open());
        assert_eq!(log.events(), vec![ChannelEvent::Open]);
    }

    // ---

    #[tokio::test]
    async fn close_when_not_connected_is_a_no_op() {
        // ---
        let (_broker, _conn, handle, log) = setup().await;
        handle.close().await.unwrap();
        assert_eq!(handle.state(), LifecycleState::Disconnected);
        assert!(log.events().is_empty());
    }

    // ---

    #[tokio::test]
    async fn broker_side_close_completes_once() {
        // ---
        let (broker, conn, handle, log) = setup().await;
        open_channel(&handle, &conn).await.unwrap();

        broker.drop_connections();
        tokio::time::timeout(Duration::from_secs(1), async {
            while handle.state() != LifecycleState::Disconnected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // A late close finds nothing to do.
        handle.close().await.unwrap();
        settle().await;
        assert_eq!(log.events(), vec![ChannelEvent::Open, ChannelEvent::CloseCompleted]);
    }

    // ---

    #[tokio::test]
    async fn failed_close_completes_locally_and_reports_the_error() {
        // ---
        let (broker, conn, handle, log) = setup().await;
        open_channel(&handle, &conn).await.unwrap();

        broker.set_fail_channel_close(true);
        let err = handle.close().await.unwrap_err();
        assert!(matches!(err, BrokerError::Channel(_)));
        assert_eq!(handle.state(), LifecycleState::Disconnected);

        settle().await;
        assert_eq!(log.events(), vec![ChannelEvent::Open, ChannelEvent::CloseCompleted]);
    }

    // ---

    #[tokio::test]
    async fn refused_channel_leaves_the_handle_disconnected() {
        // ---
        let (broker, conn, handle, log) = setup().await;
        broker.set_refuse_channels(true);

        assert!(open_channel(&handle, &conn).await.is_err());
        assert_eq!(handle.state(), LifecycleState::Disconnected);
        assert!(log.events().is_empty());
    }
}
