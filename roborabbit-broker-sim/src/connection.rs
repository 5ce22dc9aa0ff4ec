use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

// ---

use async_trait::async_trait;
use tokio::sync::watch;

// ---

use roborabbit_domain::{
    // ---
    BrokerChannelPtr,
    BrokerConnection,
    BrokerConnectionPtr,
    BrokerConnector,
    BrokerError,
    ConnectParams,
    Result,
    ShutdownRx,
    ShutdownSignal,
};

// ---

use super::broker::SimBroker;
use super::channel::SimChannel;

// ---------------------------------------------------------------------------
// SimConnector
// ---------------------------------------------------------------------------

/// In-process connector. Does not use real sockets.
pub struct SimConnector {
    // ---
    broker: SimBroker,
}

// ---

impl SimConnector {
    // ---
    pub fn new(broker: SimBroker) -> Self {
        Self { broker }
    }
}

// ---

#[async_trait]
impl BrokerConnector for SimConnector {
    // ---
    async fn connect(&self, params: &ConnectParams) -> Result<BrokerConnectionPtr> {
        // ---
        let mut state = self.broker.state();
        state.last_params = Some(params.clone());

        if state.config.refuse_connections {
            return Err(BrokerError::Connection(format!(
                "connection refused: {}",
                params.uri
            )));
        }

        let id = state.next_connection_id();
        let conn = Arc::new(SimConnection::new(id, self.broker.clone()));
        state.connections.push(Arc::downgrade(&conn));
        state.connect_count += 1;

        Ok(conn)
    }
}

// ---------------------------------------------------------------------------
// SimConnection
// ---------------------------------------------------------------------------

/// In-process broker connection.
pub struct SimConnection {
    // ---
    id: u64,
    broker: SimBroker,
    channels: Mutex<Vec<Arc<SimChannel>>>,
    next_channel: AtomicU16,
    shutdown_tx: watch::Sender<Option<ShutdownSignal>>,
}

// ---

impl SimConnection {
    // ---
    fn new(id: u64, broker: SimBroker) -> Self {
        // ---
        let (shutdown_tx, _) = watch::channel(None);
        Self {
            id,
            broker,
            channels: Mutex::new(Vec::new()),
            next_channel: AtomicU16::new(1),
            shutdown_tx,
        }
    }

    // ---

    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_live(&self) -> bool {
        self.shutdown_tx.borrow().is_none()
    }

    // ---

    fn take_channels(&self) -> Vec<Arc<SimChannel>> {
        let mut guard = self.channels.lock().unwrap_or_else(|p| p.into_inner());
        std::mem::take(&mut *guard)
    }

    // ---

    /// Close this connection and all its channels with `signal`.
    ///
    /// Only the first call has any effect.
    pub(crate) fn shut_down(&self, signal: ShutdownSignal) {
        // ---
        if !self.is_live() {
            return;
        }
        for ch in self.take_channels() {
            ch.shut_down(signal.clone());
        }
        self.shutdown_tx.send_replace(Some(signal));
    }

    // ---

    pub(crate) fn kill_channel(&self, number: u16, signal: ShutdownSignal) {
        // ---
        let target = {
            let guard = self.channels.lock().unwrap_or_else(|p| p.into_inner());
            guard.iter().find(|c| c.number() == number).cloned()
        };
        if let Some(ch) = target {
            ch.shut_down(signal);
        }
    }
}

// ---

#[async_trait]
impl BrokerConnection for SimConnection {
    // ---
    async fn create_channel(&self) -> Result<BrokerChannelPtr> {
        // ---
        if !self.is_live() {
            return Err(BrokerError::Connection("connection is closed".into()));
        }
        if self.broker.state().config.refuse_channels {
            return Err(BrokerError::Channel("channel creation refused".into()));
        }

        let number = self.next_channel.fetch_add(1, Ordering::Relaxed);
        let ch = Arc::new(SimChannel::new(number, self.id, self.broker.clone()));

        let mut guard = self.channels.lock().unwrap_or_else(|p| p.into_inner());
        guard.retain(|c| c.is_live());
        guard.push(Arc::clone(&ch));

        Ok(ch)
    }

    // ---

    fn is_open(&self) -> bool {
        self.is_live()
    }

    fn shutdown_rx(&self) -> ShutdownRx {
        self.shutdown_tx.subscribe()
    }

    // ---

    async fn close(&self) -> Result<()> {
        // ---
        if !self.is_live() {
            return Err(BrokerError::Shutdown(ShutdownSignal::application(
                "connection already closed",
            )));
        }
        if self.broker.state().config.swallow_connection_close {
            return Ok(());
        }
        self.shut_down(ShutdownSignal::application("connection closed by application"));
        Ok(())
    }
}
