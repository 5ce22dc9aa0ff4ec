use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

// ---

use tokio::sync::mpsc;

// ---

use roborabbit_domain::{
    // ---
    ConnectParams,
    Delivery,
    Envelope,
    ExchangeType,
    MessageProperties,
    ShutdownSignal,
};

// ---

use super::config::SimConfig;
use super::connection::{SimConnection, SimConnector};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One message accepted by `basic_publish`.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    // ---
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

/// One `queue_bind` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    // ---
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

// ---

/// A live consumer registered through `basic_consume`.
pub(crate) struct Consumer {
    // ---
    pub(crate) queue: String,
    pub(crate) connection_id: u64,
    pub(crate) channel_number: u16,
    pub(crate) tx: mpsc::UnboundedSender<Delivery>,
}

// ---------------------------------------------------------------------------
// BrokerState
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct BrokerState {
    // ---
    pub(crate) config: SimConfig,
    pub(crate) connections: Vec<Weak<SimConnection>>,
    pub(crate) consumers: Vec<Consumer>,
    pub(crate) published: Vec<PublishedMessage>,
    pub(crate) acks: Vec<u64>,
    pub(crate) exchanges: Vec<(String, ExchangeType)>,
    pub(crate) bindings: Vec<Binding>,
    pub(crate) queues: HashSet<String>,
    pub(crate) last_params: Option<ConnectParams>,
    pub(crate) connect_count: usize,
    next_connection_id: u64,
    next_delivery_tag: u64,
}

// ---

impl BrokerState {
    // ---
    pub(crate) fn next_connection_id(&mut self) -> u64 {
        self.next_connection_id += 1;
        self.next_connection_id
    }
}

// ---------------------------------------------------------------------------
// SimBroker
// ---------------------------------------------------------------------------

/// Shared in-memory broker. Cheap to clone; all clones see the same state.
#[derive(Clone, Default)]
pub struct SimBroker {
    // ---
    inner: Arc<Mutex<BrokerState>>,
}

// ---

impl SimBroker {
    // ---
    pub fn new(config: SimConfig) -> Self {
        // ---
        let state = BrokerState {
            config,
            ..Default::default()
        };
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    // ---

    /// Connector that opens connections against this broker.
    pub fn connector(&self) -> SimConnector {
        SimConnector::new(self.clone())
    }

    // ---

    pub(crate) fn state(&self) -> MutexGuard<'_, BrokerState> {
        // A panicking test thread must not cascade into every other test.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // --- failure injection -------------------------------------------------

    pub fn set_refuse_connections(&self, on: bool) {
        self.state().config.refuse_connections = on;
    }

    pub fn set_refuse_channels(&self, on: bool) {
        self.state().config.refuse_channels = on;
    }

    pub fn set_fail_publish(&self, on: bool) {
        self.state().config.fail_publish = on;
    }

    pub fn set_fail_channel_close(&self, on: bool) {
        self.state().config.fail_channel_close = on;
    }

    pub fn set_swallow_connection_close(&self, on: bool) {
        self.state().config.swallow_connection_close = on;
    }

    // ---

    /// Make `queue` known so passive declares succeed.
    pub fn declare_queue(&self, queue: &str) {
        self.state().queues.insert(queue.to_owned());
    }

    // ---

    /// Drop every live connection as a network failure would: each
    /// connection and its channels report a non-application shutdown.
    pub fn drop_connections(&self) {
        // ---
        let live: Vec<Arc<SimConnection>> = {
            let state = self.state();
            state.connections.iter().filter_map(Weak::upgrade).collect()
        };
        for conn in live {
            conn.shut_down(ShutdownSignal::external("connection reset by peer"));
        }
    }

    // ---

    /// Close, broker-side, every channel currently consuming `queue`.
    pub fn kill_consumers(&self, queue: &str) {
        // ---
        let (targets, live): (Vec<(u64, u16)>, Vec<Arc<SimConnection>>) = {
            let state = self.state();
            let targets = state
                .consumers
                .iter()
                .filter(|c| c.queue == queue)
                .map(|c| (c.connection_id, c.channel_number))
                .collect();
            let live = state.connections.iter().filter_map(Weak::upgrade).collect();
            (targets, live)
        };

        for (connection_id, number) in targets {
            if let Some(conn) = live.iter().find(|c| c.id() == connection_id) {
                conn.kill_channel(number, ShutdownSignal::external("channel closed by broker"));
            }
        }
    }

    // --- deliveries --------------------------------------------------------

    /// Push a message onto `queue`, handing it to the first live consumer.
    ///
    /// Returns the delivery tag, or `None` if nobody consumes the queue.
    pub fn deliver(&self, queue: &str, properties: MessageProperties, body: &[u8]) -> Option<u64> {
        // ---
        let mut state = self.state();
        state.consumers.retain(|c| !c.tx.is_closed());

        state.next_delivery_tag += 1;
        let tag = state.next_delivery_tag;

        let consumer = state.consumers.iter().find(|c| c.queue == queue)?;
        let delivery = Delivery {
            envelope: Envelope {
                delivery_tag: tag,
                redelivered: false,
                exchange: String::new(),
                routing_key: queue.to_owned(),
            },
            properties,
            body: body.to_vec(),
        };
        consumer.tx.send(delivery).ok()?;
        Some(tag)
    }

    // --- inspection --------------------------------------------------------

    pub fn acks(&self) -> Vec<u64> {
        self.state().acks.clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }

    pub fn exchanges(&self) -> Vec<(String, ExchangeType)> {
        self.state().exchanges.clone()
    }

    pub fn bindings(&self) -> Vec<Binding> {
        self.state().bindings.clone()
    }

    /// Parameters of the most recent connection attempt.
    pub fn last_params(&self) -> Option<ConnectParams> {
        self.state().last_params.clone()
    }

    /// Number of successful connection attempts so far.
    pub fn connect_count(&self) -> usize {
        self.state().connect_count
    }

    pub fn live_connections(&self) -> usize {
        // ---
        let state = self.state();
        state
            .connections
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| c.is_live())
            .count()
    }

    /// Number of open consumers on `queue`.
    pub fn consumer_count(&self, queue: &str) -> usize {
        // ---
        let state = self.state();
        state
            .consumers
            .iter()
            .filter(|c| c.queue == queue && !c.tx.is_closed())
            .count()
    }

    // ---

    /// Poll `cond` every few milliseconds until it holds.
    ///
    /// Callers bound the wait with `tokio::time::timeout`.
    pub async fn wait_for<F>(&self, cond: F)
    where
        F: Fn(&SimBroker) -> bool,
    {
        // ---
        while !cond(self) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
