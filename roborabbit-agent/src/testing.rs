//! Shared fixtures for the unit tests: recording collaborators and a
//! manager wired to the broker simulator.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use roborabbit_broker_sim::{SimBroker, SimConfig};
use roborabbit_domain::{
    // ---
    BrokerChannel,
    BrokerConnectionPtr,
    BrokerConnector,
    ConnectParams,
    ConsumeItem,
    ExchangeType,
    MessageContext,
    MessageQueueListener,
    ServerOperator,
};

use super::{
    // ---
    BrokerConfig,
    ChannelEvent,
    ChannelId,
    ChannelListener,
    ConnectionEvent,
    ConnectionHandle,
    ConnectionListener,
    ConnectionManager,
    Credentials,
    ManagerContext,
    StaticConfigSource,
    DEFAULT_CLOSE_TIMEOUT,
};

fn locked<T: Clone>(m: &Mutex<T>) -> T {
    m.lock().unwrap_or_else(|p| p.into_inner()).clone()
}

// ---------------------------------------------------------------------------
// Broker fixtures
// ---------------------------------------------------------------------------

pub(crate) async fn sim_connection() -> (SimBroker, BrokerConnectionPtr) {
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
    (broker, conn)
}

// ---------------------------------------------------------------------------
// Lifecycle event logs
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct EventLog {
    events: Mutex<Vec<ChannelEvent>>,
}

impl EventLog {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn events(&self) -> Vec<ChannelEvent> {
        locked(&self.events)
    }
}

#[async_trait]
impl ChannelListener for EventLog {
    async fn on_channel_event(&self, _channel: ChannelId, event: ChannelEvent) {
        self.events.lock().unwrap().push(event);
    }
}

// ---

#[derive(Default)]
pub(crate) struct ConnectionLog {
    events: Mutex<Vec<ConnectionEvent>>,
}

impl ConnectionLog {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn events(&self) -> Vec<ConnectionEvent> {
        locked(&self.events)
    }
}

#[async_trait]
impl ConnectionListener for ConnectionLog {
    async fn on_connection_event(&self, _connection: &Arc<ConnectionHandle>, event: ConnectionEvent) {
        self.events.lock().unwrap().push(event);
    }
}

// ---------------------------------------------------------------------------
// RecordingListener
// ---------------------------------------------------------------------------

pub(crate) struct RecordingListener {
    app_id: String,
    fail: bool,
    bound: Mutex<Vec<String>>,
    unbound: Mutex<Vec<String>>,
    received: Mutex<Vec<MessageContext>>,
}

impl RecordingListener {
    // ---
    fn build(app_id: &str, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            app_id: app_id.to_owned(),
            fail,
            bound: Mutex::default(),
            unbound: Mutex::default(),
            received: Mutex::default(),
        })
    }

    pub(crate) fn new(app_id: &str) -> Arc<Self> {
        Self::build(app_id, false)
    }

    /// Records like [`new`](Self::new) but every callback returns an error.
    pub(crate) fn failing(app_id: &str) -> Arc<Self> {
        Self::build(app_id, true)
    }

    pub(crate) fn bound(&self) -> Vec<String> {
        locked(&self.bound)
    }

    pub(crate) fn unbound(&self) -> Vec<String> {
        locked(&self.unbound)
    }

    pub(crate) fn received(&self) -> Vec<MessageContext> {
        locked(&self.received)
    }

    fn outcome(&self) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("{} refused", self.app_id);
        }
        Ok(())
    }
}

#[async_trait]
impl MessageQueueListener for RecordingListener {
    // ---
    fn name(&self) -> &str {
        "recording"
    }

    fn app_id(&self) -> &str {
        &self.app_id
    }

    async fn on_bind(&self, queue_name: &str) -> anyhow::Result<()> {
        self.bound.lock().unwrap().push(queue_name.to_owned());
        self.outcome()
    }

    async fn on_unbind(&self, queue_name: &str) -> anyhow::Result<()> {
        self.unbound.lock().unwrap().push(queue_name.to_owned());
        self.outcome()
    }

    async fn on_receive(&self, context: &MessageContext, _body: &[u8]) -> anyhow::Result<()> {
        self.received.lock().unwrap().push(context.clone());
        self.outcome()
    }
}

// ---------------------------------------------------------------------------
// Operators
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct RecordingOperator {
    fail: bool,
    opened: Mutex<Vec<String>>,
    closed: Mutex<Vec<String>>,
}

impl RecordingOperator {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    pub(crate) fn opened(&self) -> Vec<String> {
        locked(&self.opened)
    }

    pub(crate) fn closed(&self) -> Vec<String> {
        locked(&self.closed)
    }
}

#[async_trait]
impl ServerOperator for RecordingOperator {
    // ---
    fn name(&self) -> &str {
        "recording-operator"
    }

    async fn on_open(&self, _control: &dyn BrokerChannel, service_uri: &str) -> anyhow::Result<()> {
        self.opened.lock().unwrap().push(service_uri.to_owned());
        if self.fail {
            anyhow::bail!("operator refused {service_uri}");
        }
        Ok(())
    }

    async fn on_close_completed(&self, service_uri: &str) -> anyhow::Result<()> {
        self.closed.lock().unwrap().push(service_uri.to_owned());
        Ok(())
    }
}

// ---

/// Declares a topic exchange and binds an existing queue to it.
pub(crate) struct TopologyOperator {
    exchange: String,
    queue: String,
    opened: Mutex<Vec<String>>,
}

impl TopologyOperator {
    pub(crate) fn new(exchange: &str, queue: &str) -> Arc<Self> {
        Arc::new(Self {
            exchange: exchange.to_owned(),
            queue: queue.to_owned(),
            opened: Mutex::default(),
        })
    }

    pub(crate) fn opened(&self) -> Vec<String> {
        locked(&self.opened)
    }
}

#[async_trait]
impl ServerOperator for TopologyOperator {
    // ---
    fn name(&self) -> &str {
        "topology"
    }

    async fn on_open(&self, control: &dyn BrokerChannel, service_uri: &str) -> anyhow::Result<()> {
        control.queue_declare_passive(&self.queue).await?;
        control.exchange_declare(&self.exchange, ExchangeType::Topic).await?;
        control.queue_bind(&self.queue, &self.exchange, "").await?;
        self.opened.lock().unwrap().push(service_uri.to_owned());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Manager harness
// ---------------------------------------------------------------------------

pub(crate) struct Harness {
    pub broker: SimBroker,
    pub source: Arc<StaticConfigSource>,
    pub manager: Arc<ConnectionManager>,
    pub operator: Arc<RecordingOperator>,
}

/// A manager over a fresh simulator, reading `config` from a static source.
pub(crate) fn harness(config: BrokerConfig) -> Harness {
    // ---
    let broker = SimBroker::new(SimConfig::default());
    let source = Arc::new(StaticConfigSource::new(config));
    let operator = RecordingOperator::new();

    let ctx = ManagerContext::default();
    ctx.operators.register(operator.clone());

    let manager = ConnectionManager::new(
        source.clone(),
        Arc::new(broker.connector()),
        ctx,
        DEFAULT_CLOSE_TIMEOUT,
    );
    Harness {
        broker,
        source,
        manager,
        operator,
    }
}

/// Consumer enabled against `amqp://sim:5672` as `ci`/`pw`, one-second
/// watchdog, with the given `(queue, app_id)` pairs.
pub(crate) fn enabled_config(items: &[(&str, &str)]) -> BrokerConfig {
    // ---
    BrokerConfig {
        service_uri: Some("amqp://sim:5672".into()),
        credentials: Some(Credentials {
            username: "ci".into(),
            password: Some("pw".into()),
            ..Credentials::default()
        }),
        watchdog_period_ms: 1_000,
        enable_consumer: true,
        enable_debug: false,
        consume_items: items
            .iter()
            .map(|(queue, app_id)| ConsumeItem::new(Some(app_id), Some(queue)))
            .collect(),
    }
}
