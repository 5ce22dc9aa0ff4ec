use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use super::error::Result;
use super::message::{Delivery, MessageProperties};
use super::publish::ExchangeType;
use super::secret::Secret;

// ---------------------------------------------------------------------------
// ShutdownSignal
// ---------------------------------------------------------------------------

/// Notification that a broker connection or channel has closed.
///
/// The broker adapter decides `initiated_by_application` once, at the
/// point where it observes the close: `true` when the close was requested
/// through [`BrokerConnection::close`] / [`BrokerChannel::close`], `false`
/// for broker-side closes and network failures. Everything above the
/// adapter trusts this flag instead of re-deriving it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownSignal {
    // ---
    pub initiated_by_application: bool,
    pub reason: String,
}

// ---

impl ShutdownSignal {
    // ---
    /// Close requested by this process.
    pub fn application(reason: impl Into<String>) -> Self {
        Self {
            initiated_by_application: true,
            reason: reason.into(),
        }
    }

    /// Close caused by the broker or the network.
    pub fn external(reason: impl Into<String>) -> Self {
        Self {
            initiated_by_application: false,
            reason: reason.into(),
        }
    }
}

// ---

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let origin = if self.initiated_by_application {
            "application"
        } else {
            "broker"
        };
        write!(f, "{} ({origin})", self.reason)
    }
}

// ---

/// Watch receiver that flips from `None` to `Some(signal)` exactly once,
/// when the owning connection or channel shuts down.
///
/// Use [`watch::Receiver::wait_for`] to await the transition.
pub type ShutdownRx = watch::Receiver<Option<ShutdownSignal>>;

/// Inbound deliveries for one consumer. Closes when the channel shuts down.
pub type DeliveryRx = mpsc::UnboundedReceiver<Delivery>;

// ---------------------------------------------------------------------------
// ConnectParams
// ---------------------------------------------------------------------------

/// Network-level parameters for one broker connection attempt.
///
/// Empty `username` / `password` values are treated as absent by adapters,
/// so the URI's own user info (or the broker default) applies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectParams {
    // ---
    pub uri: String,
    pub username: Option<String>,
    pub password: Option<Secret>,
}

// ---------------------------------------------------------------------------
// BrokerChannel
// ---------------------------------------------------------------------------

/// One multiplexed channel over a live broker connection.
///
/// Channels are not safe for interleaved writes from several tasks; callers
/// that publish serialize their sends (see the publish channel handle in
/// `roborabbit-agent`).
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    // ---
    /// Broker-assigned channel number, for logging.
    fn channel_number(&self) -> u16;

    /// `true` until the channel closes for any reason.
    fn is_open(&self) -> bool;

    /// Subscribe to this channel's shutdown signal.
    fn shutdown_rx(&self) -> ShutdownRx;

    /// Start a manual-ack consumer on `queue`.
    async fn basic_consume(&self, queue: &str) -> Result<DeliveryRx>;

    /// Acknowledge a single delivery (no multiple, no requeue).
    async fn basic_ack(&self, delivery_tag: u64) -> Result<()>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: &MessageProperties,
        body: &[u8],
    ) -> Result<()>;

    async fn exchange_declare(&self, exchange: &str, kind: ExchangeType) -> Result<()>;

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Check that `queue` exists without creating it.
    async fn queue_declare_passive(&self, queue: &str) -> Result<()>;

    /// Request a graceful close. The shutdown signal that follows carries
    /// `initiated_by_application = true`.
    async fn close(&self) -> Result<()>;
}

/// Shared handle to a [`BrokerChannel`].
pub type BrokerChannelPtr = Arc<dyn BrokerChannel>;

// ---------------------------------------------------------------------------
// BrokerConnection
// ---------------------------------------------------------------------------

/// One live broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    // ---
    async fn create_channel(&self) -> Result<BrokerChannelPtr>;

    fn is_open(&self) -> bool;

    /// Subscribe to the connection-level shutdown signal.
    fn shutdown_rx(&self) -> ShutdownRx;

    /// Request a graceful close of the connection and all its channels.
    async fn close(&self) -> Result<()>;
}

/// Shared handle to a [`BrokerConnection`].
pub type BrokerConnectionPtr = Arc<dyn BrokerConnection>;

// ---------------------------------------------------------------------------
// BrokerConnector
// ---------------------------------------------------------------------------

/// Factory for broker connections.
///
/// Implementations: `roborabbit_amqp::AmqpConnector`,
/// `roborabbit_broker_sim::SimConnector`.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    // ---
    async fn connect(&self, params: &ConnectParams) -> Result<BrokerConnectionPtr>;
}
