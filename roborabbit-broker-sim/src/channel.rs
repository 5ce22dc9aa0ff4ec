use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

// ---

use roborabbit_domain::{
    // ---
    BrokerChannel,
    BrokerError,
    DeliveryRx,
    ExchangeType,
    MessageProperties,
    Result,
    ShutdownRx,
    ShutdownSignal,
};

// ---

use super::broker::{Binding, Consumer, PublishedMessage, SimBroker};

// ---------------------------------------------------------------------------
// SimChannel
// ---------------------------------------------------------------------------

/// In-process channel. Every operation is recorded on the owning
/// [`SimBroker`].
pub struct SimChannel {
    // ---
    number: u16,
    connection_id: u64,
    broker: SimBroker,
    shutdown_tx: watch::Sender<Option<ShutdownSignal>>,
}

// ---

impl SimChannel {
    // ---
    pub(crate) fn new(number: u16, connection_id: u64, broker: SimBroker) -> Self {
        // ---
        let (shutdown_tx, _) = watch::channel(None);
        Self {
            number,
            connection_id,
            broker,
            shutdown_tx,
        }
    }

    // ---

    pub fn number(&self) -> u16 {
        self.number
    }

    pub(crate) fn is_live(&self) -> bool {
        self.shutdown_tx.borrow().is_none()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_live() {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }

    // ---

    /// Close the channel with `signal`, dropping its consumers so their
    /// delivery streams end. Only the first call has any effect.
    pub(crate) fn shut_down(&self, signal: ShutdownSignal) {
        // ---
        if !self.is_live() {
            return;
        }
        {
            let mut state = self.broker.state();
            state.consumers.retain(|c| {
                !(c.connection_id == self.connection_id && c.channel_number == self.number)
            });
        }
        self.shutdown_tx.send_replace(Some(signal));
    }
}

// ---

#[async_trait]
impl BrokerChannel for SimChannel {
    // ---
    fn channel_number(&self) -> u16 {
        self.number
    }

    fn is_open(&self) -> bool {
        self.is_live()
    }

    fn shutdown_rx(&self) -> ShutdownRx {
        self.shutdown_tx.subscribe()
    }

    // ---

    async fn basic_consume(&self, queue: &str) -> Result<DeliveryRx> {
        // ---
        self.ensure_open()?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.broker.state().consumers.push(Consumer {
            queue: queue.to_owned(),
            connection_id: self.connection_id,
            channel_number: self.number,
            tx,
        });
        Ok(rx)
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        // ---
        self.ensure_open()?;
        self.broker.state().acks.push(delivery_tag);
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: &MessageProperties,
        body: &[u8],
    ) -> Result<()> {
        // ---
        self.ensure_open()?;

        let mut state = self.broker.state();
        if state.config.fail_publish {
            return Err(BrokerError::Channel("simulated publish failure".into()));
        }
        state.published.push(PublishedMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties: properties.clone(),
            body: body.to_vec(),
        });
        Ok(())
    }

    // ---

    async fn exchange_declare(&self, exchange: &str, kind: ExchangeType) -> Result<()> {
        // ---
        self.ensure_open()?;
        self.broker.state().exchanges.push((exchange.to_owned(), kind));
        Ok(())
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        // ---
        self.ensure_open()?;
        self.broker.state().bindings.push(Binding {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        });
        Ok(())
    }

    async fn queue_declare_passive(&self, queue: &str) -> Result<()> {
        // ---
        self.ensure_open()?;
        if self.broker.state().queues.contains(queue) {
            Ok(())
        } else {
            Err(BrokerError::Channel(format!(
                "NOT_FOUND - no queue '{queue}'"
            )))
        }
    }

    // ---

    async fn close(&self) -> Result<()> {
        // ---
        self.ensure_open()?;
        if self.broker.state().config.fail_channel_close {
            return Err(BrokerError::Channel("simulated close failure".into()));
        }
        self.shut_down(ShutdownSignal::application("channel closed by application"));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::SimConfig;
    use roborabbit_domain::{BrokerConnector, ConnectParams};

    fn params() -> ConnectParams {
        ConnectParams {
            uri: "amqp://localhost:5672".into(),
            ..Default::default()
        }
    }

    // ---

    #[tokio::test]
    async fn delivery_reaches_consumer_and_ack_is_recorded() {
        // ---
        let broker = SimBroker::new(SimConfig::default());
        let conn = broker.connector().connect(&params()).await.unwrap();
        let ch = conn.create_channel().await.unwrap();

        let mut rx = ch.basic_consume("builds").await.unwrap();
        let tag = broker
            .deliver("builds", MessageProperties::default(), b"hello")
            .unwrap();

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.envelope.delivery_tag, tag);
        assert_eq!(delivery.body, b"hello");

        ch.basic_ack(tag).await.unwrap();
        assert_eq!(broker.acks(), vec![tag]);
    }

    // ---

    #[tokio::test]
    async fn dropped_connection_signals_external_shutdown_everywhere() {
        // ---
        let broker = SimBroker::new(SimConfig::default());
        let conn = broker.connector().connect(&params()).await.unwrap();
        let ch = conn.create_channel().await.unwrap();
        let mut rx = ch.basic_consume("builds").await.unwrap();

        broker.drop_connections();

        let sig = ch.shutdown_rx().borrow().clone().unwrap();
        assert!(!sig.initiated_by_application);
        let sig = conn.shutdown_rx().borrow().clone().unwrap();
        assert!(!sig.initiated_by_application);
        assert!(rx.recv().await.is_none());
        assert_eq!(broker.consumer_count("builds"), 0);
    }

    // ---

    #[tokio::test]
    async fn application_close_is_flagged_and_idempotent() {
        // ---
        let broker = SimBroker::new(SimConfig::default());
        let conn = broker.connector().connect(&params()).await.unwrap();
        let ch = conn.create_channel().await.unwrap();

        ch.close().await.unwrap();
        assert!(!ch.is_open());
        let sig = ch.shutdown_rx().borrow().clone().unwrap();
        assert!(sig.initiated_by_application);
        assert!(matches!(ch.close().await, Err(BrokerError::ChannelClosed)));
    }

    // ---

    #[tokio::test]
    async fn injected_failures() {
        // ---
        let broker = SimBroker::new(SimConfig::unreachable());
        assert!(broker.connector().connect(&params()).await.is_err());
        assert!(broker.last_params().is_some());

        broker.set_refuse_connections(false);
        broker.set_fail_publish(true);
        let conn = broker.connector().connect(&params()).await.unwrap();
        let ch = conn.create_channel().await.unwrap();

        let props = MessageProperties::default();
        assert!(ch.basic_publish("ex", "rk", &props, b"x").await.is_err());
        assert!(ch.queue_declare_passive("missing").await.is_err());

        broker.declare_queue("present");
        assert!(ch.queue_declare_passive("present").await.is_ok());
        assert_eq!(broker.connect_count(), 1);
    }
}
