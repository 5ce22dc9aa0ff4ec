//! [`AmqpChannel`]: a lapin channel implementing [`BrokerChannel`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    // ---
    BasicAckOptions,
    BasicConsumeOptions,
    BasicPublishOptions,
    ExchangeDeclareOptions,
    QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::ExchangeKind;
use tokio::sync::mpsc;

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

use crate::error::AmqpError;
use crate::props;
use crate::signal::{fire_once, is_fired, SignalTx};

// ---------------------------------------------------------------------------
// AmqpChannel
// ---------------------------------------------------------------------------

/// One lapin channel.
///
/// lapin has no per-channel close callback. A close is observed three ways:
/// the connection's error callback fires every child channel, a consumer
/// stream ends, or an operation fails on a channel lapin reports as no
/// longer connected. The first one wins.
pub struct AmqpChannel {
    // ---
    channel: lapin::Channel,
    shutdown: SignalTx,
    closing: Arc<AtomicBool>,
}

// ---

impl AmqpChannel {
    // ---
    pub(crate) fn new(channel: lapin::Channel, shutdown: SignalTx) -> Self {
        Self {
            channel,
            shutdown,
            closing: Arc::new(AtomicBool::new(false)),
        }
    }

    // ---

    fn ensure_open(&self) -> Result<()> {
        // ---
        if is_fired(&self.shutdown) || !self.channel.status().connected() {
            return Err(AmqpError::ChannelClosed.into());
        }
        Ok(())
    }

    // ---

    /// Map a lapin failure, reporting an external shutdown if it left the
    /// channel closed.
    fn fail(&self, e: lapin::Error) -> BrokerError {
        // ---
        if !self.channel.status().connected() && !self.closing.load(Ordering::Acquire) {
            let reason = format!("channel {} closed: {e}", self.channel.id());
            fire_once(&self.shutdown, ShutdownSignal::external(reason));
        }
        AmqpError::Channel(e).into()
    }
}

// ---

#[async_trait]
impl BrokerChannel for AmqpChannel {
    // ---
    fn channel_number(&self) -> u16 {
        self.channel.id()
    }

    fn is_open(&self) -> bool {
        !is_fired(&self.shutdown) && self.channel.status().connected()
    }

    fn shutdown_rx(&self) -> ShutdownRx {
        self.shutdown.subscribe()
    }

    // ---

    async fn basic_consume(&self, queue: &str) -> Result<DeliveryRx> {
        // ---
        self.ensure_open()?;

        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.fail(e))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = Arc::clone(&self.shutdown);
        let closing = Arc::clone(&self.closing);
        let channel_id = self.channel.id();
        let queue = queue.to_owned();

        tokio::spawn(async move {
            // ---
            while let Some(item) = consumer.next().await {
                match item {
                    Ok(delivery) => {
                        if tx.send(props::delivery(&delivery)).is_err() {
                            // Receiver gone; the handle stopped consuming.
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(channel = channel_id, %queue, "consumer error: {e}");
                        break;
                    }
                }
            }

            if !closing.load(Ordering::Acquire) {
                let reason = format!("consumer on '{queue}' ended");
                fire_once(&shutdown, ShutdownSignal::external(reason));
            }
        });

        Ok(rx)
    }

    // ---

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        // ---
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| self.fail(e))
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
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                props::to_basic(properties),
            )
            .await
            .map_err(|e| self.fail(e))?;
        Ok(())
    }

    // ---

    async fn exchange_declare(&self, exchange: &str, kind: ExchangeType) -> Result<()> {
        // ---
        let kind = match kind {
            ExchangeType::Direct => ExchangeKind::Direct,
            ExchangeType::Fanout => ExchangeKind::Fanout,
            ExchangeType::Topic => ExchangeKind::Topic,
            ExchangeType::Headers => ExchangeKind::Headers,
        };
        self.channel
            .exchange_declare(
                exchange,
                kind,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.fail(e))
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        // ---
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.fail(e))
    }

    async fn queue_declare_passive(&self, queue: &str) -> Result<()> {
        // ---
        let options = QueueDeclareOptions {
            passive: true,
            ..Default::default()
        };
        self.channel
            .queue_declare(queue, options, FieldTable::default())
            .await
            .map_err(|e| self.fail(e))?;
        Ok(())
    }

    // ---

    async fn close(&self) -> Result<()> {
        // ---
        self.ensure_open()?;
        self.closing.store(true, Ordering::Release);

        match self.channel.close(200, "closed by application").await {
            Ok(()) => {
                fire_once(
                    &self.shutdown,
                    ShutdownSignal::application("channel closed by application"),
                );
                Ok(())
            }
            Err(e) => {
                self.closing.store(false, Ordering::Release);
                Err(self.fail(e))
            }
        }
    }
}
