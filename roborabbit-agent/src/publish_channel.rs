//! [`PublishChannelHandle`]: the connection's single outbound channel.
//!
//! A broker channel must not see interleaved writes, so every publish and
//! exchange setup is queued to one worker task that runs them strictly in
//! submission order.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use roborabbit_domain::{
    // ---
    ExchangeType,
    MessageProperties,
    PublishResult,
};

use super::channel::{ChannelCore, ChannelHandle};

pub const MSG_PUBLISHED: &str = "Published";
pub const MSG_PUBLISH_FAILED: &str = "Failed to publish message.";
pub const MSG_NOT_OPENED: &str = "Channel is not opened.";
pub const MSG_NO_QUEUE: &str = "Queue name should not be null.";
pub const MSG_SETUP_DONE: &str = "SUCCESS";

// ---------------------------------------------------------------------------
// PublishTask
// ---------------------------------------------------------------------------

enum PublishTask {
    // ---
    Publish {
        exchange: String,
        routing_key: String,
        properties: MessageProperties,
        body: Vec<u8>,
        reply: oneshot::Sender<PublishResult>,
    },

    Setup {
        exchange: Option<String>,
        queue: String,
        exchange_type: ExchangeType,
        routing_key: String,
        reply: oneshot::Sender<PublishResult>,
    },
}

// ---------------------------------------------------------------------------
// PendingPublish
// ---------------------------------------------------------------------------

/// A queued publish. Await [`result`](Self::result) for its outcome, or
/// drop it; the publish runs either way.
pub struct PendingPublish {
    // ---
    exchange: String,
    rx: oneshot::Receiver<PublishResult>,
}

impl PendingPublish {
    // ---
    pub async fn result(self) -> PublishResult {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => PublishResult::publish(false, MSG_NOT_OPENED, &self.exchange),
        }
    }
}

// ---------------------------------------------------------------------------
// PublishChannelHandle
// ---------------------------------------------------------------------------

pub struct PublishChannelHandle {
    // ---
    core: Arc<ChannelCore>,
    tasks: mpsc::UnboundedSender<PublishTask>,
}

// ---

impl PublishChannelHandle {
    // ---
    /// Create the handle and spawn its worker. The worker exits when the
    /// handle is dropped.
    pub fn new() -> Self {
        // ---
        let core = Arc::new(ChannelCore::new());
        let (tasks, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(Arc::clone(&core), rx));
        Self { core, tasks }
    }

    // ---

    /// Queue a publish and return immediately.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: &MessageProperties,
        body: &[u8],
    ) -> PendingPublish {
        // ---
        let (reply, rx) = oneshot::channel();
        let task = PublishTask::Publish {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties: properties.clone(),
            body: body.to_vec(),
            reply,
        };
        if self.tasks.send(task).is_err() {
            tracing::warn!(channel = %self.id(), "publish worker gone");
        }
        PendingPublish {
            exchange: exchange.to_owned(),
            rx,
        }
    }

    // ---

    /// Declare (or generate) an exchange and bind `queue` to it, waiting
    /// for the outcome.
    ///
    /// Without an exchange name a UUID-named exchange of `exchange_type`
    /// (fanout by default) is declared first.
    pub async fn setup_exchange(
        &self,
        exchange: Option<&str>,
        queue: &str,
        exchange_type: Option<ExchangeType>,
        routing_key: Option<&str>,
    ) -> PublishResult {
        // ---
        let exchange_type = exchange_type.unwrap_or_default();
        let routing_key = routing_key.unwrap_or_default();
        let exchange = exchange.map(str::to_owned);

        let (reply, rx) = oneshot::channel();
        let task = PublishTask::Setup {
            exchange: exchange.clone(),
            queue: queue.to_owned(),
            exchange_type,
            routing_key: routing_key.to_owned(),
            reply,
        };

        let not_opened = || {
            PublishResult::setup(
                false,
                MSG_NOT_OPENED,
                exchange.clone(),
                Some(queue.to_owned()),
                exchange_type,
                routing_key,
            )
        };
        if self.tasks.send(task).is_err() {
            return not_opened();
        }
        rx.await.unwrap_or_else(|_| not_opened())
    }
}

impl Default for PublishChannelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelHandle for PublishChannelHandle {
    fn core(&self) -> &ChannelCore {
        &self.core
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

async fn run_worker(core: Arc<ChannelCore>, mut rx: mpsc::UnboundedReceiver<PublishTask>) {
    // ---
    while let Some(task) = rx.recv().await {
        match task {
            PublishTask::Publish {
                exchange,
                routing_key,
                properties,
                body,
                reply,
            } => {
                let result = publish(&core, &exchange, &routing_key, &properties, &body).await;
                let _ = reply.send(result);
            }

            PublishTask::Setup {
                exchange,
                queue,
                exchange_type,
                routing_key,
                reply,
            } => {
                let result = setup(&core, exchange, &queue, exchange_type, &routing_key).await;
                let _ = reply.send(result);
            }
        }
    }
    tracing::debug!(channel = %core.id(), "publish worker stopped");
}

// ---

async fn publish(
    core: &ChannelCore,
    exchange: &str,
    routing_key: &str,
    properties: &MessageProperties,
    body: &[u8],
) -> PublishResult {
    // ---
    let Some(channel) = core.live_channel() else {
        return PublishResult::publish(false, MSG_NOT_OPENED, exchange);
    };

    match channel.basic_publish(exchange, routing_key, properties, body).await {
        Ok(()) => PublishResult::publish(true, MSG_PUBLISHED, exchange),
        Err(e) => {
            tracing::warn!(exchange, routing_key, "publish failed: {e}");
            PublishResult::publish(false, MSG_PUBLISH_FAILED, exchange)
        }
    }
}

// ---

async fn setup(
    core: &ChannelCore,
    exchange: Option<String>,
    queue: &str,
    exchange_type: ExchangeType,
    routing_key: &str,
) -> PublishResult {
    // ---
    let exchange = exchange.filter(|e| !e.is_empty());
    let fail = |message: String, exchange: Option<String>| {
        let queue = Some(queue.to_owned()).filter(|q| !q.is_empty());
        PublishResult::setup(false, message, exchange, queue, exchange_type, routing_key)
    };

    if queue.trim().is_empty() {
        return fail(MSG_NO_QUEUE.into(), exchange);
    }
    let Some(channel) = core.live_channel() else {
        return fail(MSG_NOT_OPENED.into(), exchange);
    };

    let exchange = match exchange {
        Some(name) => name,
        None => {
            let name = Uuid::new_v4().to_string();
            if let Err(e) = channel.exchange_declare(&name, exchange_type).await {
                tracing::warn!(exchange = %name, "exchange declare failed: {e}");
                return fail(e.to_string(), Some(name));
            }
            name
        }
    };

    if let Err(e) = channel.queue_bind(queue, &exchange, routing_key).await {
        tracing::warn!(%exchange, queue, "queue bind failed: {e}");
        return fail(e.to_string(), Some(exchange));
    }

    tracing::info!(%exchange, queue, %exchange_type, routing_key, "exchange set up");
    PublishResult::setup(
        true,
        MSG_SETUP_DONE,
        Some(exchange),
        Some(queue.to_owned()),
        exchange_type,
        routing_key,
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::channel::open_channel;
    use crate::testing::sim_connection;
    use roborabbit_broker_sim::SimBroker;

    async fn open() -> (SimBroker, Arc<PublishChannelHandle>) {
        // ---
        let (broker, conn) = sim_connection().await;
        let handle = Arc::new(PublishChannelHandle::new());
        open_channel(&handle, &conn).await.unwrap();
        (broker, handle)
    }

    #[tokio::test]
    async fn publishes_run_in_submission_order() {
        // ---
        let (broker, handle) = open().await;

        let pending: Vec<_> = (0..20)
            .map(|i| {
                let body = format!("msg-{i}");
                handle.publish("status", "build", &MessageProperties::default(), body.as_bytes())
            })
            .collect();

        for p in pending {
            let result = p.result().await;
            assert!(result.success);
            assert_eq!(result.message, MSG_PUBLISHED);
            assert_eq!(result.exchange.as_deref(), Some("status"));
        }

        let bodies: Vec<String> = broker
            .published()
            .into_iter()
            .map(|m| String::from_utf8(m.body).unwrap())
            .collect();
        let expected: Vec<String> = (0..20).map(|i| format!("msg-{i}")).collect();
        assert_eq!(bodies, expected);
    }

    // ---

    #[tokio::test]
    async fn broker_failure_and_closed_channel_are_reported() {
        // ---
        let (broker, handle) = open().await;

        broker.set_fail_publish(true);
        let result = handle.publish("status", "", &MessageProperties::default(), b"x").result().await;
        assert!(!result.success);
        assert_eq!(result.message, MSG_PUBLISH_FAILED);

        handle.close().await.unwrap();
        let result = handle.publish("status", "", &MessageProperties::default(), b"x").result().await;
        assert!(!result.success);
        assert_eq!(result.message, MSG_NOT_OPENED);
    }

    // ---

    #[tokio::test]
    async fn setup_with_generated_exchange() {
        // ---
        let (broker, handle) = open().await;

        let result = handle
            .setup_exchange(None, "q1", Some(ExchangeType::Fanout), Some(""))
            .await;
        assert!(result.success, "{result:?}");
        assert_eq!(result.message, MSG_SETUP_DONE);

        let name = result.exchange.unwrap();
        assert!(Uuid::parse_str(&name).is_ok());
        assert_eq!(broker.exchanges(), vec![(name.clone(), ExchangeType::Fanout)]);
        assert_eq!(broker.bindings()[0].exchange, name);
        assert_eq!(broker.bindings()[0].queue, "q1");
    }

    // ---

    #[tokio::test]
    async fn setup_with_named_exchange_only_binds() {
        // ---
        let (broker, handle) = open().await;

        let result = handle.setup_exchange(Some("ex1"), "q1", None, Some("build.#")).await;
        assert!(result.success);
        assert_eq!(result.exchange.as_deref(), Some("ex1"));
        assert_eq!(result.exchange_type, Some(ExchangeType::Fanout));
        assert_eq!(result.routing_key.as_deref(), Some("build.#"));
        assert!(broker.exchanges().is_empty());
        assert_eq!(broker.bindings()[0].routing_key, "build.#");
    }

    // ---

    #[tokio::test]
    async fn setup_without_queue_is_rejected() {
        // ---
        let (_broker, handle) = open().await;
        let result = handle.setup_exchange(Some("ex1"), "", None, None).await;
        assert!(!result.success);
        assert_eq!(result.message, MSG_NO_QUEUE);
    }
}
