use async_trait::async_trait;

use super::broker::BrokerChannel;
use super::message::MessageContext;

// ---------------------------------------------------------------------------
// MessageQueueListener
// ---------------------------------------------------------------------------

/// Downstream consumer of queued messages.
///
/// A listener is selected by its [`app_id`](Self::app_id): consume channels
/// whose app-id set contains it bind/unbind it and route matching messages
/// to it. Errors returned from these callbacks are logged by the caller and
/// never stop consumption or acknowledgement.
#[async_trait]
pub trait MessageQueueListener: Send + Sync {
    // ---
    fn name(&self) -> &str;

    fn app_id(&self) -> &str;

    /// Called when a consume channel serving this app id starts consuming.
    async fn on_bind(&self, queue_name: &str) -> anyhow::Result<()> {
        let _ = queue_name;
        Ok(())
    }

    // ---

    /// Called when a consume channel serving this app id shuts down.
    async fn on_unbind(&self, queue_name: &str) -> anyhow::Result<()> {
        let _ = queue_name;
        Ok(())
    }

    // ---

    /// Called once per matching delivery.
    async fn on_receive(&self, context: &MessageContext, body: &[u8]) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// ServerOperator
// ---------------------------------------------------------------------------

/// Collaborator that prepares broker-side state whenever a connection opens
/// (declaring exchanges, queues, bindings) and reacts when it closes.
#[async_trait]
pub trait ServerOperator: Send + Sync {
    // ---
    fn name(&self) -> &str;

    /// `control_channel` is created for this call only and closed as soon
    /// as it returns; implementations must not keep it.
    async fn on_open(&self, control_channel: &dyn BrokerChannel, service_uri: &str)
        -> anyhow::Result<()>;

    // ---

    async fn on_close_completed(&self, service_uri: &str) -> anyhow::Result<()> {
        let _ = service_uri;
        Ok(())
    }
}
