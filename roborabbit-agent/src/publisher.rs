//! [`MessagePublisher`]: publishing facade over the manager's current
//! publish channel.

use std::sync::Arc;

use roborabbit_domain::{ExchangeType, MessageProperties, PublishResult};

use super::{ConnectionManager, PendingPublish};

// ---------------------------------------------------------------------------
// MessagePublisher
// ---------------------------------------------------------------------------

/// Every call resolves the publish channel afresh, so a reconnect between
/// two publishes is transparent. `None` means there was nothing to publish
/// on.
#[derive(Clone)]
pub struct MessagePublisher {
    // ---
    manager: Arc<ConnectionManager>,
}

// ---

impl MessagePublisher {
    // ---
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: &MessageProperties,
        body: &[u8],
    ) -> Option<PendingPublish> {
        // ---
        if !self.manager.is_open() {
            tracing::debug!(exchange, "not connected, publish dropped");
            return None;
        }
        let channel = self.manager.publish_channel()?;
        Some(channel.publish(exchange, routing_key, properties, body))
    }

    pub async fn setup_exchange(
        &self,
        exchange: Option<&str>,
        queue: &str,
        exchange_type: Option<ExchangeType>,
        routing_key: Option<&str>,
    ) -> Option<PublishResult> {
        // ---
        if !self.manager.is_open() {
            return None;
        }
        let channel = self.manager.publish_channel()?;
        Some(
            channel
                .setup_exchange(exchange, queue, exchange_type, routing_key)
                .await,
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
