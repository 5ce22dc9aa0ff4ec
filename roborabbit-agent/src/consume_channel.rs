//! [`ConsumeChannelHandle`]: one queue, consumed on behalf of a set of app
//! ids.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use roborabbit_domain::{
    // ---
    BrokerChannelPtr,
    Delivery,
    DeliveryRx,
    Result,
    DEBUG_APP_ID,
};

use super::channel::{ChannelCore, ChannelHandle};
use super::MessageRouter;

// ---------------------------------------------------------------------------
// ConsumeChannelHandle
// ---------------------------------------------------------------------------

pub struct ConsumeChannelHandle {
    // ---
    core: ChannelCore,
    queue_name: String,
    app_ids: BTreeSet<String>,
    /// Snapshot of the debug setting at construction.
    debug: bool,
    router: Arc<MessageRouter>,
    consume_started: AtomicBool,
}

// ---

impl ConsumeChannelHandle {
    // ---
    pub fn new(
        queue_name: impl Into<String>,
        app_ids: BTreeSet<String>,
        debug: bool,
        router: Arc<MessageRouter>,
    ) -> Self {
        Self {
            core: ChannelCore::new(),
            queue_name: queue_name.into(),
            app_ids,
            debug,
            router,
            consume_started: AtomicBool::new(false),
        }
    }

    // ---

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn app_ids(&self) -> &BTreeSet<String> {
        &self.app_ids
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn is_consume_started(&self) -> bool {
        self.consume_started.load(Ordering::Acquire)
    }

    // ---

    /// Start a manual-ack consumer on the queue and bind the listeners.
    ///
    /// Does nothing unless the channel is `CONNECTED`, or when consuming
    /// has already started.
    pub async fn consume(self: &Arc<Self>) -> Result<()> {
        // ---
        let Some(channel) = self.core.live_channel() else {
            tracing::warn!(queue = %self.queue_name, "consume ignored, channel not connected");
            return Ok(());
        };
        if self.consume_started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let deliveries = match channel.basic_consume(&self.queue_name).await {
            Ok(rx) => rx,
            Err(e) => {
                self.consume_started.store(false, Ordering::Release);
                return Err(e);
            }
        };
        tokio::spawn(Arc::clone(self).run(channel, deliveries));

        tracing::info!(queue = %self.queue_name, app_ids = ?self.app_ids, "consume started");
        self.router.fire_on_bind(&self.app_ids, &self.queue_name).await;
        Ok(())
    }

    // ---

    async fn run(self: Arc<Self>, channel: BrokerChannelPtr, mut deliveries: DeliveryRx) {
        // ---
        while let Some(delivery) = deliveries.recv().await {
            // ---
            self.dispatch(&delivery).await;

            let tag = delivery.envelope.delivery_tag;
            if let Err(e) = channel.basic_ack(tag).await {
                tracing::warn!(queue = %self.queue_name, tag, "ack failed: {e}");
            }
        }
        tracing::debug!(queue = %self.queue_name, "delivery stream ended");
    }

    async fn dispatch(&self, delivery: &Delivery) {
        // ---
        let message_app_id = delivery.properties.app_id.as_deref();
        let targets = dispatch_targets(&self.app_ids, self.debug, message_app_id);

        if targets.is_empty() {
            tracing::debug!(
                queue = %self.queue_name,
                app_id = message_app_id.unwrap_or_default(),
                "no listener for message",
            );
        }
        for app_id in &targets {
            self.router.fire_on_receive(app_id, &self.queue_name, delivery).await;
        }
    }
}

// ---

#[async_trait]
impl ChannelHandle for ConsumeChannelHandle {
    // ---
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    async fn on_closed(&self) {
        // ---
        self.consume_started.store(false, Ordering::Release);
        self.router.fire_on_unbind(&self.app_ids, &self.queue_name).await;
    }
}

// ---------------------------------------------------------------------------
// dispatch_targets
// ---------------------------------------------------------------------------

/// App ids one delivery is dispatched to, in dispatch order.
///
/// - Debug on and `*` configured: a copy tagged `*`.
/// - Message names an app id: that id, if configured.
/// - Message names none (or names `*`): one copy per configured app id,
///   `*` included unless debug already delivered it.
pub fn dispatch_targets(
    app_ids: &BTreeSet<String>,
    debug: bool,
    message_app_id: Option<&str>,
) -> Vec<String> {
    // ---
    let mut targets = Vec::new();

    if debug && app_ids.contains(DEBUG_APP_ID) {
        targets.push(DEBUG_APP_ID.to_owned());
    }

    let named = message_app_id
        .map(str::trim)
        .filter(|id| !id.is_empty() && *id != DEBUG_APP_ID);

    match named {
        Some(id) => {
            if app_ids.contains(id) {
                targets.push(id.to_owned());
            }
        }
        None => {
            let already = targets.first().cloned();
            targets.extend(
                app_ids
                    .iter()
                    .filter(|id| Some(*id) != already.as_ref())
                    .cloned(),
            );
        }
    }
    targets
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
