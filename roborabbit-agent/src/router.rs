//! [`MessageRouter`]: registry of message-queue listeners, and the
//! built-in [`MessageLogger`].

use std::any::Any;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::FutureExt;

use roborabbit_domain::{
    // ---
    Delivery,
    MessageContext,
    MessageQueueListener,
    DEBUG_APP_ID,
};

// ---------------------------------------------------------------------------
// MessageRouter
// ---------------------------------------------------------------------------

/// Routes consume-channel events to the listeners registered for an app id.
///
/// Listener failures, panics included, are logged here and never reach the
/// consume loop.
#[derive(Default)]
pub struct MessageRouter {
    // ---
    listeners: RwLock<Vec<Arc<dyn MessageQueueListener>>>,
}

// ---

impl MessageRouter {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn MessageQueueListener>) {
        tracing::debug!(name = listener.name(), app_id = listener.app_id(), "listener registered");
        self.write().push(listener);
    }

    /// Remove every listener called `name`. Returns how many were removed.
    pub fn unregister(&self, name: &str) -> usize {
        // ---
        let mut guard = self.write();
        let before = guard.len();
        guard.retain(|l| l.name() != name);
        before - guard.len()
    }

    // ---

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<dyn MessageQueueListener>>> {
        self.listeners.write().unwrap_or_else(|p| p.into_inner())
    }

    fn matching(&self, accept: impl Fn(&str) -> bool) -> Vec<Arc<dyn MessageQueueListener>> {
        self.listeners
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|l| accept(l.app_id()))
            .cloned()
            .collect()
    }

    // ---

    /// Tell every listener whose app id is in `app_ids` that `queue_name`
    /// started consuming.
    pub async fn fire_on_bind(&self, app_ids: &BTreeSet<String>, queue_name: &str) {
        // ---
        for listener in self.matching(|id| app_ids.contains(id)) {
            if let Err(e) = listener.on_bind(queue_name).await {
                tracing::warn!(listener = listener.name(), queue = queue_name, "on_bind failed: {e:#}");
            }
        }
    }

    pub async fn fire_on_unbind(&self, app_ids: &BTreeSet<String>, queue_name: &str) {
        // ---
        for listener in self.matching(|id| app_ids.contains(id)) {
            if let Err(e) = listener.on_unbind(queue_name).await {
                tracing::warn!(listener = listener.name(), queue = queue_name, "on_unbind failed: {e:#}");
            }
        }
    }

    // ---

    /// Hand one delivery, tagged with `app_id`, to that app id's listeners.
    pub async fn fire_on_receive(&self, app_id: &str, queue_name: &str, delivery: &Delivery) {
        // ---
        let listeners = self.matching(|id| id == app_id);
        if listeners.is_empty() {
            return;
        }

        let context = MessageContext::new(app_id, queue_name, delivery);
        for listener in listeners {
            // ---
            let outcome = AssertUnwindSafe(listener.on_receive(&context, &delivery.body))
                .catch_unwind()
                .await;
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{e:#}"),
                Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
            };
            tracing::warn!(
                listener = listener.name(),
                queue = queue_name,
                app_id,
                tag = delivery.envelope.delivery_tag,
                "on_receive failed: {failure}",
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

// ---------------------------------------------------------------------------
// MessageLogger
// ---------------------------------------------------------------------------

/// Debug listener bound to the wildcard app id. Sees every message on
/// queues configured with `*` while debug mode is on.
pub struct MessageLogger;

#[async_trait]
impl MessageQueueListener for MessageLogger {
    // ---
    fn name(&self) -> &str {
        "message-logger"
    }

    fn app_id(&self) -> &str {
        DEBUG_APP_ID
    }

    async fn on_bind(&self, queue_name: &str) -> anyhow::Result<()> {
        tracing::info!(queue = queue_name, "debug logging bound");
        Ok(())
    }

    async fn on_unbind(&self, queue_name: &str) -> anyhow::Result<()> {
        tracing::info!(queue = queue_name, "debug logging unbound");
        Ok(())
    }

    async fn on_receive(&self, context: &MessageContext, body: &[u8]) -> anyhow::Result<()> {
        // ---
        tracing::info!(
            queue = %context.queue_name,
            tag = context.envelope.delivery_tag,
            bytes = body.len(),
            "message received",
        );
        for (key, value) in context.vars() {
            tracing::debug!("  {key}={value}");
        }
        tracing::debug!("  body: {}", String::from_utf8_lossy(body));
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
    use crate::testing::RecordingListener;
    use roborabbit_domain::{vars, MessageProperties};

    fn ids(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn bind_reaches_only_listeners_in_the_set() {
        // ---
        let router = MessageRouter::new();
        let x = RecordingListener::new("x");
        let z = RecordingListener::new("z");
        router.register(x.clone());
        router.register(z.clone());

        router.fire_on_bind(&ids(&["x", "y"]), "builds").await;
        router.fire_on_unbind(&ids(&["x", "y"]), "builds").await;

        assert_eq!(x.bound(), vec!["builds"]);
        assert_eq!(x.unbound(), vec!["builds"]);
        assert!(z.bound().is_empty());
    }

    // ---

    #[tokio::test]
    async fn receive_builds_the_context_and_survives_failures() {
        // ---
        let router = MessageRouter::new();
        let failing = RecordingListener::failing("x");
        let ok = RecordingListener::new("x");
        router.register(failing.clone());
        router.register(ok.clone());

        let delivery = Delivery {
            properties: MessageProperties::default()
                .with_app_id("x")
                .with_header("job", "deploy"),
            body: b"{}".to_vec(),
            ..Default::default()
        };
        router.fire_on_receive("x", "builds", &delivery).await;

        assert_eq!(failing.received().len(), 1);
        let got = ok.received();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].value(vars::QUEUE_NAME), Some("builds"));
        assert_eq!(got[0].value("rabbit_header_job"), Some("deploy"));
    }

    // ---

    #[test]
    fn unregister_by_name() {
        // ---
        let router = MessageRouter::new();
        router.register(Arc::new(MessageLogger));
        assert_eq!(router.unregister("message-logger"), 1);
        assert_eq!(router.unregister("message-logger"), 0);
    }
}
