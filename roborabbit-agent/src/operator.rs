//! [`ServerOperators`]: registry of collaborators that prepare broker-side
//! state when a connection opens.

use std::sync::{Arc, RwLock};

use roborabbit_domain::ServerOperator;

use super::ConnectionHandle;

// ---------------------------------------------------------------------------
// ServerOperators
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ServerOperators {
    // ---
    operators: RwLock<Vec<Arc<dyn ServerOperator>>>,
}

// ---

impl ServerOperators {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, operator: Arc<dyn ServerOperator>) {
        self.operators
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(operator);
    }

    fn snapshot(&self) -> Vec<Arc<dyn ServerOperator>> {
        self.operators
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    // ---

    /// Give each operator its own fresh channel on `connection`, closing it
    /// once the operator returns. Failures are logged per operator.
    pub async fn fire_on_open(&self, connection: &ConnectionHandle) {
        // ---
        for operator in self.snapshot() {
            // ---
            let channel = match connection.create_pure_channel().await {
                Ok(channel) => channel,
                Err(e) => {
                    tracing::warn!(operator = operator.name(), "no control channel: {e}");
                    continue;
                }
            };

            if let Err(e) = operator.on_open(channel.as_ref(), connection.service_uri()).await {
                tracing::warn!(operator = operator.name(), "on_open failed: {e:#}");
            }

            if channel.is_open() {
                if let Err(e) = channel.close().await {
                    tracing::debug!(operator = operator.name(), "control channel close failed: {e}");
                }
            }
        }
    }

    pub async fn fire_on_close_completed(&self, service_uri: &str) {
        // ---
        for operator in self.snapshot() {
            if let Err(e) = operator.on_close_completed(service_uri).await {
                tracing::warn!(operator = operator.name(), "on_close_completed failed: {e:#}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
