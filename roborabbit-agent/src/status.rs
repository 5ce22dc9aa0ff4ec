//! [`ConsumerStatus`]: serializable snapshot of what the daemon is
//! configured to consume and what it actually consumes.

use serde::Serialize;

use super::{ConfigError, ConnectionManager};

// ---------------------------------------------------------------------------
// ConsumerStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerStatus {
    // ---
    pub enabled: bool,
    pub connected: bool,
    pub service_uri: Option<String>,
    pub user_name: Option<String>,
    pub queues: Vec<QueueStatus>,
}

/// One configured consume item. `consumed` is true while a consume
/// channel for the queue is running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    // ---
    pub name: Option<String>,
    pub app_id: Option<String>,
    pub consumed: bool,
}

// ---

impl ConsumerStatus {
    // ---
    /// Read the current configuration and pair it with live channel state.
    /// Configuration is reported as written, without credential resolution.
    pub fn collect(manager: &ConnectionManager) -> Result<Self, ConfigError> {
        // ---
        let config = manager.config_source().load()?;

        let queues = config
            .consume_items
            .iter()
            .map(|item| QueueStatus {
                name: item.queue_name().map(str::to_owned),
                app_id: item.app_id().map(str::to_owned),
                consumed: item
                    .queue_name()
                    .is_some_and(|queue| manager.channel_status(queue)),
            })
            .collect();

        Ok(Self {
            enabled: config.enable_consumer,
            connected: manager.is_open(),
            service_uri: config.service_uri,
            user_name: config.credentials.map(|c| c.username),
            queues,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
