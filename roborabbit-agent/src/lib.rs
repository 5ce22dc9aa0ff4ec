//! Broker connection lifecycle engine for RoboRabbit.
//!
//! Keeps one resilient AMQP connection per process: a publish channel, one
//! consume channel per configured queue, and a watchdog that restores all
//! of it after the broker or the network drops it. Incoming messages are
//! routed to [`MessageQueueListener`](roborabbit_domain::MessageQueueListener)s
//! by application id; outgoing messages go through [`MessagePublisher`].
//!
//! # Structure
//!
//! - [`ConnectionManager`]: owns the current connection; `update()` is the
//!   single entry point for configuration changes
//! - [`ConnectionHandle`]: one broker connection and the channels it owns
//! - [`ChannelHandle`]: shared open/close state machine, implemented by
//!   [`PublishChannelHandle`] and [`ConsumeChannelHandle`]
//! - [`Watchdog`]: periodic reconnect
//! - [`UpdateQueue`]: coalesced asynchronous `update()` requests
//! - [`ConsumerStatus`]: JSON-ready status snapshot
//!
//! The broker itself is reached through
//! [`BrokerConnector`](roborabbit_domain::BrokerConnector):
//! `roborabbit_amqp::AmqpConnector` in production and
//! `roborabbit_broker_sim::SimConnector` in tests.

mod channel;
mod config;
mod connection;
mod consume_channel;
mod error;
mod manager;
mod monitor;
mod notify;
mod operator;
mod publish_channel;
mod publisher;
mod router;
mod status;
mod update_queue;
mod watchdog;

#[cfg(test)]
mod testing;

// Gateway re-exports: siblings import via super::Symbol

// --- error
pub use error::{ConfigError, ManagerError};

// --- config
pub use config::{
    // ---
    BrokerConfig,
    Config,
    ConfigSource,
    Credentials,
    FileConfigSource,
    ResolvedConfig,
    StaticConfigSource,
    DEFAULT_WATCHDOG_PERIOD,
};

// --- channels
pub use channel::{
    // ---
    open_channel,
    ChannelCore,
    ChannelEvent,
    ChannelHandle,
    ChannelId,
    ChannelListener,
    LifecycleState,
};
pub use consume_channel::{dispatch_targets, ConsumeChannelHandle};
pub use publish_channel::{
    // ---
    PendingPublish,
    PublishChannelHandle,
    MSG_NOT_OPENED,
    MSG_NO_QUEUE,
    MSG_PUBLISHED,
    MSG_PUBLISH_FAILED,
    MSG_SETUP_DONE,
};

// --- connection
pub use connection::{
    // ---
    ConnectionEvent,
    ConnectionHandle,
    ConnectionListener,
    ConnectionSettings,
    TrackedChannel,
    CONNECT_TIMEOUT,
};

// --- manager
pub use manager::{ConnectionManager, ManagerContext, DEFAULT_CLOSE_TIMEOUT};
pub use monitor::ConnectionMonitor;
pub use update_queue::UpdateQueue;
pub use watchdog::{Watchdog, DEFAULT_INITIAL_DELAY};

// --- collaborators
pub use operator::ServerOperators;
pub use publisher::MessagePublisher;
pub use router::{MessageLogger, MessageRouter};
pub use status::{ConsumerStatus, QueueStatus};
