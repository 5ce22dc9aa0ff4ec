//! Core traits and types for the RoboRabbit broker bridge.
//!
//! This crate defines the vocabulary of the system. The broker adapter
//! (`roborabbit-amqp`), the in-process simulator (`roborabbit-broker-sim`)
//! and the lifecycle engine (`roborabbit-agent`) all speak these types.
//! No broker implementations live here.
//!
//! # Structure
//!
//! - [`error`]: [`BrokerError`] and [`Result<T>`] alias
//! - [`broker`]: [`BrokerConnector`], [`BrokerConnection`], [`BrokerChannel`] traits
//!   and the [`ShutdownSignal`] they report
//! - [`message`]: [`MessageProperties`], [`Delivery`], [`MessageContext`]
//! - [`publish`]: [`ExchangeType`], [`PublishResult`]
//! - [`consume`]: [`ConsumeItem`] and the app-id sentinels
//! - [`extension`]: [`MessageQueueListener`], [`ServerOperator`] collaborator traits
//! - [`secret`]: [`Secret`] credential wrapper

mod broker;
mod consume;
mod error;
mod extension;
mod message;
mod publish;
mod secret;

// --- error
pub use error::{BrokerError, Result};

// --- broker
pub use broker::{
    // ---
    BrokerChannel,
    BrokerChannelPtr,
    BrokerConnection,
    BrokerConnectionPtr,
    BrokerConnector,
    ConnectParams,
    DeliveryRx,
    ShutdownRx,
    ShutdownSignal,
};

// --- consume
pub use consume::{ConsumeItem, CONTENT_NONE, DEBUG_APP_ID};

// --- extension
pub use extension::{MessageQueueListener, ServerOperator};

// --- message
pub use message::{
    // ---
    vars,
    Delivery,
    Envelope,
    HeaderValue,
    MessageContext,
    MessageProperties,
};

// --- publish
pub use publish::{ExchangeType, PublishResult};

// --- secret
pub use secret::Secret;
