//! AMQP 0-9-1 broker adapter for RoboRabbit.
//!
//! Implements [`roborabbit_domain::BrokerConnector`] using the `lapin` crate.
//! Connection loss reported by lapin's error callback becomes an external
//! [`roborabbit_domain::ShutdownSignal`] on the connection and on every one
//! of its channels; closes requested through the traits become application
//! signals.
//!
//! # Quick start
//!
//! ```ignore
//! use roborabbit_amqp::AmqpConnector;
//! use roborabbit_domain::{BrokerConnector, ConnectParams};
//!
//! let connector = AmqpConnector::default();
//! let params = ConnectParams {
//!     uri: "amqp://broker.local:5672/%2f".into(),
//!     ..Default::default()
//! };
//! let conn    = connector.connect(&params).await?;
//! let channel = conn.create_channel().await?;
//! ```

mod channel;
mod connection;
mod error;
mod props;
mod signal;

pub use channel::AmqpChannel;
pub use connection::{AmqpConnection, AmqpConnector};
pub use error::AmqpError;
