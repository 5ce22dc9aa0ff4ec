//! In-process broker simulator for RoboRabbit unit and integration tests.
//!
//! [`SimConnector`] implements [`roborabbit_domain::BrokerConnector`] on top
//! of shared in-memory state instead of a network socket. [`SimBroker`] is
//! the test's window into that state: it injects deliveries, records acks,
//! publishes and topology calls, and injects failures:
//!
//! - Refuse new connections
//! - Refuse channel creation
//! - Fail publishes
//! - Fail channel closes with a broker-side error
//! - Accept a connection close but never confirm it
//! - Drop every live connection as if the network went away
//!
//! # Quick start
//!
//! ```rust
//! use roborabbit_broker_sim::{SimBroker, SimConfig};
//!
//! let broker = SimBroker::new(SimConfig::default());
//! let connector = broker.connector();
//! ```

mod broker;
mod channel;
mod config;
mod connection;

// --- public API
pub use broker::{Binding, PublishedMessage, SimBroker};
pub use channel::SimChannel;
pub use config::SimConfig;
pub use connection::{SimConnection, SimConnector};
