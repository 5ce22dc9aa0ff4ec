use thiserror::Error;

use super::broker::ShutdownSignal;

// ---

#[derive(Debug, Error)]
pub enum BrokerError {
    // ---
    #[error("connection error: {0}")]
    Connection(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("channel is not open")]
    ChannelClosed,

    #[error("shutdown signal: {0}")]
    Shutdown(ShutdownSignal),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ---

impl BrokerError {
    // ---
    /// `true` when this error is the echo of a close the application asked
    /// for itself, as opposed to a broker or network failure.
    pub fn is_application_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown(signal) if signal.initiated_by_application)
    }
}

// ---

pub type Result<T> = std::result::Result<T, BrokerError>;
