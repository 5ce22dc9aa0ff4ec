//! Error types for `roborabbit-amqp`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AmqpError {
    // ---
    #[error("invalid AMQP URI: {0}")]
    Uri(String),

    #[error("AMQP connect error: {0}")]
    Connect(lapin::Error),

    #[error("AMQP channel error: {0}")]
    Channel(lapin::Error),

    #[error("AMQP channel is closed")]
    ChannelClosed,
}

// ---------------------------------------------------------------------------
// Bridge to roborabbit_domain::BrokerError
// ---------------------------------------------------------------------------

impl From<AmqpError> for roborabbit_domain::BrokerError {
    // ---
    fn from(e: AmqpError) -> Self {
        use roborabbit_domain::BrokerError;
        match e {
            AmqpError::Uri(_) | AmqpError::Connect(_) => BrokerError::Connection(e.to_string()),
            AmqpError::Channel(lapin::Error::InvalidChannelState(_)) | AmqpError::ChannelClosed => {
                BrokerError::ChannelClosed
            }
            AmqpError::Channel(_) => BrokerError::Channel(e.to_string()),
        }
    }
}
