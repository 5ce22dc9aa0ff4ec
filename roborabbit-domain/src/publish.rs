use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ExchangeType
// ---------------------------------------------------------------------------

/// AMQP exchange kinds supported by exchange setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    // ---
    Direct,
    #[default]
    Fanout,
    Topic,
    Headers,
}

// ---

impl ExchangeType {
    // ---
    /// Name as sent on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Topic => "topic",
            Self::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// PublishResult
// ---------------------------------------------------------------------------

/// Outcome of one publish or exchange-setup task.
///
/// Publish failures are reported here, never as an error on the
/// publishing caller's side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishResult {
    // ---
    pub success: bool,
    pub message: String,
    /// Exchange the task used. For a setup task with a generated exchange
    /// this is the generated name.
    pub exchange: Option<String>,
    pub queue: Option<String>,
    pub exchange_type: Option<ExchangeType>,
    pub routing_key: Option<String>,
}

// ---

impl PublishResult {
    // ---
    /// Result of a plain publish.
    pub fn publish(success: bool, message: impl Into<String>, exchange: &str) -> Self {
        Self {
            success,
            message: message.into(),
            exchange: Some(exchange.to_owned()),
            queue: None,
            exchange_type: None,
            routing_key: None,
        }
    }

    // ---

    /// Result of an exchange setup.
    pub fn setup(
        success: bool,
        message: impl Into<String>,
        exchange: Option<String>,
        queue: Option<String>,
        exchange_type: ExchangeType,
        routing_key: &str,
    ) -> Self {
        Self {
            success,
            message: message.into(),
            exchange,
            queue,
            exchange_type: Some(exchange_type),
            routing_key: Some(routing_key.to_owned()),
        }
    }
}
