use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// HeaderValue
// ---------------------------------------------------------------------------

/// A typed AMQP header value.
///
/// Adapters map their native field-table values onto these variants;
/// anything without a natural mapping lands in [`HeaderValue::Other`] as a
/// debug rendering.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    // ---
    Str(String),
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    /// Seconds since the Unix epoch.
    Timestamp(u64),
    Bytes(Vec<u8>),
    Other(String),
}

// ---

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) | Self::Other(s) => f.write_str(s),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::UInt(n) | Self::Timestamp(n) => write!(f, "{n}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Bytes(b) => f.write_str(&String::from_utf8_lossy(b)),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

// ---------------------------------------------------------------------------
// MessageProperties
// ---------------------------------------------------------------------------

/// AMQP basic properties of a message, inbound or outbound.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    // ---
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: BTreeMap<String, HeaderValue>,
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    /// Seconds since the Unix epoch.
    pub timestamp: Option<u64>,
    /// The AMQP `type` property.
    pub kind: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub cluster_id: Option<String>,
}

// ---

impl MessageProperties {
    // ---
    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Envelope / Delivery
// ---------------------------------------------------------------------------

/// Routing metadata the broker attaches to each delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    // ---
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
}

/// One inbound message as handed over by the broker adapter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delivery {
    // ---
    pub envelope: Envelope,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

// ---------------------------------------------------------------------------
// vars
// ---------------------------------------------------------------------------

/// Keys of the flat metadata map built by [`MessageContext`].
///
/// These double as build environment variable names on the CI side, hence
/// the upper-case `RABBIT_` namespace.
pub mod vars {
    // ---
    pub const QUEUE_NAME: &str = "RABBIT_QUEUE_NAME";
    pub const EXCHANGE: &str = "RABBIT_EXCHANGE";
    pub const ROUTING_KEY: &str = "RABBIT_ROUTING_KEY";
    pub const DELIVERY_TAG: &str = "RABBIT_DELIVERY_TAG";
    pub const REDELIVERED: &str = "RABBIT_REDELIVERED";

    pub const CONTENT_TYPE: &str = "RABBIT_CONTENT_TYPE";
    pub const CONTENT_ENCODING: &str = "RABBIT_CONTENT_ENCODING";
    pub const DELIVERY_MODE: &str = "RABBIT_DELIVERY_MODE";
    pub const PRIORITY: &str = "RABBIT_PRIORITY";
    pub const CORRELATION_ID: &str = "RABBIT_CORRELATION_ID";
    pub const REPLY_TO: &str = "RABBIT_REPLY_TO";
    pub const EXPIRATION: &str = "RABBIT_EXPIRATION";
    pub const MESSAGE_ID: &str = "RABBIT_MESSAGE_ID";
    pub const TIMESTAMP: &str = "RABBIT_TIMESTAMP";
    pub const TYPE: &str = "RABBIT_TYPE";
    pub const USER_ID: &str = "RABBIT_USER_ID";
    pub const APP_ID: &str = "RABBIT_APP_ID";
    pub const CLUSTER_ID: &str = "RABBIT_CLUSTER_ID";

    /// Prefix for arbitrary headers; the header name follows, upper-cased.
    pub const HEADER_PREFIX: &str = "RABBIT_HEADER_";
}

// ---------------------------------------------------------------------------
// MessageContext
// ---------------------------------------------------------------------------

/// Everything a message-queue listener learns about one delivery.
///
/// `app_id` is the app id this dispatch is tagged with, which is not always
/// the message's own `app_id` property: a message without one is broadcast
/// once per configured app id, each copy tagged accordingly.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageContext {
    // ---
    pub app_id: String,
    pub queue_name: String,
    pub envelope: Envelope,
    pub properties: MessageProperties,
    vars: BTreeMap<String, String>,
}

// ---

impl MessageContext {
    // ---
    pub fn new(app_id: &str, queue_name: &str, delivery: &Delivery) -> Self {
        // ---
        let vars = flatten(app_id, queue_name, &delivery.envelope, &delivery.properties);
        Self {
            app_id: app_id.to_owned(),
            queue_name: queue_name.to_owned(),
            envelope: delivery.envelope.clone(),
            properties: delivery.properties.clone(),
            vars,
        }
    }

    // ---

    /// The full flat metadata map.
    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    /// Look up one metadata value; the key is matched case-insensitively.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.vars.get(&key.to_uppercase()).map(String::as_str)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.properties.content_type.as_deref()
    }

    pub fn headers(&self) -> &BTreeMap<String, HeaderValue> {
        &self.properties.headers
    }
}

// ---

fn flatten(
    app_id: &str,
    queue_name: &str,
    envelope: &Envelope,
    props: &MessageProperties,
) -> BTreeMap<String, String> {
    // ---
    let mut out = BTreeMap::new();
    let mut put = |key: &str, value: Option<String>| {
        if let Some(v) = value {
            out.insert(key.to_owned(), v);
        }
    };

    put(vars::APP_ID, Some(app_id.to_owned()));
    put(vars::CONTENT_TYPE, props.content_type.clone());
    put(vars::CONTENT_ENCODING, props.content_encoding.clone());
    put(vars::DELIVERY_MODE, props.delivery_mode.map(|v| v.to_string()));
    put(vars::PRIORITY, props.priority.map(|v| v.to_string()));
    put(vars::CORRELATION_ID, props.correlation_id.clone());
    put(vars::REPLY_TO, props.reply_to.clone());
    put(vars::EXPIRATION, props.expiration.clone());
    put(vars::MESSAGE_ID, props.message_id.clone());
    put(vars::TIMESTAMP, props.timestamp.map(|v| v.to_string()));
    put(vars::TYPE, props.kind.clone());
    put(vars::USER_ID, props.user_id.clone());
    put(vars::CLUSTER_ID, props.cluster_id.clone());

    for (name, value) in &props.headers {
        let key = format!("{}{}", vars::HEADER_PREFIX, name.to_uppercase());
        put(&key, Some(value.to_string()));
    }

    put(vars::QUEUE_NAME, Some(queue_name.to_owned()));
    put(vars::EXCHANGE, Some(envelope.exchange.clone()));
    put(vars::ROUTING_KEY, Some(envelope.routing_key.clone()));
    put(vars::DELIVERY_TAG, Some(envelope.delivery_tag.to_string()));
    put(vars::REDELIVERED, Some(envelope.redelivered.to_string()));

    out
}
