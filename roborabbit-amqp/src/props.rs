//! Conversions between lapin's wire types and the domain message types.

use lapin::types::{AMQPValue, ByteArray, FieldTable, LongString, ShortString};
use lapin::BasicProperties;

use roborabbit_domain::{
    // ---
    Delivery,
    Envelope,
    HeaderValue,
    MessageProperties,
};

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

pub(crate) fn delivery(d: &lapin::message::Delivery) -> Delivery {
    // ---
    Delivery {
        envelope: Envelope {
            delivery_tag: d.delivery_tag,
            redelivered: d.redelivered,
            exchange: d.exchange.as_str().to_owned(),
            routing_key: d.routing_key.as_str().to_owned(),
        },
        properties: from_basic(&d.properties),
        body: d.data.clone(),
    }
}

// ---

pub(crate) fn from_basic(p: &BasicProperties) -> MessageProperties {
    // ---
    let text = |v: &Option<ShortString>| v.as_ref().map(|s| s.as_str().to_owned());

    let headers = p
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .map(|(k, v)| (k.as_str().to_owned(), header_value(v)))
                .collect()
        })
        .unwrap_or_default();

    MessageProperties {
        content_type: text(p.content_type()),
        content_encoding: text(p.content_encoding()),
        headers,
        delivery_mode: *p.delivery_mode(),
        priority: *p.priority(),
        correlation_id: text(p.correlation_id()),
        reply_to: text(p.reply_to()),
        expiration: text(p.expiration()),
        message_id: text(p.message_id()),
        timestamp: *p.timestamp(),
        kind: text(p.kind()),
        user_id: text(p.user_id()),
        app_id: text(p.app_id()),
        cluster_id: text(p.cluster_id()),
    }
}

// ---

pub(crate) fn header_value(v: &AMQPValue) -> HeaderValue {
    // ---
    match v {
        AMQPValue::Boolean(b) => HeaderValue::Bool(*b),
        AMQPValue::ShortShortInt(n) => HeaderValue::Int(i64::from(*n)),
        AMQPValue::ShortInt(n) => HeaderValue::Int(i64::from(*n)),
        AMQPValue::LongInt(n) => HeaderValue::Int(i64::from(*n)),
        AMQPValue::LongLongInt(n) => HeaderValue::Int(*n),
        AMQPValue::ShortShortUInt(n) => HeaderValue::UInt(u64::from(*n)),
        AMQPValue::ShortUInt(n) => HeaderValue::UInt(u64::from(*n)),
        AMQPValue::LongUInt(n) => HeaderValue::UInt(u64::from(*n)),
        AMQPValue::Float(x) => HeaderValue::Float(f64::from(*x)),
        AMQPValue::Double(x) => HeaderValue::Float(*x),
        AMQPValue::Timestamp(t) => HeaderValue::Timestamp(*t),
        AMQPValue::ShortString(s) => HeaderValue::Str(s.as_str().to_owned()),
        AMQPValue::LongString(s) => match std::str::from_utf8(s.as_bytes()) {
            Ok(text) => HeaderValue::Str(text.to_owned()),
            Err(_) => HeaderValue::Bytes(s.as_bytes().to_vec()),
        },
        other => HeaderValue::Other(format!("{other:?}")),
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

pub(crate) fn to_basic(p: &MessageProperties) -> BasicProperties {
    // ---
    let mut out = BasicProperties::default();

    if let Some(v) = &p.content_type {
        out = out.with_content_type(ShortString::from(v.clone()));
    }
    if let Some(v) = &p.content_encoding {
        out = out.with_content_encoding(ShortString::from(v.clone()));
    }
    if !p.headers.is_empty() {
        let mut table = FieldTable::default();
        for (k, v) in &p.headers {
            table.insert(ShortString::from(k.clone()), amqp_value(v));
        }
        out = out.with_headers(table);
    }
    if let Some(v) = p.delivery_mode {
        out = out.with_delivery_mode(v);
    }
    if let Some(v) = p.priority {
        out = out.with_priority(v);
    }
    if let Some(v) = &p.correlation_id {
        out = out.with_correlation_id(ShortString::from(v.clone()));
    }
    if let Some(v) = &p.reply_to {
        out = out.with_reply_to(ShortString::from(v.clone()));
    }
    if let Some(v) = &p.expiration {
        out = out.with_expiration(ShortString::from(v.clone()));
    }
    if let Some(v) = &p.message_id {
        out = out.with_message_id(ShortString::from(v.clone()));
    }
    if let Some(v) = p.timestamp {
        out = out.with_timestamp(v);
    }
    if let Some(v) = &p.kind {
        out = out.with_kind(ShortString::from(v.clone()));
    }
    if let Some(v) = &p.user_id {
        out = out.with_user_id(ShortString::from(v.clone()));
    }
    if let Some(v) = &p.app_id {
        out = out.with_app_id(ShortString::from(v.clone()));
    }
    if let Some(v) = &p.cluster_id {
        out = out.with_cluster_id(ShortString::from(v.clone()));
    }
    out
}

// ---

fn amqp_value(v: &HeaderValue) -> AMQPValue {
    // ---
    match v {
        HeaderValue::Str(s) | HeaderValue::Other(s) => {
            AMQPValue::LongString(LongString::from(s.clone()))
        }
        HeaderValue::Bool(b) => AMQPValue::Boolean(*b),
        HeaderValue::Int(n) => AMQPValue::LongLongInt(*n),
        HeaderValue::UInt(n) => match i64::try_from(*n) {
            Ok(n) => AMQPValue::LongLongInt(n),
            Err(_) => AMQPValue::LongString(LongString::from(n.to_string())),
        },
        HeaderValue::Float(x) => AMQPValue::Double(*x),
        HeaderValue::Timestamp(t) => AMQPValue::Timestamp(*t),
        HeaderValue::Bytes(b) => AMQPValue::ByteArray(ByteArray::from(b.clone())),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn integer_widths_collapse_to_signedness() {
        // ---
        assert_eq!(header_value(&AMQPValue::ShortInt(-4)), HeaderValue::Int(-4));
        assert_eq!(header_value(&AMQPValue::LongUInt(7)), HeaderValue::UInt(7));
        assert_eq!(
            header_value(&AMQPValue::LongString(LongString::from("deploy"))),
            HeaderValue::Str("deploy".into())
        );
    }

    // ---

    #[test]
    fn outbound_properties_survive_the_lapin_mapping() {
        // ---
        let props = MessageProperties {
            delivery_mode: Some(2),
            timestamp: Some(1_700_000_000),
            ..Default::default()
        }
        .with_app_id("remote-build")
        .with_content_type("application/json")
        .with_header("x-job-name", "deploy")
        .with_header("retries", HeaderValue::Int(3));

        let back = from_basic(&to_basic(&props));
        assert_eq!(back, props);
    }

    // ---

    #[test]
    fn oversized_unsigned_header_is_sent_as_text() {
        // ---
        let v = amqp_value(&HeaderValue::UInt(u64::MAX));
        assert_eq!(header_value(&v), HeaderValue::Str(u64::MAX.to_string()));
    }
}
