// ---------------------------------------------------------------------------
// SimConfig
// ---------------------------------------------------------------------------

/// Failure injection switches for the in-process broker.
///
/// All fields default to a healthy broker. Every switch can also be flipped
/// at runtime through the matching `SimBroker::set_*` method.
#[derive(Debug, Clone, Default)]
pub struct SimConfig {
    // ---
    /// New connection attempts fail with a connection error.
    pub refuse_connections: bool,

    /// `create_channel` fails on every live connection.
    pub refuse_channels: bool,

    /// `basic_publish` fails with a channel error.
    pub fail_publish: bool,

    /// `BrokerChannel::close` fails with a broker-side (non-application)
    /// error and leaves the channel open.
    pub fail_channel_close: bool,

    /// `BrokerConnection::close` returns `Ok` but the connection never
    /// reports its shutdown, simulating a broker that never confirms.
    pub swallow_connection_close: bool,
}

// ---

impl SimConfig {
    // ---
    /// Broker that is down: every connection attempt is refused.
    pub fn unreachable() -> Self {
        Self {
            refuse_connections: true,
            ..Default::default()
        }
    }
}
