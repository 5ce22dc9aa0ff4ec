use serde::Deserialize;

// ---------------------------------------------------------------------------
// Sentinels
// ---------------------------------------------------------------------------

/// Wildcard app id. Listeners bound to it see every message on a queue
/// while debug mode is enabled.
pub const DEBUG_APP_ID: &str = "*";

/// Placeholder app id meaning "nothing selected"; never opens a channel.
pub const CONTENT_NONE: &str = "-";

// ---------------------------------------------------------------------------
// ConsumeItem
// ---------------------------------------------------------------------------

/// One configured pairing of a queue and an application id.
///
/// Both fields are trimmed on construction; blank values become `None`.
/// Several items may name the same queue, in which case the consume
/// channel for that queue serves the union of their app ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(from = "RawConsumeItem")]
pub struct ConsumeItem {
    // ---
    app_id: Option<String>,
    queue_name: Option<String>,
}

// ---

impl ConsumeItem {
    // ---
    pub fn new(app_id: Option<&str>, queue_name: Option<&str>) -> Self {
        Self {
            app_id: strip_to_none(app_id),
            queue_name: strip_to_none(queue_name),
        }
    }

    pub fn app_id(&self) -> Option<&str> {
        self.app_id.as_deref()
    }

    pub fn queue_name(&self) -> Option<&str> {
        self.queue_name.as_deref()
    }
}

// ---

#[derive(Deserialize)]
struct RawConsumeItem {
    #[serde(default)]
    app_id: Option<String>,
    #[serde(default)]
    queue_name: Option<String>,
}

impl From<RawConsumeItem> for ConsumeItem {
    fn from(raw: RawConsumeItem) -> Self {
        Self::new(raw.app_id.as_deref(), raw.queue_name.as_deref())
    }
}

// ---

fn strip_to_none(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}
