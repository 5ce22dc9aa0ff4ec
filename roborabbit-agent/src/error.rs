//! Error types for `roborabbit-agent`.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Why a broker configuration could not be used for an update cycle.
#[derive(Debug, Error)]
pub enum ConfigError {
    // ---
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid service URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("credentials are not set")]
    MissingCredentials,

    #[error("cannot resolve password: {0}")]
    Secret(String),
}

// ---------------------------------------------------------------------------
// ManagerError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ManagerError {
    // ---
    /// The broker never confirmed the close; the connection was completed
    /// locally.
    #[error("connection close not confirmed within {0:?}")]
    ShutdownTimeout(Duration),
}
