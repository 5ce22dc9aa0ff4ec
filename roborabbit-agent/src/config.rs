//! Configuration for `roborabbit-agent`.
//!
//! Two layers:
//!
//! - [`Config`]: command-line flags, parsed once at startup.
//! - [`BrokerConfig`]: the broker settings, read through a [`ConfigSource`]
//!   at the start of every update cycle so edits take effect without a
//!   restart.
//!
//! ```toml
//! service_uri        = "amqp://rabbit.local:5672/%2f"
//! watchdog_period_ms = 60000
//! enable_consumer    = true
//! enable_debug       = false
//!
//! [credentials]
//! username     = "jenkins"
//! password_env = "ROBORABBIT_PASSWORD"
//!
//! [[consume_items]]
//! queue_name = "builds"
//! app_id     = "remote-build"
//! ```

use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

// ---

use clap::Parser;
use serde::Deserialize;

// ---

use roborabbit_domain::{ConsumeItem, Secret};

// ---

use super::ConfigError;

/// Default watchdog period when the configuration does not set one.
pub const DEFAULT_WATCHDOG_PERIOD: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Config (CLI)
// ---------------------------------------------------------------------------

#[derive(Debug, Parser)]
#[command(name = "roborabbit-agent", about = "RoboRabbit broker bridge daemon")]
pub struct Config {
    // ---
    /// Broker configuration file (TOML). Re-read on every update and on
    /// SIGHUP.
    #[arg(long, default_value = "/etc/roborabbit/broker.toml")]
    pub config: PathBuf,

    /// How long shutdown waits for the broker to confirm a connection
    /// close before completing it locally.
    #[arg(long, default_value_t = 300)]
    pub close_timeout_secs: u64,

    /// Delay before the first watchdog tick.
    #[arg(long, default_value_t = 15)]
    pub watchdog_initial_delay_secs: u64,

    /// Log a JSON status snapshot on SIGUSR1.
    #[arg(long)]
    pub status_on_usr1: bool,
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Where the broker password comes from. At most one source should be
/// set; `password` wins over `password_env`, which wins over
/// `password_file`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    // ---
    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: Option<String>,

    /// Name of an environment variable holding the password.
    #[serde(default)]
    pub password_env: Option<String>,

    /// File whose first line is the password.
    #[serde(default)]
    pub password_file: Option<PathBuf>,
}

// ---

impl Credentials {
    // ---
    /// Resolve the configured password source. No source at all yields an
    /// empty password, which leaves the URI's own user info in effect.
    pub fn resolve_password(&self) -> Result<Secret, ConfigError> {
        // ---
        if let Some(p) = &self.password {
            return Ok(Secret::from(p.as_str()));
        }

        if let Some(var) = &self.password_env {
            return std::env::var(var)
                .map(Secret::from)
                .map_err(|e| ConfigError::Secret(format!("${var}: {e}")));
        }

        if let Some(path) = &self.password_file {
            let text = std::fs::read_to_string(path).map_err(|e| {
                ConfigError::Secret(format!("{}: {e}", path.display()))
            })?;
            let line = text.lines().next().unwrap_or_default().trim_end();
            return Ok(Secret::from(line));
        }

        Ok(Secret::default())
    }
}

// ---------------------------------------------------------------------------
// BrokerConfig
// ---------------------------------------------------------------------------

/// Broker settings as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BrokerConfig {
    // ---
    #[serde(default)]
    pub service_uri: Option<String>,

    #[serde(default)]
    pub credentials: Option<Credentials>,

    #[serde(default = "default_watchdog_period_ms")]
    pub watchdog_period_ms: u64,

    #[serde(default)]
    pub enable_consumer: bool,

    #[serde(default)]
    pub enable_debug: bool,

    #[serde(default)]
    pub consume_items: Vec<ConsumeItem>,
}

fn default_watchdog_period_ms() -> u64 {
    DEFAULT_WATCHDOG_PERIOD.as_millis() as u64
}

// ---

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            service_uri: None,
            credentials: None,
            watchdog_period_ms: default_watchdog_period_ms(),
            enable_consumer: false,
            enable_debug: false,
            consume_items: Vec::new(),
        }
    }
}

// ---

impl BrokerConfig {
    // ---
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    // ---

    /// Validate the URI and resolve credentials into the values one update
    /// cycle works with.
    pub fn resolve(&self) -> Result<ResolvedConfig, ConfigError> {
        // ---
        let credentials = self
            .credentials
            .as_ref()
            .ok_or(ConfigError::MissingCredentials)?;
        let password = credentials.resolve_password()?;

        let service_uri = match self.service_uri.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(uri) => Some(validate_uri(uri)?),
        };

        let period_ms = if self.watchdog_period_ms == 0 {
            default_watchdog_period_ms()
        } else {
            self.watchdog_period_ms
        };

        Ok(ResolvedConfig {
            service_uri,
            username: credentials.username.clone(),
            password,
            watchdog_period: Duration::from_millis(period_ms),
            enable_consumer: self.enable_consumer,
            enable_debug: self.enable_debug,
            consume_items: self.consume_items.clone(),
        })
    }
}

// ---

fn validate_uri(uri: &str) -> Result<String, ConfigError> {
    // ---
    let invalid = |reason: String| ConfigError::InvalidUri {
        uri: uri.to_owned(),
        reason,
    };

    let parsed = url::Url::parse(uri).map_err(|e| invalid(e.to_string()))?;
    match parsed.scheme() {
        "amqp" | "amqps" => {}
        other => return Err(invalid(format!("unsupported scheme '{other}'"))),
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host".into()));
    }
    Ok(uri.to_owned())
}

// ---------------------------------------------------------------------------
// ResolvedConfig
// ---------------------------------------------------------------------------

/// A validated configuration snapshot with credentials resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    // ---
    pub service_uri: Option<String>,
    pub username: String,
    pub password: Secret,
    pub watchdog_period: Duration,
    pub enable_consumer: bool,
    pub enable_debug: bool,
    pub consume_items: Vec<ConsumeItem>,
}

// ---------------------------------------------------------------------------
// ConfigSource
// ---------------------------------------------------------------------------

/// Supplies the current broker configuration. Sampled at the start of every
/// update cycle and watchdog tick.
pub trait ConfigSource: Send + Sync {
    // ---
    fn load(&self) -> Result<BrokerConfig, ConfigError>;
}

// ---

/// Reads a TOML file on every [`load`](ConfigSource::load).
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    // ---
    path: PathBuf,
}

impl FileConfigSource {
    // ---
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for FileConfigSource {
    // ---
    fn load(&self) -> Result<BrokerConfig, ConfigError> {
        // ---
        let text = std::fs::read_to_string(&self.path).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;
        BrokerConfig::from_toml(&text)
    }
}

// ---

/// In-memory configuration, replaced wholesale with [`set`](Self::set).
#[derive(Debug, Default)]
pub struct StaticConfigSource {
    // ---
    config: RwLock<BrokerConfig>,
}

impl StaticConfigSource {
    // ---
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    pub fn set(&self, config: BrokerConfig) {
        *self.config.write().unwrap_or_else(|p| p.into_inner()) = config;
    }

    /// Apply `f` to the current configuration in place.
    pub fn modify(&self, f: impl FnOnce(&mut BrokerConfig)) {
        f(&mut self.config.write().unwrap_or_else(|p| p.into_inner()));
    }
}

impl ConfigSource for StaticConfigSource {
    fn load(&self) -> Result<BrokerConfig, ConfigError> {
        Ok(self.config.read().unwrap_or_else(|p| p.into_inner()).clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
        service_uri     = "amqp://rabbit.local:5672/%2f"
        enable_consumer = true

        [credentials]
        username = "jenkins"
        password = "s3cret"

        [[consume_items]]
        queue_name = " builds "
        app_id     = "remote-build"

        [[consume_items]]
        queue_name = "builds"
        app_id     = "-"
    "#;

    #[test]
    fn file_source_parses_and_defaults() {
        // ---
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let cfg = FileConfigSource::new(file.path()).load().unwrap();
        assert!(cfg.enable_consumer);
        assert!(!cfg.enable_debug);
        assert_eq!(cfg.watchdog_period_ms, 60_000);
        assert_eq!(cfg.consume_items.len(), 2);
        assert_eq!(cfg.consume_items[0].queue_name(), Some("builds"));

        let resolved = cfg.resolve().unwrap();
        assert_eq!(resolved.username, "jenkins");
        assert_eq!(resolved.password.expose(), "s3cret");
        assert_eq!(resolved.watchdog_period, DEFAULT_WATCHDOG_PERIOD);
    }

    // ---

    #[test]
    fn missing_file_is_an_io_error() {
        // ---
        let err = FileConfigSource::new("/nonexistent/roborabbit.toml")
            .load()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    // ---

    #[test]
    fn missing_credentials_abort_resolution() {
        // ---
        let cfg = BrokerConfig {
            service_uri: Some("amqp://rabbit.local".into()),
            enable_consumer: true,
            ..Default::default()
        };
        assert!(matches!(cfg.resolve(), Err(ConfigError::MissingCredentials)));
    }

    // ---

    #[test]
    fn non_amqp_uris_are_rejected() {
        // ---
        for uri in ["http://rabbit.local", "not a uri", "amqp://"] {
            let cfg = BrokerConfig {
                service_uri: Some(uri.into()),
                credentials: Some(Credentials::default()),
                ..Default::default()
            };
            assert!(
                matches!(cfg.resolve(), Err(ConfigError::InvalidUri { .. })),
                "{uri} accepted"
            );
        }
    }

    // ---

    #[test]
    fn blank_uri_means_no_uri() {
        // ---
        let cfg = BrokerConfig {
            service_uri: Some("  ".into()),
            credentials: Some(Credentials::default()),
            ..Default::default()
        };
        assert_eq!(cfg.resolve().unwrap().service_uri, None);
    }

    // ---

    #[test]
    fn password_sources() {
        // ---
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "from-file").unwrap();
        writeln!(file, "ignored").unwrap();

        let creds = Credentials {
            password_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        assert_eq!(creds.resolve_password().unwrap().expose(), "from-file");

        std::env::set_var("ROBORABBIT_TEST_PASSWORD_SOURCES", "from-env");
        let creds = Credentials {
            password_env: Some("ROBORABBIT_TEST_PASSWORD_SOURCES".into()),
            ..creds
        };
        assert_eq!(creds.resolve_password().unwrap().expose(), "from-env");

        let creds = Credentials {
            password_env: Some("ROBORABBIT_TEST_UNSET_VARIABLE".into()),
            password_file: None,
            ..Default::default()
        };
        assert!(matches!(creds.resolve_password(), Err(ConfigError::Secret(_))));
    }
}
