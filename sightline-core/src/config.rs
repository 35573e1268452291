//! Configuration loading and management
//!
//! Tracker options arrive either programmatically (`TrackerConfig` built in
//! code or deserialized from a JSON blob) or from the CLI config file at
//! `~/.config/sightline/config.toml`.
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/sightline/` (~/.config/sightline/)
//! - Data: `$XDG_DATA_HOME/sightline/` (~/.local/share/sightline/)
//! - State/Logs: `$XDG_STATE_HOME/sightline/` (~/.local/state/sightline/)

use crate::error::{Error, Result};
use crate::event::EventFilter;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable consulted when no explicit client id is configured.
pub const CLIENT_ID_ENV: &str = "SIGHTLINE_CLIENT_ID";

/// Collector used when `apiUrl` is absent or unparseable.
pub const DEFAULT_API_URL: &str = "https://basket.sightline.dev";

const MIN_BATCH_SIZE: usize = 1;
const MAX_BATCH_SIZE: usize = 50;
const MIN_BATCH_TIMEOUT_MS: u64 = 100;
const MAX_BATCH_TIMEOUT_MS: u64 = 30_000;
const MIN_RETRY_DELAY_MS: u64 = 50;
const MAX_RETRY_DELAY_MS: u64 = 10_000;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct (config file layout)
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Tracker options
    #[serde(default)]
    pub tracker: TrackerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Tracker options.
///
/// Option names are camelCase so the same blob a page would hand to the
/// script tag deserializes unchanged. Unknown options are ignored.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrackerConfig {
    /// Site identifier sent with every request (falls back to `SIGHTLINE_CLIENT_ID`)
    #[serde(default)]
    pub client_id: Option<String>,

    /// Collector base URL
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Turn the tracker into a no-op
    #[serde(default)]
    pub disabled: bool,

    /// Promote configuration and delivery warnings to `warn` level
    #[serde(default)]
    pub debug: bool,

    /// Track even when the host looks automation-driven
    #[serde(default)]
    pub ignore_bot_detection: bool,

    /// Suppress tracking when the host reports do-not-track
    #[serde(default = "default_true")]
    pub respect_do_not_track: bool,

    /// Path globs on which nothing is tracked
    #[serde(default)]
    pub skip_patterns: Vec<String>,

    /// Path globs whose variable segments are replaced by `*` in events
    #[serde(default)]
    pub mask_patterns: Vec<String>,

    /// Fraction of track calls kept (0.0 - 1.0)
    #[serde(default = "default_sampling_rate")]
    pub sampling_rate: f64,

    /// Accumulate events and send them as arrays
    #[serde(default = "default_true")]
    pub enable_batching: bool,

    /// Events per batch (1 - 50)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Milliseconds between the first buffered event and the flush (100 - 30000)
    #[serde(default = "default_batch_timeout")]
    pub batch_timeout: u64,

    /// Retry transient delivery failures
    #[serde(default)]
    pub enable_retries: bool,

    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Milliseconds before the first retry (50 - 10000)
    #[serde(default = "default_initial_retry_delay")]
    pub initial_retry_delay: u64,

    /// Milliseconds of inactivity after which the session rotates
    #[serde(default = "default_session_timeout")]
    pub session_timeout: u64,

    /// Arm the vitals collector
    #[serde(default)]
    pub track_web_vitals: bool,

    /// Capture host errors
    #[serde(default)]
    pub track_errors: bool,

    /// Emit `screen_view` on init and on route changes
    #[serde(default = "default_true")]
    pub track_screen_views: bool,

    /// Count hash-only URL changes as new screens
    #[serde(default)]
    pub track_hash_changes: bool,

    /// Drop any built event the predicate rejects (code-only, never deserialized)
    #[serde(skip)]
    pub filter: Option<EventFilter>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            api_url: default_api_url(),
            disabled: false,
            debug: false,
            ignore_bot_detection: false,
            respect_do_not_track: true,
            skip_patterns: Vec::new(),
            mask_patterns: Vec::new(),
            sampling_rate: default_sampling_rate(),
            enable_batching: true,
            batch_size: default_batch_size(),
            batch_timeout: default_batch_timeout(),
            enable_retries: false,
            max_retries: default_max_retries(),
            initial_retry_delay: default_initial_retry_delay(),
            session_timeout: default_session_timeout(),
            track_web_vitals: false,
            track_errors: false,
            track_screen_views: true,
            track_hash_changes: false,
            filter: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_sampling_rate() -> f64 {
    1.0
}

fn default_batch_size() -> usize {
    10
}

fn default_batch_timeout() -> u64 {
    5000
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_retry_delay() -> u64 {
    500
}

fn default_session_timeout() -> u64 {
    30 * 60 * 1000
}

impl TrackerConfig {
    /// Convenience constructor with only a client id set
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: Some(client_id.into()),
            ..Default::default()
        }
    }

    /// Parse options from a JSON object (the script-tag shape)
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Resolve the client id from the explicit option or the environment
    pub fn resolve_client_id(&self) -> Option<String> {
        self.resolve_client_id_with(|key| std::env::var(key).ok())
    }

    /// Resolve the client id using a caller-supplied environment lookup
    pub fn resolve_client_id_with<F>(&self, env: F) -> Option<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.client_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .or_else(|| {
                env(CLIENT_ID_ENV)
                    .map(|id| id.trim().to_string())
                    .filter(|id| !id.is_empty())
            })
    }

    /// Clamp numeric options into their supported ranges
    pub fn normalized(mut self) -> Self {
        self.batch_size = self.batch_size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE);
        self.batch_timeout = self
            .batch_timeout
            .clamp(MIN_BATCH_TIMEOUT_MS, MAX_BATCH_TIMEOUT_MS);
        self.initial_retry_delay = self
            .initial_retry_delay
            .clamp(MIN_RETRY_DELAY_MS, MAX_RETRY_DELAY_MS);
        self.sampling_rate = if self.sampling_rate.is_nan() {
            1.0
        } else {
            self.sampling_rate.clamp(0.0, 1.0)
        };
        if url::Url::parse(&self.api_url).is_err() {
            self.api_url = default_api_url();
        }
        self.api_url = self.api_url.trim_end_matches('/').to_string();
        self
    }

    /// Validate and normalize, resolving the client id from the environment
    pub fn prepare(self) -> Result<Self> {
        self.prepare_with(|key| std::env::var(key).ok())
    }

    /// Validate and normalize with a caller-supplied environment lookup
    pub fn prepare_with<F>(mut self, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let client_id = self.resolve_client_id_with(env).ok_or_else(|| {
            Error::Config(format!(
                "clientId is required (set it explicitly or via {})",
                CLIENT_ID_ENV
            ))
        })?;
        self.client_id = Some(client_id);
        Ok(self.normalized())
    }

    /// The resolved client id (empty when `prepare` was never called)
    pub fn client_id(&self) -> &str {
        self.client_id.as_deref().unwrap_or_default()
    }

    pub fn batch_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.batch_timeout)
    }

    pub fn initial_retry_delay_duration(&self) -> Duration {
        Duration::from_millis(self.initial_retry_delay)
    }

    pub fn session_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.session_timeout)
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/sightline/config.toml` (~/.config/sightline/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("sightline").join("config.toml")
    }

    /// Returns the data directory path (for persisted identity storage)
    ///
    /// `$XDG_DATA_HOME/sightline/` (~/.local/share/sightline/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("sightline")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/sightline/` (~/.local/state/sightline/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("sightline")
    }

    /// Returns the log file path
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("sightline.log")
    }
}
