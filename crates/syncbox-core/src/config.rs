//! Configuration module for syncbox.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::SyncError;

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for syncbox.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub transfers: TransfersConfig,
    pub remote: RemoteConfig,
    pub logging: LoggingConfig,
}

/// Synchronization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Root directory of the local mirror.
    pub root: PathBuf,
    /// Identifier of this device, sent with every remote request.
    pub device_id: String,
    /// Path of the Local Index database.
    pub database: PathBuf,
    /// Seconds between remote polling cycles.
    pub poll_interval: u64,
    /// Idle window of the delay/dedup processor, in milliseconds.
    pub debounce_delay_ms: u64,
}

/// Transfer scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransfersConfig {
    pub max_concurrent_uploads: usize,
    pub max_concurrent_downloads: usize,
    /// Attempts per transfer, including the first one.
    pub max_attempts: u32,
    /// First retry delay, in milliseconds.
    pub backoff_base_ms: u64,
    /// Upper bound of the retry delay, in milliseconds.
    pub backoff_max_ms: u64,
    /// Per-request timeout, in seconds.
    pub request_timeout_secs: u64,
}

/// Remote server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub base_url: String,
    pub syncbox_id: i64,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/syncbox/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("syncbox")
            .join("config.yaml")
    }
}

impl SyncConfig {
    pub fn debounce_delay(&self) -> Duration {
        Duration::from_millis(self.debounce_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }
}

impl TransfersConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for SyncConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("~/.local/share"))
            .join("syncbox");
        Self {
            root: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("~"))
                .join("Syncbox"),
            device_id: String::new(),
            database: data_dir.join("index.db"),
            poll_interval: 30,
            debounce_delay_ms: 2000,
        }
    }
}

impl Default for TransfersConfig {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: 4,
            max_concurrent_downloads: 8,
            max_attempts: 5,
            backoff_base_ms: 1000,
            backoff_max_ms: 60_000,
            request_timeout_secs: 120,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.syncbox.example".to_string(),
            syncbox_id: 0,
            api_key: None,
            api_secret: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"sync.poll_interval"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut push = |field: &str, message: String| {
            errors.push(ValidationError {
                field: field.into(),
                message,
            });
        };

        // --- sync ---
        if self.sync.root.as_os_str().is_empty() {
            push("sync.root", "must not be empty".into());
        } else if !self.sync.root.is_absolute() {
            push(
                "sync.root",
                format!("must be an absolute path: {}", self.sync.root.display()),
            );
        } else if !self.sync.root.is_dir() {
            push(
                "sync.root",
                format!("directory does not exist: {}", self.sync.root.display()),
            );
        }
        if self.sync.device_id.trim().is_empty() {
            push("sync.device_id", "must not be empty".into());
        }
        if self.sync.database.as_os_str().is_empty() {
            push("sync.database", "must not be empty".into());
        } else if self.sync.database.starts_with(&self.sync.root) {
            push(
                "sync.database",
                "must not live inside the sync root".into(),
            );
        }
        if self.sync.poll_interval == 0 {
            push("sync.poll_interval", "must be greater than 0".into());
        }
        if self.sync.debounce_delay_ms == 0 {
            push("sync.debounce_delay_ms", "must be greater than 0".into());
        }

        // --- transfers ---
        if self.transfers.max_concurrent_uploads == 0 {
            push("transfers.max_concurrent_uploads", "must be greater than 0".into());
        }
        if self.transfers.max_concurrent_downloads == 0 {
            push(
                "transfers.max_concurrent_downloads",
                "must be greater than 0".into(),
            );
        }
        if self.transfers.max_attempts == 0 {
            push("transfers.max_attempts", "must be greater than 0".into());
        }
        if self.transfers.backoff_base_ms > self.transfers.backoff_max_ms {
            push(
                "transfers.backoff_base_ms",
                format!(
                    "must not exceed backoff_max_ms ({})",
                    self.transfers.backoff_max_ms
                ),
            );
        }
        if self.transfers.request_timeout_secs == 0 {
            push("transfers.request_timeout_secs", "must be greater than 0".into());
        }

        // --- remote ---
        match url::Url::parse(&self.remote.base_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => push(
                "remote.base_url",
                format!("unsupported scheme: {}", url.scheme()),
            ),
            Err(e) => push("remote.base_url", format!("invalid URL: {e}")),
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            push(
                "logging.level",
                format!(
                    "invalid level '{}', expected one of: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            );
        }

        errors
    }

    /// Validate and convert the findings into a single [`SyncError::Validation`].
    pub fn validated(self) -> Result<Self, SyncError> {
        let errors = self.validate();
        if errors.is_empty() {
            return Ok(self);
        }
        let joined = errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Err(SyncError::Validation(joined))
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for assembling a [`Config`] programmatically.
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Start from [`Config::default`].
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- sync ---

    pub fn sync_root(mut self, root: PathBuf) -> Self {
        self.config.sync.root = root;
        self
    }

    pub fn device_id(mut self, id: impl Into<String>) -> Self {
        self.config.sync.device_id = id.into();
        self
    }

    pub fn database(mut self, path: PathBuf) -> Self {
        self.config.sync.database = path;
        self
    }

    pub fn poll_interval(mut self, seconds: u64) -> Self {
        self.config.sync.poll_interval = seconds;
        self
    }

    pub fn debounce_delay_ms(mut self, ms: u64) -> Self {
        self.config.sync.debounce_delay_ms = ms;
        self
    }

    // --- transfers ---

    pub fn max_concurrent_uploads(mut self, n: usize) -> Self {
        self.config.transfers.max_concurrent_uploads = n;
        self
    }

    pub fn max_concurrent_downloads(mut self, n: usize) -> Self {
        self.config.transfers.max_concurrent_downloads = n;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.transfers.max_attempts = n;
        self
    }

    pub fn backoff_ms(mut self, base: u64, max: u64) -> Self {
        self.config.transfers.backoff_base_ms = base;
        self.config.transfers.backoff_max_ms = max;
        self
    }

    // --- remote ---

    pub fn remote_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.remote.base_url = url.into();
        self
    }

    pub fn syncbox_id(mut self, id: i64) -> Self {
        self.config.remote.syncbox_id = id;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
