//! Collector configuration
//!
//! Configuration can come from a file (TOML, YAML or JSON), from environment
//! variables, or from both: load a file and overlay the environment with
//! [`MetricsConfig::merge_with_env`]. Every field has a default, so an empty
//! file is a valid configuration.
//!
//! ```toml
//! enabled = true
//! flush_at = 20
//! flush_interval_ms = 500
//!
//! [backend]
//! host = "https://telemetry.example.com"
//! public_key = "pk-lf-..."
//! secret_key = "sk-lf-..."
//! ```

use serde::{Deserialize, Serialize};
use std::{env, fmt, fs, path::Path, time::Duration};
use thiserror::Error;

use crate::error::RetryConfig;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable parsing error: {0}")]
    EnvVarParse(String),
    #[error("File parsing error: {0}")]
    FileParse(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Behaviour when the record buffer is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest buffered record and count it as dropped
    #[default]
    DropOldest,
    /// Wait up to `block_timeout` for room, then evict the oldest record.
    /// One hand-off shares a single deadline, and a producer on a
    /// current-thread runtime never waits.
    Block,
}

/// What the global accessor does before `init` has been called
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InitMode {
    /// Hand out a disabled collector
    #[default]
    Lenient,
    /// Fail with `NotInitialized`
    Strict,
}

impl std::str::FromStr for InitMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lenient" => Ok(InitMode::Lenient),
            "strict" => Ok(InitMode::Strict),
            other => Err(ConfigError::EnvVarParse(format!(
                "unknown init mode '{}', expected 'lenient' or 'strict'",
                other
            ))),
        }
    }
}

/// Top-level collector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Master switch; when false every recorder call is a no-op
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Ingestion backend
    #[serde(default)]
    pub backend: BackendConfig,
    /// Maximum batch size, and the buffered count that triggers a flush
    #[serde(default = "default_flush_at")]
    pub flush_at: usize,
    /// Maximum age of a pending batch
    #[serde(
        rename = "flush_interval_ms",
        with = "duration_millis",
        default = "default_flush_interval"
    )]
    pub flush_interval: Duration,
    /// Bounded record buffer size
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
    /// Longest one hand-off of records waits for room under
    /// [`OverflowPolicy::Block`]
    #[serde(
        rename = "block_timeout_ms",
        with = "duration_millis",
        default = "default_block_timeout"
    )]
    pub block_timeout: Duration,
    /// Sessions untouched for this long are finished by the sweeper
    #[serde(
        rename = "idle_timeout_secs",
        with = "duration_seconds",
        default = "default_idle_timeout"
    )]
    pub idle_timeout: Duration,
    /// Period of the idle-session sweep
    #[serde(
        rename = "gc_interval_secs",
        with = "duration_seconds",
        default = "default_gc_interval"
    )]
    pub gc_interval: Duration,
    /// How long finished summaries stay queryable
    #[serde(
        rename = "summary_retention_secs",
        with = "duration_seconds",
        default = "default_summary_retention"
    )]
    pub summary_retention: Duration,
    /// Upper bound on the final drain at teardown
    #[serde(
        rename = "shutdown_timeout_ms",
        with = "duration_millis",
        default = "default_shutdown_timeout"
    )]
    pub shutdown_timeout: Duration,
    #[serde(default)]
    pub init_mode: InitMode,
    #[serde(default = "default_retry")]
    pub retry: RetryConfig,
}

/// Backend connection settings
#[derive(Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(
        rename = "request_timeout_secs",
        with = "duration_seconds",
        default = "default_request_timeout"
    )]
    pub request_timeout: Duration,
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConfig")
            .field("host", &self.host)
            .field("public_key", &self.public_key)
            .field(
                "secret_key",
                &if self.secret_key.is_empty() {
                    ""
                } else {
                    "<redacted>"
                },
            )
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl BackendConfig {
    /// Both halves of the key pair are present
    pub fn has_credentials(&self) -> bool {
        !self.public_key.trim().is_empty() && !self.secret_key.trim().is_empty()
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            public_key: String::new(),
            secret_key: String::new(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: BackendConfig::default(),
            flush_at: default_flush_at(),
            flush_interval: default_flush_interval(),
            buffer_capacity: default_buffer_capacity(),
            overflow_policy: OverflowPolicy::default(),
            block_timeout: default_block_timeout(),
            idle_timeout: default_idle_timeout(),
            gc_interval: default_gc_interval(),
            summary_retention: default_summary_retention(),
            shutdown_timeout: default_shutdown_timeout(),
            init_mode: InitMode::default(),
            retry: default_retry(),
        }
    }
}

impl MetricsConfig {
    /// A configuration with monitoring switched off
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Load configuration from a file (supports TOML, YAML, JSON)
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let extension = path.extension().and_then(|s| s.to_str());

        match extension {
            Some("toml") => {
                toml::from_str(&content).map_err(|e| ConfigError::FileParse(e.to_string()))
            }
            Some("yaml") | Some("yml") => {
                serde_yaml::from_str(&content).map_err(|e| ConfigError::FileParse(e.to_string()))
            }
            Some("json") => {
                serde_json::from_str(&content).map_err(|e| ConfigError::FileParse(e.to_string()))
            }
            _ => Err(ConfigError::FileParse(
                "Unsupported file format. Use .toml, .yaml, .yml, or .json".to_string(),
            )),
        }
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().merge_with_env()
    }

    /// Overlay every set environment variable on this configuration
    pub fn merge_with_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(enabled) = env::var("LANGFUSE_ENABLED") {
            self.enabled = parse_bool("LANGFUSE_ENABLED", &enabled)?;
        }
        if let Ok(host) = env::var("LANGFUSE_HOST") {
            self.backend.host = host;
        }
        if let Ok(key) = env::var("LANGFUSE_PUBLIC_KEY") {
            self.backend.public_key = key;
        }
        if let Ok(key) = env::var("LANGFUSE_SECRET_KEY") {
            self.backend.secret_key = key;
        }

        if let Ok(value) = env::var("CONVO_METRICS_FLUSH_AT") {
            self.flush_at = parse_number("CONVO_METRICS_FLUSH_AT", &value)?;
        }
        if let Ok(value) = env::var("CONVO_METRICS_FLUSH_INTERVAL_MS") {
            self.flush_interval =
                Duration::from_millis(parse_number("CONVO_METRICS_FLUSH_INTERVAL_MS", &value)?);
        }
        if let Ok(value) = env::var("CONVO_METRICS_BUFFER_CAPACITY") {
            self.buffer_capacity = parse_number("CONVO_METRICS_BUFFER_CAPACITY", &value)?;
        }
        if let Ok(value) = env::var("CONVO_METRICS_IDLE_TIMEOUT_SECS") {
            self.idle_timeout =
                Duration::from_secs(parse_number("CONVO_METRICS_IDLE_TIMEOUT_SECS", &value)?);
        }
        if let Ok(value) = env::var("CONVO_METRICS_INIT_MODE") {
            self.init_mode = value.parse()?;
        }

        Ok(self)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_at == 0 {
            return Err(ConfigError::Validation(
                "flush_at must be greater than 0".to_string(),
            ));
        }
        if self.buffer_capacity < self.flush_at {
            return Err(ConfigError::Validation(format!(
                "buffer_capacity ({}) must be at least flush_at ({})",
                self.buffer_capacity, self.flush_at
            )));
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::Validation(
                "flush_interval must be greater than 0".to_string(),
            ));
        }
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "idle_timeout must be greater than 0".to_string(),
            ));
        }
        if self.gc_interval.is_zero() {
            return Err(ConfigError::Validation(
                "gc_interval must be greater than 0".to_string(),
            ));
        }
        if self.enabled && self.backend.host.trim().is_empty() {
            return Err(ConfigError::Validation(
                "backend host cannot be empty when monitoring is enabled".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(ConfigError::Validation(
                "retry jitter_factor must be between 0.0 and 1.0".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_number<T>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ConfigError::EnvVarParse(format!("{}: {}", name, e)))
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(ConfigError::EnvVarParse(format!(
            "{}: expected a boolean, got '{}'",
            name, other
        ))),
    }
}

/// Custom serialization for Duration as seconds
mod duration_seconds {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Custom serialization for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "http://localhost:3000".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_flush_at() -> usize {
    10
}

fn default_flush_interval() -> Duration {
    Duration::from_millis(1000)
}

fn default_buffer_capacity() -> usize {
    10_000
}

fn default_block_timeout() -> Duration {
    Duration::from_millis(50)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_gc_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_summary_retention() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_millis(5000)
}

fn default_retry() -> RetryConfig {
    RetryConfig::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = MetricsConfig::default();
        assert!(config.enabled);
        assert_eq!(config.backend.host, "http://localhost:3000");
        assert_eq!(config.flush_at, 10);
        assert_eq!(config.flush_interval, Duration::from_secs(1));
        assert_eq!(config.overflow_policy, OverflowPolicy::DropOldest);
        assert_eq!(config.init_mode, InitMode::Lenient);
        assert_eq!(config.retry.max_retries, 3);
        assert!(!config.backend.has_credentials());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = MetricsConfig::default();
        config.flush_at = 0;
        assert!(config.validate().is_err());

        let mut config = MetricsConfig::default();
        config.buffer_capacity = 5;
        assert!(config.validate().is_err());

        let mut config = MetricsConfig::default();
        config.flush_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = MetricsConfig::default();
        config.idle_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = MetricsConfig::default();
        config.backend.host = String::new();
        assert!(config.validate().is_err());

        // an empty host is fine when nothing will be sent
        config.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_config_loading() {
        let toml_content = r#"
enabled = true
flush_at = 25
flush_interval_ms = 250
buffer_capacity = 500
overflow_policy = "block"
idle_timeout_secs = 120
init_mode = "strict"

[backend]
host = "https://telemetry.internal"
public_key = "pk-1"
secret_key = "sk-1"

[retry]
max_retries = 5
"#;

        let temp_file = NamedTempFile::with_suffix(".toml").unwrap();
        std::fs::write(temp_file.path(), toml_content).unwrap();

        let config = MetricsConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(config.flush_at, 25);
        assert_eq!(config.flush_interval, Duration::from_millis(250));
        assert_eq!(config.buffer_capacity, 500);
        assert_eq!(config.overflow_policy, OverflowPolicy::Block);
        assert_eq!(config.idle_timeout, Duration::from_secs(120));
        assert_eq!(config.init_mode, InitMode::Strict);
        assert_eq!(config.backend.host, "https://telemetry.internal");
        assert!(config.backend.has_credentials());
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay_ms, 100);
        // untouched fields keep their defaults
        assert_eq!(config.gc_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_yaml_and_json_loading() {
        let yaml = "enabled: false\nflush_at: 3\n";
        let temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        std::fs::write(temp_file.path(), yaml).unwrap();
        let config = MetricsConfig::from_file(temp_file.path()).unwrap();
        assert!(!config.enabled);
        assert_eq!(config.flush_at, 3);

        let json = r#"{"buffer_capacity": 64, "backend": {"request_timeout_secs": 2}}"#;
        let temp_file = NamedTempFile::with_suffix(".json").unwrap();
        std::fs::write(temp_file.path(), json).unwrap();
        let config = MetricsConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(config.buffer_capacity, 64);
        assert_eq!(config.backend.request_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_unsupported_extension() {
        let temp_file = NamedTempFile::with_suffix(".ini").unwrap();
        std::fs::write(temp_file.path(), "enabled = true").unwrap();
        assert!(matches!(
            MetricsConfig::from_file(temp_file.path()),
            Err(ConfigError::FileParse(_))
        ));
    }

    #[test]
    fn test_env_var_loading() {
        env::set_var("LANGFUSE_ENABLED", "false");
        env::set_var("LANGFUSE_HOST", "http://collector:3000");
        env::set_var("CONVO_METRICS_FLUSH_AT", "42");
        env::set_var("CONVO_METRICS_INIT_MODE", "strict");

        let config = MetricsConfig::from_env().unwrap();
        assert!(!config.enabled);
        assert_eq!(config.backend.host, "http://collector:3000");
        assert_eq!(config.flush_at, 42);
        assert_eq!(config.init_mode, InitMode::Strict);

        env::set_var("CONVO_METRICS_FLUSH_AT", "many");
        assert!(matches!(
            MetricsConfig::from_env(),
            Err(ConfigError::EnvVarParse(_))
        ));

        // Clean up
        env::remove_var("LANGFUSE_ENABLED");
        env::remove_var("LANGFUSE_HOST");
        env::remove_var("CONVO_METRICS_FLUSH_AT");
        env::remove_var("CONVO_METRICS_INIT_MODE");
    }

    #[test]
    fn test_debug_redacts_secret() {
        let backend = BackendConfig {
            secret_key: "sk-very-secret".to_string(),
            ..Default::default()
        };
        let rendered = format!("{:?}", backend);
        assert!(!rendered.contains("sk-very-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
