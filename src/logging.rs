//! Logging setup for processes that embed the collector
//!
//! The library itself only emits `tracing` events. Binaries call
//! [`init_logging`] once to install a subscriber with a console layer on
//! stderr and an optional daily-rolling file layer, and keep the returned
//! [`LoggingGuard`] alive until exit so buffered file output is flushed.

use std::path::PathBuf;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
    Registry,
};

use crate::error::MetricsError;
use crate::Result;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Dependencies whose debug output drowns ours
const QUIET_TARGETS: &[&str] = &["hyper=warn", "h2=warn", "reqwest=warn", "tokio=warn"];

/// Configuration for the logging subscriber
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Directory for rolling log files
    pub log_dir: PathBuf,
    /// File name prefix; files roll daily
    pub file_prefix: String,
    /// Filter directive for the file layer
    pub file_log_level: String,
    /// Filter directive for the console layer
    pub console_log_level: String,
    pub console_enabled: bool,
    pub file_enabled: bool,
    /// Write the file layer as JSON lines
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            file_prefix: "convo-metrics.log".to_string(),
            file_log_level: "info".to_string(),
            console_log_level: "warn".to_string(),
            console_enabled: true,
            file_enabled: false,
            json_format: true,
        }
    }
}

impl LoggingConfig {
    /// Create logging configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(log_dir) = std::env::var("CONVO_METRICS_LOG_DIR") {
            config.log_dir = PathBuf::from(log_dir);
            config.file_enabled = true;
        }
        if let Ok(level) = std::env::var("CONVO_METRICS_FILE_LOG_LEVEL") {
            config.file_log_level = level;
        }
        if let Ok(level) = std::env::var("CONVO_METRICS_LOG_LEVEL") {
            config.console_log_level = level;
        }
        if let Ok(enabled) = std::env::var("CONVO_METRICS_CONSOLE_LOGGING") {
            config.console_enabled = enabled.parse().unwrap_or(true);
        }
        if let Ok(enabled) = std::env::var("CONVO_METRICS_FILE_LOGGING") {
            config.file_enabled = enabled.parse().unwrap_or(config.file_enabled);
        }
        if let Ok(json) = std::env::var("CONVO_METRICS_JSON_LOGS") {
            config.json_format = json.parse().unwrap_or(true);
        }

        config
    }
}

/// Keeps the non-blocking file writer alive
#[derive(Debug)]
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Build a filter from `level`, falling back to `fallback` when it does not parse
fn build_filter(level: &str, fallback: &str) -> EnvFilter {
    QUIET_TARGETS
        .iter()
        .filter_map(|directive| directive.parse().ok())
        .fold(
            EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new(fallback)),
            |filter, directive| filter.add_directive(directive),
        )
}

/// Install the global subscriber
///
/// Fails if the log directory cannot be created or a subscriber is already
/// installed.
pub fn init_logging(config: LoggingConfig) -> Result<LoggingGuard> {
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut file_guard = None;

    if config.file_enabled {
        std::fs::create_dir_all(&config.log_dir).map_err(|e| {
            MetricsError::configuration_error(format!("Failed to create log directory: {}", e))
        })?;

        let appender = tracing_appender::rolling::daily(&config.log_dir, &config.file_prefix);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        file_guard = Some(guard);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_span_events(FmtSpan::CLOSE)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::new(
                "%Y-%m-%d %H:%M:%S%.3f UTC".to_string(),
            ))
            .with_file(true)
            .with_line_number(true)
            .with_target(true);
        let file_filter = build_filter(&config.file_log_level, "info");

        layers.push(if config.json_format {
            file_layer
                .json()
                .with_current_span(true)
                .with_filter(file_filter)
                .boxed()
        } else {
            file_layer.with_filter(file_filter).boxed()
        });
    }

    if config.console_enabled {
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_span_events(FmtSpan::NONE)
                .with_target(true)
                .with_filter(build_filter(&config.console_log_level, "warn"))
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .map_err(|e| {
            MetricsError::configuration_error(format!("Failed to install log subscriber: {}", e))
        })?;

    info!(
        log_dir = %config.log_dir.display(),
        file_logging = config.file_enabled,
        json_format = config.json_format,
        "Logging initialized"
    );

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_config_default() {
        let config = LoggingConfig::default();
        assert_eq!(config.log_dir, PathBuf::from("logs"));
        assert!(config.console_enabled);
        assert!(!config.file_enabled);
        assert!(config.json_format);
    }

    #[test]
    fn test_invalid_level_falls_back() {
        let filter = build_filter("not a level !!", "warn");
        assert!(filter.to_string().contains("warn"));
    }

    #[test]
    fn test_init_writes_to_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            log_dir: dir.path().join("nested"),
            file_enabled: true,
            console_enabled: false,
            ..Default::default()
        };

        let guard = init_logging(config);
        assert!(dir.path().join("nested").exists());
        if guard.is_ok() {
            assert!(init_logging(LoggingConfig::default()).is_err());
        }
    }
}
