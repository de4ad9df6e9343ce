//! Process-wide collector
//!
//! Agents that cannot thread a [`MetricsCollector`] through their call graph
//! can install one here at startup and fetch it anywhere. Initialization
//! happens once; [`teardown`] drains the installed collector and frees the
//! slot again.
//!
//! What a lookup before [`init`] returns depends on the [`InitMode`]: a
//! disabled collector in lenient mode, `NotInitialized` in strict mode.

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

use super::MetricsCollector;
use crate::config::{InitMode, MetricsConfig};
use crate::error::MetricsError;
use crate::uploader::ShutdownReport;
use crate::Result;

static GLOBAL_COLLECTOR: Lazy<RwLock<Option<MetricsCollector>>> = Lazy::new(|| RwLock::new(None));
static STRICT: AtomicBool = AtomicBool::new(false);

/// Choose how lookups behave before initialization
pub fn set_init_mode(mode: InitMode) {
    STRICT.store(mode == InitMode::Strict, Ordering::Release);
}

pub fn init_mode() -> InitMode {
    if STRICT.load(Ordering::Acquire) {
        InitMode::Strict
    } else {
        InitMode::Lenient
    }
}

/// Build a collector from `config` and install it
///
/// Also applies `config.init_mode`. Fails with `AlreadyInitialized` when a
/// collector is installed, without starting a second pipeline.
pub fn init(config: MetricsConfig) -> Result<MetricsCollector> {
    let mut slot = GLOBAL_COLLECTOR.write();
    if slot.is_some() {
        return Err(MetricsError::AlreadyInitialized);
    }

    set_init_mode(config.init_mode);
    let collector = MetricsCollector::start(config)?;
    *slot = Some(collector.clone());
    info!(enabled = collector.is_enabled(), "Global metrics collector initialized");
    Ok(collector)
}

/// Install an already constructed collector
pub fn install(collector: MetricsCollector) -> Result<()> {
    let mut slot = GLOBAL_COLLECTOR.write();
    if slot.is_some() {
        return Err(MetricsError::AlreadyInitialized);
    }
    *slot = Some(collector);
    Ok(())
}

pub fn is_initialized() -> bool {
    GLOBAL_COLLECTOR.read().is_some()
}

/// The installed collector
pub fn get_metrics_collector() -> Result<MetricsCollector> {
    if let Some(collector) = GLOBAL_COLLECTOR.read().as_ref() {
        return Ok(collector.clone());
    }
    match init_mode() {
        InitMode::Strict => Err(MetricsError::NotInitialized),
        InitMode::Lenient => {
            debug!("Global metrics collector not initialized, using a disabled one");
            Ok(MetricsCollector::disabled())
        }
    }
}

/// The installed collector, or a disabled one in any mode
pub fn metrics() -> MetricsCollector {
    get_metrics_collector().unwrap_or_default()
}

/// Remove the installed collector and shut it down
///
/// `None` when nothing was installed.
pub async fn teardown() -> Option<ShutdownReport> {
    let collector = GLOBAL_COLLECTOR.write().take()?;
    Some(collector.shutdown().await)
}
