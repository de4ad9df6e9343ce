//! Collector facade
//!
//! [`MetricsCollector`] is the only type agent code needs. It owns the session
//! aggregator, the record buffer and the background tasks (uploader and idle
//! sweeper), and exposes recorder calls that never fail: any telemetry error
//! is logged, counted in [`CollectorStats::contained_errors`] and swallowed.
//!
//! The collector is an explicitly constructed context object. Clone it into
//! the components that record telemetry, and call
//! [`MetricsCollector::shutdown`] once at exit to drain pending records.
//! [`global`] offers a thin process-wide accessor on top of the same
//! lifecycle.
//!
//! ```rust,no_run
//! use convo_metrics::{MetricsCollector, MetricsConfig};
//! use convo_metrics::record::{metadata, SpanStatus};
//!
//! # async fn run() -> convo_metrics::Result<()> {
//! let collector = MetricsCollector::start(MetricsConfig::from_env()?)?;
//!
//! let span = collector.start_span("session-1", "classify_intent", None, Default::default());
//! collector.end_span(span, SpanStatus::Ok, metadata([("tokens", 12)]), None);
//! collector.record_score("session-1", "confidence", 0.91, None);
//!
//! let summary = collector.finish_conversation("session-1");
//! collector.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod global;
pub mod guard;
pub mod stats;

pub use guard::SpanGuard;
pub use stats::{CollectorStats, Counters, GlobalMetrics};

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator::{AggregatorConfig, SessionAggregator};
use crate::collector::stats::incr;
use crate::config::MetricsConfig;
use crate::error::MetricsError;
use crate::record::{EventLevel, Metadata, Score, ScoreScale, SpanId, SpanStatus, Summary};
use crate::uploader::{
    BatchBuffer, BufferConfig, HttpTransport, ShutdownReport, Transport, Uploader, UploaderConfig,
};
use crate::Result;

#[derive(Debug)]
struct Inner {
    config: MetricsConfig,
    aggregator: Arc<SessionAggregator>,
    uploader: Uploader,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}

/// Handle to the telemetry pipeline
///
/// Cloning is cheap; all clones share the same pipeline. A disabled collector
/// holds no state at all and every call on it returns immediately.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    inner: Option<Arc<Inner>>,
}

impl MetricsCollector {
    /// Collector that records nothing
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// Start a collector that ships records to the configured HTTP backend
    ///
    /// Missing API keys disable monitoring with a warning instead of failing.
    pub fn start(config: MetricsConfig) -> Result<Self> {
        config.validate()?;
        if !config.enabled {
            info!("Monitoring disabled by configuration");
            return Ok(Self::disabled());
        }
        if !config.backend.has_credentials() {
            warn!(
                host = %config.backend.host,
                "Backend API keys not configured, monitoring disabled"
            );
            return Ok(Self::disabled());
        }

        let transport =
            Arc::new(HttpTransport::new(&config.backend)?.with_max_events(config.flush_at));
        Self::with_transport(config, transport)
    }

    /// Start a collector on a caller-supplied transport
    ///
    /// Must be called inside a Tokio runtime when `config.enabled` is set.
    pub fn with_transport(config: MetricsConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        if !config.enabled {
            return Ok(Self::disabled());
        }
        tokio::runtime::Handle::try_current().map_err(|_| {
            MetricsError::configuration_error(
                "an enabled metrics collector must be started inside a Tokio runtime",
            )
        })?;

        let counters = Arc::new(Counters::new());
        let buffer = Arc::new(BatchBuffer::new(
            BufferConfig::from(&config),
            Arc::clone(&counters),
        ));
        let aggregator = Arc::new(SessionAggregator::new(
            AggregatorConfig::from(&config),
            buffer.clone(),
            Arc::clone(&counters),
        ));
        let transport_name = transport.name();
        let uploader = Uploader::spawn(
            buffer,
            transport,
            UploaderConfig::from(&config),
            Arc::clone(&counters),
        );

        let cancel = CancellationToken::new();
        let sweeper = spawn_sweeper(
            Arc::clone(&aggregator),
            config.gc_interval,
            cancel.clone(),
        );

        info!(
            transport = transport_name,
            flush_at = config.flush_at,
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            buffer_capacity = config.buffer_capacity,
            "Metrics collector started"
        );

        Ok(Self {
            inner: Some(Arc::new(Inner {
                config,
                aggregator,
                uploader,
                counters,
                cancel,
                sweeper: Mutex::new(Some(sweeper)),
                shut_down: AtomicBool::new(false),
            })),
        })
    }

    /// Pipeline state, or `None` when disabled or shut down
    fn live(&self) -> Option<&Inner> {
        self.inner
            .as_deref()
            .filter(|inner| !inner.shut_down.load(Ordering::Acquire))
    }

    /// Records are being collected
    pub fn is_enabled(&self) -> bool {
        self.live().is_some()
    }

    pub fn config(&self) -> Option<&MetricsConfig> {
        self.inner.as_deref().map(|inner| &inner.config)
    }

    /// Fallible recorder API, for callers that want the errors
    pub fn aggregator(&self) -> Option<&Arc<SessionAggregator>> {
        self.live().map(|inner| &inner.aggregator)
    }

    fn contain(inner: &Inner, operation: &'static str, error: MetricsError) {
        incr(&inner.counters.contained_errors);
        match &error {
            MetricsError::SpanClosed { .. } if operation == "update_span" => {
                debug!(operation, error = %error, "Ignoring update of a closed span");
            }
            MetricsError::SpanClosed { .. } => {
                warn!(operation, error = %error, "Span already closed, ignoring");
            }
            _ => warn!(operation, error = %error, "Telemetry call failed"),
        }
    }

    /// Open a session eagerly and attach session-level metadata
    pub fn start_conversation(&self, session_id: &str, metadata: Metadata) {
        let Some(inner) = self.live() else { return };
        if let Err(e) = inner.aggregator.try_start_conversation(session_id, metadata) {
            Self::contain(inner, "start_conversation", e);
        }
    }

    /// Open a span; returns [`SpanId::NOOP`] when disabled or on failure
    pub fn start_span(
        &self,
        session_id: &str,
        name: &str,
        parent_id: Option<SpanId>,
        metadata: Metadata,
    ) -> SpanId {
        let Some(inner) = self.live() else {
            return SpanId::NOOP;
        };
        match inner
            .aggregator
            .try_start_span(session_id, name, parent_id, metadata)
        {
            Ok(id) => id,
            Err(e) => {
                Self::contain(inner, "start_span", e);
                SpanId::NOOP
            }
        }
    }

    /// Open a span for one model call; returns [`SpanId::NOOP`] when
    /// disabled or on failure
    pub fn start_generation(
        &self,
        session_id: &str,
        name: &str,
        parent_id: Option<SpanId>,
        model: &str,
        metadata: Metadata,
    ) -> SpanId {
        let Some(inner) = self.live() else {
            return SpanId::NOOP;
        };
        match inner
            .aggregator
            .try_start_generation(session_id, name, parent_id, model, metadata)
        {
            Ok(id) => id,
            Err(e) => {
                Self::contain(inner, "start_generation", e);
                SpanId::NOOP
            }
        }
    }

    /// Close a span; closing twice is a logged no-op
    pub fn end_span(
        &self,
        span_id: SpanId,
        status: SpanStatus,
        metadata_update: Metadata,
        error: Option<String>,
    ) {
        if span_id.is_noop() {
            return;
        }
        let Some(inner) = self.live() else { return };
        if let Err(e) = inner
            .aggregator
            .try_end_span(span_id, status, metadata_update, error)
        {
            Self::contain(inner, "end_span", e);
        }
    }

    /// Close a span whose guard went out of scope unfinished
    ///
    /// The session may already be finished or reset, which closed the span;
    /// that is not a telemetry failure.
    pub(crate) fn release_span(&self, span_id: SpanId) {
        if span_id.is_noop() {
            return;
        }
        let Some(inner) = self.live() else { return };
        match inner
            .aggregator
            .try_end_span(span_id, SpanStatus::Orphaned, Metadata::new(), None)
        {
            Ok(()) => {}
            Err(
                e @ (MetricsError::UnknownSpan { .. }
                | MetricsError::InvalidSession { .. }
                | MetricsError::SpanClosed { .. }),
            ) => debug!(span_id = %span_id, error = %e, "Guard dropped after its span was closed"),
            Err(e) => Self::contain(inner, "end_span", e),
        }
    }

    /// Merge metadata into an open span
    pub fn update_span(&self, span_id: SpanId, delta: Metadata) {
        if span_id.is_noop() {
            return;
        }
        let Some(inner) = self.live() else { return };
        if let Err(e) = inner.aggregator.try_update_span(span_id, delta) {
            Self::contain(inner, "update_span", e);
        }
    }

    /// Attach a timestamped event to an open span
    pub fn add_span_event(&self, span_id: SpanId, name: &str, level: EventLevel, metadata: Metadata) {
        if span_id.is_noop() {
            return;
        }
        let Some(inner) = self.live() else { return };
        if let Err(e) = inner
            .aggregator
            .try_add_span_event(span_id, name, level, metadata)
        {
            Self::contain(inner, "add_span_event", e);
        }
    }

    /// Record what an open span received
    pub fn set_span_input(&self, span_id: SpanId, input: serde_json::Value) {
        if span_id.is_noop() {
            return;
        }
        let Some(inner) = self.live() else { return };
        if let Err(e) = inner.aggregator.try_set_span_input(span_id, input) {
            Self::contain(inner, "set_span_input", e);
        }
    }

    /// Record what an open span produced
    pub fn set_span_output(&self, span_id: SpanId, output: serde_json::Value) {
        if span_id.is_noop() {
            return;
        }
        let Some(inner) = self.live() else { return };
        if let Err(e) = inner.aggregator.try_set_span_output(span_id, output) {
            Self::contain(inner, "set_span_output", e);
        }
    }

    /// Record a 0.0 to 1.0 score on a span id or session id
    pub fn record_score(&self, target_id: &str, name: &str, value: f64, comment: Option<String>) {
        self.record_score_on_scale(target_id, name, value, ScoreScale::Unit, comment);
    }

    /// Record a score on an explicit scale; returns the stored score
    pub fn record_score_on_scale(
        &self,
        target_id: &str,
        name: &str,
        value: f64,
        scale: ScoreScale,
        comment: Option<String>,
    ) -> Option<Score> {
        let inner = self.live()?;
        match inner
            .aggregator
            .try_record_score(target_id, name, value, scale, comment)
        {
            Ok(score) => Some(score),
            Err(e) => {
                Self::contain(inner, "record_score", e);
                None
            }
        }
    }

    /// Attach the end user and tags to a conversation
    pub fn identify_conversation<I, T>(&self, session_id: &str, user_id: Option<&str>, tags: I)
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let Some(inner) = self.live() else { return };
        let tags = tags.into_iter().map(Into::into).collect();
        if let Err(e) =
            inner
                .aggregator
                .try_identify_conversation(session_id, user_id.map(str::to_string), tags)
        {
            Self::contain(inner, "identify_conversation", e);
        }
    }

    /// Record the classified intent of a conversation
    pub fn record_intent(&self, session_id: &str, intent: &str) {
        let Some(inner) = self.live() else { return };
        if let Err(e) = inner.aggregator.try_record_intent(session_id, intent) {
            Self::contain(inner, "record_intent", e);
        }
    }

    /// Finish a conversation and return its summary
    ///
    /// Repeated calls return the same summary without uploading again.
    /// `None` when disabled or the session was never seen.
    pub fn finish_conversation(&self, session_id: &str) -> Option<Summary> {
        let inner = self.live()?;
        match inner.aggregator.try_finish_conversation(session_id) {
            Ok(summary) => Some(summary),
            Err(e) => {
                Self::contain(inner, "finish_conversation", e);
                None
            }
        }
    }

    /// Drop a live conversation without summarizing or uploading it
    pub fn reset_conversation(&self, session_id: &str) {
        let Some(inner) = self.live() else { return };
        if let Err(e) = inner.aggregator.try_reset_conversation(session_id) {
            Self::contain(inner, "reset_conversation", e);
        }
    }

    /// Provisional summary of a live conversation
    pub fn session_snapshot(&self, session_id: &str) -> Option<Summary> {
        self.live()?.aggregator.session_snapshot(session_id)
    }

    /// Cached summary of a finished conversation
    pub fn summary(&self, session_id: &str) -> Option<Summary> {
        self.live()?.aggregator.summary(session_id)
    }

    pub fn finished_summaries(&self) -> Vec<Summary> {
        self.live()
            .map(|inner| inner.aggregator.finished_summaries())
            .unwrap_or_default()
    }

    /// Open a span that closes itself as orphaned if dropped unfinished
    pub fn span(&self, session_id: &str, name: &str) -> SpanGuard {
        self.span_with(session_id, name, None, Metadata::new())
    }

    pub fn span_with(
        &self,
        session_id: &str,
        name: &str,
        parent_id: Option<SpanId>,
        metadata: Metadata,
    ) -> SpanGuard {
        let id = self.start_span(session_id, name, parent_id, metadata);
        SpanGuard::new(self.clone(), session_id, id)
    }

    /// Guarded generation span for one call to `model`
    pub fn generation(
        &self,
        session_id: &str,
        name: &str,
        parent_id: Option<SpanId>,
        model: &str,
    ) -> SpanGuard {
        let id = self.start_generation(session_id, name, parent_id, model, Metadata::new());
        SpanGuard::new(self.clone(), session_id, id)
    }

    /// Process-wide conversation metrics
    pub fn global_metrics(&self) -> GlobalMetrics {
        self.inner
            .as_deref()
            .map(|inner| inner.counters.global_metrics())
            .unwrap_or_default()
    }

    /// Pipeline counters
    pub fn stats(&self) -> CollectorStats {
        self.inner
            .as_deref()
            .map(|inner| inner.counters.stats(inner.aggregator.active_sessions()))
            .unwrap_or_default()
    }

    /// Transmit buffered records now; returns how many were delivered
    pub async fn flush(&self) -> usize {
        match self.live() {
            Some(inner) => inner.uploader.flush().await,
            None => 0,
        }
    }

    /// Finish open sessions, drain the buffer and stop background tasks
    ///
    /// Bounded by `shutdown_timeout`. Only the first call does anything; the
    /// collector is a no-op afterwards.
    pub async fn shutdown(&self) -> ShutdownReport {
        let Some(inner) = self.inner.as_deref() else {
            return ShutdownReport {
                drained: true,
                dropped: 0,
            };
        };
        if inner.shut_down.swap(true, Ordering::AcqRel) {
            return ShutdownReport {
                drained: true,
                dropped: 0,
            };
        }

        inner.cancel.cancel();
        if let Some(handle) = inner.sweeper.lock().take() {
            handle.abort();
        }

        let finished = inner.aggregator.finish_all();
        if finished > 0 {
            info!(sessions = finished, "Finished open sessions at shutdown");
        }

        let report = inner.uploader.shutdown(inner.config.shutdown_timeout).await;
        let stats = inner.counters.stats(0);
        info!(
            drained = report.drained,
            dropped = report.dropped,
            records_sent = stats.records_sent,
            batches_dropped = stats.batches_dropped,
            "Metrics collector shut down"
        );
        report
    }
}

fn spawn_sweeper(
    aggregator: Arc<SessionAggregator>,
    period: std::time::Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    aggregator.sweep();
                }
            }
        }
        debug!("Idle session sweeper stopped");
    })
}
