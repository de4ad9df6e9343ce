//! Collector statistics and process-wide conversation metrics
//!
//! Every contained telemetry error ends up here as a counter increment. The
//! counters are plain atomics and sharded maps, so updating them never
//! serializes unrelated sessions.
//!
//! Two read-only views are exposed:
//!
//! - [`CollectorStats`] describes the pipeline itself (spans, scores,
//!   sessions, buffered and dropped records)
//! - [`GlobalMetrics`] describes the conversations that went through it
//!   (token and cost totals, intent distribution, per-kind execution counts)

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by the aggregator and the uploader
#[derive(Debug, Default)]
pub struct Counters {
    // Spans
    pub(crate) spans_started: AtomicU64,
    pub(crate) spans_closed: AtomicU64,
    pub(crate) spans_orphaned: AtomicU64,
    pub(crate) span_events: AtomicU64,

    // Scores
    pub(crate) scores_recorded: AtomicU64,
    pub(crate) scores_clamped: AtomicU64,

    // Sessions
    pub(crate) sessions_started: AtomicU64,
    pub(crate) sessions_finished: AtomicU64,
    pub(crate) sessions_collected: AtomicU64,
    pub(crate) sessions_reset: AtomicU64,

    // Delivery
    pub(crate) records_enqueued: AtomicU64,
    pub(crate) records_sent: AtomicU64,
    pub(crate) batches_sent: AtomicU64,
    pub(crate) batches_dropped: AtomicU64,
    pub(crate) transmission_retries: AtomicU64,
    pub(crate) records_dropped_overflow: AtomicU64,
    pub(crate) records_dropped_transmission: AtomicU64,
    pub(crate) records_dropped_shutdown: AtomicU64,

    /// Telemetry errors swallowed by the facade
    pub(crate) contained_errors: AtomicU64,

    // Conversation metrics
    total_tokens: AtomicU64,
    total_cost_bits: AtomicU64,
    intents: DashMap<String, u64>,
    kind_executions: DashMap<String, u64>,
    kind_errors: DashMap<String, u64>,
}

/// Increment a counter by one
pub(crate) fn incr(counter: &AtomicU64) -> u64 {
    counter.fetch_add(1, Ordering::Relaxed) + 1
}

/// Increment a counter by `n`
pub(crate) fn add(counter: &AtomicU64, n: u64) -> u64 {
    counter.fetch_add(n, Ordering::Relaxed) + n
}

fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    /// A span of `kind` was closed
    pub(crate) fn record_execution(&self, kind: &str, failed: bool) {
        *self.kind_executions.entry(kind.to_string()).or_insert(0) += 1;
        if failed {
            *self.kind_errors.entry(kind.to_string()).or_insert(0) += 1;
        }
    }

    pub(crate) fn record_intent(&self, intent: &str) {
        *self.intents.entry(intent.to_string()).or_insert(0) += 1;
    }

    /// A conversation finished with these totals
    pub(crate) fn record_conversation(&self, tokens: u64, cost_usd: f64) {
        add(&self.total_tokens, tokens);
        if cost_usd > 0.0 && cost_usd.is_finite() {
            // f64 stored as bits; fetch_update retries on contention
            let _ = self
                .total_cost_bits
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                    Some((f64::from_bits(bits) + cost_usd).to_bits())
                });
        }
    }

    pub fn total_cost_usd(&self) -> f64 {
        f64::from_bits(self.total_cost_bits.load(Ordering::Relaxed))
    }

    pub fn records_dropped(&self) -> u64 {
        read(&self.records_dropped_overflow)
            + read(&self.records_dropped_transmission)
            + read(&self.records_dropped_shutdown)
    }

    /// Snapshot of the pipeline counters
    pub fn stats(&self, sessions_active: usize) -> CollectorStats {
        CollectorStats {
            spans_started: read(&self.spans_started),
            spans_closed: read(&self.spans_closed),
            spans_orphaned: read(&self.spans_orphaned),
            span_events: read(&self.span_events),
            scores_recorded: read(&self.scores_recorded),
            scores_clamped: read(&self.scores_clamped),
            sessions_active: sessions_active as u64,
            sessions_started: read(&self.sessions_started),
            sessions_finished: read(&self.sessions_finished),
            sessions_collected: read(&self.sessions_collected),
            sessions_reset: read(&self.sessions_reset),
            records_enqueued: read(&self.records_enqueued),
            records_sent: read(&self.records_sent),
            batches_sent: read(&self.batches_sent),
            batches_dropped: read(&self.batches_dropped),
            transmission_retries: read(&self.transmission_retries),
            records_dropped_overflow: read(&self.records_dropped_overflow),
            records_dropped_transmission: read(&self.records_dropped_transmission),
            records_dropped_shutdown: read(&self.records_dropped_shutdown),
            contained_errors: read(&self.contained_errors),
        }
    }

    /// Snapshot of the conversation metrics
    pub fn global_metrics(&self) -> GlobalMetrics {
        fn collect(map: &DashMap<String, u64>) -> BTreeMap<String, u64> {
            map.iter()
                .map(|entry| (entry.key().clone(), *entry.value()))
                .collect()
        }

        GlobalMetrics {
            total_conversations: read(&self.sessions_finished),
            total_tokens: read(&self.total_tokens),
            total_cost_usd: self.total_cost_usd(),
            intent_distribution: collect(&self.intents),
            execution_count: collect(&self.kind_executions),
            error_count: collect(&self.kind_errors),
        }
    }
}

/// Point-in-time view of the collector pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorStats {
    pub spans_started: u64,
    pub spans_closed: u64,
    /// Spans force-closed at finish, sweep or guard drop
    pub spans_orphaned: u64,
    pub span_events: u64,
    pub scores_recorded: u64,
    /// Scores stored with the clamped flag set
    pub scores_clamped: u64,
    pub sessions_active: u64,
    pub sessions_started: u64,
    pub sessions_finished: u64,
    /// Sessions finished by the idle sweep
    pub sessions_collected: u64,
    pub sessions_reset: u64,
    pub records_enqueued: u64,
    pub records_sent: u64,
    pub batches_sent: u64,
    pub batches_dropped: u64,
    pub transmission_retries: u64,
    pub records_dropped_overflow: u64,
    pub records_dropped_transmission: u64,
    pub records_dropped_shutdown: u64,
    pub contained_errors: u64,
}

impl CollectorStats {
    pub fn records_dropped(&self) -> u64 {
        self.records_dropped_overflow
            + self.records_dropped_transmission
            + self.records_dropped_shutdown
    }
}

/// Process-wide conversation metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalMetrics {
    pub total_conversations: u64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub intent_distribution: BTreeMap<String, u64>,
    /// Closed spans per span kind
    pub execution_count: BTreeMap<String, u64>,
    /// Closed spans with status error per span kind
    pub error_count: BTreeMap<String, u64>,
}
