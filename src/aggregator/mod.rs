//! Session aggregator
//!
//! Keeps the registry of live conversations and computes their rollups. Each
//! session sits behind its own lock inside a sharded map, so recording into
//! one conversation never waits on another. Span and score recording live in
//! [`spans`] and [`scores`]; this module covers the session lifecycle:
//!
//! - sessions are created lazily on first use (or eagerly through
//!   [`SessionAggregator::try_start_conversation`])
//! - [`SessionAggregator::try_finish_conversation`] force-closes open spans,
//!   computes the [`Summary`], hands every record to the sink exactly once and
//!   caches the summary for repeated calls
//! - [`SessionAggregator::sweep`] finishes sessions idle past the threshold
//!   and evicts cached summaries past their retention
//!
//! Lock order: a session lock is never held while the session map is
//! modified. The span index is written under the owning session's lock so a
//! concurrent finish always sees every span it has to unregister.

mod scores;
mod spans;
mod state;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::collector::stats::{add, incr, Counters};
use crate::error::MetricsError;
use crate::record::{Envelope, Metadata, SpanId, Summary};
use crate::uploader::RecordSink;
use crate::Result;

use state::SessionState;

/// Aggregator settings
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub idle_timeout: Duration,
    pub summary_retention: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30 * 60),
            summary_retention: Duration::from_secs(10 * 60),
        }
    }
}

impl From<&crate::config::MetricsConfig> for AggregatorConfig {
    fn from(config: &crate::config::MetricsConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout,
            summary_retention: config.summary_retention,
        }
    }
}

/// What a sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Idle sessions finished
    pub finished: usize,
    /// Cached summaries evicted
    pub evicted: usize,
}

#[derive(Debug)]
struct FinishedEntry {
    summary: Summary,
    finished_at: Instant,
}

type SessionHandle = Arc<Mutex<SessionState>>;

/// Registry of live sessions plus the cache of finished summaries
#[derive(Debug)]
pub struct SessionAggregator {
    config: AggregatorConfig,
    sessions: DashMap<String, SessionHandle>,
    /// Span id to owning session, for every span of a live session
    span_index: DashMap<SpanId, String>,
    finished: DashMap<String, FinishedEntry>,
    sink: Arc<dyn RecordSink>,
    counters: Arc<Counters>,
}

impl SessionAggregator {
    pub fn new(config: AggregatorConfig, sink: Arc<dyn RecordSink>, counters: Arc<Counters>) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
            span_index: DashMap::new(),
            finished: DashMap::new(),
            sink,
            counters,
        }
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    /// Number of live sessions
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Ids of every live session
    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Live session handle, creating the session if it is unseen
    fn session_or_create(&self, session_id: &str) -> Result<SessionHandle> {
        if session_id.trim().is_empty() {
            return Err(MetricsError::invalid_session(session_id));
        }
        if self.finished.contains_key(session_id) {
            return Err(MetricsError::invalid_session(session_id));
        }

        let mut created = false;
        let handle = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                created = true;
                Arc::new(Mutex::new(SessionState::new(session_id)))
            })
            .value()
            .clone();

        if created {
            // a finish may have completed between the check above and the insert
            if self.finished.contains_key(session_id) {
                self.sessions
                    .remove_if(session_id, |_, current| Arc::ptr_eq(current, &handle));
                self.retire(&handle);
                return Err(MetricsError::invalid_session(session_id));
            }
            incr(&self.counters.sessions_started);
            debug!(session_id, "Session opened");
        }
        Ok(handle)
    }

    /// Mark a handle unusable and unregister its spans; returns the span count
    fn retire(&self, handle: &SessionHandle) -> usize {
        let mut state = handle.lock();
        if state.is_live() {
            state.discarded = true;
        }
        let span_ids: Vec<SpanId> = state
            .open
            .keys()
            .copied()
            .chain(state.closed.iter().map(|s| s.id))
            .collect();
        drop(state);

        for id in &span_ids {
            self.span_index.remove(id);
        }
        span_ids.len()
    }

    fn session(&self, session_id: &str) -> Option<SessionHandle> {
        self.sessions.get(session_id).map(|e| e.value().clone())
    }

    /// Session owning `span_id`
    fn session_for_span(&self, span_id: &SpanId) -> Option<(String, SessionHandle)> {
        let session_id = self.span_index.get(span_id)?.value().clone();
        let handle = self.session(&session_id)?;
        Some((session_id, handle))
    }

    /// Open a session eagerly, merging `metadata` into the session metadata
    pub fn try_start_conversation(&self, session_id: &str, metadata: Metadata) -> Result<()> {
        let handle = self.session_or_create(session_id)?;
        let mut state = handle.lock();
        if !state.is_live() {
            return Err(MetricsError::invalid_session(session_id));
        }
        state.metadata.extend(metadata);
        state.touch();
        Ok(())
    }

    /// Attach the end user and tags to a session
    ///
    /// A `None` user keeps the current one; tags are added once each.
    pub fn try_identify_conversation(
        &self,
        session_id: &str,
        user_id: Option<String>,
        tags: Vec<String>,
    ) -> Result<()> {
        let handle = self.session_or_create(session_id)?;
        let mut state = handle.lock();
        if !state.is_live() {
            return Err(MetricsError::invalid_session(session_id));
        }
        state.identify(user_id, tags);
        Ok(())
    }

    /// Append an intent to the session and to the process-wide distribution
    pub fn try_record_intent(&self, session_id: &str, intent: &str) -> Result<()> {
        let handle = self.session_or_create(session_id)?;
        let mut state = handle.lock();
        if !state.is_live() {
            return Err(MetricsError::invalid_session(session_id));
        }
        state.intents.push(intent.to_string());
        state.touch();
        drop(state);

        self.counters.record_intent(intent);
        debug!(session_id, intent, "Intent recorded");
        Ok(())
    }

    /// Finish a session and return its summary
    ///
    /// The first call force-closes open spans, computes the summary and hands
    /// the session's records to the sink. Later calls return the cached
    /// summary and send nothing.
    pub fn try_finish_conversation(&self, session_id: &str) -> Result<Summary> {
        self.finish(session_id, false).map(|(summary, _)| summary)
    }

    /// Cached summary for `session_id`, unregistering any session that was
    /// opened under the finished id
    fn cached_summary(&self, session_id: &str) -> Option<Summary> {
        let summary = self.summary(session_id)?;
        if let Some((_, stale)) = self.sessions.remove(session_id) {
            let spans = self.retire(&stale);
            debug!(session_id, spans, "Dropped session reopened under a finished id");
        }
        Some(summary)
    }

    /// Returns the summary and whether this call produced it
    fn finish(&self, session_id: &str, collected: bool) -> Result<(Summary, bool)> {
        if let Some(summary) = self.cached_summary(session_id) {
            return Ok((summary, false));
        }

        let Some(handle) = self.session(session_id) else {
            // lost a race with a concurrent finish that already removed it
            return self
                .summary(session_id)
                .map(|summary| (summary, false))
                .ok_or_else(|| MetricsError::invalid_session(session_id));
        };

        let mut state = handle.lock();
        if let Some(summary) = &state.finished {
            return Ok((summary.clone(), false));
        }
        if state.discarded {
            return Err(MetricsError::invalid_session(session_id));
        }

        let orphaned = state.force_close_open();
        if !orphaned.is_empty() {
            add(&self.counters.spans_orphaned, orphaned.len() as u64);
            add(&self.counters.spans_closed, orphaned.len() as u64);
            for span in state.closed.iter().filter(|s| orphaned.contains(&s.id)) {
                self.counters.record_execution(&span.name, false);
            }
            warn!(
                session_id,
                orphaned = orphaned.len(),
                "Force-closed open spans at session finish"
            );
        }

        let summary = state.summarize(Some(Utc::now()));
        state.finished = Some(summary.clone());

        let span_ids: Vec<SpanId> = state.closed.iter().map(|s| s.id).collect();
        let mut records = state.take_records();
        records.push(Envelope::from(summary.clone()));
        drop(state);

        // cache before unregistering so lookups never miss
        self.finished.insert(
            session_id.to_string(),
            FinishedEntry {
                summary: summary.clone(),
                finished_at: Instant::now(),
            },
        );
        self.sessions
            .remove_if(session_id, |_, current| Arc::ptr_eq(current, &handle));
        for id in &span_ids {
            self.span_index.remove(id);
        }

        incr(&self.counters.sessions_finished);
        if collected {
            incr(&self.counters.sessions_collected);
        }
        self.counters
            .record_conversation(summary.total_tokens, summary.total_cost_usd);

        info!(
            session_id,
            total_spans = summary.total_spans,
            total_tokens = summary.total_tokens,
            total_errors = summary.total_errors,
            duration_ms = summary.duration_ms,
            collected,
            "Session finished"
        );

        self.sink.push_records(records);
        Ok((summary, true))
    }

    /// Discard a live session without a summary or upload
    pub fn try_reset_conversation(&self, session_id: &str) -> Result<()> {
        self.finished.remove(session_id);

        let Some((_, handle)) = self.sessions.remove(session_id) else {
            return Err(MetricsError::invalid_session(session_id));
        };

        let spans = self.retire(&handle);
        incr(&self.counters.sessions_reset);
        info!(session_id, spans, "Session reset");
        Ok(())
    }

    /// Provisional summary of a live session; the session stays open
    pub fn session_snapshot(&self, session_id: &str) -> Option<Summary> {
        let handle = self.session(session_id)?;
        let state = handle.lock();
        if state.discarded {
            return None;
        }
        Some(
            state
                .finished
                .clone()
                .unwrap_or_else(|| state.summarize(None)),
        )
    }

    /// Cached summary of a finished session
    pub fn summary(&self, session_id: &str) -> Option<Summary> {
        self.finished.get(session_id).map(|e| e.summary.clone())
    }

    /// Every cached summary, oldest first
    pub fn finished_summaries(&self) -> Vec<Summary> {
        let mut entries: Vec<(Instant, Summary)> = self
            .finished
            .iter()
            .map(|e| (e.finished_at, e.summary.clone()))
            .collect();
        entries.sort_by_key(|(at, _)| *at);
        entries.into_iter().map(|(_, s)| s).collect()
    }

    /// Finish idle sessions and evict expired summaries
    pub fn sweep(&self) -> SweepReport {
        let now = Instant::now();

        // snapshot the handles first; no session lock is taken under the map guard
        let handles: Vec<(String, SessionHandle)> = self
            .sessions
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let idle: Vec<String> = handles
            .into_iter()
            .filter(|(_, handle)| {
                let state = handle.lock();
                state.is_live() && state.idle_for(now) >= self.config.idle_timeout
            })
            .map(|(id, _)| id)
            .collect();

        let mut report = SweepReport::default();
        for session_id in idle {
            match self.finish(&session_id, true) {
                Ok((_, true)) => report.finished += 1,
                Ok((_, false)) => {}
                Err(e) => debug!(session_id = %session_id, error = %e, "Idle sweep skipped session"),
            }
        }

        let retention = self.config.summary_retention;
        let before = self.finished.len();
        self.finished
            .retain(|_, entry| now.saturating_duration_since(entry.finished_at) < retention);
        report.evicted = before.saturating_sub(self.finished.len());

        if report.finished > 0 || report.evicted > 0 {
            info!(
                finished = report.finished,
                evicted = report.evicted,
                "Idle session sweep"
            );
        }
        report
    }

    /// Finish every live session; used at teardown
    pub fn finish_all(&self) -> usize {
        let ids = self.session_ids();
        ids.iter()
            .filter(|id| matches!(self.finish(id, false), Ok((_, true))))
            .count()
    }
}
