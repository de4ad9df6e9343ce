//! Per-session state held behind the session lock

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::time::Instant;

use crate::record::{
    Envelope, LatencyStats, Metadata, MetadataValue, Record, Score, Span, SpanId, SpanStatus,
    Summary,
};

/// A span that has not been closed yet
#[derive(Debug)]
pub(crate) struct OpenSpan {
    pub span: Span,
    /// Monotonic start, used for the closed duration
    pub started: Instant,
}

/// Position of a closed record in delivery order
#[derive(Debug, Clone, Copy)]
enum Slot {
    Span(usize),
    Score(usize),
}

#[derive(Debug, Clone, Copy, Default)]
struct DurationSum {
    count: u64,
    total_ms: f64,
}

impl DurationSum {
    fn add(&mut self, ms: f64) {
        self.count += 1;
        self.total_ms += ms;
    }

    fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_ms / self.count as f64
        }
    }
}

/// Everything the aggregator knows about one conversation
#[derive(Debug)]
pub(crate) struct SessionState {
    pub id: String,
    pub started_at: DateTime<Utc>,
    started: Instant,
    pub last_touched: Instant,
    pub metadata: Metadata,
    pub open: HashMap<SpanId, OpenSpan>,
    pub closed: Vec<Span>,
    pub scores: Vec<Score>,
    pub intents: Vec<String>,
    pub user_id: Option<String>,
    pub tags: Vec<String>,
    order: Vec<Slot>,

    // running totals, updated once per close
    total_tokens: u64,
    total_cost_usd: f64,
    total_errors: u64,
    orphaned: u64,
    latencies: HashMap<String, Vec<f64>>,
    llm: DurationSum,
    nodes: DurationSum,

    /// Set once by finish; later calls return this snapshot
    pub finished: Option<Summary>,
    /// Set by reset; the state is dead and must not be touched
    pub discarded: bool,
}

impl SessionState {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            started_at: Utc::now(),
            started: now,
            last_touched: now,
            metadata: Metadata::new(),
            open: HashMap::new(),
            closed: Vec::new(),
            scores: Vec::new(),
            intents: Vec::new(),
            user_id: None,
            tags: Vec::new(),
            order: Vec::new(),
            total_tokens: 0,
            total_cost_usd: 0.0,
            total_errors: 0,
            orphaned: 0,
            latencies: HashMap::new(),
            llm: DurationSum::default(),
            nodes: DurationSum::default(),
            finished: None,
            discarded: false,
        }
    }

    /// Accepts new spans and scores
    pub fn is_live(&self) -> bool {
        self.finished.is_none() && !self.discarded
    }

    pub fn touch(&mut self) {
        self.last_touched = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.last_touched)
    }

    pub fn open_span(&mut self, span: Span) {
        self.open.insert(
            span.id,
            OpenSpan {
                span,
                started: Instant::now(),
            },
        );
        self.touch();
    }

    /// Close an open span and fold it into the running totals
    ///
    /// The end timestamp is derived from the monotonic clock so it can never
    /// precede the start timestamp.
    pub fn close_span(&mut self, open: OpenSpan, status: SpanStatus) -> &Span {
        let OpenSpan { mut span, started } = open;

        let elapsed = chrono::Duration::from_std(started.elapsed()).unwrap_or_default();
        span.end_time = Some(span.start_time + elapsed);
        span.status = match status {
            SpanStatus::Pending => SpanStatus::Ok,
            other => other,
        };

        self.total_tokens = self.total_tokens.saturating_add(span.token_count());
        self.total_cost_usd += span.cost_usd();
        match span.status {
            SpanStatus::Error => self.total_errors += 1,
            SpanStatus::Orphaned => self.orphaned += 1,
            _ => {}
        }
        if let Some(ms) = span.duration_ms() {
            self.latencies.entry(span.name.clone()).or_default().push(ms);
            if span.is_generation() {
                self.llm.add(ms);
            } else {
                self.nodes.add(ms);
            }
        }

        self.order.push(Slot::Span(self.closed.len()));
        self.closed.push(span);
        self.touch();

        let last = self.closed.len() - 1;
        &self.closed[last]
    }

    /// Look up a closed span by id
    pub fn closed_span(&self, id: &SpanId) -> Option<&Span> {
        self.closed.iter().rev().find(|s| s.id == *id)
    }

    pub fn add_score(&mut self, score: Score) {
        self.order.push(Slot::Score(self.scores.len()));
        self.scores.push(score);
        self.touch();
    }

    /// Children of `id` that are still open
    pub fn open_children(&self, id: &SpanId) -> usize {
        self.open
            .values()
            .filter(|o| o.span.parent_id.as_ref() == Some(id))
            .count()
    }

    /// Close every open span with status orphaned, children before parents
    pub fn force_close_open(&mut self) -> Vec<SpanId> {
        let mut pending: Vec<OpenSpan> = self.open.drain().map(|(_, o)| o).collect();
        // later starts first, so nested spans close before their parents
        pending.sort_by(|a, b| b.started.cmp(&a.started));

        pending
            .into_iter()
            .map(|open| self.close_span(open, SpanStatus::Orphaned).id)
            .collect()
    }

    /// Set the end user and add tags not seen before
    pub fn identify(&mut self, user_id: Option<String>, tags: Vec<String>) {
        if user_id.is_some() {
            self.user_id = user_id;
        }
        for tag in tags {
            if !self.tags.contains(&tag) {
                self.tags.push(tag);
            }
        }
        self.touch();
    }

    /// Rollup of the session as it stands
    pub fn summarize(&self, finished_at: Option<DateTime<Utc>>) -> Summary {
        let latency_by_kind: BTreeMap<String, LatencyStats> = self
            .latencies
            .iter()
            .filter_map(|(kind, samples)| {
                LatencyStats::from_samples(samples).map(|stats| (kind.clone(), stats))
            })
            .collect();

        Summary {
            session_id: self.id.clone(),
            started_at: self.started_at,
            finished_at,
            duration_ms: self.started.elapsed().as_millis() as u64,
            total_spans: self.closed.len() as u64,
            total_errors: self.total_errors,
            orphaned_spans: self.orphaned,
            total_tokens: self.total_tokens,
            total_cost_usd: self.total_cost_usd,
            total_llm_calls: self.llm.count,
            avg_llm_duration_ms: self.llm.mean(),
            avg_node_duration_ms: self.nodes.mean(),
            latency_by_kind,
            scores: self.scores.clone(),
            intents: self.intents.clone(),
            user_id: self.user_id.clone().or_else(|| {
                self.metadata
                    .get("user_id")
                    .and_then(MetadataValue::as_str)
                    .map(str::to_string)
            }),
            tags: self.tags.clone(),
            metadata: self.metadata.clone(),
        }
    }

    /// Move closed spans and scores out in the order they were closed
    pub fn take_records(&mut self) -> Vec<Envelope> {
        let mut spans: Vec<Option<Span>> = self.closed.drain(..).map(Some).collect();
        let mut scores: Vec<Option<Score>> = self.scores.drain(..).map(Some).collect();

        self.order
            .drain(..)
            .filter_map(|slot| match slot {
                Slot::Span(i) => spans.get_mut(i).and_then(Option::take).map(Record::Span),
                Slot::Score(i) => scores.get_mut(i).and_then(Option::take).map(Record::Score),
            })
            .map(Envelope::new)
            .collect()
    }
}
