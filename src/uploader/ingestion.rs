//! Ingestion API serialization
//!
//! Maps buffered envelopes onto the backend's batch ingestion protocol:
//!
//! ```json
//! { "batch": [ { "id": "...", "type": "span-create", "timestamp": "...", "body": { ... } } ] }
//! ```
//!
//! Spans become `span-create` events, or `generation-create` for model calls,
//! each followed by one `event-create` per span event. Scores become
//! `score-create` and session summaries become `trace-create`. The trace id
//! of every record is its session id.
//!
//! Span events expand one record into several ingestion events, so a batch of
//! `flush_at` records can carry more than `flush_at` events.
//! [`IngestionBatch::split`] caps the events per request. Event ids are
//! derived from the record ids, so resending a batch after a partial failure
//! produces the same ids.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::record::{
    Envelope, EventLevel, Metadata, Record, Score, ScoreTarget, Span, SpanEvent, SpanStatus,
    Summary,
};

/// Request body of `POST /api/public/ingestion`
#[derive(Debug, Serialize)]
pub struct IngestionBatch {
    pub batch: Vec<IngestionEvent>,
}

/// One event of an ingestion batch
#[derive(Debug, Serialize)]
pub struct IngestionEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: &'static str,
    pub timestamp: DateTime<Utc>,
    pub body: IngestionBody,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum IngestionBody {
    Span(SpanBody),
    Generation(GenerationBody),
    Event(EventBody),
    Score(ScoreBody),
    Trace(TraceBody),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpanBody {
    pub id: String,
    pub trace_id: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_observation_id: Option<String>,
    pub name: String,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub metadata: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    pub level: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
}

/// A span with model and usage fields
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationBody {
    #[serde(flatten)]
    pub span: SpanBody,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub usage: Usage,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input: u64,
    pub output: u64,
    pub total: u64,
    pub unit: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBody {
    pub id: String,
    pub trace_id: String,
    pub session_id: String,
    pub parent_observation_id: String,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub level: &'static str,
    pub metadata: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreBody {
    pub id: String,
    pub trace_id: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observation_id: Option<String>,
    pub name: String,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub metadata: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceBody {
    pub id: String,
    pub name: &'static str,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub metadata: Value,
}

impl IngestionBatch {
    /// Convert envelopes preserving their order
    pub fn from_envelopes(envelopes: &[Envelope]) -> Result<Self, serde_json::Error> {
        let mut batch = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            match &envelope.record {
                Record::Span(span) => {
                    batch.push(span_event(envelope, span)?);
                    for (n, event) in span.events.iter().enumerate() {
                        batch.push(child_event(envelope, span, n, event)?);
                    }
                }
                Record::Score(score) => batch.push(score_event(envelope, score)),
                Record::Summary(summary) => batch.push(trace_event(envelope, summary)?),
            }
        }
        Ok(Self { batch })
    }

    /// Split into batches of at most `max_events` events, keeping order
    pub fn split(self, max_events: usize) -> Vec<IngestionBatch> {
        let max_events = max_events.max(1);
        if self.batch.len() <= max_events {
            return vec![self];
        }

        let mut chunks = Vec::with_capacity(self.batch.len().div_ceil(max_events));
        let mut events = self.batch.into_iter().peekable();
        while events.peek().is_some() {
            chunks.push(IngestionBatch {
                batch: events.by_ref().take(max_events).collect(),
            });
        }
        chunks
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }
}

fn metadata_json(metadata: &Metadata) -> Result<Value, serde_json::Error> {
    serde_json::to_value(metadata)
}

fn span_level(status: SpanStatus) -> &'static str {
    match status {
        SpanStatus::Error => "ERROR",
        SpanStatus::Orphaned => "WARNING",
        SpanStatus::Pending | SpanStatus::Ok => "DEFAULT",
    }
}

fn event_level(level: EventLevel) -> &'static str {
    match level {
        EventLevel::Debug => "DEBUG",
        EventLevel::Default => "DEFAULT",
        EventLevel::Warning => "WARNING",
        EventLevel::Error => "ERROR",
    }
}

fn span_event(envelope: &Envelope, span: &Span) -> Result<IngestionEvent, serde_json::Error> {
    let mut metadata = metadata_json(&span.metadata)?;
    if let Value::Object(map) = &mut metadata {
        map.insert("status".to_string(), Value::String(span.status.to_string()));
        if let Some(ms) = span.duration_ms() {
            map.insert("duration_ms".to_string(), serde_json::json!(ms));
        }
    }

    let status_message = match span.status {
        SpanStatus::Error => Some(span.error.clone().unwrap_or_else(|| "error".to_string())),
        SpanStatus::Orphaned => Some("span was not ended by its owner".to_string()),
        _ => None,
    };

    let body = SpanBody {
        id: span.id.to_string(),
        trace_id: span.session_id.clone(),
        session_id: span.session_id.clone(),
        parent_observation_id: span.parent_id.map(|p| p.to_string()),
        name: span.name.clone(),
        start_time: span.start_time,
        end_time: span.end_time,
        metadata,
        input: span.input.clone(),
        output: span.output.clone(),
        level: span_level(span.status),
        status_message,
    };

    let (event_type, body) = if span.is_generation() {
        let usage = span.usage();
        let cost = span.cost_usd();
        let generation = GenerationBody {
            span: body,
            model: span.model_name().map(str::to_string),
            usage: Usage {
                input: usage.input,
                output: usage.output,
                total: usage.total,
                unit: "TOKENS",
                total_cost: (cost > 0.0).then_some(cost),
            },
        };
        ("generation-create", IngestionBody::Generation(generation))
    } else {
        ("span-create", IngestionBody::Span(body))
    };

    Ok(IngestionEvent {
        id: envelope.id.to_string(),
        event_type,
        timestamp: envelope.timestamp,
        body,
    })
}

fn child_event(
    envelope: &Envelope,
    span: &Span,
    n: usize,
    event: &SpanEvent,
) -> Result<IngestionEvent, serde_json::Error> {
    Ok(IngestionEvent {
        id: format!("{}-{}", envelope.id, n + 1),
        event_type: "event-create",
        timestamp: event.timestamp,
        body: IngestionBody::Event(EventBody {
            id: format!("{}-{}", span.id, n + 1),
            trace_id: span.session_id.clone(),
            session_id: span.session_id.clone(),
            parent_observation_id: span.id.to_string(),
            name: event.name.clone(),
            start_time: event.timestamp,
            level: event_level(event.level),
            metadata: metadata_json(&event.metadata)?,
        }),
    })
}

fn score_event(envelope: &Envelope, score: &Score) -> IngestionEvent {
    let observation_id = match &score.target {
        ScoreTarget::Span(id) => Some(id.to_string()),
        ScoreTarget::Session(_) => None,
    };

    IngestionEvent {
        id: envelope.id.to_string(),
        event_type: "score-create",
        timestamp: envelope.timestamp,
        body: IngestionBody::Score(ScoreBody {
            id: score.id.to_string(),
            trace_id: score.session_id.clone(),
            session_id: score.session_id.clone(),
            observation_id,
            name: score.name.clone(),
            value: score.value,
            comment: score.comment.clone(),
            metadata: serde_json::json!({ "clamped": score.clamped }),
        }),
    }
}

fn trace_event(envelope: &Envelope, summary: &Summary) -> Result<IngestionEvent, serde_json::Error> {
    let mut metadata = serde_json::to_value(summary)?;
    if let Value::Object(map) = &mut metadata {
        // scores travel as their own score-create events
        map.remove("scores");
        map.remove("tags");
        map.remove("user_id");
    }

    Ok(IngestionEvent {
        id: envelope.id.to_string(),
        event_type: "trace-create",
        timestamp: envelope.timestamp,
        body: IngestionBody::Trace(TraceBody {
            id: summary.session_id.clone(),
            name: "conversation",
            session_id: summary.session_id.clone(),
            timestamp: summary.started_at,
            user_id: summary.user_id.clone(),
            tags: summary.tags.clone(),
            metadata,
        }),
    })
}
