//! Span records: timed units of work inside a conversation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Open mapping from metadata key to a small closed set of value kinds
pub type Metadata = BTreeMap<String, MetadataValue>;

/// Handle to a span
///
/// Agent code only ever holds this id; the span itself lives inside its
/// session until it is closed and handed to the uploader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpanId(Uuid);

impl SpanId {
    /// Sentinel returned when the collector is disabled or the call failed
    pub const NOOP: SpanId = SpanId(Uuid::nil());

    pub fn new() -> Self {
        SpanId(Uuid::new_v4())
    }

    pub fn is_noop(&self) -> bool {
        self.0.is_nil()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Parse a textual span id, as produced by `Display`
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s.trim()).ok().map(SpanId)
    }
}

impl Default for SpanId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for SpanId {
    fn from(id: Uuid) -> Self {
        SpanId(id)
    }
}

/// Status of a span
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    /// Still open
    #[default]
    Pending,
    /// Completed successfully
    Ok,
    /// Completed with an error
    Error,
    /// Force-closed because its owner never ended it
    Orphaned,
}

impl SpanStatus {
    pub fn is_error(&self) -> bool {
        matches!(self, SpanStatus::Error)
    }
}

impl fmt::Display for SpanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SpanStatus::Pending => "pending",
            SpanStatus::Ok => "ok",
            SpanStatus::Error => "error",
            SpanStatus::Orphaned => "orphaned",
        };
        f.write_str(s)
    }
}

/// What a span measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpanKind {
    /// A graph node or any other unit of agent work
    #[default]
    Span,
    /// One model call; carries a model name and token usage
    Generation,
}

/// Value of a metadata entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl MetadataValue {
    /// Numeric view of the value; strings and booleans are not numbers
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Int(i) => Some(*i as f64),
            MetadataValue::Float(f) => Some(*f),
            MetadataValue::Str(_) | MetadataValue::Bool(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::Bool(b) => write!(f, "{}", b),
            MetadataValue::Int(i) => write!(f, "{}", i),
            MetadataValue::Float(x) => write!(f, "{}", x),
            MetadataValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::Str(s)
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::Str(s.to_string())
    }
}

impl From<bool> for MetadataValue {
    fn from(b: bool) -> Self {
        MetadataValue::Bool(b)
    }
}

impl From<i64> for MetadataValue {
    fn from(i: i64) -> Self {
        MetadataValue::Int(i)
    }
}

impl From<i32> for MetadataValue {
    fn from(i: i32) -> Self {
        MetadataValue::Int(i as i64)
    }
}

impl From<u32> for MetadataValue {
    fn from(i: u32) -> Self {
        MetadataValue::Int(i as i64)
    }
}

impl From<u64> for MetadataValue {
    fn from(i: u64) -> Self {
        MetadataValue::Int(i64::try_from(i).unwrap_or(i64::MAX))
    }
}

impl From<usize> for MetadataValue {
    fn from(i: usize) -> Self {
        MetadataValue::Int(i64::try_from(i).unwrap_or(i64::MAX))
    }
}

impl From<f64> for MetadataValue {
    fn from(f: f64) -> Self {
        MetadataValue::Float(f)
    }
}

/// Build a [`Metadata`] map from key/value pairs
///
/// ```rust
/// use convo_metrics::record::{metadata, MetadataValue};
///
/// let meta = metadata([("model", MetadataValue::from("deepseek-chat")), ("tokens", 12.into())]);
/// assert_eq!(meta.len(), 2);
/// ```
pub fn metadata<I, K, V>(pairs: I) -> Metadata
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<MetadataValue>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Token count carried by a metadata map
///
/// `total_tokens` wins, then `tokens`, then input plus output counts under
/// either naming convention. Negative or non-numeric values count as zero.
pub fn token_count(meta: &Metadata) -> u64 {
    fn count(meta: &Metadata, key: &str) -> Option<u64> {
        meta.get(key).map(|v| match v.as_f64() {
            Some(n) if n.is_finite() && n > 0.0 => n as u64,
            _ => 0,
        })
    }

    if let Some(total) = count(meta, "total_tokens") {
        return total;
    }
    if let Some(tokens) = count(meta, "tokens") {
        return tokens;
    }

    let input = count(meta, "input_tokens")
        .or_else(|| count(meta, "prompt_tokens"))
        .unwrap_or(0);
    let output = count(meta, "output_tokens")
        .or_else(|| count(meta, "completion_tokens"))
        .unwrap_or(0);
    input.saturating_add(output)
}

/// Input, output and total token counts of a model call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub total: u64,
}

impl TokenUsage {
    /// Split usage carried by a metadata map
    ///
    /// `total` follows [`token_count`]; input and output accept either the
    /// `input_tokens`/`output_tokens` or `prompt_tokens`/`completion_tokens`
    /// names.
    pub fn from_metadata(meta: &Metadata) -> Self {
        let count = |keys: [&str; 2]| {
            keys.iter()
                .find_map(|key| meta.get(*key))
                .and_then(MetadataValue::as_f64)
                .filter(|n| n.is_finite() && *n > 0.0)
                .map_or(0, |n| n as u64)
        };
        Self {
            input: count(["input_tokens", "prompt_tokens"]),
            output: count(["output_tokens", "completion_tokens"]),
            total: token_count(meta),
        }
    }
}

/// Cost in USD carried by a metadata map (`cost_usd`, else `cost`)
pub fn cost_usd(meta: &Metadata) -> f64 {
    let value = meta
        .get("cost_usd")
        .or_else(|| meta.get("cost"))
        .and_then(MetadataValue::as_f64);
    match value {
        Some(c) if c.is_finite() && c > 0.0 => c,
        _ => 0.0,
    }
}

/// Severity of a span event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Debug,
    #[default]
    Default,
    Warning,
    Error,
}

/// Timestamped event attached to an open span
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanEvent {
    pub name: String,
    pub level: EventLevel,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: Metadata,
}

/// A timed unit of work within a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub id: SpanId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<SpanId>,
    pub session_id: String,
    /// Kind of work, e.g. `classify_intent` or a graph node name
    pub name: String,
    pub start_time: DateTime<Utc>,
    /// Absent while the span is open
    pub end_time: Option<DateTime<Utc>>,
    pub status: SpanStatus,
    #[serde(default)]
    pub kind: SpanKind,
    /// Model name of a generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    /// Payload the node or model received
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    /// Payload the node or model produced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<SpanEvent>,
}

impl Span {
    /// Open a new span starting now
    pub fn open(
        session_id: impl Into<String>,
        name: impl Into<String>,
        parent_id: Option<SpanId>,
        metadata: Metadata,
    ) -> Self {
        Self {
            id: SpanId::new(),
            parent_id,
            session_id: session_id.into(),
            name: name.into(),
            start_time: Utc::now(),
            end_time: None,
            status: SpanStatus::Pending,
            kind: SpanKind::Span,
            model: None,
            metadata,
            input: None,
            output: None,
            error: None,
            events: Vec::new(),
        }
    }

    /// Open a span for one call to `model`
    pub fn generation(
        session_id: impl Into<String>,
        name: impl Into<String>,
        parent_id: Option<SpanId>,
        model: impl Into<String>,
        metadata: Metadata,
    ) -> Self {
        Self {
            kind: SpanKind::Generation,
            model: Some(model.into()),
            ..Self::open(session_id, name, parent_id, metadata)
        }
    }

    pub fn is_generation(&self) -> bool {
        self.kind == SpanKind::Generation
    }

    /// Model name, falling back to a `model` metadata entry
    pub fn model_name(&self) -> Option<&str> {
        self.model
            .as_deref()
            .or_else(|| self.metadata.get("model").and_then(MetadataValue::as_str))
    }

    pub fn usage(&self) -> TokenUsage {
        TokenUsage::from_metadata(&self.metadata)
    }

    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    /// Wall-clock duration in milliseconds, if closed
    pub fn duration_ms(&self) -> Option<f64> {
        self.end_time
            .map(|end| (end - self.start_time).num_microseconds().unwrap_or(0) as f64 / 1000.0)
    }

    pub fn token_count(&self) -> u64 {
        token_count(&self.metadata)
    }

    pub fn cost_usd(&self) -> f64 {
        cost_usd(&self.metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_id_sentinel() {
        assert!(SpanId::NOOP.is_noop());
        assert!(!SpanId::new().is_noop());
        assert_ne!(SpanId::new(), SpanId::new());

        let id = SpanId::new();
        assert_eq!(SpanId::parse(&id.to_string()), Some(id));
        assert_eq!(SpanId::parse("session-42"), None);
    }

    #[test]
    fn test_token_count_precedence() {
        let meta = metadata([("total_tokens", 50), ("tokens", 7)]);
        assert_eq!(token_count(&meta), 50);

        let meta = metadata([("tokens", 12)]);
        assert_eq!(token_count(&meta), 12);

        let meta = metadata([("prompt_tokens", 100), ("completion_tokens", 40)]);
        assert_eq!(token_count(&meta), 140);

        let meta = metadata([("input_tokens", 10), ("output_tokens", 5)]);
        assert_eq!(token_count(&meta), 15);

        assert_eq!(token_count(&Metadata::new()), 0);
    }

    #[test]
    fn test_token_count_ignores_garbage() {
        let meta = metadata([("tokens", MetadataValue::from(-4))]);
        assert_eq!(token_count(&meta), 0);

        let meta = metadata([("tokens", MetadataValue::from("lots"))]);
        assert_eq!(token_count(&meta), 0);

        let meta = metadata([("tokens", MetadataValue::Float(12.9))]);
        assert_eq!(token_count(&meta), 12);
    }

    #[test]
    fn test_cost_extraction() {
        let meta = metadata([("cost", MetadataValue::from(0.002))]);
        assert_eq!(cost_usd(&meta), 0.002);

        let meta = metadata([
            ("cost_usd", MetadataValue::from(0.5)),
            ("cost", MetadataValue::from(9.0)),
        ]);
        assert_eq!(cost_usd(&meta), 0.5);

        let meta = metadata([("cost", MetadataValue::Float(f64::NAN))]);
        assert_eq!(cost_usd(&meta), 0.0);

        let meta = metadata([("cost", MetadataValue::Float(-1.0))]);
        assert_eq!(cost_usd(&meta), 0.0);
    }

    #[test]
    fn test_metadata_value_serde() {
        let meta = metadata([
            ("model", MetadataValue::from("deepseek-chat")),
            ("tokens", MetadataValue::from(12)),
            ("cost", MetadataValue::from(0.25)),
            ("cached", MetadataValue::from(true)),
        ]);
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["tokens"], serde_json::json!(12));
        assert_eq!(json["cached"], serde_json::json!(true));

        let back: Metadata = serde_json::from_value(json).unwrap();
        assert_eq!(back.get("tokens"), Some(&MetadataValue::Int(12)));
        assert_eq!(back.get("cost"), Some(&MetadataValue::Float(0.25)));
    }

    #[test]
    fn test_token_usage_split() {
        let usage = TokenUsage::from_metadata(&metadata([("input_tokens", 600), ("output_tokens", 120)]));
        assert_eq!(usage, TokenUsage { input: 600, output: 120, total: 720 });

        let usage = TokenUsage::from_metadata(&metadata([
            ("prompt_tokens", 90),
            ("completion_tokens", 10),
            ("total_tokens", 105),
        ]));
        assert_eq!(usage, TokenUsage { input: 90, output: 10, total: 105 });

        let usage = TokenUsage::from_metadata(&metadata([("tokens", 12)]));
        assert_eq!(usage, TokenUsage { input: 0, output: 0, total: 12 });
    }

    #[test]
    fn test_generation_span() {
        let span = Span::generation("s", "llm_call", None, "deepseek-chat", Metadata::new());
        assert!(span.is_generation());
        assert_eq!(span.model_name(), Some("deepseek-chat"));

        let node = Span::open("s", "generate_response", None, metadata([("model", "gpt-4o")]));
        assert!(!node.is_generation());
        assert_eq!(node.model_name(), Some("gpt-4o"));

        // older records without the new fields still deserialize
        let mut json = serde_json::to_value(&node).unwrap();
        let map = json.as_object_mut().unwrap();
        map.remove("kind");
        let back: Span = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind, SpanKind::Span);
        assert!(back.input.is_none());
    }

    #[test]
    fn test_span_duration() {
        let mut span = Span::open("s", "classify_intent", None, Metadata::new());
        assert!(span.is_open());
        assert_eq!(span.duration_ms(), None);

        span.end_time = Some(span.start_time + chrono::Duration::milliseconds(15));
        assert_eq!(span.duration_ms(), Some(15.0));
    }
}
