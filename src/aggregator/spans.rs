//! Span recording
//!
//! Every operation touches exactly one session lock and never perform I/O.
//! Closing a span only folds it into its session's running totals; nothing is
//! sent until the session finishes.

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, warn};

use super::SessionAggregator;
use crate::collector::stats::incr;
use crate::error::MetricsError;
use crate::record::{EventLevel, Metadata, Span, SpanEvent, SpanId, SpanStatus};
use crate::Result;

impl SessionAggregator {
    /// Open a span in `session_id`, creating the session if needed
    pub fn try_start_span(
        &self,
        session_id: &str,
        name: &str,
        parent_id: Option<SpanId>,
        metadata: Metadata,
    ) -> Result<SpanId> {
        let parent_id = parent_id.filter(|p| !p.is_noop());
        self.register_span(session_id, Span::open(session_id, name, parent_id, metadata))
    }

    /// Open a generation span for one call to `model`
    ///
    /// Generations count towards the session's LLM call total and average
    /// duration instead of the node average.
    pub fn try_start_generation(
        &self,
        session_id: &str,
        name: &str,
        parent_id: Option<SpanId>,
        model: &str,
        metadata: Metadata,
    ) -> Result<SpanId> {
        let parent_id = parent_id.filter(|p| !p.is_noop());
        self.register_span(
            session_id,
            Span::generation(session_id, name, parent_id, model, metadata),
        )
    }

    fn register_span(&self, session_id: &str, span: Span) -> Result<SpanId> {
        let handle = self.session_or_create(session_id)?;
        let mut state = handle.lock();
        if !state.is_live() {
            return Err(MetricsError::invalid_session(session_id));
        }

        if let Some(parent) = &span.parent_id {
            if !state.open.contains_key(parent) && state.closed_span(parent).is_none() {
                warn!(
                    session_id,
                    parent_id = %parent,
                    "Parent span is not part of this session"
                );
            }
        }

        let (span_id, kind) = (span.id, span.kind);
        let name = span.name.clone();
        state.open_span(span);
        self.span_index.insert(span_id, session_id.to_string());
        drop(state);

        incr(&self.counters.spans_started);
        debug!(session_id, span_id = %span_id, name = %name, ?kind, "Span started");
        Ok(span_id)
    }

    /// Close an open span
    ///
    /// A `Pending` status closes as `Ok`; passing an error marks the span as
    /// failed. Closing twice returns `SpanClosed` and changes nothing.
    pub fn try_end_span(
        &self,
        span_id: SpanId,
        status: SpanStatus,
        metadata_update: Metadata,
        error: Option<String>,
    ) -> Result<()> {
        let (session_id, handle) = self
            .session_for_span(&span_id)
            .ok_or_else(|| MetricsError::unknown_span(span_id))?;

        let mut state = handle.lock();
        if !state.is_live() {
            return Err(MetricsError::invalid_session(session_id));
        }

        let Some(mut open) = state.open.remove(&span_id) else {
            return if state.closed_span(&span_id).is_some() {
                Err(MetricsError::span_closed(span_id))
            } else {
                Err(MetricsError::unknown_span(span_id))
            };
        };

        let children = state.open_children(&span_id);
        if children > 0 {
            warn!(
                session_id = %session_id,
                span_id = %span_id,
                open_children = children,
                "Span closed before its children"
            );
        }

        open.span.metadata.extend(metadata_update);
        let status = match (&error, status) {
            (_, SpanStatus::Orphaned) => SpanStatus::Orphaned,
            (Some(_), _) => SpanStatus::Error,
            (None, status) => status,
        };
        open.span.error = error;

        let span = state.close_span(open, status);
        let (name, failed, duration_ms) = (
            span.name.clone(),
            span.status.is_error(),
            span.duration_ms().unwrap_or_default(),
        );
        let orphaned = span.status == SpanStatus::Orphaned;
        drop(state);

        incr(&self.counters.spans_closed);
        if orphaned {
            incr(&self.counters.spans_orphaned);
        }
        self.counters.record_execution(&name, failed);
        debug!(
            session_id = %session_id,
            span_id = %span_id,
            name = %name,
            duration_ms,
            failed,
            "Span ended"
        );
        Ok(())
    }

    /// Merge `delta` into the metadata of an open span
    pub fn try_update_span(&self, span_id: SpanId, delta: Metadata) -> Result<()> {
        let (session_id, handle) = self
            .session_for_span(&span_id)
            .ok_or_else(|| MetricsError::unknown_span(span_id))?;

        let mut state = handle.lock();
        if !state.is_live() {
            return Err(MetricsError::invalid_session(session_id));
        }

        match state.open.get_mut(&span_id) {
            Some(open) => {
                open.span.metadata.extend(delta);
                state.touch();
                Ok(())
            }
            None => Err(MetricsError::span_closed(span_id)),
        }
    }

    /// Attach a timestamped event to an open span
    pub fn try_add_span_event(
        &self,
        span_id: SpanId,
        name: &str,
        level: EventLevel,
        metadata: Metadata,
    ) -> Result<()> {
        let (session_id, handle) = self
            .session_for_span(&span_id)
            .ok_or_else(|| MetricsError::unknown_span(span_id))?;

        let mut state = handle.lock();
        if !state.is_live() {
            return Err(MetricsError::invalid_session(session_id));
        }

        let Some(open) = state.open.get_mut(&span_id) else {
            return Err(MetricsError::span_closed(span_id));
        };
        open.span.events.push(SpanEvent {
            name: name.to_string(),
            level,
            timestamp: Utc::now(),
            metadata,
        });
        state.touch();
        drop(state);

        incr(&self.counters.span_events);
        Ok(())
    }

    /// Record the payload an open span received
    pub fn try_set_span_input(&self, span_id: SpanId, input: Value) -> Result<()> {
        self.with_open_span(span_id, |span| span.input = Some(input))
    }

    /// Record the payload an open span produced
    pub fn try_set_span_output(&self, span_id: SpanId, output: Value) -> Result<()> {
        self.with_open_span(span_id, |span| span.output = Some(output))
    }

    fn with_open_span(&self, span_id: SpanId, f: impl FnOnce(&mut Span)) -> Result<()> {
        let (session_id, handle) = self
            .session_for_span(&span_id)
            .ok_or_else(|| MetricsError::unknown_span(span_id))?;

        let mut state = handle.lock();
        if !state.is_live() {
            return Err(MetricsError::invalid_session(session_id));
        }
        let Some(open) = state.open.get_mut(&span_id) else {
            return Err(MetricsError::span_closed(span_id));
        };
        f(&mut open.span);
        state.touch();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::aggregator;
    use super::super::AggregatorConfig;
    use super::*;
    use crate::record::{metadata, MetadataValue, Record};

    #[test]
    fn test_s1_span_totals() {
        let (agg, _) = aggregator(AggregatorConfig::default());

        let classify = agg
            .try_start_span("S1", "classify_intent", None, Metadata::new())
            .unwrap();
        agg.try_end_span(classify, SpanStatus::Ok, metadata([("tokens", 12)]), None)
            .unwrap();

        let generate = agg
            .try_start_span("S1", "generate_response", None, Metadata::new())
            .unwrap();
        agg.try_end_span(
            generate,
            SpanStatus::Ok,
            metadata([
                ("tokens", MetadataValue::from(340)),
                ("cost", MetadataValue::from(0.002)),
            ]),
            None,
        )
        .unwrap();

        let summary = agg.try_finish_conversation("S1").unwrap();
        assert_eq!(summary.total_spans, 2);
        assert_eq!(summary.total_tokens, 352);
        assert!((summary.total_cost_usd - 0.002).abs() < 1e-12);
        assert!(summary.latency_by_kind.contains_key("classify_intent"));
        assert!(summary.latency_by_kind.contains_key("generate_response"));
    }

    #[test]
    fn test_double_end_is_rejected_without_side_effects() {
        let (agg, _) = aggregator(AggregatorConfig::default());
        let span = agg
            .try_start_span("S1", "node", None, Metadata::new())
            .unwrap();
        agg.try_end_span(span, SpanStatus::Ok, metadata([("tokens", 3)]), None)
            .unwrap();

        assert!(matches!(
            agg.try_end_span(span, SpanStatus::Ok, metadata([("tokens", 100)]), None),
            Err(MetricsError::SpanClosed { .. })
        ));

        let summary = agg.try_finish_conversation("S1").unwrap();
        assert_eq!(summary.total_spans, 1);
        assert_eq!(summary.total_tokens, 3);
    }

    #[test]
    fn test_update_only_applies_to_open_spans() {
        let (agg, sink) = aggregator(AggregatorConfig::default());
        let span = agg
            .try_start_span("S1", "generate_response", None, metadata([("model", "deepseek-chat")]))
            .unwrap();
        agg.try_update_span(span, metadata([("prompt_tokens", 90)]))
            .unwrap();
        agg.try_update_span(span, metadata([("completion_tokens", 10)]))
            .unwrap();
        agg.try_end_span(span, SpanStatus::Ok, Metadata::new(), None)
            .unwrap();

        assert!(matches!(
            agg.try_update_span(span, metadata([("tokens", 1)])),
            Err(MetricsError::SpanClosed { .. })
        ));

        let summary = agg.try_finish_conversation("S1").unwrap();
        assert_eq!(summary.total_tokens, 100);

        let handoffs = sink.handoffs.lock();
        match &handoffs[0][0].record {
            Record::Span(span) => {
                assert_eq!(span.metadata.get("model"), Some(&MetadataValue::from("deepseek-chat")));
                assert!(!span.metadata.contains_key("tokens"));
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_error_marks_span_failed() {
        let (agg, _) = aggregator(AggregatorConfig::default());
        let span = agg
            .try_start_span("S1", "validation", None, Metadata::new())
            .unwrap();
        agg.try_end_span(
            span,
            SpanStatus::Ok,
            Metadata::new(),
            Some("schema mismatch".to_string()),
        )
        .unwrap();

        let summary = agg.try_finish_conversation("S1").unwrap();
        assert_eq!(summary.total_errors, 1);
        let metrics = agg.counters().global_metrics();
        assert_eq!(metrics.error_count.get("validation"), Some(&1));
    }

    #[test]
    fn test_unknown_span_and_empty_session() {
        let (agg, _) = aggregator(AggregatorConfig::default());
        assert!(matches!(
            agg.try_end_span(SpanId::new(), SpanStatus::Ok, Metadata::new(), None),
            Err(MetricsError::UnknownSpan { .. })
        ));
        assert!(matches!(
            agg.try_update_span(SpanId::NOOP, Metadata::new()),
            Err(MetricsError::UnknownSpan { .. })
        ));
        assert!(matches!(
            agg.try_start_span("  ", "node", None, Metadata::new()),
            Err(MetricsError::InvalidSession { .. })
        ));
    }

    #[test]
    fn test_parent_closed_before_child_is_tolerated() {
        let (agg, _) = aggregator(AggregatorConfig::default());
        let parent = agg
            .try_start_span("S1", "graph", None, Metadata::new())
            .unwrap();
        let child = agg
            .try_start_span("S1", "node", Some(parent), Metadata::new())
            .unwrap();

        agg.try_end_span(parent, SpanStatus::Ok, Metadata::new(), None)
            .unwrap();
        agg.try_end_span(child, SpanStatus::Ok, Metadata::new(), None)
            .unwrap();

        let summary = agg.try_finish_conversation("S1").unwrap();
        assert_eq!(summary.total_spans, 2);
        assert_eq!(summary.orphaned_spans, 0);
    }

    #[test]
    fn test_span_events_travel_with_span() {
        let (agg, sink) = aggregator(AggregatorConfig::default());
        let span = agg
            .try_start_span("S1", "generate_response", None, Metadata::new())
            .unwrap();
        agg.try_add_span_event(span, "retry", EventLevel::Warning, metadata([("attempt", 2)]))
            .unwrap();
        agg.try_end_span(span, SpanStatus::Ok, Metadata::new(), None)
            .unwrap();
        assert!(matches!(
            agg.try_add_span_event(span, "late", EventLevel::Debug, Metadata::new()),
            Err(MetricsError::SpanClosed { .. })
        ));
        agg.try_finish_conversation("S1").unwrap();

        let handoffs = sink.handoffs.lock();
        match &handoffs[0][0].record {
            Record::Span(span) => {
                assert_eq!(span.events.len(), 1);
                assert_eq!(span.events[0].level, EventLevel::Warning);
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn test_generation_and_payloads() {
        let (agg, sink) = aggregator(AggregatorConfig::default());
        let node = agg
            .try_start_span("S1", "generate_response", None, Metadata::new())
            .unwrap();
        agg.try_set_span_input(node, serde_json::json!({"message": "where is my invoice"}))
            .unwrap();

        let call = agg
            .try_start_generation("S1", "llm_call", Some(node), "deepseek-chat", Metadata::new())
            .unwrap();
        agg.try_end_span(
            call,
            SpanStatus::Ok,
            metadata([("input_tokens", 600), ("output_tokens", 120)]),
            None,
        )
        .unwrap();
        agg.try_set_span_output(node, serde_json::json!("It was emailed on Monday"))
            .unwrap();
        agg.try_end_span(node, SpanStatus::Ok, Metadata::new(), None)
            .unwrap();

        assert!(matches!(
            agg.try_set_span_output(node, serde_json::json!("late")),
            Err(MetricsError::SpanClosed { .. })
        ));

        let summary = agg.try_finish_conversation("S1").unwrap();
        assert_eq!(summary.total_llm_calls, 1);
        assert_eq!(summary.total_tokens, 720);

        let handoffs = sink.handoffs.lock();
        match (&handoffs[0][0].record, &handoffs[0][1].record) {
            (Record::Span(generation), Record::Span(node)) => {
                assert!(generation.is_generation());
                assert_eq!(generation.model.as_deref(), Some("deepseek-chat"));
                assert_eq!(generation.usage().input, 600);
                assert_eq!(node.input.as_ref().unwrap()["message"], "where is my invoice");
                assert_eq!(node.output, Some(serde_json::json!("It was emailed on Monday")));
            }
            other => panic!("unexpected records {:?}", other),
        }
    }
}
