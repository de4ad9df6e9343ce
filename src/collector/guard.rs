//! Scoped spans
//!
//! A [`SpanGuard`] closes its span when it goes out of scope. Finishing it
//! explicitly records `Ok` (or `Error` through [`SpanGuard::fail`]); a guard
//! that is dropped unfinished, for example because the node returned early
//! with `?`, closes its span as orphaned.

use serde_json::Value;

use crate::record::{EventLevel, Metadata, SpanId, SpanStatus};

use super::MetricsCollector;

#[must_use = "dropping a SpanGuard immediately closes the span as orphaned"]
#[derive(Debug)]
pub struct SpanGuard {
    collector: MetricsCollector,
    session_id: String,
    span_id: SpanId,
    closed: bool,
}

impl SpanGuard {
    pub(crate) fn new(collector: MetricsCollector, session_id: &str, span_id: SpanId) -> Self {
        Self {
            collector,
            session_id: session_id.to_string(),
            span_id,
            closed: false,
        }
    }

    pub fn id(&self) -> SpanId {
        self.span_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Merge metadata into the open span
    pub fn update(&self, delta: Metadata) {
        self.collector.update_span(self.span_id, delta);
    }

    pub fn event(&self, name: &str, level: EventLevel, metadata: Metadata) {
        self.collector
            .add_span_event(self.span_id, name, level, metadata);
    }

    /// Record what the span received
    pub fn input(&self, input: Value) {
        self.collector.set_span_input(self.span_id, input);
    }

    /// Record what the span produced
    pub fn output(&self, output: Value) {
        self.collector.set_span_output(self.span_id, output);
    }

    /// Open a nested span in the same session
    pub fn child(&self, name: &str) -> SpanGuard {
        self.collector
            .span_with(&self.session_id, name, Some(self.span_id), Metadata::new())
    }

    /// Open a nested generation span for one call to `model`
    pub fn child_generation(&self, name: &str, model: &str) -> SpanGuard {
        self.collector
            .generation(&self.session_id, name, Some(self.span_id), model)
    }

    /// Close the span successfully
    pub fn finish(self) {
        self.finish_with(Metadata::new());
    }

    /// Close the span successfully with a final metadata update
    pub fn finish_with(mut self, metadata_update: Metadata) {
        self.close(SpanStatus::Ok, metadata_update, None);
    }

    /// Close the span as failed
    pub fn fail(mut self, error: impl Into<String>) {
        self.close(SpanStatus::Error, Metadata::new(), Some(error.into()));
    }

    fn close(&mut self, status: SpanStatus, metadata_update: Metadata, error: Option<String>) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.collector
            .end_span(self.span_id, status, metadata_update, error);
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            self.collector.release_span(self.span_id);
        }
    }
}
