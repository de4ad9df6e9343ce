//! Score recording

use tracing::{debug, warn};

use super::SessionAggregator;
use crate::collector::stats::incr;
use crate::error::MetricsError;
use crate::record::{Score, ScoreScale, ScoreTarget, SpanId};
use crate::Result;

impl SessionAggregator {
    /// Attach a score to a span or a session
    ///
    /// `target_id` is resolved as a span id first, then as a session id.
    /// Values outside `scale` are clamped and flagged, never rejected. A
    /// range with non-finite bounds is rejected with `InvalidScale`.
    pub fn try_record_score(
        &self,
        target_id: &str,
        name: &str,
        value: f64,
        scale: ScoreScale,
        comment: Option<String>,
    ) -> Result<Score> {
        scale.validate()?;
        let (session_id, target) = self.resolve_target(target_id)?;

        let handle = self
            .session(&session_id)
            .ok_or_else(|| MetricsError::invalid_session(&session_id))?;
        let mut state = handle.lock();
        if !state.is_live() {
            return Err(MetricsError::invalid_session(&session_id));
        }

        let score = Score::new(target, session_id.as_str(), name, value, scale, comment);
        state.add_score(score.clone());
        drop(state);

        incr(&self.counters.scores_recorded);
        if score.clamped {
            incr(&self.counters.scores_clamped);
            warn!(
                session_id = %session_id,
                score = name,
                submitted = value,
                stored = score.value,
                "Score outside its scale was clamped"
            );
        } else {
            debug!(session_id = %session_id, score = name, value, "Score recorded");
        }
        Ok(score)
    }

    fn resolve_target(&self, target_id: &str) -> Result<(String, ScoreTarget)> {
        if let Some(span_id) = SpanId::parse(target_id) {
            if let Some(entry) = self.span_index.get(&span_id) {
                return Ok((entry.value().clone(), ScoreTarget::Span(span_id)));
            }
        }

        if self.sessions.contains_key(target_id) {
            return Ok((
                target_id.to_string(),
                ScoreTarget::Session(target_id.to_string()),
            ));
        }
        if self.finished.contains_key(target_id) {
            return Err(MetricsError::invalid_session(target_id));
        }

        Err(MetricsError::unknown_target(target_id))
    }
}
