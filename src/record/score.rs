//! Score records: quality judgments attached to a span or a session

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::span::SpanId;
use crate::error::MetricsError;

/// What a score is attached to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum ScoreTarget {
    Span(SpanId),
    Session(String),
}

/// Declared range of a score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScoreScale {
    /// 0.0 to 1.0
    #[default]
    Unit,
    /// Inclusive `[min, max]`
    Range { min: f64, max: f64 },
    /// Any finite value
    Open,
}

impl ScoreScale {
    /// Build a range scale; reversed bounds are swapped
    pub fn range(min: f64, max: f64) -> Result<Self, MetricsError> {
        ScoreScale::Range { min, max }.validate()?;
        Ok(ScoreScale::Range {
            min: min.min(max),
            max: min.max(max),
        })
    }

    /// Range bounds must be finite
    pub fn validate(&self) -> Result<(), MetricsError> {
        match *self {
            ScoreScale::Range { min, max } if !min.is_finite() || !max.is_finite() => Err(
                MetricsError::invalid_scale(format!("range bounds must be finite, got [{}, {}]", min, max)),
            ),
            _ => Ok(()),
        }
    }

    /// Clamp `value` into the scale, returning the stored value and whether
    /// it had to be changed
    ///
    /// NaN is stored as the lower bound (0.0 on an open scale). A range with
    /// a non-finite bound clamps as the unit scale and always flags.
    pub fn clamp(&self, value: f64) -> (f64, bool) {
        let (min, max) = match *self {
            ScoreScale::Unit => (0.0, 1.0),
            ScoreScale::Range { .. } if self.validate().is_err() => {
                return (ScoreScale::Unit.clamp(value).0, true);
            }
            ScoreScale::Range { min, max } if min <= max => (min, max),
            ScoreScale::Range { min, max } => (max, min),
            ScoreScale::Open => {
                return if value.is_finite() {
                    (value, false)
                } else {
                    (0.0, true)
                };
            }
        };

        if value.is_nan() {
            (min, true)
        } else if value < min {
            (min, true)
        } else if value > max {
            (max, true)
        } else {
            (value, false)
        }
    }
}

/// A stored quality judgment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub id: Uuid,
    pub target: ScoreTarget,
    /// Session the target belongs to
    pub session_id: String,
    pub name: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// The submitted value was outside the scale and has been clamped
    #[serde(default)]
    pub clamped: bool,
    pub created_at: DateTime<Utc>,
}

impl Score {
    pub fn new(
        target: ScoreTarget,
        session_id: impl Into<String>,
        name: impl Into<String>,
        value: f64,
        scale: ScoreScale,
        comment: Option<String>,
    ) -> Self {
        let (value, clamped) = scale.clamp(value);
        Self {
            id: Uuid::new_v4(),
            target,
            session_id: session_id.into(),
            name: name.into(),
            value,
            comment,
            clamped,
            created_at: Utc::now(),
        }
    }

    /// Span id when the score targets a span
    pub fn span_id(&self) -> Option<SpanId> {
        match &self.target {
            ScoreTarget::Span(id) => Some(*id),
            ScoreTarget::Session(_) => None,
        }
    }
}
