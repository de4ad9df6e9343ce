//! Envelopes wrap closed records on their way to the backend

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Score, Span, Summary};

/// A closed record ready for transmission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum Record {
    Span(Span),
    Score(Score),
    Summary(Summary),
}

impl Record {
    pub fn session_id(&self) -> &str {
        match self {
            Record::Span(span) => &span.session_id,
            Record::Score(score) => &score.session_id,
            Record::Summary(summary) => &summary.session_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Record::Span(_) => "span",
            Record::Score(_) => "score",
            Record::Summary(_) => "summary",
        }
    }
}

/// Unit of buffering and transmission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Idempotency key for the backend
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub record: Record,
}

impl Envelope {
    pub fn new(record: Record) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            record,
        }
    }

    pub fn session_id(&self) -> &str {
        self.record.session_id()
    }
}

impl From<Span> for Envelope {
    fn from(span: Span) -> Self {
        Envelope::new(Record::Span(span))
    }
}

impl From<Score> for Envelope {
    fn from(score: Score) -> Self {
        Envelope::new(Record::Score(score))
    }
}

impl From<Summary> for Envelope {
    fn from(summary: Summary) -> Self {
        Envelope::new(Record::Summary(summary))
    }
}
