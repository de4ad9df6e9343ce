//! Record model
//!
//! Passive data types produced by the recorders: [`Span`], [`Score`] and the
//! per-session [`Summary`], plus the [`Envelope`] they travel in once closed.
//! None of these types carry behaviour beyond small derived views such as
//! [`Span::token_count`].

mod envelope;
mod score;
mod span;
mod summary;

pub use envelope::{Envelope, Record};
pub use score::{Score, ScoreScale, ScoreTarget};
pub use span::{
    cost_usd, metadata, token_count, EventLevel, Metadata, MetadataValue, Span, SpanEvent, SpanId,
    SpanKind, SpanStatus, TokenUsage,
};
pub use summary::{LatencyStats, Summary};
