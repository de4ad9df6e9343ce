//! Record spans, scores and per-conversation rollups for conversational agents.
//!
//! convo-metrics collects telemetry from agent pipelines that are built as a
//! graph of processing nodes (intent classification, response generation,
//! validation and so on). You record a span around each node execution,
//! attach quality scores to spans or whole conversations, and finish the
//! conversation to get a [`Summary`](record::Summary) with token, cost,
//! latency and error totals. Closed records are batched in the background and
//! shipped to a Langfuse-compatible ingestion endpoint.
//!
//! Recording never blocks on the network and never fails the agent: the
//! facade swallows and counts telemetry errors, and a disabled collector turns
//! every call into a no-op.
//!
//! # Quick Start
//!
//! ```no_run
//! use convo_metrics::record::{metadata, MetadataValue, SpanStatus};
//! use convo_metrics::{MetricsCollector, MetricsConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Reads LANGFUSE_HOST, LANGFUSE_PUBLIC_KEY and LANGFUSE_SECRET_KEY
//!     let collector = MetricsCollector::start(MetricsConfig::from_env()?)?;
//!
//!     let classify = collector.span("session-42", "classify_intent");
//!     classify.finish_with(metadata([("tokens", 12)]));
//!     collector.record_intent("session-42", "billing");
//!
//!     let generate = collector.start_span("session-42", "generate_response", None, Default::default());
//!     collector.end_span(
//!         generate,
//!         SpanStatus::Ok,
//!         metadata([
//!             ("tokens", MetadataValue::from(340)),
//!             ("cost", MetadataValue::from(0.002)),
//!         ]),
//!         None,
//!     );
//!     collector.record_score("session-42", "confidence", 0.91, None);
//!
//!     if let Some(summary) = collector.finish_conversation("session-42") {
//!         println!("{} tokens, ${:.4}", summary.total_tokens, summary.total_cost_usd);
//!     }
//!
//!     collector.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`record`] holds the passive data model
//! - [`aggregator`] tracks live sessions and exposes the fallible `try_*` API
//! - [`uploader`] buffers closed records and delivers them with retries
//! - [`collector`] is the infallible facade plus the process-wide accessor
//! - [`config`], [`logging`] and [`pricing`] cover setup and cost estimation

pub mod aggregator;
pub mod collector;
pub mod config;
pub mod error;
pub mod logging;
pub mod pricing;
pub mod record;
pub mod uploader;

pub use collector::global::{get_metrics_collector, init, teardown};
pub use collector::{CollectorStats, GlobalMetrics, MetricsCollector, SpanGuard};
pub use config::{InitMode, MetricsConfig, OverflowPolicy};
pub use error::{MetricsError, RetryConfig};

pub type Result<T> = std::result::Result<T, MetricsError>;
