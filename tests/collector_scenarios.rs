//! End-to-end conversation scenarios through the collector facade

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};

use convo_metrics::record::{metadata, Envelope, MetadataValue, Record, ScoreScale, SpanStatus};
use convo_metrics::uploader::{InMemoryTransport, TransmissionError, Transport};
use convo_metrics::{MetricsCollector, MetricsConfig, OverflowPolicy};

fn collector_with(config: MetricsConfig) -> (MetricsCollector, Arc<InMemoryTransport>) {
    let transport = Arc::new(InMemoryTransport::new());
    let collector = MetricsCollector::with_transport(config, transport.clone()).unwrap();
    (collector, transport)
}

fn quiet_config() -> MetricsConfig {
    MetricsConfig {
        flush_interval: Duration::from_secs(3600),
        ..Default::default()
    }
}

fn kinds(transport: &InMemoryTransport) -> Vec<&'static str> {
    transport
        .records()
        .iter()
        .map(|e| e.record.kind())
        .collect()
}

#[tokio::test]
async fn test_two_node_conversation_totals() {
    let (collector, transport) = collector_with(quiet_config());

    let classify = collector.start_span("S1", "classify_intent", None, Default::default());
    collector.end_span(classify, SpanStatus::Ok, metadata([("tokens", 12)]), None);
    collector.record_intent("S1", "billing");

    let generate = collector.start_span("S1", "generate_response", None, Default::default());
    collector.end_span(
        generate,
        SpanStatus::Ok,
        metadata([
            ("tokens", MetadataValue::from(340)),
            ("cost", MetadataValue::from(0.002)),
        ]),
        None,
    );
    collector.record_score("S1", "confidence", 0.91, None);

    let summary = collector.finish_conversation("S1").unwrap();
    assert_eq!(summary.total_spans, 2);
    assert_eq!(summary.total_tokens, 352);
    assert!((summary.total_cost_usd - 0.002).abs() < 1e-12);
    assert_eq!(summary.total_errors, 0);
    assert_eq!(summary.score("confidence"), Some(0.91));
    assert_eq!(summary.intents, vec!["billing".to_string()]);
    assert!(summary.is_final());

    let metrics = collector.global_metrics();
    assert_eq!(metrics.total_conversations, 1);
    assert_eq!(metrics.total_tokens, 352);
    assert_eq!(metrics.intent_distribution.get("billing"), Some(&1));
    assert_eq!(metrics.execution_count.get("generate_response"), Some(&1));

    collector.shutdown().await;
    assert_eq!(kinds(&transport), vec!["span", "span", "score", "summary"]);
}

#[tokio::test]
async fn test_finish_is_idempotent_and_uploads_once() {
    let (collector, transport) = collector_with(quiet_config());

    let span = collector.start_span("S1", "node", None, Default::default());
    collector.end_span(span, SpanStatus::Ok, metadata([("tokens", 5)]), None);

    let first = collector.finish_conversation("S1").unwrap();
    let second = collector.finish_conversation("S1").unwrap();
    assert_eq!(first, second);
    assert_eq!(collector.summary("S1"), Some(first));

    collector.shutdown().await;
    let summaries = transport
        .records()
        .into_iter()
        .filter(|e| matches!(e.record, Record::Summary(_)))
        .count();
    assert_eq!(summaries, 1);
    assert_eq!(collector.stats().sessions_finished, 1);
}

#[tokio::test]
async fn test_disabled_collector_records_nothing() {
    let (collector, transport) = collector_with(MetricsConfig::disabled());
    assert!(!collector.is_enabled());

    let span = collector.start_span("S1", "node", None, Default::default());
    assert!(span.is_noop());
    collector.end_span(span, SpanStatus::Ok, Default::default(), None);
    collector.record_score("S1", "confidence", 0.3, None);
    assert!(collector.finish_conversation("S1").is_none());

    collector.shutdown().await;
    assert_eq!(transport.attempts(), 0);
}

#[tokio::test]
async fn test_open_spans_are_force_closed_at_finish() {
    let (collector, transport) = collector_with(quiet_config());

    let parent = collector.start_span("S1", "graph", None, Default::default());
    tokio::time::sleep(Duration::from_millis(2)).await;
    collector.start_span("S1", "generate_response", Some(parent), Default::default());

    let summary = collector.finish_conversation("S1").unwrap();
    assert_eq!(summary.total_spans, 2);
    assert_eq!(summary.orphaned_spans, 2);

    collector.shutdown().await;
    let records = transport.records();
    let names: Vec<&str> = records
        .iter()
        .filter_map(|e| match &e.record {
            Record::Span(span) => {
                assert_eq!(span.status, SpanStatus::Orphaned);
                assert!(span.end_time.is_some());
                Some(span.name.as_str())
            }
            _ => None,
        })
        .collect();
    assert_eq!(names, vec!["generate_response", "graph"]);
}

#[tokio::test]
async fn test_overflow_drops_oldest_records() {
    let (collector, transport) = collector_with(MetricsConfig {
        flush_at: 3,
        buffer_capacity: 3,
        overflow_policy: OverflowPolicy::DropOldest,
        ..quiet_config()
    });

    for n in 0..5 {
        let span = collector.start_span("S1", &format!("node_{}", n), None, Default::default());
        collector.end_span(span, SpanStatus::Ok, Default::default(), None);
    }
    // six records land in the buffer before the upload task gets to run
    collector.finish_conversation("S1").unwrap();

    let report = collector.shutdown().await;
    assert!(report.drained);

    let stats = collector.stats();
    assert_eq!(stats.records_dropped_overflow, 3);
    assert_eq!(stats.records_sent, 3);

    let records = transport.records();
    assert!(matches!(records.last().map(|e| &e.record), Some(Record::Summary(_))));
    match &records[0].record {
        Record::Span(span) => assert_eq!(span.name, "node_3"),
        other => panic!("unexpected record {:?}", other),
    }
}

/// Backend that holds every batch for a minute
#[derive(Debug)]
struct SlowTransport;

#[async_trait]
impl Transport for SlowTransport {
    async fn send_batch(&self, _batch: &[Envelope]) -> Result<(), TransmissionError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "slow"
    }
}

fn blocking_config() -> MetricsConfig {
    MetricsConfig {
        flush_at: 2,
        buffer_capacity: 2,
        overflow_policy: OverflowPolicy::Block,
        block_timeout: Duration::from_millis(50),
        shutdown_timeout: Duration::from_millis(100),
        ..quiet_config()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_block_policy_bounds_finish_with_stalled_backend() {
    let collector =
        MetricsCollector::with_transport(blocking_config(), Arc::new(SlowTransport)).unwrap();

    for n in 0..40 {
        let span = collector.start_span("S1", &format!("node_{}", n), None, Default::default());
        collector.end_span(span, SpanStatus::Ok, Default::default(), None);
    }

    let started = Instant::now();
    let summary = collector.finish_conversation("S1").unwrap();
    assert_eq!(summary.total_spans, 40);
    // one 50ms wait for the whole hand-off, not one per record
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(collector.stats().records_dropped_overflow > 0);

    let report = collector.shutdown().await;
    assert!(!report.drained);
}

#[tokio::test]
async fn test_block_policy_on_current_thread_runtime_evicts_without_waiting() {
    let (collector, transport) = collector_with(MetricsConfig {
        block_timeout: Duration::from_secs(30),
        ..blocking_config()
    });

    for n in 0..5 {
        let span = collector.start_span("S1", &format!("node_{}", n), None, Default::default());
        collector.end_span(span, SpanStatus::Ok, Default::default(), None);
    }

    let started = Instant::now();
    collector.finish_conversation("S1").unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(collector.stats().records_dropped_overflow, 4);

    collector.shutdown().await;
    assert_eq!(kinds(&transport), vec!["span", "summary"]);
}

#[tokio::test]
async fn test_out_of_range_score_is_clamped_and_flagged() {
    let (collector, transport) = collector_with(quiet_config());
    collector.start_conversation("S1", Default::default());

    let score = collector
        .record_score_on_scale("S1", "confidence", 1.4, ScoreScale::Unit, None)
        .unwrap();
    assert_eq!(score.value, 1.0);
    assert!(score.clamped);

    let summary = collector.finish_conversation("S1").unwrap();
    assert_eq!(summary.score("confidence"), Some(1.0));
    assert_eq!(collector.stats().scores_clamped, 1);

    collector.shutdown().await;
    let shipped = transport
        .records()
        .into_iter()
        .find_map(|e| match e.record {
            Record::Score(score) => Some(score),
            _ => None,
        })
        .unwrap();
    assert!(shipped.clamped);
}

#[tokio::test]
async fn test_reset_discards_conversation() {
    let (collector, transport) = collector_with(quiet_config());

    let span = collector.start_span("S1", "node", None, Default::default());
    collector.end_span(span, SpanStatus::Ok, metadata([("tokens", 9)]), None);
    collector.reset_conversation("S1");

    assert!(collector.session_snapshot("S1").is_none());
    assert_eq!(collector.stats().sessions_reset, 1);

    // the id is usable again
    let span = collector.start_span("S1", "node", None, Default::default());
    collector.end_span(span, SpanStatus::Ok, metadata([("tokens", 1)]), None);
    let summary = collector.finish_conversation("S1").unwrap();
    assert_eq!(summary.total_tokens, 1);

    collector.shutdown().await;
    assert_eq!(kinds(&transport), vec!["span", "summary"]);
}

#[tokio::test(start_paused = true)]
async fn test_idle_sessions_are_finished_by_sweeper() {
    let (collector, transport) = collector_with(MetricsConfig {
        idle_timeout: Duration::from_secs(2),
        gc_interval: Duration::from_secs(1),
        ..quiet_config()
    });

    let span = collector.start_span("S1", "node", None, Default::default());
    collector.end_span(span, SpanStatus::Ok, Default::default(), None);
    collector.start_span("S1", "abandoned", None, Default::default());
    assert_eq!(collector.stats().sessions_active, 1);

    tokio::time::sleep(Duration::from_secs(5)).await;

    let summary = collector.summary("S1").unwrap();
    assert!(summary.is_final());
    assert_eq!(summary.orphaned_spans, 1);
    let stats = collector.stats();
    assert_eq!(stats.sessions_active, 0);
    assert_eq!(stats.sessions_collected, 1);

    collector.shutdown().await;
    assert_eq!(kinds(&transport), vec!["span", "span", "summary"]);
}

#[tokio::test]
async fn test_many_concurrent_sessions() {
    let (collector, transport) = collector_with(MetricsConfig {
        flush_at: 10,
        ..quiet_config()
    });

    let mut handles = Vec::new();
    for n in 0..20 {
        let collector = collector.clone();
        handles.push(tokio::spawn(async move {
            let session = format!("session-{}", n);
            for _ in 0..3 {
                let guard = collector.span(&session, "node");
                tokio::task::yield_now().await;
                guard.finish_with(metadata([("tokens", 2)]));
            }
            collector.finish_conversation(&session).unwrap()
        }));
    }
    for handle in handles {
        let summary = handle.await.unwrap();
        assert_eq!(summary.total_spans, 3);
        assert_eq!(summary.total_tokens, 6);
    }

    let report = collector.shutdown().await;
    assert!(report.drained);
    assert_eq!(collector.global_metrics().total_tokens, 120);
    assert_eq!(transport.records().len(), 20 * 4);
}
