//! Simulated agent run that exercises the whole telemetry pipeline
//!
//! Each session walks a three-node graph (classify_intent, generate_response
//! with a nested model call, validation), scores the answer and finishes the
//! conversation. With
//! `--dry-run` the batches stay in memory and are counted at the end;
//! otherwise they go to the configured backend.

use anyhow::Context;
use clap::{Arg, ArgAction, Command};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use convo_metrics::logging::{init_logging, LoggingConfig};
use convo_metrics::pricing::{PricingTable, DEFAULT_MODEL};
use convo_metrics::record::{metadata, EventLevel};
use convo_metrics::uploader::InMemoryTransport;
use convo_metrics::{MetricsCollector, MetricsConfig};

const INTENTS: &[&str] = &["billing", "technical_support", "account", "small_talk"];

async fn run_session(collector: &MetricsCollector, pricing: &PricingTable, session_id: &str) {
    collector.start_conversation(
        session_id,
        metadata([("channel", "demo"), ("user_tier", "free")]),
    );
    let user = format!("demo-user-{}", fastrand::u8(1..10));
    collector.identify_conversation(session_id, Some(&user), ["demo"]);

    let classify = collector.span(session_id, "classify_intent");
    tokio::time::sleep(Duration::from_millis(fastrand::u64(5..20))).await;
    let intent = INTENTS[fastrand::usize(..INTENTS.len())];
    classify.finish_with(pricing.usage_metadata(DEFAULT_MODEL, 120, fastrand::u64(4..12)));
    collector.record_intent(session_id, intent);

    let generate = collector.span(session_id, "generate_response");
    generate.update(metadata([("intent", intent)]));
    generate.input(json!({ "intent": intent }));
    let llm_call = generate.child_generation("llm_call", DEFAULT_MODEL);
    llm_call.input(json!([{ "role": "user", "content": format!("simulated {} question", intent) }]));
    if fastrand::u8(..10) == 0 {
        llm_call.event("retry", EventLevel::Warning, metadata([("attempt", 2)]));
    }
    tokio::time::sleep(Duration::from_millis(fastrand::u64(40..120))).await;
    let usage = pricing.usage_metadata(DEFAULT_MODEL, 600, fastrand::u64(80..400));
    llm_call.output(json!("simulated answer"));
    llm_call.finish_with(usage);
    generate.output(json!({ "answer": "simulated answer" }));
    let response_span = generate.id();
    generate.finish();

    let validation = collector.span(session_id, "validation");
    tokio::time::sleep(Duration::from_millis(fastrand::u64(2..10))).await;
    if fastrand::u8(..5) == 0 {
        validation.fail("response failed schema validation");
    } else {
        validation.finish();
    }

    collector.record_score(
        &response_span.to_string(),
        "answer_quality",
        fastrand::f64(),
        Some("simulated grader".to_string()),
    );
    collector.record_score(session_id, "confidence", 0.5 + fastrand::f64() / 2.0, None);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = Command::new("convo_metrics_demo")
        .about("Run simulated conversations through the metrics collector")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .help("Collector configuration file (toml, yaml or json)"),
        )
        .arg(
            Arg::new("sessions")
                .long("sessions")
                .short('n')
                .help("Number of conversations to simulate")
                .value_parser(clap::value_parser!(usize))
                .default_value("5"),
        )
        .arg(
            Arg::new("dry-run")
                .long("dry-run")
                .help("Keep batches in memory instead of sending them")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let _log_guard = init_logging(LoggingConfig::from_env())?;

    let config = match matches.get_one::<String>("config") {
        Some(path) => MetricsConfig::from_file(path)
            .and_then(MetricsConfig::merge_with_env)
            .with_context(|| format!("loading collector config from {}", path))?,
        None => MetricsConfig::from_env()?,
    };
    let sessions = matches.get_one::<usize>("sessions").copied().unwrap_or(5);
    let dry_run = matches.get_flag("dry-run");

    let memory = Arc::new(InMemoryTransport::new());
    let collector = if dry_run {
        MetricsCollector::with_transport(config, memory.clone())?
    } else {
        MetricsCollector::start(config)?
    };
    info!(sessions, dry_run, enabled = collector.is_enabled(), "Starting demo run");

    let pricing = PricingTable::default();
    let mut summaries = Vec::with_capacity(sessions);
    for n in 0..sessions {
        let session_id = format!("demo-session-{}", n + 1);
        run_session(&collector, &pricing, &session_id).await;
        if let Some(summary) = collector.finish_conversation(&session_id) {
            summaries.push(summary);
        }
    }

    let report = collector.shutdown().await;
    let output = json!({
        "summaries": summaries,
        "global_metrics": collector.global_metrics(),
        "stats": collector.stats(),
        "shutdown": {
            "drained": report.drained,
            "dropped": report.dropped,
        },
        "dry_run_batches": dry_run.then(|| memory.batch_count()),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}
