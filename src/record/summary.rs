//! Session summaries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::score::Score;
use super::span::Metadata;

/// Latency statistics for one span kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub count: usize,
    pub mean_ms: f64,
    pub median_ms: f64,
}

impl LatencyStats {
    /// Compute statistics over a set of durations; `None` when empty
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }

        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let count = sorted.len();
        let mean_ms = sorted.iter().sum::<f64>() / count as f64;
        let mid = count / 2;
        let median_ms = if count % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };

        Some(Self {
            count,
            mean_ms,
            median_ms,
        })
    }
}

/// Rollup of one conversation
///
/// Summaries are snapshots: they are cloned out of the session and never
/// change after being returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    /// `None` for a provisional snapshot of a live session
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub total_spans: u64,
    pub total_errors: u64,
    pub orphaned_spans: u64,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    /// Number of generation spans
    #[serde(default)]
    pub total_llm_calls: u64,
    /// Mean duration of generation spans, 0.0 when there were none
    #[serde(default)]
    pub avg_llm_duration_ms: f64,
    /// Mean duration of every other span, 0.0 when there were none
    #[serde(default)]
    pub avg_node_duration_ms: f64,
    pub latency_by_kind: BTreeMap<String, LatencyStats>,
    pub scores: Vec<Score>,
    #[serde(default)]
    pub intents: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Summary {
    pub fn is_final(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Value of the first score with the given name
    pub fn score(&self, name: &str) -> Option<f64> {
        self.scores.iter().find(|s| s.name == name).map(|s| s.value)
    }

    /// Mean of every score with the given name
    pub fn average_score(&self, name: &str) -> Option<f64> {
        let values: Vec<f64> = self
            .scores
            .iter()
            .filter(|s| s.name == name)
            .map(|s| s.value)
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.iter().sum::<f64>() / values.len() as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_stats() {
        assert!(LatencyStats::from_samples(&[]).is_none());

        let stats = LatencyStats::from_samples(&[30.0, 10.0, 20.0]).unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.mean_ms, 20.0);
        assert_eq!(stats.median_ms, 20.0);

        let stats = LatencyStats::from_samples(&[4.0, 1.0, 3.0, 100.0]).unwrap();
        assert_eq!(stats.median_ms, 3.5);
        assert_eq!(stats.mean_ms, 27.0);
    }
}
