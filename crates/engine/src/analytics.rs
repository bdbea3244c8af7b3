//! Aggregated task metrics.
//!
//! Fed by the coordinator on every terminal outcome and folded into the
//! periodic summary the evolution loop publishes. Metrics are named
//! series of samples; the summary reports count and mean per series.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Default)]
struct AnalyticsState {
    completions: u64,
    failures: u64,
    total_duration_ms: u64,
    metrics: HashMap<String, Vec<f64>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricSummary {
    pub count: usize,
    pub mean: f64,
}

/// Point-in-time report over everything recorded so far.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsSummary {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub metrics: HashMap<String, MetricSummary>,
}

#[derive(Default)]
pub struct Analytics {
    state: Mutex<AnalyticsState>,
}

impl Analytics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_task_completion(&self, duration_ms: u64, success: bool) {
        let mut state = self.state.lock();
        if success {
            state.completions += 1;
        } else {
            state.failures += 1;
        }
        state.total_duration_ms += duration_ms;
    }

    pub fn record_metric(&self, name: impl Into<String>, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.state
            .lock()
            .metrics
            .entry(name.into())
            .or_default()
            .push(value);
    }

    pub fn summary(&self) -> AnalyticsSummary {
        let state = self.state.lock();
        let total = state.completions + state.failures;
        let success_rate = if total == 0 {
            0.0
        } else {
            state.completions as f64 / total as f64
        };
        let avg_duration_ms = if total == 0 {
            0.0
        } else {
            state.total_duration_ms as f64 / total as f64
        };
        let metrics = state
            .metrics
            .iter()
            .map(|(name, samples)| {
                let mean = samples.iter().sum::<f64>() / samples.len() as f64;
                (
                    name.clone(),
                    MetricSummary {
                        count: samples.len(),
                        mean,
                    },
                )
            })
            .collect();

        AnalyticsSummary {
            tasks_completed: state.completions,
            tasks_failed: state.failures,
            success_rate,
            avg_duration_ms,
            metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_summary() {
        let analytics = Analytics::new();
        let summary = analytics.summary();
        assert_eq!(summary.tasks_completed, 0);
        assert_eq!(summary.tasks_failed, 0);
        assert_eq!(summary.success_rate, 0.0);
        assert_eq!(summary.avg_duration_ms, 0.0);
    }

    #[test]
    fn test_completion_aggregation() {
        let analytics = Analytics::new();
        analytics.record_task_completion(100, true);
        analytics.record_task_completion(300, true);
        analytics.record_task_completion(200, false);

        let summary = analytics.summary();
        assert_eq!(summary.tasks_completed, 2);
        assert_eq!(summary.tasks_failed, 1);
        assert!((summary.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((summary.avg_duration_ms - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_named_metrics() {
        let analytics = Analytics::new();
        analytics.record_metric("capability_research_score", 0.4);
        analytics.record_metric("capability_research_score", 0.8);
        analytics.record_metric("capability_research_score", f64::NAN);

        let summary = analytics.summary();
        let metric = &summary.metrics["capability_research_score"];
        assert_eq!(metric.count, 2);
        assert!((metric.mean - 0.6).abs() < 1e-9);
    }
}
