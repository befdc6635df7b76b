//! Per-run telemetry aggregation keyed by trace id.
//!
//! The collector records one `ExecutionMetric` per linter task. A run's
//! tasks share the root trace id, so metrics are stored as a vector per
//! trace id with the task's own span id preserved on each entry. A
//! disabled collector silently drops everything.

use crate::trace::TraceContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// Handle returned by [`TelemetryCollector::start`]; carries the start
/// instant and the identifiers the eventual metric is recorded under.
#[derive(Debug)]
pub struct ExecutionHandle {
    linter_id: String,
    trace_id: String,
    span_id: String,
    started: Instant,
}

/// One recorded linter execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetric {
    pub linter_id: String,
    pub trace_id: String,
    pub span_id: String,
    pub duration_ms: u64,
    pub output_bytes: u64,
    pub success: bool,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Aggregate statistics over a (possibly filtered) metric set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub total_output_bytes: u64,
    pub min_duration_ms: u64,
    pub mean_duration_ms: u64,
    pub max_duration_ms: u64,
}

/// Serialization contract for persisting a run's telemetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryExport {
    pub version: String,
    pub collected_at: DateTime<Utc>,
    pub metrics: Vec<ExecutionMetric>,
    pub stats: TelemetryStats,
}

const EXPORT_VERSION: &str = "1.0";

/// In-memory, single-process metric store shared by a run's tasks.
pub struct TelemetryCollector {
    enabled: bool,
    metrics: Mutex<HashMap<String, Vec<ExecutionMetric>>>,
}

impl TelemetryCollector {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            metrics: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Record the start of a linter execution.
    pub fn start(&self, linter_id: &str, ctx: &TraceContext) -> ExecutionHandle {
        ExecutionHandle {
            linter_id: linter_id.to_string(),
            trace_id: ctx.trace_id.clone(),
            span_id: ctx.span_id.clone(),
            started: Instant::now(),
        }
    }

    /// Record a finished execution. Dropped silently when disabled.
    pub fn record(
        &self,
        handle: ExecutionHandle,
        output_bytes: u64,
        success: bool,
        error: Option<String>,
    ) {
        if !self.enabled {
            return;
        }
        let metric = ExecutionMetric {
            linter_id: handle.linter_id,
            trace_id: handle.trace_id.clone(),
            span_id: handle.span_id,
            duration_ms: handle.started.elapsed().as_millis() as u64,
            output_bytes,
            success,
            error,
            recorded_at: Utc::now(),
        };
        self.lock_metrics()
            .entry(handle.trace_id)
            .or_default()
            .push(metric);
    }

    /// All metrics recorded under a trace id; empty for unknown keys or a
    /// disabled collector.
    pub fn metrics_for(&self, trace_id: &str) -> Vec<ExecutionMetric> {
        self.lock_metrics()
            .get(trace_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Derive stats over the metric set, optionally filtered. An empty set
    /// yields all-zero stats.
    pub fn stats(&self, filter: Option<&dyn Fn(&ExecutionMetric) -> bool>) -> TelemetryStats {
        let metrics = self.lock_metrics();
        let selected: Vec<&ExecutionMetric> = metrics
            .values()
            .flatten()
            .filter(|m| filter.map(|f| f(m)).unwrap_or(true))
            .collect();
        if selected.is_empty() {
            return TelemetryStats::default();
        }
        let durations: Vec<u64> = selected.iter().map(|m| m.duration_ms).collect();
        let total = selected.len();
        TelemetryStats {
            total,
            succeeded: selected.iter().filter(|m| m.success).count(),
            failed: selected.iter().filter(|m| !m.success).count(),
            total_output_bytes: selected.iter().map(|m| m.output_bytes).sum(),
            min_duration_ms: durations.iter().copied().min().unwrap_or(0),
            mean_duration_ms: durations.iter().sum::<u64>() / total as u64,
            max_duration_ms: durations.iter().copied().max().unwrap_or(0),
        }
    }

    /// Snapshot the full metric set for persistence by the caller.
    pub fn export(&self) -> TelemetryExport {
        let metrics: Vec<ExecutionMetric> = {
            let map = self.lock_metrics();
            let mut all: Vec<ExecutionMetric> = map.values().flatten().cloned().collect();
            all.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at));
            all
        };
        TelemetryExport {
            version: EXPORT_VERSION.to_string(),
            collected_at: Utc::now(),
            metrics,
            stats: self.stats(None),
        }
    }

    fn lock_metrics(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<ExecutionMetric>>> {
        self.metrics
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record_one(collector: &TelemetryCollector, ctx: &TraceContext, id: &str, success: bool) {
        let handle = collector.start(id, ctx);
        collector.record(handle, 100, success, (!success).then(|| "boom".to_string()));
    }

    #[test]
    fn records_are_keyed_by_trace_id() {
        let collector = TelemetryCollector::new(true);
        let root = TraceContext::root();
        record_one(&collector, &root.child(), "eslint", true);
        record_one(&collector, &root.child(), "knip", false);

        let metrics = collector.metrics_for(&root.trace_id);
        assert_eq!(metrics.len(), 2);
        assert!(metrics.iter().all(|m| m.trace_id == root.trace_id));
        assert_ne!(metrics[0].span_id, metrics[1].span_id);
    }

    #[test]
    fn disabled_collector_drops_records() {
        let collector = TelemetryCollector::new(false);
        let ctx = TraceContext::root();
        record_one(&collector, &ctx, "eslint", true);
        assert!(collector.metrics_for(&ctx.trace_id).is_empty());
        assert_eq!(collector.stats(None), TelemetryStats::default());
    }

    #[test]
    fn unknown_trace_id_yields_empty_metrics() {
        let collector = TelemetryCollector::new(true);
        assert!(collector.metrics_for("deadbeef").is_empty());
    }

    #[test]
    fn stats_over_empty_set_are_all_zero() {
        let collector = TelemetryCollector::new(true);
        let stats = collector.stats(None);
        assert_eq!(stats.total, 0);
        assert_eq!(stats.min_duration_ms, 0);
        assert_eq!(stats.mean_duration_ms, 0);
        assert_eq!(stats.max_duration_ms, 0);
    }

    #[test]
    fn stats_count_successes_and_failures() {
        let collector = TelemetryCollector::new(true);
        let root = TraceContext::root();
        record_one(&collector, &root.child(), "eslint", true);
        record_one(&collector, &root.child(), "prettier", true);
        record_one(&collector, &root.child(), "knip", false);

        let stats = collector.stats(None);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total_output_bytes, 300);
    }

    #[test]
    fn stats_respect_filter() {
        let collector = TelemetryCollector::new(true);
        let root = TraceContext::root();
        record_one(&collector, &root.child(), "eslint", true);
        record_one(&collector, &root.child(), "knip", false);

        let failures_only = collector.stats(Some(&|m: &ExecutionMetric| !m.success));
        assert_eq!(failures_only.total, 1);
        assert_eq!(failures_only.failed, 1);
    }

    #[test]
    fn duration_reflects_elapsed_time() {
        let collector = TelemetryCollector::new(true);
        let ctx = TraceContext::root();
        let handle = collector.start("eslint", &ctx);
        std::thread::sleep(Duration::from_millis(15));
        collector.record(handle, 0, true, None);
        let metrics = collector.metrics_for(&ctx.trace_id);
        assert!(metrics[0].duration_ms >= 10);
    }

    #[test]
    fn export_carries_version_and_stats() {
        let collector = TelemetryCollector::new(true);
        let root = TraceContext::root();
        record_one(&collector, &root.child(), "eslint", true);

        let export = collector.export();
        assert_eq!(export.version, "1.0");
        assert_eq!(export.metrics.len(), 1);
        assert_eq!(export.stats.total, 1);

        let json = serde_json::to_string(&export).unwrap();
        assert!(json.contains("\"collectedAt\""));
        assert!(json.contains("\"durationMs\""));
    }
}
