//! Parallel coordinator: fans the task executor out over the configured
//! fleet under a bounded concurrency and aggregates a run summary.
//!
//! Output order always matches input order regardless of completion order.
//! A single task's `Fail`/`Error` never aborts the run; only a re-raised
//! unexpected fault does.

use crate::errors::ExecError;
use crate::executor::{LinterExecutor, LinterResult, LinterStatus};
use crate::registry::LinterConfig;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Aggregate counts over a run. Derived, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub errors: usize,
    pub duration: Duration,
}

/// Pure reduction over a result list.
pub fn calculate_summary(results: &[LinterResult], total_duration: Duration) -> ExecutionSummary {
    ExecutionSummary {
        total: results.len(),
        passed: results
            .iter()
            .filter(|r| r.status == LinterStatus::Pass)
            .count(),
        failed: results
            .iter()
            .filter(|r| r.status == LinterStatus::Fail)
            .count(),
        errors: results
            .iter()
            .filter(|r| r.status == LinterStatus::Error)
            .count(),
        duration: total_duration,
    }
}

/// Default concurrency bound: all cores but one, floor of one.
pub fn default_concurrency() -> usize {
    std::cmp::max(1, num_cpus::get().saturating_sub(1))
}

pub struct ParallelRunner {
    executor: Arc<LinterExecutor>,
    concurrency: usize,
    cancel: CancellationToken,
}

impl ParallelRunner {
    pub fn new(executor: Arc<LinterExecutor>, concurrency: usize) -> Self {
        Self {
            executor,
            concurrency: concurrency.max(1),
            cancel: CancellationToken::new(),
        }
    }

    /// Install an externally supplied cancellation signal. Cancellation is
    /// settled by the executor: not-yet-started tasks end as
    /// `ERROR: cancelled`, in-flight processes are terminated gracefully,
    /// and every task still gets its telemetry record and terminal
    /// notification.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Execute every configured linter, preserving input ordering.
    pub async fn run_all(&self, configs: &[LinterConfig]) -> Result<Vec<LinterResult>, ExecError> {
        debug!(
            linters = configs.len(),
            concurrency = self.concurrency,
            "starting parallel run"
        );
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::with_capacity(configs.len());

        for config in configs.iter().cloned() {
            let semaphore = semaphore.clone();
            let executor = self.executor.clone();
            let cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| ExecError::Other(e.into()))?;
                executor.execute_cancellable(&config, &cancel).await
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            let result = handle
                .await
                .map_err(|e| ExecError::TaskPanicked(e.to_string()))??;
            results.push(result);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorOptions;
    use crate::executor::spawn::{ProcessRunner, SpawnOutcome};
    use crate::registry::LinterMode;
    use crate::telemetry::TelemetryCollector;
    use crate::trace::TraceContext;
    use async_trait::async_trait;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Runner that tracks how many spawns are in flight simultaneously.
    struct GaugeRunner {
        current: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
    }

    impl GaugeRunner {
        fn new(delay: Duration) -> Self {
            Self {
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delay,
            }
        }
    }

    #[async_trait]
    impl ProcessRunner for GaugeRunner {
        async fn spawn(
            &self,
            binary: &str,
            _args: &[String],
            _mode: LinterMode,
            _limit: Duration,
            _cancel: &CancellationToken,
        ) -> io::Result<SpawnOutcome> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(SpawnOutcome {
                exit_code: Some(if binary.ends_with("fail") { 1 } else { 0 }),
                timed_out: false,
                cancelled: false,
                output: String::new(),
            })
        }

        fn binary_exists(&self, _binary: &str) -> bool {
            true
        }
    }

    fn configs(n: usize) -> Vec<LinterConfig> {
        const IDS: &[&str] = &[
            "t0", "t1", "t2", "t3", "t4", "t5", "t6", "t7", "t8", "t9",
        ];
        IDS[..n]
            .iter()
            .map(|id| LinterConfig::new(id, id, "tool", &[], 30))
            .collect()
    }

    fn build_runner(
        runner: Arc<dyn ProcessRunner>,
        dir: &std::path::Path,
        concurrency: usize,
    ) -> ParallelRunner {
        let executor = Arc::new(LinterExecutor::new(
            ExecutorOptions::new(dir, dir.join("logs")),
            runner,
            Arc::new(TelemetryCollector::new(true)),
            TraceContext::root(),
        ));
        ParallelRunner::new(executor, concurrency)
    }

    #[tokio::test]
    async fn concurrency_bound_is_never_exceeded() {
        let dir = tempdir().unwrap();
        let gauge = Arc::new(GaugeRunner::new(Duration::from_millis(30)));
        let runner = build_runner(gauge.clone(), dir.path(), 2);

        let results = runner.run_all(&configs(10)).await.unwrap();
        assert_eq!(results.len(), 10);
        assert!(gauge.peak.load(Ordering::SeqCst) <= 2);
        assert!(gauge.peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn results_preserve_input_order() {
        let dir = tempdir().unwrap();
        let gauge = Arc::new(GaugeRunner::new(Duration::from_millis(5)));
        let runner = build_runner(gauge, dir.path(), 4);

        let input = configs(8);
        let results = runner.run_all(&input).await.unwrap();
        let result_ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
        let input_ids: Vec<&str> = input.iter().map(|c| c.id).collect();
        assert_eq!(result_ids, input_ids);
    }

    #[tokio::test]
    async fn failures_do_not_abort_the_run() {
        let dir = tempdir().unwrap();
        let gauge = Arc::new(GaugeRunner::new(Duration::from_millis(1)));
        let runner = build_runner(gauge, dir.path(), 2);

        let mut input = configs(3);
        input[1] = LinterConfig::new("t1", "t1", "tool-fail", &[], 30);
        let results = runner.run_all(&input).await.unwrap();
        assert_eq!(results[0].status, LinterStatus::Pass);
        assert_eq!(results[1].status, LinterStatus::Fail);
        assert_eq!(results[2].status, LinterStatus::Pass);
    }

    #[tokio::test]
    async fn cancelled_tasks_still_record_telemetry_and_notify() {
        use std::sync::Mutex;

        let dir = tempdir().unwrap();
        let telemetry = Arc::new(TelemetryCollector::new(true));
        let trace = TraceContext::root();
        let terminal: Arc<Mutex<Vec<(String, LinterStatus)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = terminal.clone();
        let executor = Arc::new(
            LinterExecutor::new(
                ExecutorOptions::new(dir.path(), dir.path().join("logs")),
                Arc::new(GaugeRunner::new(Duration::from_millis(50))),
                telemetry.clone(),
                trace.clone(),
            )
            .with_status_callback(Arc::new(move |id, status| {
                if status.is_terminal() {
                    sink.lock().unwrap().push((id.to_string(), status));
                }
            })),
        );
        let token = CancellationToken::new();
        let runner = ParallelRunner::new(executor, 1).with_cancellation(token.clone());

        let input = configs(4);
        let run = tokio::spawn(async move { runner.run_all(&input).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        let results = run.await.unwrap().unwrap();
        assert_eq!(results.len(), 4);
        assert!(
            results
                .iter()
                .any(|r| r.error.as_deref() == Some("cancelled"))
        );

        // One telemetry record and one terminal notification per task,
        // cancelled tasks included.
        let metrics = telemetry.metrics_for(&trace.trace_id);
        assert_eq!(metrics.len(), results.len());
        assert_eq!(terminal.lock().unwrap().len(), results.len());
    }

    #[tokio::test]
    async fn cancellation_errors_pending_tasks() {
        let dir = tempdir().unwrap();
        let gauge = Arc::new(GaugeRunner::new(Duration::from_millis(50)));
        let token = CancellationToken::new();
        let runner = build_runner(gauge, dir.path(), 1).with_cancellation(token.clone());

        let input = configs(4);
        let run = tokio::spawn(async move { runner.run_all(&input).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        let results = run.await.unwrap().unwrap();
        assert_eq!(results.len(), 4);
        assert!(
            results
                .iter()
                .any(|r| r.error.as_deref() == Some("cancelled")),
            "at least the queued tasks resolve as cancelled"
        );
    }

    #[test]
    fn summary_arithmetic() {
        let dir = tempdir().unwrap();
        let result = |status| LinterResult {
            id: "x".to_string(),
            name: "x".to_string(),
            status,
            exit_code: None,
            error: None,
            duration: Duration::from_millis(250),
            log_path: dir.path().join("x.log"),
        };
        let results = vec![
            result(LinterStatus::Pass),
            result(LinterStatus::Fail),
            result(LinterStatus::Error),
            result(LinterStatus::Skipped),
        ];
        let summary = calculate_summary(&results, Duration::from_millis(1000));
        assert_eq!(summary.total, 4);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.duration, Duration::from_millis(1000));
    }

    #[test]
    fn summary_of_empty_run_is_zero() {
        let summary = calculate_summary(&[], Duration::ZERO);
        assert_eq!(summary.total, 0);
        assert_eq!(summary.passed, 0);
    }

    #[test]
    fn default_concurrency_has_a_floor_of_one() {
        assert!(default_concurrency() >= 1);
    }
}
