//! Run control flow: acquire the execution lock, fan out the fleet,
//! write the telemetry export, release the lock unconditionally.

use crate::errors::{ExecError, LockError};
use crate::executor::{ExecutorOptions, LinterExecutor, StatusCallback};
use crate::incremental::{GitChangeProvider, IncrementalTracker};
use crate::lock::{ExecutionLock, LockOptions};
use crate::registry::{self, LinterConfig};
use crate::runner::{self, ExecutionSummary, ParallelRunner};
use crate::telemetry::TelemetryCollector;
use crate::trace::TraceContext;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use uuid::Uuid;

pub struct RunOptions {
    pub project_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Restrict the run to these linter ids; empty means the whole fleet.
    pub only: Vec<String>,
    pub concurrency: Option<usize>,
    pub incremental: bool,
    pub telemetry_out: Option<PathBuf>,
    pub lock: LockOptions,
    /// Bound on how long to wait for the execution lock; `None` waits
    /// indefinitely.
    pub lock_wait_timeout: Option<Duration>,
    pub on_status_change: Option<StatusCallback>,
}

impl RunOptions {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        let project_dir = project_dir.into();
        let log_dir = project_dir.join(".lintrun").join("logs");
        Self {
            project_dir,
            log_dir,
            only: Vec::new(),
            concurrency: None,
            incremental: true,
            telemetry_out: None,
            lock: LockOptions::default(),
            lock_wait_timeout: None,
            on_status_change: None,
        }
    }

    pub fn with_only(mut self, ids: Vec<String>) -> Self {
        self.only = ids;
        self
    }

    pub fn with_lock(mut self, lock: LockOptions) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }

    pub fn with_telemetry_out(mut self, path: impl Into<PathBuf>) -> Self {
        self.telemetry_out = Some(path.into());
        self
    }

    pub fn with_lock_wait_timeout(mut self, limit: Duration) -> Self {
        self.lock_wait_timeout = Some(limit);
        self
    }
}

#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub trace: TraceContext,
    pub results: Vec<crate::executor::LinterResult>,
    pub summary: ExecutionSummary,
}

/// Execute a full orchestrator run. The lock is released before this
/// returns no matter how the run itself went.
pub async fn run(mut options: RunOptions) -> Result<RunOutcome> {
    let linters = select_linters(&options.only)?;

    let lock_options = std::mem::take(&mut options.lock);
    let lock_path = lock_options.path.clone();
    let mut guard = match options.lock_wait_timeout {
        Some(limit) => tokio::time::timeout(limit, ExecutionLock::acquire(lock_options))
            .await
            .map_err(|_| LockError::WaitTimeout {
                path: lock_path,
                waited: limit,
            })??,
        None => ExecutionLock::acquire(lock_options).await?,
    };
    let run_result = run_locked(&options, linters).await;
    let release_result = guard.release();

    let outcome = run_result?;
    release_result?;
    Ok(outcome)
}

async fn run_locked(options: &RunOptions, linters: Vec<LinterConfig>) -> Result<RunOutcome> {
    let started = Instant::now();
    let run_id = Uuid::new_v4();
    let trace = TraceContext::root();
    info!(
        %run_id,
        traceparent = %trace.traceparent(),
        linters = linters.len(),
        "starting lint run"
    );

    let telemetry = Arc::new(TelemetryCollector::new(true));
    let mut executor = LinterExecutor::new(
        ExecutorOptions::new(&options.project_dir, &options.log_dir),
        Arc::new(crate::executor::spawn::TokioProcessRunner::new(
            &options.project_dir,
        )),
        telemetry.clone(),
        trace.clone(),
    );
    if options.incremental {
        executor = executor.with_tracker(Arc::new(IncrementalTracker::new(Box::new(
            GitChangeProvider::new(&options.project_dir),
        ))));
    }
    if let Some(callback) = &options.on_status_change {
        executor = executor.with_status_callback(callback.clone());
    }

    let concurrency = options
        .concurrency
        .unwrap_or_else(runner::default_concurrency);
    let parallel = ParallelRunner::new(Arc::new(executor), concurrency);
    let results = parallel.run_all(&linters).await?;

    let summary = runner::calculate_summary(&results, started.elapsed());
    info!(
        passed = summary.passed,
        failed = summary.failed,
        errors = summary.errors,
        total = summary.total,
        "lint run finished"
    );

    if let Some(path) = &options.telemetry_out {
        let export = telemetry.export();
        let json = serde_json::to_string_pretty(&export)
            .context("Failed to serialize telemetry export")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write telemetry export {}", path.display()))?;
    }

    Ok(RunOutcome {
        run_id,
        trace,
        results,
        summary,
    })
}

fn select_linters(only: &[String]) -> Result<Vec<LinterConfig>> {
    if only.is_empty() {
        return Ok(registry::all_linters());
    }
    only.iter()
        .map(|id| {
            registry::linter_by_id(id).ok_or_else(|| {
                ExecError::UnknownLinter { id: id.clone() }.into()
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn lock_wait_timeout_surfaces_as_a_lock_error() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("run.lock");
        let _holder = ExecutionLock::acquire(
            LockOptions::default()
                .with_path(&lock_path)
                .with_signal_handling(false),
        )
        .await
        .unwrap();

        let options = RunOptions::new(dir.path())
            .with_lock(
                LockOptions::default()
                    .with_path(&lock_path)
                    .with_poll_interval(Duration::from_millis(10))
                    .with_signal_handling(false),
            )
            .with_lock_wait_timeout(Duration::from_millis(50));

        let err = run(options).await.unwrap_err();
        let lock_err = err.downcast_ref::<LockError>().expect("LockError downcast");
        assert!(matches!(lock_err, LockError::WaitTimeout { .. }));
    }

    #[test]
    fn select_defaults_to_whole_fleet() {
        let linters = select_linters(&[]).unwrap();
        assert_eq!(linters.len(), registry::all_linters().len());
    }

    #[test]
    fn select_honors_only_and_rejects_unknown_ids() {
        let linters = select_linters(&["eslint".to_string(), "knip".to_string()]).unwrap();
        assert_eq!(linters.len(), 2);
        assert_eq!(linters[0].id, "eslint");

        let err = select_linters(&["frobnicator".to_string()]).unwrap_err();
        assert!(err.to_string().contains("frobnicator"));
    }
}
