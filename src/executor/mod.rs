//! Single-task execution pipeline.
//!
//! Per linter: incremental decision → skip check → binary check → version
//! probe → spawn with timeout and retry → status determination. Every
//! terminal outcome (a skip and a cancellation included) produces exactly
//! one telemetry record and one status-change notification. Unexpected faults are
//! telemetry-recorded and re-raised, never downgraded to a per-task
//! `Error` status.

pub mod spawn;
pub mod status;

use crate::errors::ExecError;
use crate::incremental::IncrementalTracker;
use crate::logs;
use crate::registry::{LinterConfig, LinterMode};
use crate::telemetry::TelemetryCollector;
use crate::trace::TraceContext;
use serde::{Deserialize, Serialize};
use spawn::{ProcessRunner, SpawnOutcome, is_transient};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lifecycle states of one linter task. Terminal states are final; a retry
/// re-enters at the spawn step, never at the status level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinterStatus {
    Pending,
    Running,
    Pass,
    Fail,
    Error,
    Skipped,
}

impl LinterStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LinterStatus::Pass | LinterStatus::Fail | LinterStatus::Error | LinterStatus::Skipped
        )
    }
}

impl fmt::Display for LinterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinterStatus::Pending => "PENDING",
            LinterStatus::Running => "RUNNING",
            LinterStatus::Pass => "PASS",
            LinterStatus::Fail => "FAIL",
            LinterStatus::Error => "ERROR",
            LinterStatus::Skipped => "SKIPPED",
        };
        f.write_str(s)
    }
}

/// Terminal record of one linter task. Created exactly once, never mutated.
#[derive(Debug, Clone, Serialize)]
pub struct LinterResult {
    pub id: String,
    pub name: String,
    pub status: LinterStatus,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub duration: Duration,
    pub log_path: PathBuf,
}

/// Status-change notification seam consumed by the UI layer.
pub type StatusCallback = Arc<dyn Fn(&str, LinterStatus) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub project_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Additional spawn attempts after the first transient failure.
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub version_probe_timeout: Duration,
    /// Freshness window handed to the incremental tracker.
    pub check_interval: Duration,
}

impl ExecutorOptions {
    pub fn new(project_dir: impl Into<PathBuf>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            log_dir: log_dir.into(),
            retry_count: 2,
            retry_delay: Duration::from_millis(1000),
            version_probe_timeout: Duration::from_secs(10),
            check_interval: crate::incremental::DEFAULT_CHECK_INTERVAL,
        }
    }

    pub fn with_retry(mut self, count: u32, delay: Duration) -> Self {
        self.retry_count = count;
        self.retry_delay = delay;
        self
    }
}

struct PipelineOutcome {
    status: LinterStatus,
    exit_code: Option<i32>,
    error: Option<String>,
    output_bytes: u64,
}

impl PipelineOutcome {
    fn skipped(reason: String) -> Self {
        Self {
            status: LinterStatus::Skipped,
            exit_code: None,
            error: Some(reason),
            output_bytes: 0,
        }
    }

    fn error(message: String) -> Self {
        Self {
            status: LinterStatus::Error,
            exit_code: None,
            error: Some(message),
            output_bytes: 0,
        }
    }
}

/// Runs one linter through the full pipeline.
pub struct LinterExecutor {
    options: ExecutorOptions,
    runner: Arc<dyn ProcessRunner>,
    telemetry: Arc<TelemetryCollector>,
    tracker: Option<Arc<IncrementalTracker>>,
    trace: TraceContext,
    on_status_change: Option<StatusCallback>,
}

impl LinterExecutor {
    pub fn new(
        options: ExecutorOptions,
        runner: Arc<dyn ProcessRunner>,
        telemetry: Arc<TelemetryCollector>,
        trace: TraceContext,
    ) -> Self {
        Self {
            options,
            runner,
            telemetry,
            tracker: None,
            trace,
            on_status_change: None,
        }
    }

    /// Enable change-based incremental skipping.
    pub fn with_tracker(mut self, tracker: Arc<IncrementalTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn with_status_callback(mut self, callback: StatusCallback) -> Self {
        self.on_status_change = Some(callback);
        self
    }

    pub fn log_path(&self, id: &str) -> PathBuf {
        logs::log_path(&self.options.log_dir, id)
    }

    /// Execute one linter to a terminal result.
    pub async fn execute(&self, config: &LinterConfig) -> Result<LinterResult, ExecError> {
        self.execute_cancellable(config, &CancellationToken::new())
            .await
    }

    /// Execute one linter under a cancellation signal. A cancelled task
    /// still settles to a terminal `Error` through the same exit point, so
    /// it is telemetry-recorded and notified like any other outcome; an
    /// in-flight process is terminated gracefully.
    pub async fn execute_cancellable(
        &self,
        config: &LinterConfig,
        cancel: &CancellationToken,
    ) -> Result<LinterResult, ExecError> {
        let ctx = self.trace.child();
        let handle = self.telemetry.start(config.id, &ctx);
        let started = Instant::now();
        debug!(id = config.id, traceparent = %ctx.traceparent(), "executing linter");

        match self.run_pipeline(config, cancel).await {
            Ok(outcome) => {
                let success =
                    matches!(outcome.status, LinterStatus::Pass | LinterStatus::Skipped);
                self.telemetry
                    .record(handle, outcome.output_bytes, success, outcome.error.clone());
                self.notify(config.id, outcome.status);
                Ok(LinterResult {
                    id: config.id.to_string(),
                    name: config.name.to_string(),
                    status: outcome.status,
                    exit_code: outcome.exit_code,
                    error: outcome.error,
                    duration: started.elapsed(),
                    log_path: self.log_path(config.id),
                })
            }
            Err(e) => {
                self.telemetry.record(handle, 0, false, Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn run_pipeline(
        &self,
        config: &LinterConfig,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome, ExecError> {
        if cancel.is_cancelled() {
            return Ok(PipelineOutcome::error("cancelled".to_string()));
        }

        if let Some(tracker) = &self.tracker {
            let decision = tracker.decision(config.id, self.options.check_interval);
            if !decision.should_execute {
                return Ok(PipelineOutcome::skipped(decision.reason));
            }
        }

        // Custom skip check wins over the registry's generic heuristic.
        let skip_rule = config
            .skip_check
            .as_ref()
            .or_else(|| status::generic_skip_rule(config.id));
        if let Some(rule) = skip_rule
            && let Some(reason) = rule.evaluate(&self.options.project_dir)
        {
            return Ok(PipelineOutcome::skipped(reason));
        }

        if config.mode == LinterMode::Direct && !self.runner.binary_exists(config.binary) {
            return Ok(PipelineOutcome::error(format!(
                "binary not found: {}",
                config.binary
            )));
        }

        if let Some(expected) = config.expected_version
            && let Some(message) = self.check_version(config, expected, cancel).await
        {
            return Ok(PipelineOutcome::error(message));
        }

        self.notify(config.id, LinterStatus::Running);
        let outcome = match self.spawn_with_retry(config, cancel).await {
            Ok(o) => o,
            Err(e) => return Ok(PipelineOutcome::error(format!("spawn failed: {e}"))),
        };

        let output_bytes = outcome.output.len() as u64;
        logs::append_to_log(&self.options.log_dir, config.id, &outcome.output)
            .map_err(ExecError::from)?;

        if outcome.cancelled {
            return Ok(PipelineOutcome {
                status: LinterStatus::Error,
                exit_code: outcome.exit_code,
                error: Some("cancelled".to_string()),
                output_bytes,
            });
        }

        if outcome.timed_out {
            return Ok(PipelineOutcome {
                status: LinterStatus::Error,
                exit_code: outcome.exit_code,
                error: Some(format!("timed out after {}ms", config.timeout.as_millis())),
                output_bytes,
            });
        }

        let exit_code = outcome.exit_code.unwrap_or(-1);
        let terminal = status::determine_status(config.id, exit_code, &outcome.output);
        Ok(PipelineOutcome {
            status: terminal,
            exit_code: Some(exit_code),
            error: None,
            output_bytes,
        })
    }

    async fn spawn_with_retry(
        &self,
        config: &LinterConfig,
        cancel: &CancellationToken,
    ) -> io::Result<SpawnOutcome> {
        let mut attempt: u32 = 0;
        loop {
            match self
                .runner
                .spawn(
                    config.binary,
                    &config.args,
                    config.mode,
                    config.timeout,
                    cancel,
                )
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(e) if attempt < self.options.retry_count && is_transient(&e) => {
                    attempt += 1;
                    warn!(id = config.id, attempt, error = %e, "transient spawn failure, retrying");
                    tokio::time::sleep(self.options.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Returns an error message when the probe fails or the version does
    /// not match; `None` means the version is acceptable.
    async fn check_version(
        &self,
        config: &LinterConfig,
        expected: &str,
        cancel: &CancellationToken,
    ) -> Option<String> {
        let probe_args = config
            .version_probe
            .clone()
            .unwrap_or_else(|| vec!["--version".to_string()]);
        match self
            .runner
            .spawn(
                config.binary,
                &probe_args,
                LinterMode::Direct,
                self.options.version_probe_timeout,
                cancel,
            )
            .await
        {
            Ok(o) if o.timed_out => Some(format!("version probe timed out for {}", config.binary)),
            Ok(o) if o.exit_code != Some(0) => Some(format!(
                "version probe failed for {} (exit {:?})",
                config.binary, o.exit_code
            )),
            Ok(o) => {
                if o.output.contains(expected) {
                    None
                } else {
                    Some(format!(
                        "version mismatch for {}: expected {}, got {}",
                        config.binary,
                        expected,
                        o.output.lines().next().unwrap_or("").trim()
                    ))
                }
            }
            Err(e) => Some(format!("version probe failed for {}: {e}", config.binary)),
        }
    }

    fn notify(&self, id: &str, status: LinterStatus) {
        if let Some(callback) = &self.on_status_change {
            callback(id, status);
        }
    }
}
