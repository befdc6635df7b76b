//! Typed error hierarchy for the lintrun orchestrator.
//!
//! Two top-level enums cover the two fallible subsystems:
//! - `LockError` — execution-lock acquire/release failures (fatal to the run)
//! - `ExecError` — executor pipeline faults that must propagate to the caller
//!
//! Per-task linter failures are not errors at this level; they are folded
//! into a `LinterResult` with status `Error` and the run continues.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors from the cross-process execution lock.
///
/// The expected conditions ("file already exists" while waiting, "file
/// already gone" on release) are handled internally and never surface here;
/// anything that does surface aborts the run.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Failed to create lock file at {}: {source}", .path.display())]
    Acquire {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read lock file at {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove lock file at {}: {source}", .path.display())]
    Release {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out waiting for lock file at {} after {}ms", .path.display(), .waited.as_millis())]
    WaitTimeout { path: PathBuf, waited: Duration },
}

/// Errors from the task executor and parallel runner.
///
/// These indicate programming faults or infrastructure failures, not linter
/// findings; they are recorded in telemetry and re-raised rather than being
/// downgraded to a per-task `Error` status.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Unknown linter id: {id}")]
    UnknownLinter { id: String },

    #[error("Linter task panicked: {0}")]
    TaskPanicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
