//! Per-tool append-only log files.

use anyhow::{Context, Result};
use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Where a tool's log lives under the log directory.
pub fn log_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{id}.log"))
}

/// Append a timestamped entry to the tool's log file, creating the
/// directory and file as needed. Returns the log path.
pub fn append_to_log(dir: &Path, id: &str, message: &str) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    let path = log_path(dir, id);
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open log file {}", path.display()))?;
    writeln!(file, "--- {} ---", Utc::now().to_rfc3339())
        .and_then(|_| writeln!(file, "{}", message.trim_end()))
        .with_context(|| format!("Failed to write log file {}", path.display()))?;
    Ok(path)
}
