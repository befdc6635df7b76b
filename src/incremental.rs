//! Change-based incremental skip tracking.
//!
//! Each linter id maps to a set of glob patterns describing the files it
//! cares about. A decision compares the repository's current state against
//! the last check for that id: inside the freshness window with an
//! unchanged state digest, the expensive diff is skipped entirely and the
//! linter is reported as skippable. Any failure along the way is treated
//! as "assume changed" so the tracker can never silently drop work.

use anyhow::Result;
use chrono::{DateTime, Utc};
use git2::{DiffOptions, Repository, StatusOptions};
use glob::Pattern;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Outcome of an incremental check for one linter id.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionDecision {
    pub should_execute: bool,
    pub reason: String,
    pub checked_at: DateTime<Utc>,
}

impl ExecutionDecision {
    fn execute(reason: impl Into<String>) -> Self {
        Self {
            should_execute: true,
            reason: reason.into(),
            checked_at: Utc::now(),
        }
    }

    fn skip(reason: impl Into<String>) -> Self {
        Self {
            should_execute: false,
            reason: reason.into(),
            checked_at: Utc::now(),
        }
    }
}

/// Source of repository change information.
///
/// Injected so tests can substitute a scripted provider and count diff
/// invocations without a real repository.
pub trait ChangeProvider: Send + Sync {
    /// Whether version control is usable at all.
    fn is_available(&self) -> bool;

    /// Cheap digest of overall repository state (head plus status list).
    fn state_digest(&self) -> Result<String>;

    /// Paths changed relative to the current head, untracked included.
    fn changed_files(&self) -> Result<Vec<PathBuf>>;
}

/// Production provider built on git2.
pub struct GitChangeProvider {
    repo_dir: PathBuf,
}

impl GitChangeProvider {
    pub fn new(repo_dir: impl AsRef<Path>) -> Self {
        Self {
            repo_dir: repo_dir.as_ref().to_path_buf(),
        }
    }
}

impl ChangeProvider for GitChangeProvider {
    fn is_available(&self) -> bool {
        Repository::open(&self.repo_dir).is_ok()
    }

    fn state_digest(&self) -> Result<String> {
        let repo = Repository::open(&self.repo_dir)?;
        let head = repo
            .head()
            .ok()
            .and_then(|h| h.peel_to_commit().ok())
            .map(|c| c.id().to_string())
            .unwrap_or_default();

        let mut opts = StatusOptions::new();
        opts.include_untracked(true);
        let statuses = repo.statuses(Some(&mut opts))?;

        let mut hasher = Sha256::new();
        hasher.update(head.as_bytes());
        for entry in statuses.iter() {
            if let Some(path) = entry.path() {
                hasher.update(path.as_bytes());
                hasher.update(entry.status().bits().to_le_bytes());
            }
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    fn changed_files(&self) -> Result<Vec<PathBuf>> {
        let repo = Repository::open(&self.repo_dir)?;
        // Unborn branch: diff against an empty tree baseline.
        let head_tree = repo.head().ok().and_then(|h| h.peel_to_tree().ok());

        let mut opts = DiffOptions::new();
        opts.include_untracked(true);
        let diff = repo.diff_tree_to_workdir_with_index(head_tree.as_ref(), Some(&mut opts))?;

        let mut files = Vec::new();
        diff.foreach(
            &mut |delta, _progress| {
                if let Some(path) = delta.new_file().path() {
                    files.push(path.to_path_buf());
                }
                true
            },
            None,
            None,
            None,
        )?;
        Ok(files)
    }
}

struct CacheEntry {
    digest: String,
    fingerprint: String,
    checked_at: Instant,
}

/// Per-linter incremental skip tracker.
pub struct IncrementalTracker {
    provider: Box<dyn ChangeProvider>,
    patterns: Mutex<HashMap<String, Vec<Pattern>>>,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

/// Default freshness window for cached decisions.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

impl IncrementalTracker {
    pub fn new(provider: Box<dyn ChangeProvider>) -> Self {
        Self {
            provider,
            patterns: Mutex::new(builtin_patterns()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Register or replace the file patterns for a linter id.
    pub fn register_patterns(&self, id: &str, patterns: &[&str]) -> Result<()> {
        let compiled = patterns
            .iter()
            .map(|p| Pattern::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        self.lock_patterns().insert(id.to_string(), compiled);
        Ok(())
    }

    /// Decide whether the linter's relevant files changed since last check.
    pub fn decision(&self, id: &str, check_interval: Duration) -> ExecutionDecision {
        if !self.provider.is_available() {
            return ExecutionDecision::execute("version control unavailable");
        }

        let digest = match self.provider.state_digest() {
            Ok(d) => d,
            Err(e) => return ExecutionDecision::execute(format!("assume changed: {e}")),
        };

        // Freshness shortcut: an unchanged cheap digest implies an unchanged
        // fingerprint, so the diff is provably not needed.
        {
            let cache = self.lock_cache();
            if let Some(entry) = cache.get(id)
                && entry.checked_at.elapsed() < check_interval
                && entry.digest == digest
            {
                debug!(id, "incremental cache hit");
                return ExecutionDecision::skip("no changes detected since last execution");
            }
        }

        let changed = match self.provider.changed_files() {
            Ok(c) => c,
            Err(e) => return ExecutionDecision::execute(format!("assume changed: {e}")),
        };

        let matched: Vec<&PathBuf> = {
            let patterns = self.lock_patterns();
            match patterns.get(id) {
                // No registered patterns: every change is relevant.
                None => changed.iter().collect(),
                Some(pats) => changed
                    .iter()
                    .filter(|f| pats.iter().any(|p| p.matches_path(f)))
                    .collect(),
            }
        };

        let fingerprint = fingerprint(&digest, &matched);
        let count = matched.len();
        let previous = {
            let mut cache = self.lock_cache();
            let previous = cache.get(id).map(|e| e.fingerprint.clone());
            cache.insert(
                id.to_string(),
                CacheEntry {
                    digest,
                    fingerprint: fingerprint.clone(),
                    checked_at: Instant::now(),
                },
            );
            previous
        };

        if count == 0 {
            ExecutionDecision::skip("no relevant files changed")
        } else if previous.as_deref() == Some(fingerprint.as_str()) {
            // The same relevant change set was already seen at the last
            // check; nothing new happened in between.
            ExecutionDecision::skip("no changes detected since last execution")
        } else {
            ExecutionDecision::execute(format!("{count} relevant file(s) changed"))
        }
    }

    /// Drop all cached fingerprints.
    pub fn clear(&self) {
        self.lock_cache().clear();
    }

    /// Drop the cached fingerprint for one linter id.
    pub fn clear_linter(&self, id: &str) {
        self.lock_cache().remove(id);
    }

    fn lock_patterns(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Pattern>>> {
        self.patterns
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn fingerprint(digest: &str, files: &[&PathBuf]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(digest.as_bytes());
    for f in files {
        hasher.update(f.to_string_lossy().as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

fn builtin_patterns() -> HashMap<String, Vec<Pattern>> {
    const TABLE: &[(&str, &[&str])] = &[
        ("typecheck", &["**/*.ts", "**/*.tsx", "tsconfig*.json"]),
        (
            "eslint",
            &[
                "**/*.ts",
                "**/*.tsx",
                "**/*.js",
                "**/*.jsx",
                ".eslintrc*",
                "eslint.config.*",
            ],
        ),
        (
            "prettier",
            &[
                "**/*.ts",
                "**/*.tsx",
                "**/*.js",
                "**/*.jsx",
                "**/*.json",
                "**/*.md",
                "**/*.yml",
                "**/*.yaml",
                ".prettierrc*",
            ],
        ),
        ("knip", &["**/*.ts", "**/*.tsx", "package.json", "knip.json"]),
        ("markdownlint", &["**/*.md"]),
        ("shellcheck", &["**/*.sh", "**/*.bash"]),
        (
            "actionlint",
            &[".github/workflows/*.yml", ".github/workflows/*.yaml"],
        ),
        ("gitleaks", &["**/*"]),
    ];
    TABLE
        .iter()
        .map(|(id, pats)| {
            (
                id.to_string(),
                pats.iter().filter_map(|p| Pattern::new(p).ok()).collect(),
            )
        })
        .collect()
}
