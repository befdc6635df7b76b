//! The fixed linter fleet and its lookup functions.
//!
//! Configurations are immutable data; the executor never mutates them.
//! The fleet targets a TypeScript monorepo checkout, but nothing in the
//! core depends on the specific tools listed here.

use crate::executor::status::SkipRule;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the linter's command line is launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinterMode {
    /// Spawn the binary directly with its argument list.
    Direct,
    /// Run the command line through `sh -c`.
    Shell,
}

/// One linter's immutable configuration.
#[derive(Debug, Clone)]
pub struct LinterConfig {
    pub id: &'static str,
    pub name: &'static str,
    pub binary: &'static str,
    pub args: Vec<String>,
    pub timeout: Duration,
    pub mode: LinterMode,
    pub skip_check: Option<SkipRule>,
    pub expected_version: Option<&'static str>,
    pub version_probe: Option<Vec<String>>,
}

impl LinterConfig {
    pub fn new(
        id: &'static str,
        name: &'static str,
        binary: &'static str,
        args: &[&str],
        timeout_secs: u64,
    ) -> Self {
        Self {
            id,
            name,
            binary,
            args: args.iter().map(|a| a.to_string()).collect(),
            timeout: Duration::from_secs(timeout_secs),
            mode: LinterMode::Direct,
            skip_check: None,
            expected_version: None,
            version_probe: None,
        }
    }

    pub fn with_mode(mut self, mode: LinterMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_skip_check(mut self, rule: SkipRule) -> Self {
        self.skip_check = Some(rule);
        self
    }

    pub fn with_version(mut self, expected: &'static str, probe_args: &[&str]) -> Self {
        self.expected_version = Some(expected);
        self.version_probe = Some(probe_args.iter().map(|a| a.to_string()).collect());
        self
    }
}

/// The full configured fleet, in canonical execution order.
pub fn all_linters() -> Vec<LinterConfig> {
    vec![
        LinterConfig::new(
            "typecheck",
            "TypeScript type check",
            "npx",
            &["tsc", "--noEmit"],
            300,
        )
        .with_skip_check(SkipRule::FileMissing("tsconfig.json")),
        LinterConfig::new(
            "eslint",
            "ESLint",
            "npx",
            &["eslint", ".", "--max-warnings", "0"],
            300,
        ),
        LinterConfig::new(
            "prettier",
            "Prettier format check",
            "npx",
            &["prettier", "--check", "."],
            120,
        ),
        // knip reports findings on stdout with a zero exit; the status
        // determination table scans its output for markers.
        LinterConfig::new(
            "knip",
            "Knip unused-code scan",
            "npx",
            &["knip", "--no-exit-code"],
            180,
        ),
        LinterConfig::new("markdownlint", "Markdown lint", "markdownlint", &["."], 60),
        LinterConfig::new(
            "shellcheck",
            "ShellCheck",
            "find . -name '*.sh' -not -path './node_modules/*' -exec shellcheck {} +",
            &[],
            120,
        )
        .with_mode(LinterMode::Shell),
        LinterConfig::new("actionlint", "GitHub Actions lint", "actionlint", &[], 60),
        LinterConfig::new(
            "gitleaks",
            "Gitleaks secret scan",
            "gitleaks",
            &["detect", "--no-banner"],
            120,
        )
        .with_version("8.", &["version"]),
    ]
}

/// Look up one linter by its stable id.
pub fn linter_by_id(id: &str) -> Option<LinterConfig> {
    all_linters().into_iter().find(|l| l.id == id)
}
