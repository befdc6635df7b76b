//! Status determination and skip-rule tables.
//!
//! Both special cases are table-driven: adding an output-scanned tool or a
//! generic skip heuristic is a table entry, not a new branch.

use super::LinterStatus;
use std::path::Path;

/// Tools whose exit code alone is not the signal: a zero exit with any of
/// the listed markers in the log output still counts as findings.
const FINDING_MARKERS: &[(&str, &[&str])] = &[(
    "knip",
    &[
        "Unused files",
        "Unused dependencies",
        "Unused exports",
        "Unlisted dependencies",
    ],
)];

/// Map a finished process to a terminal status.
pub fn determine_status(id: &str, exit_code: i32, log_output: &str) -> LinterStatus {
    if exit_code != 0 {
        return LinterStatus::Fail;
    }
    if let Some((_, markers)) = FINDING_MARKERS.iter().find(|(tool, _)| *tool == id)
        && markers.iter().any(|m| log_output.contains(m))
    {
        return LinterStatus::Fail;
    }
    LinterStatus::Pass
}

/// Declarative skip predicate evaluated against the project directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipRule {
    /// Skip when the named file is absent from the project root.
    FileMissing(&'static str),
    /// Skip when no file in the project matches the glob pattern.
    NoFilesMatching(&'static str),
}

impl SkipRule {
    /// Returns a human-readable skip reason when the rule fires.
    pub fn evaluate(&self, project_dir: &Path) -> Option<String> {
        match self {
            SkipRule::FileMissing(name) => {
                if project_dir.join(name).exists() {
                    None
                } else {
                    Some(format!("{name} not present"))
                }
            }
            SkipRule::NoFilesMatching(pattern) => {
                let full = project_dir.join(pattern);
                let matched = glob::glob(&full.to_string_lossy())
                    .ok()
                    .and_then(|mut paths| paths.find_map(|p| p.ok()));
                match matched {
                    Some(_) => None,
                    None => Some(format!("no files matching {pattern}")),
                }
            }
        }
    }
}

/// Registry-wide skip heuristics, consulted when a linter has no custom
/// skip check of its own.
const GENERIC_SKIP_RULES: &[(&str, SkipRule)] = &[
    ("markdownlint", SkipRule::NoFilesMatching("**/*.md")),
    ("shellcheck", SkipRule::NoFilesMatching("**/*.sh")),
    (
        "actionlint",
        SkipRule::NoFilesMatching(".github/workflows/*.y*ml"),
    ),
    ("knip", SkipRule::FileMissing("package.json")),
];

pub fn generic_skip_rule(id: &str) -> Option<&'static SkipRule> {
    GENERIC_SKIP_RULES
        .iter()
        .find(|(tool, _)| *tool == id)
        .map(|(_, rule)| rule)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn zero_exit_is_pass_for_ordinary_tools() {
        assert_eq!(determine_status("eslint", 0, ""), LinterStatus::Pass);
        assert_eq!(determine_status("prettier", 0, "All matched files"), LinterStatus::Pass);
    }

    #[test]
    fn nonzero_exit_is_fail_for_ordinary_tools() {
        assert_eq!(determine_status("eslint", 1, ""), LinterStatus::Fail);
        assert_eq!(determine_status("typecheck", 2, "error TS2322"), LinterStatus::Fail);
    }

    #[test]
    fn knip_zero_exit_with_findings_is_fail() {
        let output = "Unused files (3)\nsrc/dead.ts\n";
        assert_eq!(determine_status("knip", 0, output), LinterStatus::Fail);
    }

    #[test]
    fn knip_zero_exit_without_findings_is_pass() {
        assert_eq!(determine_status("knip", 0, "Everything in use\n"), LinterStatus::Pass);
    }

    #[test]
    fn knip_nonzero_exit_is_fail_regardless_of_output() {
        assert_eq!(determine_status("knip", 1, ""), LinterStatus::Fail);
    }

    #[test]
    fn file_missing_rule_fires_only_when_absent() {
        let dir = tempdir().unwrap();
        let rule = SkipRule::FileMissing("tsconfig.json");
        assert!(rule.evaluate(dir.path()).is_some());

        fs::write(dir.path().join("tsconfig.json"), "{}").unwrap();
        assert!(rule.evaluate(dir.path()).is_none());
    }

    #[test]
    fn no_files_matching_rule_fires_only_without_matches() {
        let dir = tempdir().unwrap();
        let rule = SkipRule::NoFilesMatching("**/*.sh");
        let reason = rule.evaluate(dir.path()).unwrap();
        assert!(reason.contains("**/*.sh"));

        fs::create_dir_all(dir.path().join("scripts")).unwrap();
        fs::write(dir.path().join("scripts/build.sh"), "#!/bin/sh\n").unwrap();
        assert!(rule.evaluate(dir.path()).is_none());
    }

    #[test]
    fn generic_table_covers_known_tools_only() {
        assert!(generic_skip_rule("markdownlint").is_some());
        assert!(generic_skip_rule("shellcheck").is_some());
        assert!(generic_skip_rule("eslint").is_none());
    }
}
