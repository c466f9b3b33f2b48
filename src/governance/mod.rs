//! Deterministic post-phase governance checks.
//!
//! Seven checks run over the workspace after every phase, with no model
//! involved:
//!
//! | Code | Check              | Result on violation |
//! |------|--------------------|---------------------|
//! | G1   | scope              | FAIL                |
//! | G2   | layer boundaries   | FAIL                |
//! | G3   | dependency gate    | FAIL                |
//! | G4   | secrets            | WARN                |
//! | G5   | route coverage     | WARN                |
//! | G6   | rename detection   | WARN                |
//! | G7   | TODO/placeholders  | WARN                |
//!
//! Which results block the phase is decided by [`GovernanceConfig`].

pub mod checks;
pub mod imports;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use crate::config::GovernanceConfig;
use crate::manifest::{FileAction, FileManifestEntry};
use crate::workspace::{list_files, safe_read};

pub const CHECK_CODES: &[&str] = &["G1", "G2", "G3", "G4", "G5", "G6", "G7"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Warn => "WARN",
            Self::Fail => "FAIL",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckResult {
    pub code: String,
    pub name: String,
    pub status: CheckStatus,
    #[serde(default)]
    pub detail: String,
}

impl CheckResult {
    pub fn new(code: &str, name: &str, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            name: name.to_string(),
            status,
            detail: detail.into(),
        }
    }

    pub fn pass(code: &str, name: &str) -> Self {
        Self::new(code, name, CheckStatus::Pass, "")
    }

    /// Whether this result blocks the phase under `config`.
    pub fn blocks(&self, config: &GovernanceConfig) -> bool {
        let listed = |codes: &[String]| codes.iter().any(|c| c == &self.code);
        match self.status {
            CheckStatus::Pass => false,
            CheckStatus::Fail => listed(&config.blocking) || listed(&config.warn_blocks),
            CheckStatus::Warn => listed(&config.warn_blocks),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GovernanceReport {
    pub checks: Vec<CheckResult>,
    pub passed: bool,
    /// Codes of the checks that blocked
    #[serde(default)]
    pub blocking: Vec<String>,
}

impl GovernanceReport {
    fn from_checks(checks: Vec<CheckResult>, config: &GovernanceConfig) -> Self {
        let blocking: Vec<String> = checks
            .iter()
            .filter(|c| c.blocks(config))
            .map(|c| c.code.clone())
            .collect();
        Self {
            passed: blocking.is_empty(),
            checks,
            blocking,
        }
    }

    pub fn get(&self, code: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.code == code)
    }

    /// Blocking findings rendered for a recovery prompt.
    pub fn render_failures(&self) -> String {
        self.checks
            .iter()
            .filter(|c| self.blocking.contains(&c.code))
            .map(|c| format!("[{} {}] {}: {}", c.code, c.status.as_str(), c.name, c.detail))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// One line per check, for logs.
    pub fn summary(&self) -> String {
        self.checks
            .iter()
            .map(|c| format!("{}={}", c.code, c.status.as_str()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Everything the checks look at, gathered once.
#[derive(Debug)]
pub struct Snapshot<'a> {
    pub root: &'a Path,
    pub manifest: &'a [FileManifestEntry],
    /// Files present before the phase started
    pub baseline: HashSet<String>,
    /// Files present now
    pub files: Vec<String>,
    /// Current content of every manifest file that is not a delete
    pub contents: BTreeMap<String, String>,
    pub routes: &'a [(String, String)],
}

impl<'a> Snapshot<'a> {
    pub fn capture(
        root: &'a Path,
        manifest: &'a [FileManifestEntry],
        baseline: &[String],
        routes: &'a [(String, String)],
    ) -> Result<Self> {
        let files = list_files(root)?;
        let mut contents = BTreeMap::new();
        for entry in manifest.iter().filter(|e| e.action != FileAction::Delete) {
            if let Some(content) = safe_read(root, &entry.path)? {
                contents.insert(entry.path.clone(), content);
            }
        }
        Ok(Self {
            root,
            manifest,
            baseline: baseline.iter().cloned().collect(),
            files,
            contents,
            routes,
        })
    }

    pub fn in_manifest(&self, path: &str) -> bool {
        self.manifest.iter().any(|e| e.path == path)
    }
}

/// Run all seven checks over a phase's result.
pub fn evaluate(
    root: &Path,
    manifest: &[FileManifestEntry],
    baseline: &[String],
    routes: &[(String, String)],
    config: &GovernanceConfig,
) -> Result<GovernanceReport> {
    let snapshot = Snapshot::capture(root, manifest, baseline, routes)?;
    let results = vec![
        checks::scope(&snapshot),
        checks::layer_boundaries(&snapshot, &config.layers),
        checks::dependency_gate(&snapshot, &config.package_aliases),
        checks::secrets(&snapshot),
        checks::route_coverage(&snapshot),
        checks::renames(&snapshot),
        checks::placeholders(&snapshot),
    ];
    let report = GovernanceReport::from_checks(results, config);
    tracing::info!(passed = report.passed, checks = %report.summary(), "governance evaluated");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(path: &str) -> FileManifestEntry {
        FileManifestEntry::new(path, FileAction::Create, "test").unwrap()
    }

    #[test]
    fn test_missing_manifest_file_fails_scope() {
        let dir = tempdir().unwrap();
        let manifest = vec![entry("missing.py")];
        let report =
            evaluate(dir.path(), &manifest, &[], &[], &GovernanceConfig::default()).unwrap();
        assert_eq!(report.checks.len(), 7);
        assert_eq!(report.get("G1").unwrap().status, CheckStatus::Fail);
        assert!(report.get("G1").unwrap().detail.contains("missing.py"));
        assert!(!report.passed);
        assert_eq!(report.blocking, vec!["G1"]);
    }

    #[test]
    fn test_clean_phase_passes() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("requirements.txt"), "fastapi\n").unwrap();
        std::fs::create_dir_all(dir.path().join("app")).unwrap();
        std::fs::write(
            dir.path().join("app/main.py"),
            "from fastapi import FastAPI\n\napp = FastAPI()\n",
        )
        .unwrap();
        let manifest = vec![entry("app/main.py")];
        let baseline = vec!["requirements.txt".to_string()];
        let report = evaluate(
            dir.path(),
            &manifest,
            &baseline,
            &[],
            &GovernanceConfig::default(),
        )
        .unwrap();
        assert!(report.passed, "{}", report.summary());
        assert!(report.checks.iter().all(|c| c.status == CheckStatus::Pass));
    }

    #[test]
    fn test_warn_blocks_only_when_configured() {
        let warn = CheckResult::new("G7", "placeholders", CheckStatus::Warn, "TODO");
        let mut config = GovernanceConfig::default();
        assert!(!warn.blocks(&config));
        config.warn_blocks.push("G7".to_string());
        assert!(warn.blocks(&config));

        let fail = CheckResult::new("G3", "dependencies", CheckStatus::Fail, "x");
        config.blocking.clear();
        assert!(!fail.blocks(&config));
    }

    #[test]
    fn test_render_failures_lists_blocking_only() {
        let config = GovernanceConfig::default();
        let report = GovernanceReport::from_checks(
            vec![
                CheckResult::new("G1", "scope", CheckStatus::Fail, "missing: a.py"),
                CheckResult::new("G7", "placeholders", CheckStatus::Warn, "a.py:3 TODO"),
            ],
            &config,
        );
        let text = report.render_failures();
        assert!(text.contains("G1"));
        assert!(!text.contains("G7"));
    }
}
