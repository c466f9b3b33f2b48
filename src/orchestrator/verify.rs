//! Phase verification: in-process syntax checks over the phase's files
//! plus the project's own test command.

use anyhow::{Context, Result};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

use crate::config::VerificationConfig;
use crate::manifest::{FileAction, FileManifestEntry};
use crate::syntax;
use crate::workspace::safe_read;

/// Tail of test output kept for prompts and logs.
const OUTPUT_TAIL_CHARS: usize = 6_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRun {
    pub passed: bool,
    pub exit_code: Option<i32>,
    pub output: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Verification {
    /// `(path, error)` per file that failed its syntax check
    pub syntax_errors: Vec<(String, String)>,
    /// `None` when no test command is configured
    pub tests: Option<TestRun>,
}

impl Verification {
    pub fn passed(&self) -> bool {
        self.syntax_errors.is_empty() && self.tests.as_ref().is_none_or(|t| t.passed)
    }

    /// Findings text for fix and recovery prompts.
    pub fn findings(&self) -> String {
        let mut out = String::new();
        for (path, error) in &self.syntax_errors {
            out.push_str(&format!("- {}: {}\n", path, error));
        }
        if let Some(run) = self.tests.as_ref().filter(|t| !t.passed) {
            out.push_str(&format!(
                "- test command failed (exit {}):\n{}\n",
                run.exit_code.map_or("signal".to_string(), |c| c.to_string()),
                run.output
            ));
        }
        out
    }
}

pub fn check_syntax(root: &Path, entries: &[FileManifestEntry]) -> Vec<(String, String)> {
    entries
        .iter()
        .filter(|e| e.action != FileAction::Delete)
        .filter_map(|e| match safe_read(root, &e.path) {
            Ok(Some(content)) => syntax::check(&e.path, &content)
                .err()
                .map(|err| (e.path.clone(), err)),
            Ok(None) => Some((e.path.clone(), "file is missing on disk".to_string())),
            Err(err) => Some((e.path.clone(), err.to_string())),
        })
        .collect()
}

fn tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...\n{}", &text[start..])
}

/// Run the configured test command in `root`. A run that exceeds the
/// timeout is killed and reported as failed.
pub async fn run_tests(root: &Path, config: &VerificationConfig) -> Result<Option<TestRun>> {
    let Some(command) = config.test_command.as_deref().filter(|c| !c.trim().is_empty()) else {
        return Ok(None);
    };
    tracing::info!(command, dir = %root.display(), "running test command");
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(root)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn test command: {}", command))?;

    let limit = Duration::from_secs(config.timeout_secs.max(1));
    let output = match timeout(limit, child.wait_with_output()).await {
        Ok(result) => result.context("Failed to wait for test command")?,
        Err(_) => {
            tracing::warn!(command, timeout_secs = config.timeout_secs, "test command timed out");
            return Ok(Some(TestRun {
                passed: false,
                exit_code: None,
                output: format!("timed out after {}s", config.timeout_secs),
            }));
        }
    };
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        combined.push_str(&stderr);
    }
    Ok(Some(TestRun {
        passed: output.status.success(),
        exit_code: output.status.code(),
        output: tail(combined.trim(), OUTPUT_TAIL_CHARS),
    }))
}

/// Syntax checks plus tests.
pub async fn verify(root: &Path, entries: &[FileManifestEntry], config: &VerificationConfig) -> Result<Verification> {
    let syntax_errors = check_syntax(root, entries);
    let tests = run_tests(root, config).await?;
    Ok(Verification { syntax_errors, tests })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(command: &str) -> VerificationConfig {
        VerificationConfig {
            test_command: Some(command.to_string()),
            timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn test_no_command_configured() {
        let dir = tempdir().unwrap();
        let run = run_tests(dir.path(), &VerificationConfig::default()).await.unwrap();
        assert!(run.is_none());
    }

    #[tokio::test]
    async fn test_failing_command_reports_output() {
        let dir = tempdir().unwrap();
        let run = run_tests(dir.path(), &config("echo boom >&2; exit 3"))
            .await
            .unwrap()
            .unwrap();
        assert!(!run.passed);
        assert_eq!(run.exit_code, Some(3));
        assert!(run.output.contains("boom"));
    }

    #[tokio::test]
    async fn test_command_runs_in_workspace() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let run = run_tests(dir.path(), &config("test -f marker.txt"))
            .await
            .unwrap()
            .unwrap();
        assert!(run.passed);
    }

    #[tokio::test]
    async fn test_verify_collects_syntax_errors() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("ok.json"), "{}").unwrap();
        std::fs::write(dir.path().join("bad.json"), "{").unwrap();
        let entries = vec![
            FileManifestEntry::new("ok.json", FileAction::Create, "").unwrap(),
            FileManifestEntry::new("bad.json", FileAction::Create, "").unwrap(),
            FileManifestEntry::new("gone.py", FileAction::Delete, "").unwrap(),
        ];
        let result = verify(dir.path(), &entries, &VerificationConfig::default())
            .await
            .unwrap();
        assert!(!result.passed());
        assert_eq!(result.syntax_errors.len(), 1);
        assert_eq!(result.syntax_errors[0].0, "bad.json");
        assert!(result.findings().contains("bad.json"));
    }

    #[test]
    fn test_tail_keeps_the_end() {
        let text = format!("{}END", "a".repeat(10_000));
        let kept = tail(&text, 100);
        assert!(kept.ends_with("END"));
        assert!(kept.len() < 120);
    }
}
