//! Per-phase file manifests.
//!
//! A manifest is the planned list of files for one phase. Entries are
//! sanitised on construction, deduplicated by path, ordered by
//! [`sort::topological_sort`] and persisted through [`cache::ManifestCache`]
//! so a restarted build resumes mid-phase instead of re-planning.

pub mod cache;
pub mod sort;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Component, Path};

use crate::errors::PathError;

pub use cache::ManifestCache;
pub use sort::topological_sort;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    Create,
    Modify,
    Delete,
}

impl FileAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Modify => "modify",
            Self::Delete => "delete",
        }
    }
}

/// Per-file progress, written back to the cache on every transition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    #[default]
    Pending,
    Fixing,
    FixQueued,
    Audited,
    Fixed,
}

impl FileStatus {
    /// The file passed audit, possibly after a fix.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Audited | Self::Fixed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Fail,
}

/// Result of auditing a single file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditResult {
    pub path: String,
    pub verdict: Verdict,
    #[serde(default)]
    pub findings: String,
}

impl AuditResult {
    pub fn pass(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            verdict: Verdict::Pass,
            findings: String::new(),
        }
    }

    pub fn fail(path: impl Into<String>, findings: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            verdict: Verdict::Fail,
            findings: findings.into(),
        }
    }

    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileManifestEntry {
    pub path: String,
    pub action: FileAction,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub context_files: Vec<String>,
    #[serde(default)]
    pub estimated_lines: u32,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub status: FileStatus,
    #[serde(default)]
    pub verdict: Option<Verdict>,
    /// Last audit findings while the file waits in the fix queue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub findings: Option<String>,
}

impl FileManifestEntry {
    pub fn new(path: &str, action: FileAction, purpose: &str) -> Result<Self, PathError> {
        let path = sanitize_path(path)?;
        let language = language_for(&path).to_string();
        Ok(Self {
            path,
            action,
            purpose: purpose.to_string(),
            depends_on: Vec::new(),
            context_files: Vec::new(),
            estimated_lines: 0,
            language,
            status: FileStatus::Pending,
            verdict: None,
            findings: None,
        })
    }

    pub fn with_depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }
}

/// Normalise a workspace-relative path. Traversal and absolute paths are
/// rejected outright, never rewritten into something allowed.
pub fn sanitize_path(raw: &str) -> Result<String, PathError> {
    let trimmed = raw.trim().trim_matches('`').replace('\\', "/");
    let trimmed = trimmed.trim_start_matches("./");
    if trimmed.is_empty() {
        return Err(PathError::Empty);
    }
    if trimmed.starts_with('/') || Path::new(trimmed).is_absolute() || has_drive_prefix(trimmed) {
        return Err(PathError::Absolute(raw.to_string()));
    }

    let mut parts = Vec::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir => return Err(PathError::Traversal(raw.to_string())),
            Component::RootDir | Component::Prefix(_) => {
                return Err(PathError::Absolute(raw.to_string()));
            }
        }
    }
    if parts.is_empty() {
        return Err(PathError::Empty);
    }
    Ok(parts.join("/"))
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Language tag from the file extension.
pub fn language_for(path: &str) -> &'static str {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    match ext.as_str() {
        "py" => "python",
        "ts" | "tsx" => "typescript",
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "rs" => "rust",
        "go" => "go",
        "json" => "json",
        "toml" => "toml",
        "yml" | "yaml" => "yaml",
        "md" => "markdown",
        "html" => "html",
        "css" => "css",
        "sql" => "sql",
        "sh" => "shell",
        _ => "text",
    }
}

/// Drop duplicate paths (first declaration wins) and sanitise dependency
/// lists, discarding dependency entries that fail sanitisation.
pub fn dedupe(entries: Vec<FileManifestEntry>) -> Vec<FileManifestEntry> {
    let mut seen = HashSet::new();
    entries
        .into_iter()
        .filter(|e| seen.insert(e.path.clone()))
        .map(|mut e| {
            e.depends_on = e
                .depends_on
                .iter()
                .filter_map(|d| sanitize_path(d).ok())
                .filter(|d| d != &e.path)
                .collect();
            e.context_files = e
                .context_files
                .iter()
                .filter_map(|d| sanitize_path(d).ok())
                .collect();
            e
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_accepts_relative_paths() {
        assert_eq!(sanitize_path("app/main.py").unwrap(), "app/main.py");
        assert_eq!(sanitize_path("./app//main.py").unwrap(), "app/main.py");
        assert_eq!(sanitize_path(" `tests/test_x.py` ").unwrap(), "tests/test_x.py");
        assert_eq!(sanitize_path("app\\core\\db.py").unwrap(), "app/core/db.py");
    }

    #[test]
    fn test_sanitize_rejects_traversal_and_absolute() {
        assert!(matches!(
            sanitize_path("../etc/passwd"),
            Err(PathError::Traversal(_))
        ));
        assert!(matches!(
            sanitize_path("app/../../x.py"),
            Err(PathError::Traversal(_))
        ));
        assert!(matches!(
            sanitize_path("/etc/passwd"),
            Err(PathError::Absolute(_))
        ));
        assert!(matches!(
            sanitize_path("C:/windows/x"),
            Err(PathError::Absolute(_))
        ));
        assert!(matches!(sanitize_path("  "), Err(PathError::Empty)));
        assert!(matches!(sanitize_path("./"), Err(PathError::Empty)));
    }

    #[test]
    fn test_language_from_extension() {
        assert_eq!(language_for("a/b.py"), "python");
        assert_eq!(language_for("web/App.tsx"), "typescript");
        assert_eq!(language_for("Makefile"), "text");
    }

    #[test]
    fn test_dedupe_keeps_first_and_cleans_deps() {
        let mut a = FileManifestEntry::new("a.py", FileAction::Create, "first").unwrap();
        a.depends_on = vec!["a.py".into(), "../x".into(), "b.py".into()];
        let a2 = FileManifestEntry::new("a.py", FileAction::Modify, "dup").unwrap();
        let b = FileManifestEntry::new("b.py", FileAction::Create, "").unwrap();
        let out = dedupe(vec![a, a2, b]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].purpose, "first");
        assert_eq!(out[0].depends_on, vec!["b.py"]);
    }

    #[test]
    fn test_entry_serde_defaults() {
        let entry: FileManifestEntry =
            serde_json::from_str(r#"{"path":"x.py","action":"create"}"#).unwrap();
        assert_eq!(entry.status, FileStatus::Pending);
        assert!(entry.depends_on.is_empty());
        assert!(entry.verdict.is_none());

        let json = serde_json::to_string(&AuditResult::fail("x.py", "missing import")).unwrap();
        assert!(json.contains("\"FAIL\""));
    }
}
