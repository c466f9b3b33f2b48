//! The individual governance checks.

use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

use super::imports::{
    Ecosystem, candidate_packages, ecosystem_for, extract_imports, is_stdlib, local_modules,
    read_declared_deps,
};
use super::{CheckResult, CheckStatus, Snapshot};
use crate::config::LayerRule;
use crate::contracts::SNAPSHOT_DIR;
use crate::manifest::FileAction;

/// Findings listed per check before the detail is truncated.
const MAX_FINDINGS: usize = 10;

static SECRET_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    vec![
        ("AWS access key", Regex::new(r"\bAKIA[0-9A-Z]{16}\b").unwrap()),
        (
            "private key",
            Regex::new(r"-----BEGIN (?:RSA |EC |OPENSSH |DSA )?PRIVATE KEY-----").unwrap(),
        ),
        ("API token", Regex::new(r"\bsk-[A-Za-z0-9_\-]{20,}").unwrap()),
        ("GitHub token", Regex::new(r"\bgh[pousr]_[A-Za-z0-9]{36,}").unwrap()),
        ("Slack token", Regex::new(r"\bxox[baprs]-[A-Za-z0-9\-]{10,}").unwrap()),
        (
            "hardcoded credential",
            Regex::new(
                r#"(?i)\b(?:api[_-]?key|secret(?:[_-]?key)?|password|passwd|auth[_-]?token|access[_-]?token)\b\s*[:=]\s*["']([^"'\s]{8,})["']"#,
            )
            .unwrap(),
        ),
    ]
});

/// Values that look like secrets but are obviously placeholders.
const SECRET_PLACEHOLDERS: &[&str] = &[
    "changeme", "change-me", "change_me", "your-", "your_", "example", "placeholder", "xxxx",
    "dummy", "test", "secret-key-here", "<", "${",
];

static PLACEHOLDER_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"\b(?:TODO|FIXME|XXX)\b").unwrap(),
        Regex::new(r"\braise\s+NotImplementedError\b").unwrap(),
        Regex::new(r#"throw new Error\(\s*["']not implemented"#).unwrap(),
        Regex::new(r"(?i)\bimplement (?:this|me|later)\b").unwrap(),
        Regex::new(r"(?i)#\s*placeholder\b|//\s*placeholder\b").unwrap(),
        Regex::new(r"^\s*pass\s*#").unwrap(),
    ]
});

static PY_ROUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"@\w+\.(get|post|put|patch|delete)\(\s*["']([^"']*)["']"#).unwrap()
});

static JS_ROUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\b(?:router|app|server)\.(get|post|put|patch|delete)\(\s*["'`]([^"'`]+)["'`]"#)
        .unwrap()
});

static ROUTER_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"APIRouter\([^)]*prefix\s*=\s*["']([^"']+)["']"#).unwrap());

static PATH_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{[^}]*\}|:[A-Za-z_]\w*|<[^>]*>").unwrap());

fn listing(items: &[String]) -> String {
    let mut text = items
        .iter()
        .take(MAX_FINDINGS)
        .cloned()
        .collect::<Vec<_>>()
        .join("; ");
    if items.len() > MAX_FINDINGS {
        text.push_str(&format!("; and {} more", items.len() - MAX_FINDINGS));
    }
    text
}

/// Tooling byproducts that never count as unplanned files.
fn is_incidental(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    path.starts_with(SNAPSHOT_DIR)
        || name.ends_with(".pyc")
        || name.ends_with(".lock")
        || name.ends_with(".log")
        || matches!(name, "package-lock.json" | ".coverage" | ".DS_Store")
}

/// Files that appeared during the phase without being planned.
fn unplanned(snapshot: &Snapshot<'_>) -> Vec<String> {
    snapshot
        .files
        .iter()
        .filter(|f| !snapshot.baseline.contains(*f) && !snapshot.in_manifest(f) && !is_incidental(f))
        .cloned()
        .collect()
}

/// G1: every planned file is in the state its action asks for, and nothing
/// else appeared.
pub fn scope(snapshot: &Snapshot<'_>) -> CheckResult {
    let mut problems = Vec::new();
    for entry in snapshot.manifest {
        let present = snapshot.files.contains(&entry.path);
        match entry.action {
            FileAction::Delete if present => {
                problems.push(format!("{} should have been deleted", entry.path))
            }
            FileAction::Create | FileAction::Modify if !present => {
                problems.push(format!("missing: {}", entry.path))
            }
            FileAction::Create | FileAction::Modify => {
                if snapshot.contents.get(&entry.path).is_some_and(|c| c.trim().is_empty()) {
                    problems.push(format!("empty: {}", entry.path));
                }
            }
            FileAction::Delete => {}
        }
    }
    problems.extend(unplanned(snapshot).into_iter().map(|f| format!("unplanned: {}", f)));

    if problems.is_empty() {
        CheckResult::pass("G1", "scope")
    } else {
        CheckResult::new("G1", "scope", CheckStatus::Fail, listing(&problems))
    }
}

/// G2: files under a layer prefix import nothing the layer forbids.
pub fn layer_boundaries(snapshot: &Snapshot<'_>, layers: &[LayerRule]) -> CheckResult {
    let mut violations = Vec::new();
    for (path, content) in &snapshot.contents {
        let Some(layer) = layers
            .iter()
            .find(|l| l.path_prefixes.iter().any(|p| path.starts_with(p.as_str())))
        else {
            continue;
        };
        for import in extract_imports(path, content) {
            let lower = import.to_lowercase();
            if layer.forbidden_imports.iter().any(|f| f.to_lowercase() == lower) {
                violations.push(format!("{} ({} layer) imports {}", path, layer.name, import));
            }
        }
    }
    if violations.is_empty() {
        CheckResult::pass("G2", "layer boundaries")
    } else {
        CheckResult::new("G2", "layer boundaries", CheckStatus::Fail, listing(&violations))
    }
}

/// G3: every third-party import is declared in a dependency manifest.
pub fn dependency_gate(
    snapshot: &Snapshot<'_>,
    aliases: &HashMap<String, String>,
) -> CheckResult {
    let declared = read_declared_deps(snapshot.root);
    let local = local_modules(&snapshot.files);
    let mut undeclared: BTreeSet<(String, String)> = BTreeSet::new();

    for (path, content) in &snapshot.contents {
        let Some(ecosystem) = ecosystem_for(path) else {
            continue;
        };
        for import in extract_imports(path, content) {
            if is_stdlib(ecosystem, &import) {
                continue;
            }
            if ecosystem == Ecosystem::Python && local.contains(&import) {
                continue;
            }
            let candidates = candidate_packages(ecosystem, &import, aliases);
            if !declared.satisfies(ecosystem, &candidates) {
                undeclared.insert((import, path.clone()));
            }
        }
    }

    if undeclared.is_empty() {
        return CheckResult::pass("G3", "dependency gate");
    }
    let findings: Vec<String> = undeclared
        .iter()
        .map(|(import, path)| format!("{} (imported by {})", import, path))
        .collect();
    let mut detail = format!("undeclared dependencies: {}", listing(&findings));
    for ecosystem in [Ecosystem::Python, Ecosystem::Node] {
        let relevant = undeclared
            .iter()
            .any(|(_, path)| ecosystem_for(path) == Some(ecosystem));
        if relevant && !declared.has_manifest(ecosystem) {
            detail.push_str(match ecosystem {
                Ecosystem::Python => "; no requirements.txt or pyproject.toml found",
                Ecosystem::Node => "; no package.json found",
            });
        }
    }
    CheckResult::new("G3", "dependency gate", CheckStatus::Fail, detail)
}

/// G4: no credentials committed in phase files.
pub fn secrets(snapshot: &Snapshot<'_>) -> CheckResult {
    let mut findings = Vec::new();
    for (path, content) in &snapshot.contents {
        for (no, line) in content.lines().enumerate() {
            for (label, pattern) in SECRET_PATTERNS.iter() {
                let Some(caps) = pattern.captures(line) else {
                    continue;
                };
                let value = caps.get(1).map(|m| m.as_str().to_lowercase());
                if let Some(value) = value
                    && SECRET_PLACEHOLDERS.iter().any(|p| value.contains(p))
                {
                    continue;
                }
                findings.push(format!("{}:{} {}", path, no + 1, label));
                break;
            }
        }
    }
    if findings.is_empty() {
        CheckResult::pass("G4", "secrets")
    } else {
        CheckResult::new("G4", "secrets", CheckStatus::Warn, listing(&findings))
    }
}

fn normalize_route(path: &str) -> String {
    let replaced = PATH_PARAM.replace_all(path.trim(), "{}");
    let trimmed = replaced.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

fn join_route(prefix: &str, path: &str) -> String {
    normalize_route(&format!(
        "{}/{}",
        prefix.trim_end_matches('/'),
        path.trim_start_matches('/')
    ))
}

/// Routes implemented in one source file, as `(METHOD, normalized path)`.
pub fn implemented_routes(path: &str, content: &str) -> Vec<(String, String)> {
    let pattern = match ecosystem_for(path) {
        Some(Ecosystem::Python) => &*PY_ROUTE,
        Some(Ecosystem::Node) => &*JS_ROUTE,
        None => return Vec::new(),
    };
    let prefix = ROUTER_PREFIX
        .captures(content)
        .map(|c| c[1].to_string())
        .unwrap_or_default();
    pattern
        .captures_iter(content)
        .map(|c| (c[1].to_uppercase(), join_route(&prefix, &c[2])))
        .collect()
}

/// G5: routes declared in the contracts exist in code.
///
/// Routers are often mounted under a prefix elsewhere, so an implemented
/// route also covers any declared route it is a suffix of.
pub fn route_coverage(snapshot: &Snapshot<'_>) -> CheckResult {
    if snapshot.routes.is_empty() {
        return CheckResult::pass("G5", "route coverage");
    }
    let mut implemented = Vec::new();
    for file in &snapshot.files {
        if ecosystem_for(file).is_none() || file.starts_with(SNAPSHOT_DIR) {
            continue;
        }
        let content = match snapshot.contents.get(file) {
            Some(c) => c.clone(),
            None => match std::fs::read_to_string(snapshot.root.join(file)) {
                Ok(c) => c,
                Err(_) => continue,
            },
        };
        implemented.extend(implemented_routes(file, &content));
    }
    if implemented.is_empty() {
        return CheckResult::new(
            "G5",
            "route coverage",
            CheckStatus::Pass,
            "no routes implemented yet",
        );
    }

    let missing: Vec<String> = snapshot
        .routes
        .iter()
        .filter(|(method, path)| {
            let declared = normalize_route(path);
            !implemented.iter().any(|(m, p)| {
                m == method && (*p == declared || (p != "/" && declared.ends_with(p.as_str())))
            })
        })
        .map(|(method, path)| format!("{} {}", method, path))
        .collect();

    if missing.is_empty() {
        CheckResult::pass("G5", "route coverage")
    } else {
        CheckResult::new(
            "G5",
            "route coverage",
            CheckStatus::Warn,
            format!("declared but not implemented: {}", listing(&missing)),
        )
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// G6: a planned file is missing while a same-named file appeared elsewhere.
pub fn renames(snapshot: &Snapshot<'_>) -> CheckResult {
    let appeared = unplanned(snapshot);
    let mut suspects = Vec::new();
    for entry in snapshot.manifest {
        if entry.action == FileAction::Delete || snapshot.files.contains(&entry.path) {
            continue;
        }
        for candidate in appeared.iter().filter(|f| file_name(f) == file_name(&entry.path)) {
            suspects.push(format!("{} → {}", entry.path, candidate));
        }
    }
    if suspects.is_empty() {
        CheckResult::pass("G6", "rename detection")
    } else {
        CheckResult::new(
            "G6",
            "rename detection",
            CheckStatus::Warn,
            format!("possible renames: {}", listing(&suspects)),
        )
    }
}

/// G7: no TODOs or stub bodies left in phase files.
pub fn placeholders(snapshot: &Snapshot<'_>) -> CheckResult {
    let mut findings = Vec::new();
    for (path, content) in &snapshot.contents {
        if path.ends_with(".md") {
            continue;
        }
        for (no, line) in content.lines().enumerate() {
            if PLACEHOLDER_PATTERNS.iter().any(|p| p.is_match(line)) {
                findings.push(format!("{}:{} {}", path, no + 1, line.trim()));
            }
        }
    }
    if findings.is_empty() {
        CheckResult::pass("G7", "placeholders")
    } else {
        CheckResult::new("G7", "placeholders", CheckStatus::Warn, listing(&findings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::FileManifestEntry;
    use std::path::Path;
    use tempfile::tempdir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn entry(path: &str, action: FileAction) -> FileManifestEntry {
        FileManifestEntry::new(path, action, "test").unwrap()
    }

    #[test]
    fn test_scope_flags_unplanned_and_undeleted_files() {
        let dir = tempdir().unwrap();
        write(dir.path(), "app/main.py", "x = 1\n");
        write(dir.path(), "app/extra.py", "y = 2\n");
        write(dir.path(), "old.py", "z = 3\n");
        write(dir.path(), ".autoforge-contracts/stack.md", "# stack\n");
        let manifest = vec![
            entry("app/main.py", FileAction::Create),
            entry("old.py", FileAction::Delete),
        ];
        let baseline = vec!["old.py".to_string()];
        let snap = Snapshot::capture(dir.path(), &manifest, &baseline, &[]).unwrap();
        let result = scope(&snap);
        assert_eq!(result.status, CheckStatus::Fail);
        assert!(result.detail.contains("unplanned: app/extra.py"));
        assert!(result.detail.contains("old.py should have been deleted"));
        assert!(!result.detail.contains("stack.md"));
    }

    #[test]
    fn test_layer_violation() {
        let dir = tempdir().unwrap();
        write(
            dir.path(),
            "app/api/users.py",
            "from sqlalchemy.orm import Session\nfrom fastapi import APIRouter\n",
        );
        let manifest = vec![entry("app/api/users.py", FileAction::Create)];
        let snap = Snapshot::capture(dir.path(), &manifest, &[], &[]).unwrap();
        let layers = crate::config::GovernanceConfig::default().layers;
        let result = layer_boundaries(&snap, &layers);
        assert_eq!(result.status, CheckStatus::Fail);
        assert!(result.detail.contains("imports sqlalchemy"));
    }

    #[test]
    fn test_dependency_gate_uses_aliases_and_local_modules() {
        let dir = tempdir().unwrap();
        write(dir.path(), "requirements.txt", "Pillow\nPyYAML==6.0\nfastapi\n");
        write(
            dir.path(),
            "app/images.py",
            "import os\nfrom PIL import Image\nimport yaml\nfrom app.core import cfg\nimport requests\n",
        );
        let manifest = vec![entry("app/images.py", FileAction::Create)];
        let snap = Snapshot::capture(dir.path(), &manifest, &[], &[]).unwrap();
        let result = dependency_gate(&snap, &HashMap::new());
        assert_eq!(result.status, CheckStatus::Fail);
        assert!(result.detail.contains("requests"));
        assert!(!result.detail.contains("PIL"));
        assert!(!result.detail.contains("yaml"));
        assert!(!result.detail.contains("app "));
    }

    #[test]
    fn test_dependency_gate_without_any_manifest() {
        let dir = tempdir().unwrap();
        write(dir.path(), "web/index.js", "import express from 'express';\n");
        let manifest = vec![entry("web/index.js", FileAction::Create)];
        let snap = Snapshot::capture(dir.path(), &manifest, &[], &[]).unwrap();
        let result = dependency_gate(&snap, &HashMap::new());
        assert_eq!(result.status, CheckStatus::Fail);
        assert!(result.detail.contains("no package.json found"));
    }

    #[test]
    fn test_secrets_ignore_placeholders() {
        let dir = tempdir().unwrap();
        write(
            dir.path(),
            "app/config.py",
            "API_KEY = \"changeme-please\"\nPASSWORD = \"hunter2hunter2\"\n",
        );
        let manifest = vec![entry("app/config.py", FileAction::Create)];
        let snap = Snapshot::capture(dir.path(), &manifest, &[], &[]).unwrap();
        let result = secrets(&snap);
        assert_eq!(result.status, CheckStatus::Warn);
        assert!(result.detail.contains("app/config.py:2"));
        assert!(!result.detail.contains("app/config.py:1"));
    }

    #[test]
    fn test_route_coverage_with_router_prefix() {
        let dir = tempdir().unwrap();
        write(
            dir.path(),
            "app/api/users.py",
            "router = APIRouter(prefix=\"/users\")\n\n@router.get(\"/{user_id}\")\ndef get_user(user_id: int): ...\n",
        );
        let manifest = vec![entry("app/api/users.py", FileAction::Create)];
        let routes = vec![
            ("GET".to_string(), "/api/users/{id}".to_string()),
            ("POST".to_string(), "/api/users".to_string()),
        ];
        let snap = Snapshot::capture(dir.path(), &manifest, &[], &routes).unwrap();
        let result = route_coverage(&snap);
        assert_eq!(result.status, CheckStatus::Warn);
        assert!(result.detail.contains("POST /api/users"));
        assert!(!result.detail.contains("GET"));
    }

    #[test]
    fn test_rename_detection() {
        let dir = tempdir().unwrap();
        write(dir.path(), "app/routers/users.py", "x = 1\n");
        let manifest = vec![entry("app/api/users.py", FileAction::Create)];
        let snap = Snapshot::capture(dir.path(), &manifest, &[], &[]).unwrap();
        let result = renames(&snap);
        assert_eq!(result.status, CheckStatus::Warn);
        assert!(result.detail.contains("app/api/users.py → app/routers/users.py"));
    }

    #[test]
    fn test_placeholders_found() {
        let dir = tempdir().unwrap();
        write(
            dir.path(),
            "app/service.py",
            "def f():\n    # TODO: wire up\n    raise NotImplementedError\n",
        );
        let manifest = vec![entry("app/service.py", FileAction::Create)];
        let snap = Snapshot::capture(dir.path(), &manifest, &[], &[]).unwrap();
        let result = placeholders(&snap);
        assert_eq!(result.status, CheckStatus::Warn);
        assert!(result.detail.contains("app/service.py:2"));
        assert!(result.detail.contains("app/service.py:3"));
    }
}
