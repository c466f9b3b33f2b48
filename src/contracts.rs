//! Project contracts: the fixed documents every phase is generated against.
//!
//! Contracts are the markdown files of one directory, keyed by file stem
//! (`blueprint`, `stack`, `schema`, `physics`, `boundaries`, `ui`, `phases`).
//! Per-file prompts only carry the contracts relevant to the file's path
//! prefix; see [`Contracts::relevant_for`].

use anyhow::{Context, Result, bail};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use crate::phase::{Phase, parse_phases};

/// Directory inside the workspace that receives the contract snapshot.
pub const SNAPSHOT_DIR: &str = ".autoforge-contracts";

pub const PHASES_CONTRACT: &str = "phases";

static ROUTE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:[-*|]\s*)?`?(GET|POST|PUT|PATCH|DELETE)\s+(/[A-Za-z0-9_\-/{}:.]*)").unwrap()
});

/// Path prefix → contract names shown for files under it. First match wins.
const RELEVANCE_TABLE: &[(&str, &[&str])] = &[
    ("tests/", &["stack", "physics", "schema"]),
    ("test/", &["stack", "physics", "schema"]),
    ("app/api/", &["physics", "boundaries", "schema"]),
    ("app/routers/", &["physics", "boundaries", "schema"]),
    ("src/routes/", &["physics", "boundaries", "schema"]),
    ("app/models/", &["schema", "stack"]),
    ("app/repositories/", &["schema", "boundaries"]),
    ("migrations/", &["schema"]),
    ("alembic/", &["schema"]),
    ("db/", &["schema"]),
    ("app/services/", &["blueprint", "physics", "boundaries"]),
    ("frontend/", &["ui", "physics"]),
    ("web/", &["ui", "physics"]),
    ("ui/", &["ui", "physics"]),
];

/// Contracts for files that match no prefix.
const DEFAULT_RELEVANT: &[&str] = &["blueprint", "stack"];

/// Contracts for top-level manifests (`requirements.txt`, `package.json`, ...).
const ROOT_RELEVANT: &[&str] = &["stack"];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Contracts {
    docs: BTreeMap<String, String>,
}

impl Contracts {
    pub fn from_docs<I, K, V>(docs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            docs: docs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Load every `*.md` file directly inside `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            bail!("Contracts directory not found: {}", dir.display());
        }
        let mut docs = BTreeMap::new();
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read contracts directory {}", dir.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read contract {}", path.display()))?;
            docs.insert(stem.to_string(), content);
        }
        if docs.is_empty() {
            bail!("No contracts (*.md) found in {}", dir.display());
        }
        Ok(Self { docs })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.docs.get(name).map(String::as_str)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.docs.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn phases(&self) -> Result<Vec<Phase>> {
        let doc = self
            .get(PHASES_CONTRACT)
            .context("Contracts do not include phases.md")?;
        let phases = parse_phases(doc)?;
        if phases.is_empty() {
            bail!("phases.md declares no phases");
        }
        Ok(phases)
    }

    /// Contract names relevant to a file path, restricted to contracts that exist.
    pub fn relevant_for(&self, path: &str) -> Vec<&str> {
        let names: &[&str] = if !path.contains('/') && is_root_manifest(path) {
            ROOT_RELEVANT
        } else {
            RELEVANCE_TABLE
                .iter()
                .find(|(prefix, _)| path.starts_with(prefix))
                .map(|(_, names)| *names)
                .unwrap_or(DEFAULT_RELEVANT)
        };
        names
            .iter()
            .copied()
            .filter(|n| self.docs.contains_key(*n))
            .collect()
    }

    /// Render the named contracts as prompt sections.
    pub fn render(&self, names: &[&str]) -> String {
        names
            .iter()
            .filter_map(|n| self.get(n).map(|c| format!("### CONTRACT: {}\n{}\n", n, c)))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Render every contract except the phase list.
    pub fn render_reference(&self) -> String {
        let names: Vec<&str> = self.names().filter(|n| *n != PHASES_CONTRACT).collect();
        self.render(&names)
    }

    /// Short content hash identifying this contract set.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, content) in &self.docs {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update(content.as_bytes());
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())[..12].to_string()
    }

    /// Routes declared as `METHOD /path` lines in any contract.
    pub fn declared_routes(&self) -> Vec<(String, String)> {
        let mut routes: Vec<(String, String)> = self
            .docs
            .values()
            .flat_map(|doc| {
                ROUTE_LINE
                    .captures_iter(doc)
                    .map(|c| (c[1].to_string(), c[2].trim_end_matches('`').to_string()))
                    .collect::<Vec<_>>()
            })
            .collect();
        routes.sort();
        routes.dedup();
        routes
    }

    /// Write the snapshot into `<root>/.autoforge-contracts/`.
    pub fn write_snapshot(&self, root: &Path) -> Result<Vec<String>> {
        let dir = root.join(SNAPSHOT_DIR);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let mut written = Vec::new();
        for (name, content) in &self.docs {
            let rel = format!("{}/{}.md", SNAPSHOT_DIR, name);
            std::fs::write(root.join(&rel), content)
                .with_context(|| format!("Failed to write contract snapshot {}", rel))?;
            written.push(rel);
        }
        Ok(written)
    }
}

fn is_root_manifest(path: &str) -> bool {
    matches!(
        path,
        "requirements.txt"
            | "pyproject.toml"
            | "package.json"
            | "Cargo.toml"
            | "go.mod"
            | "Dockerfile"
            | "docker-compose.yml"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> Contracts {
        Contracts::from_docs([
            ("blueprint", "# Blueprint"),
            ("stack", "# Stack\nPython + FastAPI"),
            ("schema", "# Schema"),
            ("physics", "# API\n- GET /health\n- `POST /api/users`\n| PUT /api/users/{id} |"),
            ("phases", "## Phase 0 — Genesis\nObjective: start\n- skeleton\n"),
        ])
    }

    #[test]
    fn test_relevance_by_prefix() {
        let c = sample();
        assert_eq!(c.relevant_for("app/api/users.py"), vec!["physics", "schema"]);
        assert_eq!(c.relevant_for("tests/test_users.py"), vec!["stack", "physics", "schema"]);
        assert_eq!(c.relevant_for("app/core/config.py"), vec!["blueprint", "stack"]);
        assert_eq!(c.relevant_for("requirements.txt"), vec!["stack"]);
    }

    #[test]
    fn test_render_only_named() {
        let c = sample();
        let text = c.render(&["schema"]);
        assert!(text.contains("CONTRACT: schema"));
        assert!(!text.contains("Blueprint"));
        assert!(!c.render_reference().contains("CONTRACT: phases"));
    }

    #[test]
    fn test_phases_from_contract() {
        let phases = sample().phases().unwrap();
        assert_eq!(phases.len(), 1);
        assert_eq!(phases[0].name, "Genesis");
    }

    #[test]
    fn test_missing_phases_contract_is_error() {
        let c = Contracts::from_docs([("stack", "x")]);
        assert!(c.phases().is_err());
    }

    #[test]
    fn test_fingerprint_changes_with_content() {
        let a = sample();
        let b = Contracts::from_docs([("stack", "changed")]);
        assert_eq!(a.fingerprint().len(), 12);
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), sample().fingerprint());
    }

    #[test]
    fn test_declared_routes() {
        let routes = sample().declared_routes();
        assert!(routes.contains(&("GET".to_string(), "/health".to_string())));
        assert!(routes.contains(&("POST".to_string(), "/api/users".to_string())));
        assert!(routes.contains(&("PUT".to_string(), "/api/users/{id}".to_string())));
    }

    #[test]
    fn test_load_and_snapshot() {
        let src = tempdir().unwrap();
        std::fs::write(src.path().join("stack.md"), "stack").unwrap();
        std::fs::write(src.path().join("phases.md"), "## Phase 0 - A\n").unwrap();
        std::fs::write(src.path().join("notes.txt"), "ignored").unwrap();
        let contracts = Contracts::load(src.path()).unwrap();
        assert_eq!(contracts.len(), 2);

        let dest = tempdir().unwrap();
        let written = contracts.write_snapshot(dest.path()).unwrap();
        assert_eq!(written.len(), 2);
        assert!(dest.path().join(SNAPSHOT_DIR).join("stack.md").exists());
    }

    #[test]
    fn test_load_missing_dir_is_error() {
        let err = Contracts::load(Path::new("/definitely/not/here")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
