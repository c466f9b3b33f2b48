//! JSON-file store under `<state_root>/builds/<build_id>/`.
//!
//! - `build.json`: the build record, replaced atomically on every update
//! - `log.jsonl`: append-only build log
//! - `costs.jsonl`: append-only cost ledger rows
//!
//! All file access runs on tokio's blocking pool behind one mutex, so
//! read-modify-write updates are serialised process-wide.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::{BuildMutation, BuildStore, CostEntry, CostLedger};
use crate::build::{Build, BuildId, BuildLogEntry};

const BUILD_FILE: &str = "build.json";
const LOG_FILE: &str = "log.jsonl";
const COST_FILE: &str = "costs.jsonl";

struct Dirs {
    root: PathBuf,
}

impl Dirs {
    fn build_dir(&self, id: BuildId) -> PathBuf {
        self.root.join(id.to_string())
    }

    fn read_build(&self, id: BuildId) -> Result<Option<Build>> {
        let path = self.build_dir(id).join(BUILD_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let build = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(Some(build))
    }

    fn write_build(&self, build: &Build) -> Result<()> {
        let dir = self.build_dir(build.id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join(BUILD_FILE);
        let tmp = dir.join(format!("{}.tmp", BUILD_FILE));
        std::fs::write(&tmp, serde_json::to_string_pretty(build)?)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}

fn append_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    writeln!(file, "{}", serde_json::to_string(value)?)?;
    Ok(())
}

fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).with_context(|| format!("Bad line in {}", path.display())))
        .collect()
}

#[derive(Clone)]
pub struct FileStore {
    inner: Arc<Mutex<Dirs>>,
}

impl FileStore {
    /// `root` is the directory holding one subdirectory per build.
    pub fn new(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)
            .with_context(|| format!("Failed to create store directory {}", root.display()))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(Dirs {
                root: root.to_path_buf(),
            })),
        })
    }

    async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Dirs) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = inner
                .lock()
                .map_err(|e| anyhow::anyhow!("Store lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("Store task panicked")?
    }
}

#[async_trait]
impl BuildStore for FileStore {
    async fn create(&self, build: &Build) -> Result<()> {
        let build = build.clone();
        self.call(move |dirs| {
            if dirs.read_build(build.id)?.is_some() {
                bail!("Build {} already exists", build.id);
            }
            dirs.write_build(&build)
        })
        .await
    }

    async fn get(&self, id: BuildId) -> Result<Option<Build>> {
        self.call(move |dirs| dirs.read_build(id)).await
    }

    async fn list(&self) -> Result<Vec<Build>> {
        self.call(|dirs| {
            let mut builds = Vec::new();
            for entry in std::fs::read_dir(&dirs.root)? {
                let entry = entry?;
                let Ok(id) = entry.file_name().to_string_lossy().parse::<BuildId>() else {
                    continue;
                };
                match dirs.read_build(id) {
                    Ok(Some(build)) => builds.push(build),
                    Ok(None) => {}
                    Err(e) => tracing::warn!(build_id = %id, error = %e, "skipping unreadable build"),
                }
            }
            builds.sort_by_key(|b| b.created_at);
            Ok(builds)
        })
        .await
    }

    async fn update(&self, id: BuildId, mutation: BuildMutation) -> Result<Option<Build>> {
        self.call(move |dirs| {
            let Some(mut build) = dirs.read_build(id)? else {
                return Ok(None);
            };
            mutation(&mut build);
            build.updated_at = Utc::now();
            dirs.write_build(&build)?;
            Ok(Some(build))
        })
        .await
    }

    async fn append_log(&self, id: BuildId, entry: BuildLogEntry) -> Result<()> {
        self.call(move |dirs| append_line(&dirs.build_dir(id).join(LOG_FILE), &entry))
            .await
    }

    async fn logs(&self, id: BuildId) -> Result<Vec<BuildLogEntry>> {
        self.call(move |dirs| read_lines(&dirs.build_dir(id).join(LOG_FILE)))
            .await
    }
}

#[async_trait]
impl CostLedger for FileStore {
    async fn record(&self, entry: CostEntry) -> Result<()> {
        self.call(move |dirs| append_line(&dirs.build_dir(entry.build_id).join(COST_FILE), &entry))
            .await
    }

    async fn entries(&self, build_id: BuildId) -> Result<Vec<CostEntry>> {
        self.call(move |dirs| read_lines(&dirs.build_dir(build_id).join(COST_FILE)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{BuildStatus, BuildTarget, LogLevel};
    use crate::config::ModelPrice;
    use crate::provider::TokenUsage;
    use tempfile::tempdir;

    fn build() -> Build {
        Build::new(
            "demo",
            BuildTarget::NewRepo {
                name: "demo".into(),
                remote: None,
            },
            "/tmp/demo".into(),
            "/tmp/contracts".into(),
        )
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempdir().unwrap();
        let b = build();
        {
            let store = FileStore::new(dir.path()).unwrap();
            store.create(&b).await.unwrap();
            store
                .update(
                    b.id,
                    Box::new(|b| {
                        b.transition(BuildStatus::Running, None);
                        b.completed_phases = 2;
                    }),
                )
                .await
                .unwrap();
            store
                .append_log(b.id, BuildLogEntry::new(LogLevel::Info, "phase 2 committed"))
                .await
                .unwrap();
        }

        let store = FileStore::new(dir.path()).unwrap();
        let loaded = store.get(b.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, BuildStatus::Running);
        assert_eq!(loaded.completed_phases, 2);
        assert_eq!(store.list().await.unwrap().len(), 1);
        assert_eq!(store.logs(b.id).await.unwrap()[0].message, "phase 2 committed");
    }

    #[tokio::test]
    async fn test_cost_rows_append() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        let id = uuid::Uuid::new_v4();
        let price = ModelPrice {
            input_per_mtok: 1.0,
            output_per_mtok: 5.0,
        };
        for label in ["Phase 0 — Genesis", "Phase 0 — Genesis (recovery)"] {
            store
                .record(CostEntry::new(
                    id,
                    label,
                    "m",
                    TokenUsage {
                        input_tokens: 10,
                        output_tokens: 2,
                    },
                    price,
                ))
                .await
                .unwrap();
        }
        let rows = store.entries(id).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].phase_label, "Phase 0 — Genesis (recovery)");
    }

    #[tokio::test]
    async fn test_list_ignores_foreign_directories() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("not-a-uuid")).unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        assert!(store.list().await.unwrap().is_empty());
        assert!(store.update(uuid::Uuid::new_v4(), Box::new(|_| {})).await.unwrap().is_none());
    }
}
