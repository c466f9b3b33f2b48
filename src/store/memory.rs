//! In-process store for tests.

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{BuildMutation, BuildStore, CostEntry, CostLedger};
use crate::build::{Build, BuildId, BuildLogEntry};

#[derive(Default)]
struct Tables {
    builds: HashMap<BuildId, Build>,
    logs: HashMap<BuildId, Vec<BuildLogEntry>>,
    costs: Vec<CostEntry>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BuildStore for MemoryStore {
    async fn create(&self, build: &Build) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if tables.builds.contains_key(&build.id) {
            bail!("Build {} already exists", build.id);
        }
        tables.builds.insert(build.id, build.clone());
        Ok(())
    }

    async fn get(&self, id: BuildId) -> Result<Option<Build>> {
        Ok(self.tables.lock().await.builds.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Build>> {
        let mut builds: Vec<Build> = self.tables.lock().await.builds.values().cloned().collect();
        builds.sort_by_key(|b| b.created_at);
        Ok(builds)
    }

    async fn update(&self, id: BuildId, mutation: BuildMutation) -> Result<Option<Build>> {
        let mut tables = self.tables.lock().await;
        let Some(build) = tables.builds.get_mut(&id) else {
            return Ok(None);
        };
        mutation(build);
        build.updated_at = Utc::now();
        Ok(Some(build.clone()))
    }

    async fn append_log(&self, id: BuildId, entry: BuildLogEntry) -> Result<()> {
        self.tables
            .lock()
            .await
            .logs
            .entry(id)
            .or_default()
            .push(entry);
        Ok(())
    }

    async fn logs(&self, id: BuildId) -> Result<Vec<BuildLogEntry>> {
        Ok(self
            .tables
            .lock()
            .await
            .logs
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl CostLedger for MemoryStore {
    async fn record(&self, entry: CostEntry) -> Result<()> {
        self.tables.lock().await.costs.push(entry);
        Ok(())
    }

    async fn entries(&self, build_id: BuildId) -> Result<Vec<CostEntry>> {
        Ok(self
            .tables
            .lock()
            .await
            .costs
            .iter()
            .filter(|c| c.build_id == build_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{BuildStatus, BuildTarget, LogLevel};

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
    async fn test_create_update_and_logs() {
        let store = MemoryStore::new();
        let b = build();
        store.create(&b).await.unwrap();
        assert!(store.create(&b).await.is_err());

        let updated = store
            .update(
                b.id,
                Box::new(|b| {
                    b.transition(BuildStatus::Running, None);
                }),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, BuildStatus::Running);
        assert!(store
            .update(uuid::Uuid::new_v4(), Box::new(|_| {}))
            .await
            .unwrap()
            .is_none());

        store
            .append_log(b.id, BuildLogEntry::new(LogLevel::Warn, "paused: review"))
            .await
            .unwrap();
        assert_eq!(store.logs(b.id).await.unwrap().len(), 1);
    }
}
