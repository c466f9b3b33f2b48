//! Restart sweep.
//!
//! After a restart no build has a live task. Builds that were waiting on a
//! gate go to `paused`. Builds that were running have their progress
//! reconciled against the workspace history and are then either handed
//! back for resumption or failed.

use anyhow::Result;
use regex::Regex;
use std::path::Path;

use crate::build::{Build, BuildId, BuildStatus};
use crate::config::AutoforgeConfig;
use crate::manifest::ManifestCache;
use crate::registry::BuildRegistry;
use crate::store::BuildStore;
use crate::workspace::WorkspaceProvider;

/// How far back in history to look for phase-completion commits.
const HISTORY_DEPTH: usize = 200;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Builds that were waiting on an operator
    pub paused: Vec<BuildId>,
    pub failed: Vec<BuildId>,
    /// Builds to respawn (only when `auto_resume` is on)
    pub resumable: Vec<BuildId>,
}

/// Highest phase number with a `"<tag>: Phase N complete"` commit.
pub fn completed_from_history(messages: &[String], tag: &str) -> Option<i64> {
    let pattern = format!(r"^{}: Phase (\d+) complete", regex::escape(tag));
    let re = Regex::new(&pattern).ok()?;
    messages
        .iter()
        .filter_map(|m| re.captures(m.trim()))
        .filter_map(|c| c[1].parse::<i64>().ok())
        .max()
}

/// Bring `completed_phases` up to what the workspace history proves and
/// drop manifest caches for phases that are done.
async fn reconcile(
    store: &dyn BuildStore,
    workspaces: &dyn WorkspaceProvider,
    config: &AutoforgeConfig,
    state_root: &Path,
    build: &Build,
) -> Result<i64> {
    let mut completed = build.completed_phases;
    if build.working_dir.exists() {
        let workspace = workspaces.prepare(build).await?;
        let history = workspace.commit_messages(HISTORY_DEPTH).await?;
        if let Some(from_history) =
            completed_from_history(&history, &config.orchestrator.commit_tag)
            && from_history > completed
        {
            tracing::info!(
                build_id = %build.id,
                stored = completed,
                from_history,
                "workspace history is ahead of the build record"
            );
            completed = from_history;
            store
                .update(build.id, Box::new(move |b| b.completed_phases = completed))
                .await?;
        }
    }

    let cache = ManifestCache::new(state_root, build.id);
    for phase in cache.cached_phases() {
        if i64::from(phase) <= completed {
            cache.remove(phase)?;
        }
    }
    Ok(completed)
}

async fn sweep_one(
    store: &dyn BuildStore,
    registry: &BuildRegistry,
    workspaces: &dyn WorkspaceProvider,
    config: &AutoforgeConfig,
    state_root: &Path,
    build: &Build,
    report: &mut SweepReport,
) -> Result<()> {
    let id = build.id;
    if let Some(gate) = &build.pending_gate {
        let detail = format!("awaiting {} after restart", gate.kind);
        if build.status == BuildStatus::Pending {
            registry.transition(id, BuildStatus::Running, None).await?;
        }
        if build.status != BuildStatus::Paused {
            registry
                .transition(id, BuildStatus::Paused, Some(detail))
                .await?;
        }
        report.paused.push(id);
        return Ok(());
    }
    if build.status == BuildStatus::Paused {
        return Ok(());
    }

    let completed = reconcile(store, workspaces, config, state_root, build).await?;
    if config.orchestrator.auto_resume {
        tracing::info!(build_id = %id, completed_phases = completed, "build will resume");
        report.resumable.push(id);
        return Ok(());
    }
    registry
        .transition(id, BuildStatus::Failed, Some("interrupted by restart".to_string()))
        .await?;
    if build.target.is_ephemeral()
        && let Err(e) = workspaces.remove(build).await
    {
        tracing::warn!(build_id = %id, error = %e, "failed to remove workspace");
    }
    report.failed.push(id);
    Ok(())
}

/// Sweep every non-terminal build that has no live task.
pub async fn sweep(
    store: &dyn BuildStore,
    registry: &BuildRegistry,
    workspaces: &dyn WorkspaceProvider,
    config: &AutoforgeConfig,
    state_root: &Path,
) -> Result<SweepReport> {
    let mut report = SweepReport::default();
    for build in store.list().await? {
        if build.status.is_terminal() || registry.is_active(build.id) {
            continue;
        }
        if let Err(e) =
            sweep_one(store, registry, workspaces, config, state_root, &build, &mut report).await
        {
            tracing::error!(build_id = %build.id, error = %e, "restart recovery failed for build");
        }
    }
    tracing::info!(
        paused = report.paused.len(),
        failed = report.failed.len(),
        resumable = report.resumable.len(),
        "restart sweep complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{BuildTarget, GateKind, PendingGate};
    use crate::events::EventBus;
    use crate::manifest::{FileAction, FileManifestEntry};
    use crate::store::MemoryStore;
    use crate::workspace::{MemoryWorkspace, MemoryWorkspaceProvider};
    use chrono::Utc;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        store: Arc<MemoryStore>,
        registry: BuildRegistry,
        workspaces: MemoryWorkspaceProvider,
    }

    impl Fixture {
        fn new(history: &[&str]) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = Arc::new(MemoryStore::new());
            let registry = BuildRegistry::new(store.clone(), EventBus::new());
            let workspaces = MemoryWorkspaceProvider::new(Arc::new(
                MemoryWorkspace::new(dir.path()).with_commits(history),
            ));
            Self {
                dir,
                store,
                registry,
                workspaces,
            }
        }

        async fn build(&self, status: BuildStatus, gate: Option<GateKind>) -> BuildId {
            let build = Build::new(
                "demo",
                BuildTarget::LocalPath {
                    path: self.dir.path().to_path_buf(),
                    branch: "main".into(),
                },
                self.dir.path().to_path_buf(),
                self.dir.path().join("contracts"),
            );
            self.store.create(&build).await.unwrap();
            self.store
                .update(
                    build.id,
                    Box::new(move |b| {
                        b.status = status;
                        b.pending_gate = gate.map(|kind| PendingGate {
                            kind,
                            payload: serde_json::json!({ "phase": 1 }),
                            registered_at: Utc::now(),
                        });
                    }),
                )
                .await
                .unwrap();
            build.id
        }

        async fn sweep(&self, config: &AutoforgeConfig) -> SweepReport {
            sweep(
                self.store.as_ref(),
                &self.registry,
                &self.workspaces,
                config,
                &self.dir.path().join("state"),
            )
            .await
            .unwrap()
        }

        async fn get(&self, id: BuildId) -> Build {
            self.store.get(id).await.unwrap().unwrap()
        }
    }

    #[test]
    fn test_completed_from_history() {
        let history = vec![
            "forge: Phase 2 recovery round 1".to_string(),
            "forge: Phase 1 complete (2 audit attempts)".to_string(),
            "forge: Phase 0 complete".to_string(),
            "other: Phase 9 complete".to_string(),
        ];
        assert_eq!(completed_from_history(&history, "forge"), Some(1));
        assert_eq!(completed_from_history(&history, "nope"), None);
    }

    #[tokio::test]
    async fn test_gated_build_pauses_not_fails() {
        let fixture = Fixture::new(&[]);
        let running = fixture.build(BuildStatus::Running, Some(GateKind::PhaseReview)).await;
        let paused = fixture.build(BuildStatus::Paused, Some(GateKind::Clarification)).await;
        let pending = fixture.build(BuildStatus::Pending, Some(GateKind::PlanReview)).await;

        let report = fixture.sweep(&AutoforgeConfig::default()).await;
        assert_eq!(report.paused.len(), 3);
        assert!(report.failed.is_empty());
        for id in [running, paused, pending] {
            let build = fixture.get(id).await;
            assert_eq!(build.status, BuildStatus::Paused);
            assert!(build.pending_gate.is_some());
        }
    }

    #[tokio::test]
    async fn test_interrupted_build_reconciled_then_failed() {
        let fixture = Fixture::new(&["forge: contract snapshot", "forge: Phase 1 complete"]);
        let id = fixture.build(BuildStatus::Running, None).await;
        let cache = ManifestCache::new(&fixture.dir.path().join("state"), id);
        let entry = FileManifestEntry::new("a.py", FileAction::Create, "a").unwrap();
        cache.save(1, std::slice::from_ref(&entry)).unwrap();
        cache.save(2, &[entry]).unwrap();

        let report = fixture.sweep(&AutoforgeConfig::default()).await;
        assert_eq!(report.failed, vec![id]);
        let build = fixture.get(id).await;
        assert_eq!(build.status, BuildStatus::Failed);
        assert_eq!(build.completed_phases, 1);
        assert_eq!(build.detail.as_deref(), Some("interrupted by restart"));
        assert_eq!(cache.cached_phases(), vec![2]);
    }

    #[tokio::test]
    async fn test_auto_resume_hands_builds_back() {
        let fixture = Fixture::new(&[]);
        let id = fixture.build(BuildStatus::Running, None).await;
        let idle = fixture.build(BuildStatus::Paused, None).await;
        let mut config = AutoforgeConfig::default();
        config.orchestrator.auto_resume = true;

        let report = fixture.sweep(&config).await;
        assert_eq!(report.resumable, vec![id]);
        assert_eq!(fixture.get(id).await.status, BuildStatus::Running);
        assert_eq!(fixture.get(idle).await.status, BuildStatus::Paused);
    }

    #[tokio::test]
    async fn test_live_builds_are_left_alone() {
        let fixture = Fixture::new(&[]);
        let id = fixture.build(BuildStatus::Running, None).await;
        let _runtime = fixture.registry.register(id).unwrap();
        let report = fixture.sweep(&AutoforgeConfig::default()).await;
        assert_eq!(report, SweepReport::default());
        assert_eq!(fixture.get(id).await.status, BuildStatus::Running);
    }
}
