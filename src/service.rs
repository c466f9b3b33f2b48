//! Operator-facing control surface.
//!
//! Every operation either acts on the live task through the registry or,
//! when no task exists (after a restart), on the persisted build record.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::build::{Build, BuildId, BuildLogEntry, BuildStatus, BuildTarget, GateKind, LogLevel};
use crate::commands::{OperatorCommand, parse_command};
use crate::config::AutoforgeConfig;
use crate::contracts::Contracts;
use crate::errors::BuildError;
use crate::events::EventBus;
use crate::orchestrator::{Engine, RunOutcome};
use crate::provider::build_client;
use crate::recovery::orphan::{self, SweepReport};
use crate::registry::{BuildRegistry, GateResolution};
use crate::store::FileStore;
use crate::workspace::GitWorkspaceProvider;
use crate::watchdog::{self, Thresholds};

const STATUS_LOG_LINES: usize = 10;

/// Synchronous `/status` read.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub id: BuildId,
    pub project: String,
    pub status: BuildStatus,
    pub current_phase: Option<String>,
    pub completed_phases: i64,
    pub cost_usd: f64,
    pub pending_gate: Option<GateKind>,
    pub detail: Option<String>,
    /// A task is driving the build right now
    pub live: bool,
    pub activity: Option<String>,
    pub idle_secs: Option<u64>,
    pub recent_log: Vec<BuildLogEntry>,
}

#[derive(Debug, Clone)]
pub enum CommandOutcome {
    /// Flag set, signal queued or gate resolved
    Ack(String),
    Status(Box<StatusReport>),
}

pub struct BuildService {
    engine: Arc<Engine>,
    /// Serialises the one-active-build-per-project check with creation
    start_lock: Mutex<()>,
}

impl BuildService {
    pub fn new(engine: Arc<Engine>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            start_lock: Mutex::new(()),
        })
    }

    /// Production wiring: JSON-file store under `state_root`, git
    /// workspaces and the pooled CLI generation client.
    pub fn open(state_root: &Path, config: AutoforgeConfig) -> Result<Arc<Self>, BuildError> {
        let store = Arc::new(FileStore::new(&state_root.join("store"))?);
        let registry = Arc::new(BuildRegistry::new(store.clone(), EventBus::new()));
        let engine = Engine {
            client: build_client(&config.provider, &config.retry),
            workspaces: Arc::new(
                GitWorkspaceProvider::new(config.workspace.builds_root.clone())
                    .with_retry(config.workspace.push_max_retries, config.workspace.push_backoff_ms),
            ),
            config: Arc::new(config),
            store: store.clone(),
            ledger: store,
            registry,
            state_root: state_root.to_path_buf(),
        };
        Ok(Self::new(Arc::new(engine)))
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    async fn get(&self, id: BuildId) -> Result<Build, BuildError> {
        self.engine
            .store
            .get(id)
            .await?
            .ok_or(BuildError::NotFound { id })
    }

    fn invalid(build: &Build, action: &str) -> BuildError {
        BuildError::InvalidState {
            id: build.id,
            status: build.status.to_string(),
            action: action.to_string(),
        }
    }

    /// Create a build for `project` and start driving it. A project may
    /// have only one non-terminal build.
    pub async fn start(
        self: &Arc<Self>,
        project: &str,
        target: BuildTarget,
        contracts_dir: PathBuf,
    ) -> Result<Build, BuildError> {
        let _guard = self.start_lock.lock().await;
        let existing = self.engine.store.list().await?;
        if let Some(active) = existing
            .iter()
            .find(|b| b.project == project && !b.status.is_terminal())
        {
            return Err(BuildError::AlreadyRunning {
                project: project.to_string(),
                build_id: active.id,
            });
        }

        let contracts = Contracts::load(&contracts_dir)?;
        let phases = contracts.phases()?;
        if phases.is_empty() {
            return Err(anyhow::anyhow!(
                "No phases declared in {}",
                contracts_dir.join("phases.md").display()
            )
            .into());
        }

        let mut build = Build::new(project, target, PathBuf::new(), contracts_dir);
        build.working_dir = self.engine.workspaces.working_dir(build.id, &build.target);
        self.engine.store.create(&build).await?;
        tracing::info!(
            build_id = %build.id,
            project,
            phases = phases.len(),
            dir = %build.working_dir.display(),
            "build created"
        );
        self.spawn_task(build.id, None)?;
        Ok(build)
    }

    /// Own the build with a fresh task plus its watchdog.
    fn spawn_task(
        self: &Arc<Self>,
        id: BuildId,
        carried: Option<(GateKind, GateResolution)>,
    ) -> Result<(), BuildError> {
        let engine = self.engine.clone();
        let registry = engine.registry.clone();
        let Some(runtime) = registry.register(id) else {
            return Err(BuildError::InvalidState {
                id,
                status: BuildStatus::Running.to_string(),
                action: "start a second task".to_string(),
            });
        };
        let kill = runtime.kill.clone();
        let monitor = watchdog::spawn(
            registry.clone(),
            engine.store.clone(),
            id,
            Thresholds::from(&engine.config.watchdog),
        );

        let task = tokio::spawn(async move {
            let outcome = tokio::select! {
                result = engine.clone().run(runtime, carried) => match result {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        tracing::error!(build_id = %id, error = %format!("{:#}", e), "build failed");
                        RunOutcome::Failed(format!("{:#}", e))
                    }
                },
                _ = kill.cancelled() => {
                    let liveness = registry.liveness(id);
                    let stalled = BuildError::Stalled {
                        idle_secs: liveness.as_ref().map_or(0, |l| l.idle.as_secs()),
                        activity: liveness.map_or_else(String::new, |l| l.activity),
                    };
                    tracing::error!(build_id = %id, error = %stalled, "build killed by watchdog");
                    RunOutcome::Failed(stalled.to_string())
                }
            };
            monitor.abort();
            match engine.finalize(id, outcome).await {
                Ok(status) => tracing::info!(build_id = %id, status = %status, "build task finished"),
                Err(e) => tracing::error!(build_id = %id, error = %e, "failed to record build outcome"),
            }
            registry.cleanup(id);
        });
        self.engine.registry.attach_task(id, task);
        Ok(())
    }

    /// Ask the live task to pause at its next checkpoint.
    pub async fn pause(&self, id: BuildId) -> Result<(), BuildError> {
        let build = self.get(id).await?;
        if build.status == BuildStatus::Paused {
            return Ok(());
        }
        if build.status.is_terminal() || !self.engine.registry.request_pause(id) {
            return Err(Self::invalid(&build, "pause"));
        }
        self.engine
            .registry
            .log(id, LogLevel::Info, "pause requested by operator")
            .await?;
        Ok(())
    }

    /// `/start` and `/continue`. An open gate is answered (retry for a phase
    /// review, approve otherwise); a paused or interrupted build gets a new
    /// task. `phase` restarts the build from that phase.
    pub async fn resume(self: &Arc<Self>, id: BuildId, phase: Option<u32>) -> Result<String, BuildError> {
        let build = self.get(id).await?;
        if build.status.is_terminal() {
            return Err(Self::invalid(&build, "resume"));
        }
        let gate = self
            .engine
            .registry
            .open_gate_kind(id)
            .or(build.pending_gate.as_ref().map(|g| g.kind));

        if let Some(number) = phase {
            if self.engine.registry.is_active(id) {
                return Err(Self::invalid(&build, "jump to another phase"));
            }
            if let Some(kind) = gate {
                self.engine
                    .registry
                    .clear_marker(id, kind, &GateResolution::Retry)
                    .await?;
            }
            self.rewind(&build, number).await?;
            self.spawn_task(id, None)?;
            return Ok(format!("resuming from phase {}", number));
        }

        if let Some(kind) = gate {
            let resolution = match kind {
                GateKind::PhaseReview => GateResolution::Retry,
                _ => GateResolution::Approve,
            };
            self.resolve_gate(id, resolution).await?;
            return Ok(format!("{} resolved", kind));
        }
        if self.engine.registry.is_active(id) {
            return Err(Self::invalid(&build, "resume a build that is already running"));
        }
        self.spawn_task(id, None)?;
        Ok("resumed".to_string())
    }

    /// Forget progress at and after `phase`.
    async fn rewind(&self, build: &Build, phase: u32) -> Result<(), BuildError> {
        let completed = i64::from(phase) - 1;
        self.engine
            .store
            .update(
                build.id,
                Box::new(move |b| {
                    b.completed_phases = completed;
                    b.counters.phase_attempts = 0;
                    b.counters.recovery_rounds = 0;
                }),
            )
            .await?;
        let cache = self.engine.manifest_cache(build.id);
        for cached in cache.cached_phases() {
            if cached >= phase {
                cache.remove(cached)?;
            }
        }
        Ok(())
    }

    /// Request cancellation. A build without a live task is cancelled
    /// directly.
    pub async fn cancel(&self, id: BuildId) -> Result<(), BuildError> {
        let build = self.get(id).await?;
        if build.status.is_terminal() {
            return Err(Self::invalid(&build, "cancel"));
        }
        if self.engine.registry.request_cancel(id) {
            tracing::info!(build_id = %id, "cancellation requested");
            return Ok(());
        }
        self.engine.finalize(id, RunOutcome::Cancelled).await?;
        Ok(())
    }

    /// Deliver an operator decision. Without a live task the persisted gate
    /// marker is resolved and a new task picks the build up.
    pub async fn resolve_gate(
        self: &Arc<Self>,
        id: BuildId,
        resolution: GateResolution,
    ) -> Result<GateKind, BuildError> {
        if let Some(kind) = self
            .engine
            .registry
            .resolve_gate(id, resolution.clone())
            .await?
        {
            return Ok(kind);
        }
        let build = self.get(id).await?;
        let Some(gate) = build.pending_gate.clone() else {
            return Err(BuildError::NoOpenGate { id });
        };
        if self.engine.registry.is_active(id) {
            // The task is between opening the gate in memory and persisting it.
            return Err(BuildError::NoOpenGate { id });
        }
        let kind = gate.kind;
        self.engine
            .registry
            .clear_marker(id, kind, &resolution)
            .await?;
        tracing::info!(build_id = %id, gate = %kind, ?resolution, "persisted gate resolved");

        if resolution == GateResolution::Abort {
            self.engine
                .finalize(id, RunOutcome::Failed(format!("aborted by operator at {}", kind)))
                .await?;
            return Ok(kind);
        }
        match kind {
            GateKind::PhaseReview => {
                let phase = build.next_phase();
                if resolution == GateResolution::Skip {
                    self.skip_phase(&build, phase).await?;
                } else {
                    self.rewind(&build, phase).await?;
                }
                self.spawn_task(id, None)?;
            }
            _ => self.spawn_task(id, Some((kind, resolution)))?,
        }
        Ok(kind)
    }

    async fn skip_phase(&self, build: &Build, phase: u32) -> Result<(), BuildError> {
        let number = i64::from(phase);
        self.engine
            .store
            .update(
                build.id,
                Box::new(move |b| {
                    b.completed_phases = b.completed_phases.max(number);
                    b.counters.phase_attempts = 0;
                    b.counters.recovery_rounds = 0;
                }),
            )
            .await?;
        self.engine.manifest_cache(build.id).remove(phase)?;
        self.engine
            .registry
            .log(
                build.id,
                LogLevel::Warn,
                format!("phase {} skipped by operator", phase),
            )
            .await?;
        Ok(())
    }

    /// Interpret one operator slash command.
    pub async fn command(self: &Arc<Self>, id: BuildId, input: &str) -> Result<CommandOutcome, BuildError> {
        let command = parse_command(input)?;
        tracing::debug!(build_id = %id, command = command.name(), "operator command");
        match command {
            OperatorCommand::Stop => {
                self.cancel(id).await?;
                Ok(CommandOutcome::Ack("stop requested".to_string()))
            }
            OperatorCommand::Pause => {
                self.pause(id).await?;
                Ok(CommandOutcome::Ack("pause requested".to_string()))
            }
            OperatorCommand::Continue { phase } => Ok(CommandOutcome::Ack(self.resume(id, phase).await?)),
            OperatorCommand::Status => Ok(CommandOutcome::Status(Box::new(self.status(id).await?))),
            other => {
                let build = self.get(id).await?;
                let Some(signal) = other.as_signal() else {
                    return Err(Self::invalid(&build, other.name()));
                };
                if build.status.is_terminal() || !self.engine.registry.send_signal(id, signal) {
                    return Err(Self::invalid(&build, other.name()));
                }
                Ok(CommandOutcome::Ack(format!("/{} queued for the next checkpoint", other.name())))
            }
        }
    }

    pub async fn status(&self, id: BuildId) -> Result<StatusReport, BuildError> {
        let build = self.get(id).await?;
        let liveness = self.engine.registry.liveness(id);
        let mut recent_log = self.engine.store.logs(id).await?;
        let skip = recent_log.len().saturating_sub(STATUS_LOG_LINES);
        recent_log = recent_log.split_off(skip);
        Ok(StatusReport {
            id,
            project: build.project,
            status: build.status,
            current_phase: build.current_phase,
            completed_phases: build.completed_phases,
            cost_usd: build.cost_usd,
            pending_gate: build.pending_gate.map(|g| g.kind),
            detail: build.detail,
            live: self.engine.registry.is_active(id),
            activity: liveness.as_ref().map(|l| l.activity.clone()),
            idle_secs: liveness.map(|l| l.idle.as_secs()),
            recent_log,
        })
    }

    pub async fn list(&self) -> Result<Vec<Build>, BuildError> {
        Ok(self.engine.store.list().await?)
    }

    /// Restart sweep, then respawn the builds it hands back.
    pub async fn recover_on_startup(self: &Arc<Self>) -> Result<SweepReport, BuildError> {
        let engine = &self.engine;
        let report = orphan::sweep(
            engine.store.as_ref(),
            &engine.registry,
            engine.workspaces.as_ref(),
            &engine.config,
            &engine.state_root,
        )
        .await?;
        for id in &report.resumable {
            if let Err(e) = self.spawn_task(*id, None) {
                tracing::warn!(build_id = %id, error = %e, "could not resume build");
            }
        }
        Ok(report)
    }

    /// Wait until build `id` has no live task, or `limit` passes.
    pub async fn wait_idle(&self, id: BuildId, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while self.engine.registry.is_active(id) {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::PendingGate;
    use crate::config::AutoforgeConfig;
    use crate::orchestrator::testing::Harness;
    use crate::store::BuildStore;
    use crate::provider::ScriptedClient;
    use chrono::Utc;

    fn client() -> ScriptedClient {
        ScriptedClient::new(|req| {
            let mut words = req.label.split_whitespace();
            match words.next() {
                Some("plan") => {
                    let path = if req.label.ends_with(" 0") { "app/main.py" } else { "app/core.py" };
                    Ok(format!(r#"{{"files": [{{"path": "{}"}}]}}"#, path))
                }
                Some("generate") => Ok(format!(
                    "=== FILE: {} ===\nx = 1\n=== END FILE ===\n",
                    words.next().unwrap_or("")
                )),
                _ => Ok("VERDICT: PASS".into()),
            }
        })
    }

    async fn setup() -> (Harness, Arc<BuildService>) {
        let harness = Harness::new(client(), AutoforgeConfig::default()).await;
        let service = BuildService::new(harness.engine.clone());
        (harness, service)
    }

    async fn park_on_gate(harness: &Harness, kind: GateKind) {
        harness
            .store
            .update(
                harness.build_id,
                Box::new(move |b| {
                    b.status = BuildStatus::Paused;
                    b.pending_gate = Some(PendingGate {
                        kind,
                        payload: serde_json::json!({}),
                        registered_at: Utc::now(),
                    });
                }),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_one_active_build_per_project() {
        let (harness, service) = setup().await;
        let err = service
            .start(
                "demo",
                BuildTarget::LocalPath {
                    path: harness.root(),
                    branch: "main".into(),
                },
                harness.dir.path().join("contracts"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::AlreadyRunning { build_id, .. } if build_id == harness.build_id));
        assert!(err.is_user_correctable());
    }

    #[tokio::test]
    async fn test_started_build_runs_to_completion() {
        let (harness, service) = setup().await;
        let build = service
            .start(
                "other",
                BuildTarget::LocalPath {
                    path: harness.root(),
                    branch: "main".into(),
                },
                harness.dir.path().join("contracts"),
            )
            .await
            .unwrap();
        assert!(service.wait_idle(build.id, Duration::from_secs(10)).await);
        let report = service.status(build.id).await.unwrap();
        assert_eq!(report.status, BuildStatus::Completed);
        assert_eq!(report.completed_phases, 1);
        assert!(!report.live);
        assert!(!report.recent_log.is_empty());
    }

    #[tokio::test]
    async fn test_persisted_skip_advances_and_respawns() {
        let (harness, service) = setup().await;
        park_on_gate(&harness, GateKind::PhaseReview).await;

        let kind = service
            .resolve_gate(harness.build_id, GateResolution::Skip)
            .await
            .unwrap();
        assert_eq!(kind, GateKind::PhaseReview);
        assert!(service.wait_idle(harness.build_id, Duration::from_secs(10)).await);

        let build = harness.build().await;
        assert_eq!(build.status, BuildStatus::Completed);
        assert!(build.pending_gate.is_none());
        assert_eq!(harness.client.calls_labelled("plan phase 0"), 0);
        assert_eq!(harness.client.calls_labelled("plan phase 1"), 1);
    }

    #[tokio::test]
    async fn test_persisted_abort_fails_build() {
        let (harness, service) = setup().await;
        park_on_gate(&harness, GateKind::Clarification).await;
        service
            .resolve_gate(harness.build_id, GateResolution::Abort)
            .await
            .unwrap();
        let build = harness.build().await;
        assert_eq!(build.status, BuildStatus::Failed);
        assert!(build.pending_gate.is_none());
        assert!(!harness.registry.is_active(harness.build_id));
    }

    #[tokio::test]
    async fn test_restart_resumes_cached_manifest_untouched() {
        use crate::manifest::{FileAction, FileManifestEntry, FileStatus, Verdict};
        use std::sync::OnceLock;

        let expected: Arc<OnceLock<(PathBuf, Vec<u8>)>> = Arc::new(OnceLock::new());
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let client = {
            let expected = expected.clone();
            let seen = seen.clone();
            ScriptedClient::new(move |req| {
                if req.label == "generate app/util.py"
                    && let Some((path, bytes)) = expected.get()
                {
                    let unchanged = std::fs::read(path).ok().as_ref() == Some(bytes);
                    seen.lock().unwrap().push(unchanged);
                }
                let mut words = req.label.split_whitespace();
                match words.next() {
                    Some("plan") => Ok(r#"{"files": [{"path": "app/core.py"}]}"#.into()),
                    Some("generate") => Ok(format!(
                        "=== FILE: {} ===\nx = 1\n=== END FILE ===\n",
                        words.next().unwrap_or("")
                    )),
                    _ => Ok("VERDICT: PASS".into()),
                }
            })
        };
        let mut config = AutoforgeConfig::default();
        config.orchestrator.auto_resume = true;
        let harness = Harness::new(client, config).await;
        let service = BuildService::new(harness.engine.clone());
        let id = harness.build_id;
        harness
            .store
            .update(
                id,
                Box::new(|b| {
                    b.status = BuildStatus::Running;
                    b.workspace_prepared = true;
                }),
            )
            .await
            .unwrap();

        let mut audited = FileManifestEntry::new("app/main.py", FileAction::Create, "entry point").unwrap();
        audited.status = FileStatus::Audited;
        audited.verdict = Some(Verdict::Pass);
        let pending = FileManifestEntry::new("app/util.py", FileAction::Create, "helpers").unwrap();
        let cache = harness.engine.manifest_cache(id);
        cache.save(0, &[audited, pending]).unwrap();
        harness.write("app/main.py", "def main():\n    return 0\n");
        let bytes = std::fs::read(cache.path(0)).unwrap();
        expected.set((cache.path(0), bytes)).unwrap();

        let report = service.recover_on_startup().await.unwrap();
        assert_eq!(report.resumable, vec![id]);
        assert!(service.wait_idle(id, Duration::from_secs(10)).await);

        assert_eq!(harness.build().await.status, BuildStatus::Completed);
        assert_eq!(*seen.lock().unwrap(), vec![true]);
        assert_eq!(harness.client.calls_labelled("plan phase 0"), 0);
        assert_eq!(harness.client.calls_labelled("generate app/main.py"), 0);
        assert_eq!(harness.client.calls_labelled("audit app/main.py"), 0);
        assert_eq!(harness.client.calls_labelled("audit app/util.py"), 1);
        assert_eq!(harness.read("app/main.py").unwrap(), "def main():\n    return 0\n");
        assert!(cache.cached_phases().is_empty());
    }

    #[tokio::test]
    async fn test_no_gate_to_resolve() {
        let (harness, service) = setup().await;
        let err = service
            .resolve_gate(harness.build_id, GateResolution::Approve)
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::NoOpenGate { .. }));
    }

    #[tokio::test]
    async fn test_commands() {
        let (harness, service) = setup().await;
        let id = harness.build_id;
        let err = service.command(id, "/dance").await.unwrap_err();
        assert!(err.is_user_correctable());
        assert!(err.public_message().contains("Unknown command"));

        let CommandOutcome::Status(report) = service.command(id, "/status").await.unwrap() else {
            panic!("expected status");
        };
        assert_eq!(report.status, BuildStatus::Pending);

        // No live task to take the signal.
        assert!(matches!(
            service.command(id, "/commit").await,
            Err(BuildError::InvalidState { .. })
        ));

        service.command(id, "/stop").await.unwrap();
        assert_eq!(harness.build().await.status, BuildStatus::Cancelled);
        assert!(service.cancel(id).await.is_err());
    }
}
