//! Shared fixture for engine tests: scripted client, in-memory store and a
//! directory-backed workspace in a temp dir.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use super::{Engine, PhaseScope};
use crate::build::{Build, BuildId, BuildTarget};
use crate::config::AutoforgeConfig;
use crate::contracts::Contracts;
use crate::events::EventBus;
use crate::phase::Phase;
use crate::provider::ScriptedClient;
use crate::registry::BuildRegistry;
use crate::store::{BuildStore, CostLedger, MemoryStore};
use crate::workspace::{MemoryWorkspace, MemoryWorkspaceProvider};

pub const PHASES_MD: &str = "\
## Phase 0 — Genesis
**Objective:** Skeleton
**Deliverables:**
- app/main.py

## Phase 1 — Core
**Objective:** Core logic
**Deliverables:**
- app/core.py
";

pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<MemoryStore>,
    pub client: Arc<ScriptedClient>,
    pub workspaces: Arc<MemoryWorkspaceProvider>,
    pub registry: Arc<BuildRegistry>,
    pub engine: Arc<Engine>,
    pub build_id: BuildId,
}

impl Harness {
    pub async fn new(client: ScriptedClient, config: AutoforgeConfig) -> Self {
        Self::with_workspace(client, config, |ws| ws).await
    }

    pub async fn with_workspace<F>(client: ScriptedClient, config: AutoforgeConfig, shape: F) -> Self
    where
        F: FnOnce(MemoryWorkspace) -> MemoryWorkspace,
    {
        Self::assemble(client, config, shape, |p| p).await
    }

    pub async fn with_provider<F>(client: ScriptedClient, config: AutoforgeConfig, shape: F) -> Self
    where
        F: FnOnce(MemoryWorkspaceProvider) -> MemoryWorkspaceProvider,
    {
        Self::assemble(client, config, |ws| ws, shape).await
    }

    async fn assemble<W, P>(client: ScriptedClient, mut config: AutoforgeConfig, shape: W, provider: P) -> Self
    where
        W: FnOnce(MemoryWorkspace) -> MemoryWorkspace,
        P: FnOnce(MemoryWorkspaceProvider) -> MemoryWorkspaceProvider,
    {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("ws");
        std::fs::create_dir_all(&root).unwrap();
        let contracts_dir = dir.path().join("contracts");
        std::fs::create_dir_all(&contracts_dir).unwrap();
        std::fs::write(contracts_dir.join("phases.md"), PHASES_MD).unwrap();
        std::fs::write(contracts_dir.join("stack.md"), "Python 3.12, FastAPI\n").unwrap();
        config.workspace.push_backoff_ms = 1;

        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(client);
        let workspaces = Arc::new(provider(MemoryWorkspaceProvider::new(Arc::new(shape(
            MemoryWorkspace::new(&root),
        )))));
        let registry = Arc::new(BuildRegistry::new(store.clone(), EventBus::new()));
        let build = Build::new(
            "demo",
            BuildTarget::NewRepo {
                name: "demo".into(),
                remote: Some("git@example.com:demo.git".into()),
            },
            root,
            contracts_dir,
        );
        store.create(&build).await.unwrap();
        let engine = Arc::new(Engine {
            config: Arc::new(config),
            store: store.clone(),
            ledger: store.clone(),
            client: client.clone(),
            registry: registry.clone(),
            workspaces: workspaces.clone(),
            state_root: dir.path().join("state"),
        });
        Self {
            dir,
            store,
            client,
            workspaces,
            registry,
            engine,
            build_id: build.id,
        }
    }

    pub async fn scripted(replies: Vec<Result<String, crate::errors::ProviderError>>) -> Self {
        Self::new(ScriptedClient::queued(replies), AutoforgeConfig::default()).await
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().join("ws")
    }

    pub fn write(&self, rel: &str, content: &str) {
        let path = self.root().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    pub fn read(&self, rel: &str) -> Option<String> {
        std::fs::read_to_string(self.root().join(rel)).ok()
    }

    pub fn scope(&self) -> PhaseScope {
        self.scope_at(&self.root())
    }

    pub fn scope_at(&self, root: &Path) -> PhaseScope {
        PhaseScope {
            id: self.build_id,
            phase: Arc::new(Phase::new(1, "Core", "Core logic", vec!["app/core.py".into()])),
            root: root.to_path_buf(),
            contracts: Arc::new(Contracts::from_docs([("stack", "Python 3.12, FastAPI\n")])),
            instructions: Arc::new(Vec::new()),
        }
    }

    pub async fn build(&self) -> Build {
        self.store.get(self.build_id).await.unwrap().unwrap()
    }

    pub async fn logs(&self) -> Vec<crate::build::BuildLogEntry> {
        self.store.logs(self.build_id).await.unwrap()
    }

    pub async fn ledger_rows(&self) -> usize {
        self.store.entries(self.build_id).await.unwrap().len()
    }
}
