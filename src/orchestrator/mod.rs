//! The phase engine.
//!
//! For every declared phase: plan a manifest (or resume the cached one),
//! generate files in dependency order while auditing finished files
//! concurrently, run governance and recovery, verify, commit, push and
//! advance. [`Engine::run`] drives one build until it completes, pauses,
//! is cancelled or fails.

pub mod audit;
pub mod engine;
pub mod generate;
pub mod planning;
pub mod prompts;
pub mod verify;

#[cfg(test)]
pub(crate) mod testing;

use anyhow::Result;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::build::BuildId;
use crate::config::AutoforgeConfig;
use crate::contracts::Contracts;
use crate::errors::ProviderError;
use crate::events::BuildEvent;
use crate::manifest::{FileManifestEntry, FileStatus, ManifestCache, Verdict};
use crate::phase::Phase;
use crate::provider::{GenerationClient, GenerationRequest, GenerationResponse};
use crate::registry::BuildRegistry;
use crate::store::{BuildStore, CostEntry, CostLedger};
use crate::workspace::WorkspaceProvider;

/// How a run of the engine ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Paused(String),
    Cancelled,
    Failed(String),
}

/// Everything the engine needs, shared by the build task and its audit
/// workers.
pub struct Engine {
    pub config: Arc<AutoforgeConfig>,
    pub store: Arc<dyn BuildStore>,
    pub ledger: Arc<dyn CostLedger>,
    pub client: Arc<dyn GenerationClient>,
    pub registry: Arc<BuildRegistry>,
    pub workspaces: Arc<dyn WorkspaceProvider>,
    /// Root of autoforge's own state (manifest caches live below it)
    pub state_root: PathBuf,
}

impl Engine {
    pub fn manifest_cache(&self, id: BuildId) -> ManifestCache {
        ManifestCache::new(&self.state_root, id)
    }

    /// Make one generation call: beat the heartbeat, record the cost row and
    /// bump the build's running total.
    pub async fn call(
        &self,
        id: BuildId,
        ledger_label: &str,
        request: GenerationRequest,
    ) -> Result<GenerationResponse, ProviderError> {
        self.registry.beat(id, &request.label);
        let response = self.client.generate(&request).await?;
        self.registry.beat(id, &request.label);

        let price = self.config.provider.price_for(&response.model);
        let entry = CostEntry::new(id, ledger_label, &response.model, response.usage, price);
        let cost = entry.cost_usd;
        if let Err(e) = self.ledger.record(entry).await {
            tracing::warn!(build_id = %id, error = %e, "failed to record cost row");
        }
        let total = match self
            .store
            .update(
                id,
                Box::new(move |b| {
                    b.cost_usd += cost;
                    b.counters.generation_calls += 1;
                }),
            )
            .await
        {
            Ok(Some(build)) => build.cost_usd,
            Ok(None) => cost,
            Err(e) => {
                tracing::warn!(build_id = %id, error = %e, "failed to update build cost");
                cost
            }
        };
        tracing::debug!(
            build_id = %id,
            label = %request.label,
            model = %response.model,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            cost_usd = cost,
            "generation call complete"
        );
        self.registry.events().publish(BuildEvent::Cost {
            build_id: id,
            phase_label: ledger_label.to_string(),
            cost_usd: cost,
            total_usd: total,
        });
        Ok(response)
    }
}

/// Read-only view of the phase being worked on, cheap to clone into
/// concurrent audit tasks.
#[derive(Clone)]
pub struct PhaseScope {
    pub id: BuildId,
    pub phase: Arc<Phase>,
    pub root: PathBuf,
    pub contracts: Arc<Contracts>,
    pub instructions: Arc<Vec<String>>,
}

impl PhaseScope {
    /// Cost-ledger label for a sub-step of this phase.
    pub fn ledger_label(&self, step: &str) -> String {
        format!("{} [{}]", self.phase.label(), step)
    }
}

/// The current phase's manifest, kept in memory and mirrored to the cache
/// on every status transition.
pub struct PhaseManifest {
    phase: u32,
    cache: ManifestCache,
    entries: Mutex<Vec<FileManifestEntry>>,
}

impl PhaseManifest {
    /// Persist `entries` as the phase's cached manifest.
    pub fn create(cache: ManifestCache, phase: u32, entries: Vec<FileManifestEntry>) -> Result<Self> {
        cache.save(phase, &entries)?;
        Ok(Self::resume(cache, phase, entries))
    }

    /// Wrap a manifest already loaded from the cache. Nothing is written.
    pub fn resume(cache: ManifestCache, phase: u32, entries: Vec<FileManifestEntry>) -> Self {
        Self {
            phase,
            cache,
            entries: Mutex::new(entries),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<FileManifestEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn entries(&self) -> Vec<FileManifestEntry> {
        self.lock().clone()
    }

    pub fn get(&self, path: &str) -> Option<FileManifestEntry> {
        self.lock().iter().find(|e| e.path == path).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        self.lock().iter().map(|e| e.path.clone()).collect()
    }

    pub fn set_status(&self, path: &str, status: FileStatus, verdict: Option<Verdict>) -> Result<()> {
        let mut entries = self.lock();
        if let Some(entry) = entries.iter_mut().find(|e| e.path == path) {
            entry.status = status;
            if verdict.is_some() {
                entry.verdict = verdict;
            }
        }
        self.cache.update_status(self.phase, path, status, verdict)?;
        Ok(())
    }

    /// Remember the findings a queued file still has to address, or clear
    /// them once it passes.
    pub fn set_findings(&self, path: &str, findings: Option<String>) -> Result<()> {
        let mut entries = self.lock();
        let Some(entry) = entries.iter_mut().find(|e| e.path == path) else {
            return Ok(());
        };
        if entry.findings == findings {
            return Ok(());
        }
        entry.findings = findings;
        self.cache.save(self.phase, &entries)
    }

    /// Add or replace an entry (recovery fixes join the phase's scope).
    pub fn upsert(&self, entry: FileManifestEntry) -> Result<()> {
        let mut entries = self.lock();
        match entries.iter_mut().find(|e| e.path == entry.path) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
        self.cache.save(self.phase, &entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::FileAction;
    use tempfile::tempdir;
    use uuid::Uuid;

    #[test]
    fn test_phase_manifest_mirrors_transitions_to_cache() {
        let dir = tempdir().unwrap();
        let cache = ManifestCache::new(dir.path(), Uuid::new_v4());
        let entries = vec![
            FileManifestEntry::new("a.py", FileAction::Create, "a").unwrap(),
            FileManifestEntry::new("b.py", FileAction::Create, "b").unwrap(),
        ];
        let manifest = PhaseManifest::create(cache.clone(), 2, entries).unwrap();
        manifest
            .set_status("b.py", FileStatus::Fixed, Some(Verdict::Pass))
            .unwrap();
        let cached = cache.load(2).unwrap().unwrap();
        assert_eq!(cached[1].status, FileStatus::Fixed);
        assert_eq!(manifest.get("b.py").unwrap().verdict, Some(Verdict::Pass));

        manifest
            .upsert(FileManifestEntry::new("c.py", FileAction::Create, "fix").unwrap())
            .unwrap();
        assert_eq!(cache.load(2).unwrap().unwrap().len(), 3);
        assert_eq!(manifest.paths(), vec!["a.py", "b.py", "c.py"]);
    }

    #[test]
    fn test_queued_findings_survive_reload() {
        let dir = tempdir().unwrap();
        let cache = ManifestCache::new(dir.path(), Uuid::new_v4());
        let entries = vec![FileManifestEntry::new("a.py", FileAction::Create, "a").unwrap()];
        let manifest = PhaseManifest::create(cache.clone(), 0, entries).unwrap();
        manifest
            .set_findings("a.py", Some("- missing import os".into()))
            .unwrap();
        let cached = cache.load(0).unwrap().unwrap();
        assert_eq!(cached[0].findings.as_deref(), Some("- missing import os"));

        manifest.set_findings("a.py", None).unwrap();
        let raw = std::fs::read_to_string(cache.path(0)).unwrap();
        assert!(!raw.contains("findings"));
    }
}
