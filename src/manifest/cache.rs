//! On-disk manifest cache.
//!
//! One JSON array per (build, phase) at
//! `<state_root>/builds/<build_id>/manifest_phase_<N>.json`. Presence means the
//! phase has been planned; absence after the phase ran means it was committed.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use super::{FileManifestEntry, FileStatus, Verdict};
use crate::build::BuildId;

#[derive(Debug, Clone)]
pub struct ManifestCache {
    dir: PathBuf,
}

impl ManifestCache {
    pub fn new(state_root: &Path, build_id: BuildId) -> Self {
        Self {
            dir: state_root.join("builds").join(build_id.to_string()),
        }
    }

    pub fn path(&self, phase: u32) -> PathBuf {
        self.dir.join(format!("manifest_phase_{}.json", phase))
    }

    /// Read the cached manifest. Loading never rewrites the file.
    pub fn load(&self, phase: u32) -> Result<Option<Vec<FileManifestEntry>>> {
        let path = self.path(phase);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read manifest cache {}", path.display()))?;
        let entries = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse manifest cache {}", path.display()))?;
        Ok(Some(entries))
    }

    pub fn save(&self, phase: u32, entries: &[FileManifestEntry]) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let path = self.path(phase);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(entries)?;
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }

    /// Persist one file's status transition. Returns false when the phase has
    /// no cached manifest or the path is not in it.
    pub fn update_status(
        &self,
        phase: u32,
        file: &str,
        status: FileStatus,
        verdict: Option<Verdict>,
    ) -> Result<bool> {
        let Some(mut entries) = self.load(phase)? else {
            return Ok(false);
        };
        let Some(entry) = entries.iter_mut().find(|e| e.path == file) else {
            return Ok(false);
        };
        entry.status = status;
        if verdict.is_some() {
            entry.verdict = verdict;
        }
        self.save(phase, &entries)?;
        Ok(true)
    }

    pub fn remove(&self, phase: u32) -> Result<()> {
        let path = self.path(phase);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
        Ok(())
    }

    /// Phases that currently have a cached manifest.
    pub fn cached_phases(&self) -> Vec<u32> {
        let Ok(read) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut phases: Vec<u32> = read
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                name.strip_prefix("manifest_phase_")?
                    .strip_suffix(".json")?
                    .parse()
                    .ok()
            })
            .collect();
        phases.sort_unstable();
        phases
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::FileAction;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn entries() -> Vec<FileManifestEntry> {
        vec![
            FileManifestEntry::new("a.py", FileAction::Create, "a").unwrap(),
            FileManifestEntry::new("b.py", FileAction::Create, "b").unwrap(),
        ]
    }

    #[test]
    fn test_missing_cache_loads_none() {
        let dir = tempdir().unwrap();
        let cache = ManifestCache::new(dir.path(), Uuid::new_v4());
        assert!(cache.load(0).unwrap().is_none());
        assert!(cache.cached_phases().is_empty());
    }

    #[test]
    fn test_save_load_and_status_update() {
        let dir = tempdir().unwrap();
        let cache = ManifestCache::new(dir.path(), Uuid::new_v4());
        cache.save(2, &entries()).unwrap();
        assert!(cache.path(2).exists());

        assert!(cache
            .update_status(2, "b.py", FileStatus::Audited, Some(Verdict::Pass))
            .unwrap());
        assert!(!cache.update_status(2, "zzz.py", FileStatus::Fixed, None).unwrap());
        assert!(!cache.update_status(7, "a.py", FileStatus::Fixed, None).unwrap());

        let loaded = cache.load(2).unwrap().unwrap();
        assert_eq!(loaded[0].status, FileStatus::Pending);
        assert_eq!(loaded[1].status, FileStatus::Audited);
        assert_eq!(loaded[1].verdict, Some(Verdict::Pass));
    }

    #[test]
    fn test_load_does_not_rewrite_file() {
        let dir = tempdir().unwrap();
        let cache = ManifestCache::new(dir.path(), Uuid::new_v4());
        cache.save(0, &entries()).unwrap();
        let before = std::fs::read(cache.path(0)).unwrap();
        let _ = cache.load(0).unwrap();
        let _ = cache.load(0).unwrap();
        assert_eq!(std::fs::read(cache.path(0)).unwrap(), before);
    }

    #[test]
    fn test_remove_and_cached_phases() {
        let dir = tempdir().unwrap();
        let cache = ManifestCache::new(dir.path(), Uuid::new_v4());
        cache.save(3, &entries()).unwrap();
        cache.save(1, &entries()).unwrap();
        assert_eq!(cache.cached_phases(), vec![1, 3]);
        cache.remove(1).unwrap();
        cache.remove(1).unwrap();
        assert_eq!(cache.cached_phases(), vec![3]);
    }
}
