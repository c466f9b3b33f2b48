//! Directory-backed workspace without version control, for tests and dry runs.
//!
//! Files live on disk so governance and syntax checks see real content;
//! commits and pushes are only recorded.

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use super::{SyncError, Workspace, WorkspaceProvider};
use crate::build::{Build, BuildId, BuildTarget};

pub struct MemoryWorkspace {
    root: PathBuf,
    commits: Mutex<Vec<String>>,
    push_failures: AtomicU32,
    push_fatal: bool,
    push_calls: AtomicUsize,
    pull_calls: AtomicUsize,
    has_remote: bool,
}

impl MemoryWorkspace {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            commits: Mutex::new(Vec::new()),
            push_failures: AtomicU32::new(0),
            push_fatal: false,
            push_calls: AtomicUsize::new(0),
            pull_calls: AtomicUsize::new(0),
            has_remote: true,
        }
    }

    /// Fail the next `n` pushes with a retryable error.
    pub fn failing_pushes(self, n: u32) -> Self {
        self.push_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Fail every push with a non-retryable error.
    pub fn rejecting_pushes(mut self) -> Self {
        self.push_fatal = true;
        self
    }

    pub fn without_remote(mut self) -> Self {
        self.has_remote = false;
        self
    }

    /// Seed history, oldest first.
    pub fn with_commits(self, messages: &[&str]) -> Self {
        self.commits
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(messages.iter().map(|m| m.to_string()));
        self
    }

    pub fn commits(&self) -> Vec<String> {
        self.commits
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn push_calls(&self) -> usize {
        self.push_calls.load(Ordering::SeqCst)
    }

    pub fn pull_calls(&self) -> usize {
        self.pull_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Workspace for MemoryWorkspace {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn add_all(&self) -> Result<()> {
        Ok(())
    }

    async fn commit(&self, message: &str) -> Result<Option<String>> {
        let mut commits = self.commits.lock().unwrap_or_else(|e| e.into_inner());
        commits.push(message.to_string());
        Ok(Some(format!("mem-{}", commits.len())))
    }

    async fn push(&self, _branch: &str) -> Result<(), SyncError> {
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        if self.push_fatal {
            return Err(SyncError::Fatal("remote: Permission denied".into()));
        }
        let remaining = self.push_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.push_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(SyncError::Retryable("remote hung up unexpectedly".into()));
        }
        Ok(())
    }

    async fn pull(&self, _branch: &str) -> Result<(), SyncError> {
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn commit_messages(&self, limit: usize) -> Result<Vec<String>> {
        Ok(self.commits().into_iter().rev().take(limit).collect())
    }

    fn has_remote(&self) -> bool {
        self.has_remote
    }
}

/// Hands every build the same shared [`MemoryWorkspace`].
pub struct MemoryWorkspaceProvider {
    workspace: Arc<MemoryWorkspace>,
    removed: AtomicUsize,
    prepare_error: Mutex<Option<SyncError>>,
}

impl MemoryWorkspaceProvider {
    pub fn new(workspace: Arc<MemoryWorkspace>) -> Self {
        Self {
            workspace,
            removed: AtomicUsize::new(0),
            prepare_error: Mutex::new(None),
        }
    }

    /// Fail every `prepare` with `error`, as an unreachable remote would.
    pub fn failing_prepare(self, error: SyncError) -> Self {
        *self.prepare_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(error);
        self
    }

    pub fn workspace(&self) -> Arc<MemoryWorkspace> {
        self.workspace.clone()
    }

    pub fn removed(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkspaceProvider for MemoryWorkspaceProvider {
    fn working_dir(&self, _id: BuildId, _target: &BuildTarget) -> PathBuf {
        self.workspace.root.clone()
    }

    async fn prepare(&self, _build: &Build) -> Result<Arc<dyn Workspace>> {
        if let Some(error) = self
            .prepare_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            return Err(error.into());
        }
        std::fs::create_dir_all(&self.workspace.root)?;
        Ok(self.workspace.clone())
    }

    async fn remove(&self, build: &Build) -> Result<()> {
        if build.target.is_ephemeral() {
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_push_failures_count_down() {
        let dir = tempdir().unwrap();
        let ws = MemoryWorkspace::new(dir.path()).failing_pushes(2);
        assert!(ws.push("main").await.is_err());
        assert!(ws.push("main").await.is_err());
        assert!(ws.push("main").await.is_ok());
        assert_eq!(ws.push_calls(), 3);
    }

    #[tokio::test]
    async fn test_commit_history_newest_first() {
        let dir = tempdir().unwrap();
        let ws = MemoryWorkspace::new(dir.path()).with_commits(&["forge: Phase 0 complete"]);
        ws.commit("forge: Phase 1 complete").await.unwrap();
        assert_eq!(
            ws.commit_messages(5).await.unwrap(),
            vec!["forge: Phase 1 complete", "forge: Phase 0 complete"]
        );
    }
}
