//! Build workspaces: a directory plus a version-control handle.
//!
//! File contents are always written through [`files::safe_write`], which
//! rejects any path that would land outside the workspace root.

pub mod files;
pub mod git;
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::build::{Build, BuildId, BuildTarget};

pub use files::{list_files, safe_delete, safe_join, safe_read, safe_write};
pub use git::{GitWorkspace, GitWorkspaceProvider};
pub use memory::{MemoryWorkspace, MemoryWorkspaceProvider};

/// Failure of a remote sync operation.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SyncError {
    /// Worth retrying: network blips, remote busy, non-fast-forward races
    #[error("{0}")]
    Retryable(String),
    /// Retrying cannot help: missing permissions, unknown repository
    #[error("{0}")]
    Fatal(String),
}

impl SyncError {
    /// Classify git's stderr.
    pub fn from_git_stderr(stderr: &str) -> Self {
        let lower = stderr.to_lowercase();
        let fatal = [
            "permission denied",
            "authentication failed",
            "could not read username",
            "repository not found",
            "403",
            "does not appear to be a git repository",
        ];
        let message = stderr.trim().to_string();
        if fatal.iter().any(|p| lower.contains(p)) {
            Self::Fatal(message)
        } else {
            Self::Retryable(message)
        }
    }
}

/// Delay before retry `attempt + 1`: `base_ms` doubled per attempt, capped
/// at 64x.
pub fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    Duration::from_millis(base_ms.saturating_mul(1 << attempt.saturating_sub(1).min(6)))
}

/// Run a remote operation up to `attempts` times with doubling backoff.
/// A fatal failure stops at once; exhaustion comes back as `Retryable`
/// naming the attempt count.
pub async fn retry_sync<F, Fut>(attempts: u32, backoff_ms: u64, mut op: F) -> Result<(), SyncError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<(), SyncError>>,
{
    let attempts = attempts.max(1);
    let mut last = String::new();
    for attempt in 1..=attempts {
        match op(attempt).await {
            Ok(()) => return Ok(()),
            Err(SyncError::Fatal(msg)) => return Err(SyncError::Fatal(msg)),
            Err(SyncError::Retryable(msg)) => {
                tracing::warn!(attempt, attempts, error = %msg, "remote operation failed");
                last = msg;
                if attempt < attempts {
                    tokio::time::sleep(backoff_delay(backoff_ms, attempt)).await;
                }
            }
        }
    }
    Err(SyncError::Retryable(format!("failed after {} attempts: {}", attempts, last)))
}

#[async_trait]
pub trait Workspace: Send + Sync {
    fn root(&self) -> &Path;

    /// Stage every change, including deletions.
    async fn add_all(&self) -> Result<()>;

    /// Commit the staged tree. Returns the new commit id, or `None` when
    /// there was nothing to commit.
    async fn commit(&self, message: &str) -> Result<Option<String>>;

    async fn push(&self, branch: &str) -> Result<(), SyncError>;

    async fn pull(&self, branch: &str) -> Result<(), SyncError>;

    /// Commit subjects, newest first.
    async fn commit_messages(&self, limit: usize) -> Result<Vec<String>>;

    fn list_files(&self) -> Result<Vec<String>> {
        files::list_files(self.root())
    }

    fn has_remote(&self) -> bool;
}

/// Creates and tears down workspaces for builds.
#[async_trait]
pub trait WorkspaceProvider: Send + Sync {
    /// Directory the build's workspace lives in.
    fn working_dir(&self, id: BuildId, target: &BuildTarget) -> PathBuf;

    /// Open the build's workspace, cloning or initialising it when it does
    /// not exist yet. Remote failures surface as a [`SyncError`] inside the
    /// returned error.
    async fn prepare(&self, build: &Build) -> Result<Arc<dyn Workspace>>;

    /// Delete an ephemeral workspace directory.
    async fn remove(&self, build: &Build) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_error_classification() {
        assert!(matches!(
            SyncError::from_git_stderr("remote: Permission denied to bob.\nfatal: unable to access"),
            SyncError::Fatal(_)
        ));
        assert!(matches!(
            SyncError::from_git_stderr("fatal: unable to access: Could not resolve host"),
            SyncError::Retryable(_)
        ));
        assert!(matches!(
            SyncError::from_git_stderr("ERROR: Repository not found."),
            SyncError::Fatal(_)
        ));
    }

    #[tokio::test]
    async fn test_retry_sync_exhausts_retryable_failures() {
        let calls = std::sync::atomic::AtomicU32::new(0);
        let result = retry_sync(3, 1, |_| {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Err(SyncError::Retryable("Could not resolve host".into())) }
        })
        .await;
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
        let Err(SyncError::Retryable(msg)) = result else {
            panic!("expected retryable exhaustion, got {:?}", result);
        };
        assert!(msg.starts_with("failed after 3 attempts"), "{}", msg);
    }

    #[tokio::test]
    async fn test_retry_sync_stops_on_fatal_and_recovers() {
        let calls = std::sync::atomic::AtomicU32::new(0);
        let result = retry_sync(3, 1, |_| {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Err(SyncError::Fatal("Permission denied".into())) }
        })
        .await;
        assert_eq!(result, Err(SyncError::Fatal("Permission denied".into())));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        let result = retry_sync(3, 1, |attempt| async move {
            if attempt < 2 {
                Err(SyncError::Retryable("remote busy".into()))
            } else {
                Ok(())
            }
        })
        .await;
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(100, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(100, 3), Duration::from_millis(400));
        assert_eq!(backoff_delay(100, 20), Duration::from_millis(6400));
    }
}
