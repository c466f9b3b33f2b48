//! Git-backed workspace: `git2` for local repository operations and the
//! `git` CLI for anything that talks to a remote.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use git2::{IndexAddOption, Repository, RepositoryInitOptions, Signature, Status};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use super::{SyncError, Workspace, WorkspaceProvider, retry_sync};
use crate::build::{Build, BuildId, BuildTarget};

const AUTHOR_NAME: &str = "autoforge";
const AUTHOR_EMAIL: &str = "autoforge@localhost";

pub struct GitWorkspace {
    root: PathBuf,
    has_remote: bool,
}

impl GitWorkspace {
    /// Open an existing repository.
    pub fn open(root: &Path) -> Result<Self> {
        let repo = Repository::open(root)
            .with_context(|| format!("Failed to open git repository at {}", root.display()))?;
        let has_remote = repo.find_remote("origin").is_ok();
        Ok(Self {
            root: root.to_path_buf(),
            has_remote,
        })
    }

    /// Initialise a repository on `main`, optionally wiring `origin`.
    pub fn init(root: &Path, remote: Option<&str>) -> Result<Self> {
        std::fs::create_dir_all(root)
            .with_context(|| format!("Failed to create {}", root.display()))?;
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = Repository::init_opts(root, &opts)
            .with_context(|| format!("Failed to init git repository at {}", root.display()))?;
        if let Some(url) = remote
            && repo.find_remote("origin").is_err()
        {
            repo.remote("origin", url).context("Failed to add origin remote")?;
        }
        Self::open(root)
    }

    fn repo(&self) -> Result<Repository> {
        Repository::open(&self.root)
            .with_context(|| format!("Failed to open git repository at {}", self.root.display()))
    }

    async fn git(&self, args: &[&str]) -> Result<(), SyncError> {
        run_git(&self.root, args).await
    }
}

async fn run_git(dir: &Path, args: &[&str]) -> Result<(), SyncError> {
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| SyncError::Retryable(format!("Failed to run git {}: {}", args.join(" "), e)))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(SyncError::from_git_stderr(&String::from_utf8_lossy(
            &output.stderr,
        )))
    }
}

#[async_trait]
impl Workspace for GitWorkspace {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn add_all(&self) -> Result<()> {
        let repo = self.repo()?;
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        // add_all does not stage deletions.
        index.update_all(["*"].iter(), None)?;
        index.write()?;
        Ok(())
    }

    async fn commit(&self, message: &str) -> Result<Option<String>> {
        let repo = self.repo()?;
        let mut index = repo.index()?;
        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());

        if let Some(parent) = &parent
            && parent.tree_id() == tree_id
        {
            return Ok(None);
        }

        let sig = Signature::now(AUTHOR_NAME, AUTHOR_EMAIL)?;
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        let oid = repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .context("Failed to create commit")?;
        Ok(Some(oid.to_string()))
    }

    async fn push(&self, branch: &str) -> Result<(), SyncError> {
        if !self.has_remote {
            return Err(SyncError::Fatal("workspace has no remote".into()));
        }
        self.git(&["push", "-u", "origin", branch]).await
    }

    async fn pull(&self, branch: &str) -> Result<(), SyncError> {
        if !self.has_remote {
            return Err(SyncError::Fatal("workspace has no remote".into()));
        }
        self.git(&["pull", "--rebase", "origin", branch]).await
    }

    async fn commit_messages(&self, limit: usize) -> Result<Vec<String>> {
        let repo = self.repo()?;
        if repo.head().is_err() {
            return Ok(Vec::new());
        }
        let mut walk = repo.revwalk()?;
        walk.push_head()?;
        let mut messages = Vec::new();
        for oid in walk.take(limit) {
            let commit = repo.find_commit(oid?)?;
            messages.push(commit.summary().unwrap_or("").to_string());
        }
        Ok(messages)
    }

    fn has_remote(&self) -> bool {
        self.has_remote
    }
}

/// Whether the repository at `root` has uncommitted changes.
pub fn is_dirty(root: &Path) -> Result<bool> {
    let repo = Repository::open(root)?;
    let statuses = repo.statuses(None)?;
    Ok(statuses
        .iter()
        .any(|s| s.status() != Status::CURRENT && s.status() != Status::IGNORED))
}

/// Prepares workspaces under a builds root.
pub struct GitWorkspaceProvider {
    builds_root: PathBuf,
    clone_attempts: u32,
    clone_backoff_ms: u64,
}

impl GitWorkspaceProvider {
    pub fn new(builds_root: PathBuf) -> Self {
        Self {
            builds_root,
            clone_attempts: 2,
            clone_backoff_ms: 500,
        }
    }

    /// Retry budget for clones, shared with pushes.
    pub fn with_retry(mut self, attempts: u32, backoff_ms: u64) -> Self {
        self.clone_attempts = attempts;
        self.clone_backoff_ms = backoff_ms;
        self
    }

    async fn clone_repo(&self, url: &str, branch: &str, dir: &Path) -> Result<(), SyncError> {
        if let Some(parent) = dir.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::Fatal(format!("Failed to create {}: {}", parent.display(), e)))?;
        }
        let dest = dir.to_string_lossy().into_owned();
        let cwd = dir.parent().unwrap_or(Path::new("."));
        retry_sync(self.clone_attempts, self.clone_backoff_ms, |attempt| {
            let dest = dest.clone();
            async move {
                // A failed clone can leave a partial directory behind.
                if attempt > 1 && dir.exists() {
                    let _ = std::fs::remove_dir_all(dir);
                }
                tracing::debug!(url, attempt, "cloning");
                run_git(cwd, &["clone", "--branch", branch, url, &dest]).await
            }
        })
        .await
        .map_err(|e| match e {
            SyncError::Retryable(msg) => SyncError::Retryable(format!("clone of {} {}", url, msg)),
            SyncError::Fatal(msg) => SyncError::Fatal(format!("clone of {} rejected: {}", url, msg)),
        })
    }
}

#[async_trait]
impl WorkspaceProvider for GitWorkspaceProvider {
    fn working_dir(&self, id: BuildId, target: &BuildTarget) -> PathBuf {
        match target {
            BuildTarget::NewRepo { name, .. } => self.builds_root.join(name),
            BuildTarget::ExistingRepo { .. } => self.builds_root.join(id.to_string()),
            BuildTarget::LocalPath { path, .. } => path.clone(),
        }
    }

    async fn prepare(&self, build: &Build) -> Result<Arc<dyn Workspace>> {
        let dir = &build.working_dir;
        let workspace = match &build.target {
            BuildTarget::NewRepo { remote, .. } => {
                if dir.join(".git").exists() {
                    GitWorkspace::open(dir)?
                } else {
                    GitWorkspace::init(dir, remote.as_deref())?
                }
            }
            BuildTarget::ExistingRepo { url, branch } => {
                if !dir.join(".git").exists() {
                    self.clone_repo(url, branch, dir)
                        .await
                        .map_err(anyhow::Error::new)?;
                }
                GitWorkspace::open(dir)?
            }
            BuildTarget::LocalPath { path, .. } => {
                if !path.is_dir() {
                    bail!("Local path does not exist: {}", path.display());
                }
                if path.join(".git").exists() {
                    GitWorkspace::open(path)?
                } else {
                    GitWorkspace::init(path, None)?
                }
            }
        };
        tracing::info!(build_id = %build.id, dir = %dir.display(), "workspace ready");
        Ok(Arc::new(workspace))
    }

    async fn remove(&self, build: &Build) -> Result<()> {
        if !build.target.is_ephemeral() {
            return Ok(());
        }
        if build.working_dir.exists() {
            tokio::fs::remove_dir_all(&build.working_dir)
                .await
                .with_context(|| format!("Failed to remove {}", build.working_dir.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::safe_write;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_init_commit_and_log() {
        let dir = tempdir().unwrap();
        let ws = GitWorkspace::init(dir.path(), None).unwrap();
        assert!(!ws.has_remote());

        safe_write(ws.root(), "app/main.py", "print('hi')\n").unwrap();
        ws.add_all().await.unwrap();
        let first = ws.commit("forge: Phase 0 complete").await.unwrap();
        assert!(first.is_some());

        // Nothing changed: no empty commit.
        ws.add_all().await.unwrap();
        assert!(ws.commit("noop").await.unwrap().is_none());

        safe_write(ws.root(), "app/db.py", "x = 1\n").unwrap();
        assert!(is_dirty(ws.root()).unwrap());
        ws.add_all().await.unwrap();
        ws.commit("forge: Phase 1 complete").await.unwrap();

        let messages = ws.commit_messages(10).await.unwrap();
        assert_eq!(messages, vec!["forge: Phase 1 complete", "forge: Phase 0 complete"]);
    }

    #[tokio::test]
    async fn test_deletions_are_staged() {
        let dir = tempdir().unwrap();
        let ws = GitWorkspace::init(dir.path(), None).unwrap();
        safe_write(ws.root(), "old.py", "x\n").unwrap();
        ws.add_all().await.unwrap();
        ws.commit("add").await.unwrap();
        std::fs::remove_file(dir.path().join("old.py")).unwrap();
        ws.add_all().await.unwrap();
        assert!(ws.commit("remove").await.unwrap().is_some());
        assert!(!is_dirty(ws.root()).unwrap());
    }

    #[tokio::test]
    async fn test_push_without_remote_is_fatal() {
        let dir = tempdir().unwrap();
        let ws = GitWorkspace::init(dir.path(), None).unwrap();
        assert!(matches!(ws.push("main").await, Err(SyncError::Fatal(_))));
    }

    #[tokio::test]
    async fn test_failed_clone_is_retried_then_reported_retryable() {
        let root = tempdir().unwrap();
        let provider = GitWorkspaceProvider::new(root.path().join("builds")).with_retry(2, 1);
        let missing = root.path().join("no-such-repo");
        let target = BuildTarget::ExistingRepo {
            url: missing.to_string_lossy().into_owned(),
            branch: "main".into(),
        };
        let id = uuid::Uuid::new_v4();
        let build = Build::new("p", target.clone(), provider.working_dir(id, &target), "c".into());
        let err = match provider.prepare(&build).await {
            Ok(_) => panic!("clone of a missing repository succeeded"),
            Err(e) => e,
        };
        let Some(SyncError::Retryable(msg)) = err.downcast_ref::<SyncError>() else {
            panic!("expected a retryable sync error, got {:#}", err);
        };
        assert!(msg.contains("failed after 2 attempts"), "{}", msg);
    }

    #[tokio::test]
    async fn test_provider_dirs_and_local_init() {
        let root = tempdir().unwrap();
        let provider = GitWorkspaceProvider::new(root.path().join("builds"));
        let id = uuid::Uuid::new_v4();
        let clone = BuildTarget::ExistingRepo {
            url: "https://example.com/r.git".into(),
            branch: "main".into(),
        };
        assert_eq!(
            provider.working_dir(id, &clone),
            root.path().join("builds").join(id.to_string())
        );

        let local = root.path().join("local");
        std::fs::create_dir_all(&local).unwrap();
        let target = BuildTarget::LocalPath {
            path: local.clone(),
            branch: "main".into(),
        };
        let build = Build::new("p", target.clone(), provider.working_dir(id, &target), "c".into());
        let ws = provider.prepare(&build).await.unwrap();
        assert!(local.join(".git").exists());
        assert_eq!(ws.root(), local.as_path());
        // Non-ephemeral workspaces survive removal.
        provider.remove(&build).await.unwrap();
        assert!(local.exists());
    }
}
