//! Path-checked file access under a workspace root.

use anyhow::{Context, Result, bail};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::errors::PathError;
use crate::manifest::sanitize_path;

/// Directories never listed as project files.
const SKIP_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "__pycache__",
    ".venv",
    "venv",
    ".pytest_cache",
    ".mypy_cache",
    "target",
    "dist",
];

/// Resolve `relative` inside `root`, refusing traversal and absolute paths.
pub fn safe_join(root: &Path, relative: &str) -> Result<PathBuf, PathError> {
    let clean = sanitize_path(relative)?;
    Ok(root.join(clean))
}

/// Refuse `path` when a symlink along it leads outside `root`. The nearest
/// existing ancestor must resolve under the resolved root. With
/// `follow_link`, so must the file itself when it is a link.
fn ensure_contained(root: &Path, path: &Path, relative: &str, follow_link: bool) -> Result<()> {
    if !root.exists() {
        return Ok(());
    }
    let root = root
        .canonicalize()
        .with_context(|| format!("Failed to resolve workspace root {}", root.display()))?;
    let mut existing = path.parent();
    while let Some(dir) = existing.filter(|d| !d.exists()) {
        existing = dir.parent();
    }
    if let Some(dir) = existing {
        let resolved = dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", dir.display()))?;
        if !resolved.starts_with(&root) {
            bail!(PathError::Traversal(relative.to_string()));
        }
    }
    let is_link = follow_link
        && std::fs::symlink_metadata(path).is_ok_and(|m| m.file_type().is_symlink());
    if is_link && !path.canonicalize().is_ok_and(|target| target.starts_with(&root)) {
        bail!(PathError::Traversal(relative.to_string()));
    }
    Ok(())
}

pub fn safe_write(root: &Path, relative: &str, content: &str) -> Result<PathBuf> {
    let path = safe_join(root, relative)?;
    ensure_contained(root, &path, relative, true)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        ensure_contained(root, &path, relative, true)?;
    }
    std::fs::write(&path, content)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

pub fn safe_read(root: &Path, relative: &str) -> Result<Option<String>> {
    let path = safe_join(root, relative)?;
    if !path.is_file() {
        return Ok(None);
    }
    ensure_contained(root, &path, relative, true)?;
    let bytes =
        std::fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
}

/// Delete a file if present. Returns whether anything was removed.
pub fn safe_delete(root: &Path, relative: &str) -> Result<bool> {
    let path = safe_join(root, relative)?;
    ensure_contained(root, &path, relative, false)?;
    if std::fs::symlink_metadata(&path).is_err() {
        return Ok(false);
    }
    std::fs::remove_file(&path).with_context(|| format!("Failed to delete {}", path.display()))?;
    Ok(true)
}

/// Whether a file exists with non-empty content.
pub fn has_content(root: &Path, relative: &str) -> bool {
    safe_join(root, relative)
        .ok()
        .and_then(|p| std::fs::metadata(p).ok())
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

/// Every project file under `root`, relative with `/` separators, sorted.
pub fn list_files(root: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root).into_iter().filter_entry(|e| {
        e.depth() == 0
            || !(e.file_type().is_dir()
                && SKIP_DIRS.contains(&e.file_name().to_string_lossy().as_ref()))
    });
    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        files.push(rel.to_string_lossy().replace('\\', "/"));
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_read_delete_inside_root() {
        let dir = tempdir().unwrap();
        let written = safe_write(dir.path(), "app/core/db.py", "x = 1\n").unwrap();
        assert!(written.starts_with(dir.path()));
        assert_eq!(
            safe_read(dir.path(), "app/core/db.py").unwrap().as_deref(),
            Some("x = 1\n")
        );
        assert!(has_content(dir.path(), "app/core/db.py"));
        assert!(safe_delete(dir.path(), "app/core/db.py").unwrap());
        assert!(!safe_delete(dir.path(), "app/core/db.py").unwrap());
        assert!(safe_read(dir.path(), "app/core/db.py").unwrap().is_none());
    }

    #[test]
    fn test_traversal_writes_are_rejected() {
        let dir = tempdir().unwrap();
        let inner = dir.path().join("ws");
        std::fs::create_dir_all(&inner).unwrap();
        assert!(safe_write(&inner, "../escape.txt", "no").is_err());
        assert!(safe_write(&inner, "/tmp/escape.txt", "no").is_err());
        assert!(!dir.path().join("escape.txt").exists());
        assert!(matches!(
            safe_join(&inner, "a/../../b"),
            Err(PathError::Traversal(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_directory_cannot_redirect_writes() {
        let dir = tempdir().unwrap();
        let inner = dir.path().join("ws");
        let outside = dir.path().join("outside");
        std::fs::create_dir_all(&inner).unwrap();
        std::fs::create_dir_all(&outside).unwrap();
        std::fs::write(outside.join("keep.txt"), "keep").unwrap();
        std::os::unix::fs::symlink(&outside, inner.join("app")).unwrap();

        let err = safe_write(&inner, "app/new/escape.py", "no").unwrap_err();
        assert!(matches!(err.downcast_ref::<PathError>(), Some(PathError::Traversal(_))));
        assert!(!outside.join("new").exists());
        assert!(safe_delete(&inner, "app/keep.txt").is_err());
        assert!(outside.join("keep.txt").exists());
        assert!(safe_read(&inner, "app/keep.txt").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_file_pointing_outside_is_refused() {
        let dir = tempdir().unwrap();
        let inner = dir.path().join("ws");
        std::fs::create_dir_all(&inner).unwrap();
        let target = dir.path().join("secret.txt");
        std::fs::write(&target, "secret").unwrap();
        std::os::unix::fs::symlink(&target, inner.join("link.txt")).unwrap();

        assert!(safe_write(&inner, "link.txt", "overwritten").is_err());
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "secret");

        // Links that stay inside the root keep working.
        std::fs::write(inner.join("real.txt"), "a").unwrap();
        std::os::unix::fs::symlink(inner.join("real.txt"), inner.join("alias.txt")).unwrap();
        safe_write(&inner, "alias.txt", "b").unwrap();
        assert_eq!(std::fs::read_to_string(inner.join("real.txt")).unwrap(), "b");
    }

    #[test]
    fn test_list_files_skips_vcs_and_caches() {
        let dir = tempdir().unwrap();
        safe_write(dir.path(), "app/main.py", "").unwrap();
        safe_write(dir.path(), "README.md", "").unwrap();
        safe_write(dir.path(), ".git/HEAD", "ref").unwrap();
        safe_write(dir.path(), "app/__pycache__/main.pyc", "").unwrap();
        assert_eq!(list_files(dir.path()).unwrap(), vec!["README.md", "app/main.py"]);
    }
}
