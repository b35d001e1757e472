//! Version-control awareness for the parity file universe.
//!
//! Parity mode ranks over the files the surrounding VCS tracks rather than
//! the walker's view. The capability is a trait so hosts can plug their own
//! VCS layer; [`GitTrackedFiles`] reads the repository index through libgit2.

use std::path::Path;

use crate::ctx::Ctx;
use crate::error::MapError;

/// Lists the files tracked by the surrounding version-control tool, sorted.
pub trait TrackedFiles: Send + Sync {
    fn list(&self, ctx: &Ctx) -> Result<Vec<String>, MapError>;
}

/// libgit2-backed [`TrackedFiles`] over the repository index.
pub struct GitTrackedFiles {
    root: String,
}

impl GitTrackedFiles {
    pub fn new(root: &str) -> Self {
        GitTrackedFiles { root: root.to_string() }
    }

    /// Probe whether a repository exists at the root.
    pub fn detect(root: &str) -> Option<Self> {
        if git2::Repository::open(Path::new(root)).is_ok() {
            Some(GitTrackedFiles::new(root))
        } else {
            None
        }
    }
}

impl TrackedFiles for GitTrackedFiles {
    fn list(&self, ctx: &Ctx) -> Result<Vec<String>, MapError> {
        ctx.check()?;
        let repo = git2::Repository::open(Path::new(&self.root))
            .map_err(|e| MapError::backend("open git repository", e))?;
        let index = repo.index().map_err(|e| MapError::backend("read git index", e))?;

        let mut files: Vec<String> = index
            .iter()
            .filter_map(|entry| String::from_utf8(entry.path).ok())
            .collect();
        files.sort();
        files.dedup();
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn git_fixture() -> (tempfile::TempDir, GitTrackedFiles) {
        let dir = tempfile::tempdir().unwrap();
        let repo = git2::Repository::init(dir.path()).unwrap();
        fs::write(dir.path().join("tracked.go"), "package main\n").unwrap();
        fs::write(dir.path().join("untracked.go"), "package main\n").unwrap();
        {
            let mut index = repo.index().unwrap();
            index.add_path(Path::new("tracked.go")).unwrap();
            index.write().unwrap();
        }
        let tracked = GitTrackedFiles::new(dir.path().to_str().unwrap());
        (dir, tracked)
    }

    #[test]
    fn lists_only_tracked_files() {
        let (_dir, tracked) = git_fixture();
        let files = tracked.list(&Ctx::background()).unwrap();
        assert_eq!(files, vec!["tracked.go".to_string()]);
    }

    #[test]
    fn detect_requires_a_repository() {
        let dir = tempfile::tempdir().unwrap();
        assert!(GitTrackedFiles::detect(dir.path().to_str().unwrap()).is_none());
        let (git_dir, _) = git_fixture();
        assert!(GitTrackedFiles::detect(git_dir.path().to_str().unwrap()).is_some());
    }

    #[test]
    fn canceled_context_propagates() {
        let (_dir, tracked) = git_fixture();
        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let err = tracked.list(&Ctx::with_cancel(token)).unwrap_err();
        assert!(err.is_cancellation());
    }
}
