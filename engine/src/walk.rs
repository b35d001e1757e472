//! Ignore-aware file enumeration.
//!
//! Walks the repository root honoring `.gitignore` / `.crushignore`
//! semantics, conventional skip directories, and a final pass of
//! user-supplied exclude globs. Symlinks are never followed. Output is a
//! sorted list of forward-slash relative paths, every one already through
//! the path normalizer.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use tracing::{debug, warn};

use crate::ctx::Ctx;
use crate::error::MapError;
use crate::paths;

// ---------------------------------------------------------------------------
// Fast skip rules
// ---------------------------------------------------------------------------

/// Pre-ignore skip rules applied before gitignore semantics. The default
/// implementation covers the conventional dependency/build directories.
pub trait SkipRules: Send + Sync {
    fn should_skip_dir(&self, name: &str) -> bool;
    fn should_skip(&self, rel_path: &str) -> bool;
}

/// Conventional skips: `.git`, package caches, build output.
pub struct ConventionalSkips {
    dirs: HashSet<&'static str>,
}

impl ConventionalSkips {
    pub fn new() -> Self {
        ConventionalSkips {
            dirs: [
                ".git",
                "node_modules",
                "__pycache__",
                "target",
                "dist",
                "build",
                ".next",
                "vendor",
                ".venv",
                "venv",
            ]
            .into_iter()
            .collect(),
        }
    }
}

impl Default for ConventionalSkips {
    fn default() -> Self {
        Self::new()
    }
}

impl SkipRules for ConventionalSkips {
    fn should_skip_dir(&self, name: &str) -> bool {
        self.dirs.contains(name)
    }

    fn should_skip(&self, _rel_path: &str) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Exclude globs
// ---------------------------------------------------------------------------

/// Compile user exclude globs. Malformed patterns are skipped with a warning;
/// the remaining set still applies.
pub fn compile_excludes(patterns: &[String]) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pat in patterns {
        match Glob::new(pat) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(err) => warn!(pattern = %pat, %err, "skipping malformed exclude glob"),
        }
    }
    builder.build().unwrap_or_else(|err| {
        warn!(%err, "exclude glob set failed to build, excluding nothing");
        GlobSet::empty()
    })
}

// ---------------------------------------------------------------------------
// Walker
// ---------------------------------------------------------------------------

/// Ignore-aware walker over a repository root.
pub struct Walker {
    root: String,
    skips: Arc<dyn SkipRules>,
    excludes: GlobSet,
}

impl Walker {
    pub fn new(root: &str, exclude_globs: &[String], skips: Arc<dyn SkipRules>) -> Self {
        Walker {
            root: root.to_string(),
            skips,
            excludes: compile_excludes(exclude_globs),
        }
    }

    /// True when a (normalized) path is removed by the user exclude globs.
    pub fn excluded(&self, rel_path: &str) -> bool {
        self.excludes.is_match(rel_path)
    }

    /// Apply the exclude globs to an externally supplied universe (parity
    /// mode bypasses the walk but not the excludes).
    pub fn filter_universe(&self, paths: Vec<String>) -> Vec<String> {
        paths.into_iter().filter(|p| !self.excluded(p)).collect()
    }

    /// Enumerate regular files under the root: conventional skips, gitignore
    /// and `.crushignore` semantics, then the exclude globs. Sorted relative
    /// paths.
    pub fn files(&self, ctx: &Ctx) -> Result<Vec<String>, MapError> {
        ctx.check()?;
        let root = Path::new(&self.root);

        let skips = self.skips.clone();
        let walk = WalkBuilder::new(root)
            .hidden(false)
            .git_ignore(true)
            .git_global(false)
            .git_exclude(true)
            .require_git(false)
            .add_custom_ignore_filename(".crushignore")
            .follow_links(false)
            .filter_entry(move |entry| {
                if entry.file_type().is_some_and(|ft| ft.is_dir()) {
                    let name = entry.file_name().to_string_lossy();
                    return !skips.should_skip_dir(name.as_ref());
                }
                true
            })
            .build();

        let mut out = Vec::new();
        for entry in walk {
            ctx.check()?;
            let entry = match entry {
                Ok(e) => e,
                Err(err) => {
                    debug!(%err, "walk entry error");
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                continue;
            }
            let rel = match entry.path().strip_prefix(root) {
                Ok(r) => r.to_string_lossy().replace('\\', "/"),
                Err(_) => continue,
            };
            if self.skips.should_skip(&rel) || self.excludes.is_match(rel.as_str()) {
                continue;
            }
            out.push(rel);
        }

        let mut out = paths::normalize_file_universe(&self.root, &out);
        out.sort();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(root: &Path, rel: &str) {
        let p = root.join(rel);
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(p, "x\n").unwrap();
    }

    fn walker(root: &Path, excludes: &[&str]) -> Walker {
        let globs: Vec<String> = excludes.iter().map(|s| s.to_string()).collect();
        Walker::new(
            root.to_str().unwrap(),
            &globs,
            Arc::new(ConventionalSkips::new()),
        )
    }

    #[test]
    fn walk_is_sorted_and_skips_conventional_dirs() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "b.go");
        touch(dir.path(), "a.go");
        touch(dir.path(), "src/lib.rs");
        touch(dir.path(), "node_modules/pkg/index.js");
        touch(dir.path(), ".git/config");

        let files = walker(dir.path(), &[]).files(&Ctx::background()).unwrap();
        assert_eq!(files, vec!["a.go", "b.go", "src/lib.rs"]);
    }

    #[test]
    fn gitignore_is_honored() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "keep.rs");
        touch(dir.path(), "drop.log");
        fs::write(dir.path().join(".gitignore"), "*.log\n").unwrap();

        let files = walker(dir.path(), &[]).files(&Ctx::background()).unwrap();
        assert!(files.contains(&"keep.rs".to_string()));
        assert!(!files.iter().any(|f| f == "drop.log"));
    }

    #[test]
    fn crushignore_is_honored() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "keep.rs");
        touch(dir.path(), "secret.txt");
        fs::write(dir.path().join(".crushignore"), "secret.txt\n").unwrap();

        let files = walker(dir.path(), &[]).files(&Ctx::background()).unwrap();
        assert!(files.contains(&"keep.rs".to_string()));
        assert!(!files.iter().any(|f| f == "secret.txt"));
    }

    #[test]
    fn exclude_globs_apply_last() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "main.go");
        touch(dir.path(), "gen/schema.pb.go");

        let w = walker(dir.path(), &["gen/**"]);
        let files = w.files(&Ctx::background()).unwrap();
        assert_eq!(files, vec!["main.go"]);
        assert!(w.excluded("gen/schema.pb.go"));
    }

    #[test]
    fn malformed_globs_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "main.go");
        // One bad pattern, one good; the good one still applies.
        let w = walker(dir.path(), &["[", "*.go"]);
        let files = w.files(&Ctx::background()).unwrap();
        assert!(files.is_empty());
    }

    #[test]
    fn canceled_walk_propagates() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "main.go");
        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let err = walker(dir.path(), &[]).files(&Ctx::with_cancel(token)).unwrap_err();
        assert!(err.is_cancellation());
    }
}
