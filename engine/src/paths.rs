//! Path normalization and the repository identity key.
//!
//! Every relative path stored anywhere in the engine goes through
//! [`normalize_rel`]: forward slashes, no `.` or `..` components, strictly
//! inside the repository root. [`repo_key`] derives the stable per-repo
//! digest that keys all persisted state.

use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

/// Why a path failed normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("empty repository root")]
    EmptyRoot,
    #[error("empty path")]
    EmptyPath,
    #[error("path could not be resolved")]
    ResolveFailed,
    #[error("path escapes the repository root")]
    OutsideRoot,
    #[error("path resolves to the repository root")]
    ResolvesToRoot,
}

/// Lexically clean a path: resolve `.` and `..` without touching the
/// filesystem. `..` at the top of an absolute path is dropped, matching the
/// usual clean semantics.
fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    // Relative paths keep leading `..`; absolute paths drop it.
                    if !path.has_root() {
                        out.push("..");
                    }
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn to_forward_slashes(path: &Path) -> String {
    let s = path.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        s.into_owned()
    } else {
        s.replace(std::path::MAIN_SEPARATOR, "/")
    }
}

/// Resolve a root to its cleaned absolute form.
fn absolute_root(root: &str) -> Result<PathBuf, PathError> {
    let trimmed = root.trim();
    if trimmed.is_empty() {
        return Err(PathError::EmptyRoot);
    }
    let abs = std::path::absolute(trimmed).map_err(|_| PathError::ResolveFailed)?;
    Ok(clean(&abs))
}

/// Stable identity for a repository root: SHA-256 of the cleaned absolute
/// forward-slash form, hex encoded. Idempotent across `a`, `a/.` and
/// `a/b/..` spellings of the same directory.
pub fn repo_key(root: &str) -> Result<String, PathError> {
    let abs = absolute_root(root)?;
    let canon = to_forward_slashes(&abs);
    let digest = Sha256::digest(canon.as_bytes());
    let mut out = String::with_capacity(64);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    Ok(out)
}

/// Normalize `path` to a cleaned forward-slash path relative to `root`,
/// guaranteed to resolve strictly inside it.
pub fn normalize_rel(root: &str, path: &str) -> Result<String, PathError> {
    let abs_root = absolute_root(root)?;
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(PathError::EmptyPath);
    }

    let candidate = Path::new(trimmed);
    let joined = if candidate.is_absolute() {
        clean(candidate)
    } else {
        clean(&abs_root.join(candidate))
    };

    let rel = joined.strip_prefix(&abs_root).map_err(|_| PathError::OutsideRoot)?;
    if rel.as_os_str().is_empty() {
        return Err(PathError::ResolvesToRoot);
    }
    Ok(to_forward_slashes(rel))
}

/// Normalize a candidate file universe: each entry through [`normalize_rel`],
/// duplicates dropped, ascending order. Entries that fail normalization are
/// skipped.
pub fn normalize_file_universe(root: &str, paths: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(paths.len());
    for p in paths {
        match normalize_rel(root, p) {
            Ok(rel) => out.push(rel),
            Err(err) => debug!(path = %p, %err, "dropping path from file universe"),
        }
    }
    out.sort();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_key_is_stable_across_spellings() {
        let a = repo_key("/tmp/proj").unwrap();
        let b = repo_key("/tmp/proj/.").unwrap();
        let c = repo_key("/tmp/proj/sub/..").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn repo_key_distinguishes_roots() {
        assert_ne!(repo_key("/tmp/a").unwrap(), repo_key("/tmp/b").unwrap());
    }

    #[test]
    fn empty_root_is_rejected() {
        assert_eq!(repo_key("   "), Err(PathError::EmptyRoot));
        assert_eq!(normalize_rel("", "x"), Err(PathError::EmptyRoot));
    }

    #[test]
    fn normalize_rel_cleans_and_relativizes() {
        assert_eq!(normalize_rel("/repo", "src/main.rs").unwrap(), "src/main.rs");
        assert_eq!(normalize_rel("/repo", "./src/./main.rs").unwrap(), "src/main.rs");
        assert_eq!(normalize_rel("/repo", "src/sub/../main.rs").unwrap(), "src/main.rs");
        assert_eq!(normalize_rel("/repo", "/repo/src/main.rs").unwrap(), "src/main.rs");
    }

    #[test]
    fn normalize_rel_rejects_escapes() {
        assert_eq!(normalize_rel("/repo", "../etc/passwd"), Err(PathError::OutsideRoot));
        assert_eq!(normalize_rel("/repo", "src/../../etc"), Err(PathError::OutsideRoot));
        assert_eq!(normalize_rel("/repo", "/elsewhere/x"), Err(PathError::OutsideRoot));
        assert_eq!(normalize_rel("/repo", ""), Err(PathError::EmptyPath));
        assert_eq!(normalize_rel("/repo", "."), Err(PathError::ResolvesToRoot));
    }

    #[test]
    fn normalized_paths_are_fixpoints() {
        // Path safety invariant: normalize(normalize(p)) == normalize(p).
        for p in ["src/main.rs", "a/b/c.go", "deep/./x/../y.ts"] {
            let once = normalize_rel("/repo", p).unwrap();
            let twice = normalize_rel("/repo", &once).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn universe_sorts_and_dedups() {
        let paths = vec![
            "b.rs".to_string(),
            "a.rs".to_string(),
            "./a.rs".to_string(),
            "../escape.rs".to_string(),
        ];
        let norm = normalize_file_universe("/repo", &paths);
        assert_eq!(norm, vec!["a.rs".to_string(), "b.rs".to_string()]);
    }
}
