//! Persisted-state interface and the in-memory reference implementation.
//!
//! The engine talks to storage through the [`Queries`] trait: two per-repo
//! tables for the extractor's incremental cache (`repo_map_file_cache`,
//! `repo_map_tags`) and two session-scoped tables for ranking persistence.
//! Hosts back this with their database; [`MemoryQueries`] is a complete
//! in-memory implementation with real transactional semantics, used by the
//! tests and by hosts that run without a database.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;

use crate::error::StoreError;
use crate::tags::Tag;

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// Freshness record for one parsed file. For every live row there are exactly
/// `tag_count` tag rows for the same `(repo_key, rel_path)`, and no tag rows
/// exist for paths absent from the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileCacheRow {
    pub rel_path: String,
    pub mtime_ns: i64,
    pub language: String,
    pub tag_count: i64,
}

/// One persisted session ranking row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedPath {
    pub rel_path: String,
    pub rank: f64,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Parameterized storage operations. All methods are scoped by `repo_key`;
/// session operations additionally by `session_id`.
pub trait Queries: Send + Sync {
    /// Non-transactional read of the whole file cache for a repo.
    fn list_file_cache(&self, repo_key: &str) -> Result<Vec<FileCacheRow>, StoreError>;

    /// Open the single write transaction used by the extractor's writeback.
    fn tag_transaction<'a>(
        &'a self,
        repo_key: &str,
    ) -> Result<Box<dyn TagTransaction + 'a>, StoreError>;

    /// Idempotent replace of a session's ranking rows.
    fn replace_session_rankings(
        &self,
        repo_key: &str,
        session_id: &str,
        rows: &[RankedPath],
    ) -> Result<(), StoreError>;

    /// Idempotent replace of a session's read-only path rows.
    fn replace_session_read_only_paths(
        &self,
        repo_key: &str,
        session_id: &str,
        paths: &[String],
    ) -> Result<(), StoreError>;

    fn list_session_read_only_paths(
        &self,
        repo_key: &str,
        session_id: &str,
    ) -> Result<Vec<String>, StoreError>;

    /// Drop all session-scoped rows (rankings and read-only paths).
    fn clear_session(&self, repo_key: &str, session_id: &str) -> Result<(), StoreError>;
}

/// The extractor's writeback transaction. Mutations are invisible to other
/// readers until `commit`; dropping without committing rolls back.
pub trait TagTransaction {
    /// Drop cache rows (and their tags) for paths absent from `live`.
    fn prune_file_cache(&mut self, live: &[String]) -> Result<(), StoreError>;

    fn upsert_file_cache(&mut self, row: &FileCacheRow) -> Result<(), StoreError>;

    /// Delete existing tags for the path, insert the new set.
    fn replace_tags(&mut self, rel_path: &str, tags: &[Tag]) -> Result<(), StoreError>;

    /// Drop the cache row and tags for a deleted file.
    fn delete_file(&mut self, rel_path: &str) -> Result<(), StoreError>;

    /// Read the full tag table for the repo through this transaction,
    /// including uncommitted mutations.
    fn list_tags(&self) -> Result<Vec<Tag>, StoreError>;

    fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemTables {
    /// (repo_key, rel_path) -> cache row
    file_cache: BTreeMap<(String, String), FileCacheRow>,
    /// (repo_key, rel_path) -> tag rows
    tags: BTreeMap<(String, String), Vec<Tag>>,
    /// (repo_key, session_id) -> ranking rows
    rankings: BTreeMap<(String, String), Vec<RankedPath>>,
    /// (repo_key, session_id) -> read-only paths
    read_only: BTreeMap<(String, String), Vec<String>>,
}

/// In-memory [`Queries`] implementation. The tag transaction holds the table
/// lock for its lifetime, which gives it exclusive-writer semantics for free.
#[derive(Default)]
pub struct MemoryQueries {
    tables: Mutex<MemTables>,
}

impl MemoryQueries {
    pub fn new() -> Self {
        MemoryQueries::default()
    }
}

fn lock(tables: &Mutex<MemTables>) -> Result<MutexGuard<'_, MemTables>, StoreError> {
    tables.lock().map_err(|_| StoreError::new("store mutex poisoned"))
}

impl Queries for MemoryQueries {
    fn list_file_cache(&self, repo_key: &str) -> Result<Vec<FileCacheRow>, StoreError> {
        let tables = lock(&self.tables)?;
        Ok(tables
            .file_cache
            .range((repo_key.to_string(), String::new())..)
            .take_while(|((k, _), _)| k == repo_key)
            .map(|(_, row)| row.clone())
            .collect())
    }

    fn tag_transaction<'a>(
        &'a self,
        repo_key: &str,
    ) -> Result<Box<dyn TagTransaction + 'a>, StoreError> {
        let guard = lock(&self.tables)?;
        Ok(Box::new(MemTagTx::new(guard, repo_key)))
    }

    fn replace_session_rankings(
        &self,
        repo_key: &str,
        session_id: &str,
        rows: &[RankedPath],
    ) -> Result<(), StoreError> {
        let mut tables = lock(&self.tables)?;
        let key = (repo_key.to_string(), session_id.to_string());
        if rows.is_empty() {
            tables.rankings.remove(&key);
        } else {
            tables.rankings.insert(key, rows.to_vec());
        }
        Ok(())
    }

    fn replace_session_read_only_paths(
        &self,
        repo_key: &str,
        session_id: &str,
        paths: &[String],
    ) -> Result<(), StoreError> {
        let mut tables = lock(&self.tables)?;
        let key = (repo_key.to_string(), session_id.to_string());
        if paths.is_empty() {
            tables.read_only.remove(&key);
        } else {
            tables.read_only.insert(key, paths.to_vec());
        }
        Ok(())
    }

    fn list_session_read_only_paths(
        &self,
        repo_key: &str,
        session_id: &str,
    ) -> Result<Vec<String>, StoreError> {
        let tables = lock(&self.tables)?;
        let key = (repo_key.to_string(), session_id.to_string());
        let mut out = tables.read_only.get(&key).cloned().unwrap_or_default();
        out.sort();
        Ok(out)
    }

    fn clear_session(&self, repo_key: &str, session_id: &str) -> Result<(), StoreError> {
        let mut tables = lock(&self.tables)?;
        let key = (repo_key.to_string(), session_id.to_string());
        tables.rankings.remove(&key);
        tables.read_only.remove(&key);
        Ok(())
    }
}

/// Snapshot-rollback transaction over the in-memory tables.
struct MemTagTx<'a> {
    guard: MutexGuard<'a, MemTables>,
    repo_key: String,
    cache_snapshot: BTreeMap<(String, String), FileCacheRow>,
    tags_snapshot: BTreeMap<(String, String), Vec<Tag>>,
    committed: bool,
}

impl<'a> MemTagTx<'a> {
    fn new(guard: MutexGuard<'a, MemTables>, repo_key: &str) -> Self {
        let cache_snapshot = guard
            .file_cache
            .iter()
            .filter(|((k, _), _)| k == repo_key)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let tags_snapshot = guard
            .tags
            .iter()
            .filter(|((k, _), _)| k == repo_key)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        MemTagTx {
            guard,
            repo_key: repo_key.to_string(),
            cache_snapshot,
            tags_snapshot,
            committed: false,
        }
    }

    fn key(&self, rel_path: &str) -> (String, String) {
        (self.repo_key.clone(), rel_path.to_string())
    }
}

impl TagTransaction for MemTagTx<'_> {
    fn prune_file_cache(&mut self, live: &[String]) -> Result<(), StoreError> {
        let live: std::collections::BTreeSet<&str> = live.iter().map(|s| s.as_str()).collect();
        let repo_key = self.repo_key.clone();
        let stale: Vec<(String, String)> = self
            .guard
            .file_cache
            .keys()
            .filter(|(k, p)| *k == repo_key && !live.contains(p.as_str()))
            .cloned()
            .collect();
        for key in stale {
            self.guard.file_cache.remove(&key);
            self.guard.tags.remove(&key);
        }
        Ok(())
    }

    fn upsert_file_cache(&mut self, row: &FileCacheRow) -> Result<(), StoreError> {
        let key = self.key(&row.rel_path);
        self.guard.file_cache.insert(key, row.clone());
        Ok(())
    }

    fn replace_tags(&mut self, rel_path: &str, tags: &[Tag]) -> Result<(), StoreError> {
        let key = self.key(rel_path);
        if tags.is_empty() {
            self.guard.tags.remove(&key);
        } else {
            self.guard.tags.insert(key, tags.to_vec());
        }
        Ok(())
    }

    fn delete_file(&mut self, rel_path: &str) -> Result<(), StoreError> {
        let key = self.key(rel_path);
        self.guard.file_cache.remove(&key);
        self.guard.tags.remove(&key);
        Ok(())
    }

    fn list_tags(&self) -> Result<Vec<Tag>, StoreError> {
        let mut out: Vec<Tag> = self
            .guard
            .tags
            .iter()
            .filter(|((k, _), _)| *k == self.repo_key)
            .flat_map(|(_, tags)| tags.iter().cloned())
            .collect();
        out.sort();
        Ok(out)
    }

    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        self.committed = true;
        Ok(())
    }
}

impl Drop for MemTagTx<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        // Roll back: restore the repo-scoped slices from the snapshots.
        let repo_key = self.repo_key.clone();
        self.guard.file_cache.retain(|(k, _), _| *k != repo_key);
        self.guard.tags.retain(|(k, _), _| *k != repo_key);
        for (k, v) in std::mem::take(&mut self.cache_snapshot) {
            self.guard.file_cache.insert(k, v);
        }
        for (k, v) in std::mem::take(&mut self.tags_snapshot) {
            self.guard.tags.insert(k, v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::{Tag, TagKind};

    fn tag(rel: &str, name: &str, kind: TagKind, line: u32) -> Tag {
        Tag {
            rel_path: rel.to_string(),
            name: name.to_string(),
            kind,
            line,
            language: "go".to_string(),
            node_type: "identifier".to_string(),
        }
    }

    fn row(rel: &str, mtime: i64, count: i64) -> FileCacheRow {
        FileCacheRow {
            rel_path: rel.to_string(),
            mtime_ns: mtime,
            language: "go".to_string(),
            tag_count: count,
        }
    }

    #[test]
    fn commit_persists_mutations() {
        let q = MemoryQueries::new();
        {
            let mut tx = q.tag_transaction("repo").unwrap();
            tx.upsert_file_cache(&row("a.go", 1, 1)).unwrap();
            tx.replace_tags("a.go", &[tag("a.go", "main", TagKind::Def, 1)]).unwrap();
            tx.commit().unwrap();
        }
        let rows = q.list_file_cache("repo").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].rel_path, "a.go");

        let tx = q.tag_transaction("repo").unwrap();
        assert_eq!(tx.list_tags().unwrap().len(), 1);
    }

    #[test]
    fn drop_without_commit_rolls_back() {
        let q = MemoryQueries::new();
        {
            let mut tx = q.tag_transaction("repo").unwrap();
            tx.upsert_file_cache(&row("a.go", 1, 1)).unwrap();
            tx.commit().unwrap();
        }
        {
            let mut tx = q.tag_transaction("repo").unwrap();
            tx.delete_file("a.go").unwrap();
            tx.upsert_file_cache(&row("b.go", 2, 0)).unwrap();
            // dropped without commit
        }
        let rows = q.list_file_cache("repo").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].rel_path, "a.go");
    }

    #[test]
    fn prune_drops_rows_and_tags_together() {
        let q = MemoryQueries::new();
        {
            let mut tx = q.tag_transaction("repo").unwrap();
            tx.upsert_file_cache(&row("a.go", 1, 1)).unwrap();
            tx.replace_tags("a.go", &[tag("a.go", "A", TagKind::Def, 1)]).unwrap();
            tx.upsert_file_cache(&row("b.go", 1, 1)).unwrap();
            tx.replace_tags("b.go", &[tag("b.go", "B", TagKind::Def, 1)]).unwrap();
            tx.commit().unwrap();
        }
        {
            let mut tx = q.tag_transaction("repo").unwrap();
            tx.prune_file_cache(&["a.go".to_string()]).unwrap();
            let tags = tx.list_tags().unwrap();
            assert!(tags.iter().all(|t| t.rel_path == "a.go"));
            tx.commit().unwrap();
        }
        assert_eq!(q.list_file_cache("repo").unwrap().len(), 1);
    }

    #[test]
    fn repo_keys_are_isolated() {
        let q = MemoryQueries::new();
        {
            let mut tx = q.tag_transaction("repo-a").unwrap();
            tx.upsert_file_cache(&row("a.go", 1, 0)).unwrap();
            tx.commit().unwrap();
        }
        assert!(q.list_file_cache("repo-b").unwrap().is_empty());
    }

    #[test]
    fn session_rows_replace_idempotently() {
        let q = MemoryQueries::new();
        let rows = vec![RankedPath { rel_path: "a.go".into(), rank: 0.5 }];
        q.replace_session_rankings("repo", "s", &rows).unwrap();
        q.replace_session_rankings("repo", "s", &rows).unwrap();
        q.replace_session_read_only_paths("repo", "s", &["b.go".into(), "a.go".into()])
            .unwrap();
        assert_eq!(
            q.list_session_read_only_paths("repo", "s").unwrap(),
            vec!["a.go".to_string(), "b.go".to_string()]
        );
        q.clear_session("repo", "s").unwrap();
        assert!(q.list_session_read_only_paths("repo", "s").unwrap().is_empty());
    }
}
