//! Symbol tags and the incremental extractor.
//!
//! A [`Tag`] is one symbol occurrence (`def` or `ref`). The [`Extractor`]
//! turns a live file list into the repo's full tag set: it preloads the
//! persisted freshness cache, parses changed files on a bounded worker pool,
//! writes the delta back in a single transaction, and returns the tag table
//! re-read through that same transaction.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Instant, UNIX_EPOCH};

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::ctx::Ctx;
use crate::error::MapError;
use crate::parser::SourceParser;
use crate::store::{FileCacheRow, Queries};

// ---------------------------------------------------------------------------
// Tag model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TagKind {
    Def,
    Ref,
}

impl TagKind {
    pub fn label(&self) -> &'static str {
        match self {
            TagKind::Def => "def",
            TagKind::Ref => "ref",
        }
    }
}

/// One symbol occurrence in a source file. `line` is 1-indexed; the renderer
/// converts to 0-indexed when computing lines of interest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tag {
    pub rel_path: String,
    pub name: String,
    pub kind: TagKind,
    pub line: u32,
    pub language: String,
    pub node_type: String,
}

impl Ord for Tag {
    /// Deterministic total order:
    /// `(rel_path, line, kind, name, node_type, language)`.
    fn cmp(&self, other: &Self) -> Ordering {
        self.rel_path
            .cmp(&other.rel_path)
            .then_with(|| self.line.cmp(&other.line))
            .then_with(|| self.kind.cmp(&other.kind))
            .then_with(|| self.name.cmp(&other.name))
            .then_with(|| self.node_type.cmp(&other.node_type))
            .then_with(|| self.language.cmp(&other.language))
    }
}

impl PartialOrd for Tag {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ---------------------------------------------------------------------------
// Extractor
// ---------------------------------------------------------------------------

/// Per-file result of the parallel parse phase. Errors are values here;
/// nothing in the parse phase touches the database.
enum Outcome {
    /// Cache row is current; tags come from the persisted table.
    Fresh,
    /// Not a regular file, or short-circuited by cancellation.
    Skipped,
    /// On-disk file is gone; drop its rows.
    Missing,
    /// Newly parsed (possibly with zero tags, e.g. unsupported language).
    Parsed { row: FileCacheRow, tags: Vec<Tag> },
    /// Per-file parse failure; logged and skipped, never fatal.
    Failed(String),
}

pub struct Extractor {
    queries: Option<Arc<dyn Queries>>,
    parser: Option<Arc<dyn SourceParser>>,
    pool: rayon::ThreadPool,
}

impl Extractor {
    /// `pool_size` 0 means CPU count; the effective size is
    /// `max(pool_size, cpu_count, 1)`.
    pub fn new(
        queries: Option<Arc<dyn Queries>>,
        parser: Option<Arc<dyn SourceParser>>,
        pool_size: usize,
    ) -> Result<Self, MapError> {
        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let threads = pool_size.max(cpus).max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("repomap-parse-{i}"))
            .build()
            .map_err(|e| MapError::backend("build parser pool", e))?;
        Ok(Extractor { queries, parser, pool })
    }

    /// Extract tags for the full current universe. `live` must already be
    /// normalized and sorted.
    pub fn extract(
        &self,
        ctx: &Ctx,
        root: &str,
        repo_key: &str,
        live: &[String],
        force_refresh: bool,
    ) -> Result<Vec<Tag>, MapError> {
        ctx.check()?;
        let start = Instant::now();

        // Phase 1: non-transactional preload of the freshness cache.
        let cache: HashMap<String, FileCacheRow> = match &self.queries {
            Some(q) => q
                .list_file_cache(repo_key)
                .map_err(|e| MapError::backend("list repo-map file cache", e))?
                .into_iter()
                .map(|row| (row.rel_path.clone(), row))
                .collect(),
            None => HashMap::new(),
        };

        // Phase 2: parallel parse. No database access in this phase.
        let results: Vec<(String, Outcome)> = self.pool.install(|| {
            live.par_iter()
                .map(|rel| {
                    let outcome = self.parse_one(ctx, root, rel, &cache, force_refresh);
                    (rel.clone(), outcome)
                })
                .collect()
        });
        ctx.check()?;

        let mut parsed = 0usize;
        let mut fresh = 0usize;
        let mut missing = 0usize;
        for (rel, outcome) in &results {
            match outcome {
                Outcome::Parsed { .. } => parsed += 1,
                Outcome::Fresh => fresh += 1,
                Outcome::Missing => missing += 1,
                Outcome::Failed(err) => warn!(path = %rel, %err, "skipping unparsable file"),
                Outcome::Skipped => {}
            }
        }

        // Phase 3 + 4: sequential writeback in one transaction, then re-read
        // the tag table through that transaction.
        let tags = match &self.queries {
            Some(q) => self.write_back(repo_key, live, &results, q.as_ref())?,
            None => {
                let mut tags: Vec<Tag> = results
                    .into_iter()
                    .flat_map(|(_, outcome)| match outcome {
                        Outcome::Parsed { tags, .. } => tags,
                        _ => Vec::new(),
                    })
                    .collect();
                tags.sort();
                tags
            }
        };

        debug!(
            files = live.len(),
            parsed,
            fresh,
            missing,
            tags = tags.len(),
            time_ms = start.elapsed().as_millis() as u64,
            "tag extraction complete"
        );
        Ok(tags)
    }

    fn parse_one(
        &self,
        ctx: &Ctx,
        root: &str,
        rel: &str,
        cache: &HashMap<String, FileCacheRow>,
        force_refresh: bool,
    ) -> Outcome {
        if ctx.is_done() {
            return Outcome::Skipped;
        }
        let abs = Path::new(root).join(rel);
        let meta = match std::fs::metadata(&abs) {
            Ok(m) => m,
            Err(_) => return Outcome::Missing,
        };
        if !meta.is_file() {
            return Outcome::Skipped;
        }
        let mtime_ns = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);

        if !force_refresh {
            if let Some(row) = cache.get(rel) {
                if row.mtime_ns == mtime_ns {
                    return Outcome::Fresh;
                }
            }
        }

        let parser = match &self.parser {
            Some(p) => p,
            None => return Outcome::Skipped,
        };

        // Unsupported languages still get a cache row (zero tags) so the
        // freshness check short-circuits them next run.
        if !parser.supports_language(rel) {
            return Outcome::Parsed {
                row: FileCacheRow {
                    rel_path: rel.to_string(),
                    mtime_ns,
                    language: String::new(),
                    tag_count: 0,
                },
                tags: Vec::new(),
            };
        }

        let content = match std::fs::read_to_string(&abs) {
            Ok(c) => c,
            Err(e) => return Outcome::Failed(e.to_string()),
        };

        match parser.analyze(ctx, rel, &content) {
            Ok(analysis) => {
                let mut tags: Vec<Tag> = analysis
                    .tags
                    .into_iter()
                    .filter(|t| matches!(t.kind, TagKind::Def | TagKind::Ref))
                    .collect();
                tags.sort();
                Outcome::Parsed {
                    row: FileCacheRow {
                        rel_path: rel.to_string(),
                        mtime_ns,
                        language: analysis.language,
                        tag_count: tags.len() as i64,
                    },
                    tags,
                }
            }
            Err(e) => Outcome::Failed(e.to_string()),
        }
    }

    fn write_back(
        &self,
        repo_key: &str,
        live: &[String],
        results: &[(String, Outcome)],
        queries: &dyn Queries,
    ) -> Result<Vec<Tag>, MapError> {
        let mut tx = queries
            .tag_transaction(repo_key)
            .map_err(|e| MapError::backend("begin tag transaction", e))?;

        tx.prune_file_cache(live)
            .map_err(|e| MapError::backend("prune repo-map file cache", e))?;

        for (rel, outcome) in results {
            match outcome {
                Outcome::Parsed { row, tags } => {
                    tx.upsert_file_cache(row)
                        .map_err(|e| MapError::backend("upsert repo-map file cache", e))?;
                    tx.replace_tags(rel, tags)
                        .map_err(|e| MapError::backend("replace repo-map tags", e))?;
                }
                Outcome::Missing => {
                    tx.delete_file(rel)
                        .map_err(|e| MapError::backend("delete repo-map file entry", e))?;
                }
                Outcome::Fresh | Outcome::Skipped | Outcome::Failed(_) => {}
            }
        }

        let mut tags = tx
            .list_tags()
            .map_err(|e| MapError::backend("list repo-map tags", e))?;
        tx.commit()
            .map_err(|e| MapError::backend("commit tag transaction", e))?;
        tags.sort();
        Ok(tags)
    }
}
