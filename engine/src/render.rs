//! Scope-aware rendering: file headers plus only the lines that define the
//! symbols of interest, with `│` prefixes and `⋮` gap markers.
//!
//! Per-file problems (unreadable file, unsupported language, parse failure,
//! nothing to show) degrade to a flat one-line-per-entry fallback and never
//! fail the call; only cancellation aborts rendering.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use tracing::debug;

use crate::ctx::Ctx;
use crate::error::MapError;
use crate::parser::SourceParser;
use crate::stages::StageEntry;
use crate::tags::{Tag, TagKind};

/// Bump to retire every render-cache entry produced by older renderers.
pub const RENDERER_VERSION: &str = "2";

pub struct Renderer<'a> {
    root: &'a str,
    parser: Option<&'a dyn SourceParser>,
    tags_by_file: &'a BTreeMap<String, Vec<Tag>>,
}

impl<'a> Renderer<'a> {
    pub fn new(
        root: &'a str,
        parser: Option<&'a dyn SourceParser>,
        tags_by_file: &'a BTreeMap<String, Vec<Tag>>,
    ) -> Self {
        Renderer { root, parser, tags_by_file }
    }

    /// Render the accepted entries. Groups share a file and keep first-seen
    /// order; a group with any stage-1 entry gets the scope-aware treatment,
    /// the rest print as bare paths.
    pub fn render(&self, ctx: &Ctx, entries: &[StageEntry]) -> Result<String, MapError> {
        let mut order: Vec<&str> = Vec::new();
        let mut groups: BTreeMap<&str, Vec<&StageEntry>> = BTreeMap::new();
        for entry in entries {
            let group = groups.entry(entry.file.as_str()).or_default();
            if group.is_empty() {
                order.push(&entry.file);
            }
            group.push(entry);
        }

        let mut out = String::new();
        for file in order {
            ctx.check()?;
            let group = &groups[file];
            let stage1: Vec<&StageEntry> =
                group.iter().copied().filter(|e| e.stage == 1).collect();
            if stage1.is_empty() {
                out.push_str(file);
                out.push('\n');
                continue;
            }
            match self.render_scoped(ctx, file, &stage1)? {
                Some(text) => out.push_str(&text),
                None => {
                    for entry in &stage1 {
                        out.push_str("S1|");
                        out.push_str(file);
                        out.push('|');
                        out.push_str(entry.ident.as_deref().unwrap_or(""));
                        out.push('\n');
                    }
                }
            }
        }
        Ok(out)
    }

    /// `Ok(None)` means fall back to the flat form for this file.
    fn render_scoped(
        &self,
        ctx: &Ctx,
        file: &str,
        stage1: &[&StageEntry],
    ) -> Result<Option<String>, MapError> {
        let parser = match self.parser {
            Some(p) if p.supports_language(file) => p,
            _ => return Ok(None),
        };
        let content = match std::fs::read_to_string(Path::new(self.root).join(file)) {
            Ok(c) => c,
            Err(err) => {
                debug!(%file, %err, "render falling back, file unreadable");
                return Ok(None);
            }
        };
        // The parse gates the scoped form; its tree is released on scope
        // exit. Cancellation is the only parser error that aborts.
        match parser.parse_tree(ctx, file, &content) {
            Ok(_tree) => {}
            Err(err) if err.is_cancellation() => return Err(err),
            Err(err) => {
                debug!(%file, %err, "render falling back, parse failed");
                return Ok(None);
            }
        }

        let loi = self.lines_of_interest(file, stage1);
        if loi.is_empty() {
            return Ok(None);
        }

        let lines: Vec<&str> = content.lines().collect();
        let mut out = String::with_capacity(content.len() / 4);
        out.push_str(file);
        out.push_str(":\n");
        out.push_str(&tree_context(&lines, &loi));
        Ok(Some(out))
    }

    /// 0-indexed lines for every stage-1 identifier in this file, from the
    /// file's `def` tags. Overloaded names contribute all their lines.
    fn lines_of_interest(&self, file: &str, stage1: &[&StageEntry]) -> BTreeSet<usize> {
        let mut lines_by_name: BTreeMap<&str, BTreeSet<usize>> = BTreeMap::new();
        if let Some(tags) = self.tags_by_file.get(file) {
            for tag in tags {
                if tag.kind == TagKind::Def && tag.line > 0 {
                    lines_by_name
                        .entry(tag.name.as_str())
                        .or_default()
                        .insert(tag.line as usize - 1);
                }
            }
        }
        let mut loi = BTreeSet::new();
        for entry in stage1 {
            if let Some(ident) = entry.ident.as_deref() {
                if let Some(lines) = lines_by_name.get(ident) {
                    loi.extend(lines.iter().copied());
                }
            }
        }
        loi
    }
}

// ---------------------------------------------------------------------------
// Context expansion
// ---------------------------------------------------------------------------

/// Print the lines of interest with `│` prefixes, closing one-line gaps,
/// pulling in whitespace-only neighbors, and separating non-adjacent runs
/// with a single `⋮`.
pub fn tree_context(lines: &[&str], lines_of_interest: &BTreeSet<usize>) -> String {
    let mut shown: BTreeSet<usize> =
        lines_of_interest.iter().copied().filter(|&i| i < lines.len()).collect();
    if shown.is_empty() {
        return String::new();
    }

    // Close single-line gaps.
    let snapshot: Vec<usize> = shown.iter().copied().collect();
    for pair in snapshot.windows(2) {
        if pair[1] - pair[0] == 2 {
            shown.insert(pair[0] + 1);
        }
    }

    // Include whitespace-only neighbors until a fixed point.
    loop {
        let mut added = Vec::new();
        for &i in &shown {
            if i > 0 && !shown.contains(&(i - 1)) && lines[i - 1].trim().is_empty() {
                added.push(i - 1);
            }
            if i + 1 < lines.len() && !shown.contains(&(i + 1)) && lines[i + 1].trim().is_empty()
            {
                added.push(i + 1);
            }
        }
        if added.is_empty() {
            break;
        }
        shown.extend(added);
    }

    let mut out = String::new();
    let mut prev: Option<usize> = None;
    for &i in &shown {
        if let Some(p) = prev {
            if i > p + 1 {
                out.push_str("⋮\n");
            }
        }
        out.push('│');
        out.push_str(lines[i]);
        out.push('\n');
        prev = Some(i);
    }
    out
}
