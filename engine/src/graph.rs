//! Weighted reference multigraph over files.
//!
//! Tags become edges: a file that references an identifier gets one edge to
//! every file defining it, weighted by how "interesting" the identifier is
//! (mentions, naming shape, commonness) and by whether the referring file is
//! part of the conversation. Files with defs but no refs get synthetic
//! self-references so they stay connected.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::tags::{Tag, TagKind};

/// One reference edge. The multiset is totally ordered by
/// `(from, to, ident, ref_count, weight)` for determinism.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefEdge {
    pub from: String,
    pub to: String,
    pub ident: String,
    pub weight: f64,
    pub ref_count: u64,
}

#[derive(Debug, Clone, Default)]
pub struct RefGraph {
    /// Ascending set of files that produced any def or ref.
    pub nodes: Vec<String>,
    pub edges: Vec<RefEdge>,
}

fn is_lexical_identifier(name: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());
    re.is_match(name)
}

/// Identifiers that look deliberately named: at least 8 runes and either
/// snake/kebab separators or mixed case.
fn is_long_structured(name: &str) -> bool {
    if name.chars().count() < 8 {
        return false;
    }
    if name.contains('_') || name.contains('-') {
        return true;
    }
    let has_upper = name.chars().any(|c| c.is_uppercase());
    let has_lower = name.chars().any(|c| c.is_lowercase());
    has_upper && has_lower
}

/// Build the reference graph from the full tag set plus conversational hints.
pub fn build_graph(
    tags: &[Tag],
    chat_files: &BTreeSet<String>,
    mentioned_idents: &BTreeSet<String>,
) -> RefGraph {
    // Index defs and refs.
    let mut defs_by_name: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    let mut defs_by_file: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    let mut refs_by_file: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();

    for tag in tags {
        match tag.kind {
            TagKind::Def => {
                defs_by_name.entry(&tag.name).or_default().insert(&tag.rel_path);
                defs_by_file.entry(&tag.rel_path).or_default().insert(&tag.name);
            }
            TagKind::Ref => {
                *refs_by_file
                    .entry(tag.rel_path.clone())
                    .or_default()
                    .entry(tag.name.clone())
                    .or_insert(0) += 1;
            }
        }
    }

    // Per-file lexical backfill: a file with defs but no refs references its
    // own plainly-named defs once each.
    for (file, names) in &defs_by_file {
        let has_refs = refs_by_file.get(*file).is_some_and(|m| !m.is_empty());
        if has_refs {
            continue;
        }
        for name in names {
            if is_lexical_identifier(name) {
                *refs_by_file
                    .entry(file.to_string())
                    .or_default()
                    .entry(name.to_string())
                    .or_insert(0) += 1;
            }
        }
    }

    // Global fallback: a def-only corpus with nothing referenced anywhere
    // self-references every def regardless of identifier shape.
    let any_refs = refs_by_file.values().any(|m| !m.is_empty());
    if !any_refs {
        for (file, names) in &defs_by_file {
            for name in names {
                *refs_by_file
                    .entry(file.to_string())
                    .or_default()
                    .entry(name.to_string())
                    .or_insert(0) += 1;
            }
        }
    }

    // name -> {referring file -> count}
    let mut refs_by_name: BTreeMap<&str, BTreeMap<&str, u64>> = BTreeMap::new();
    for (file, names) in &refs_by_file {
        for (name, count) in names {
            refs_by_name.entry(name).or_default().insert(file, *count);
        }
    }

    let mut edges: Vec<RefEdge> = Vec::new();

    // Self-edges keep never-referenced defs in the graph at low weight.
    for (name, def_files) in &defs_by_name {
        if refs_by_name.contains_key(*name) {
            continue;
        }
        for def_file in def_files {
            edges.push(RefEdge {
                from: def_file.to_string(),
                to: def_file.to_string(),
                ident: name.to_string(),
                weight: 0.1,
                ref_count: 0,
            });
        }
    }

    // Cross-file edges for every referenced name with at least one def.
    for (name, referrers) in &refs_by_name {
        let Some(def_files) = defs_by_name.get(*name) else { continue };

        let mut base_mul = 1.0_f64;
        if mentioned_idents.contains(*name) {
            base_mul *= 10.0;
        }
        if is_long_structured(name) {
            base_mul *= 10.0;
        }
        if name.starts_with('_') {
            base_mul *= 0.1;
        }
        if def_files.len() > 5 {
            base_mul *= 0.1;
        }

        for (ref_file, count) in referrers {
            let mut mul = base_mul;
            if chat_files.contains(*ref_file) {
                mul *= 50.0;
            }
            let weight = mul * (*count as f64).sqrt();
            if weight <= 0.0 {
                continue;
            }
            for def_file in def_files {
                edges.push(RefEdge {
                    from: ref_file.to_string(),
                    to: def_file.to_string(),
                    ident: name.to_string(),
                    weight,
                    ref_count: *count,
                });
            }
        }
    }

    edges.sort_by(|a, b| {
        a.from
            .cmp(&b.from)
            .then_with(|| a.to.cmp(&b.to))
            .then_with(|| a.ident.cmp(&b.ident))
            .then_with(|| a.ref_count.cmp(&b.ref_count))
            .then_with(|| a.weight.total_cmp(&b.weight))
    });

    let mut nodes: BTreeSet<String> = BTreeSet::new();
    nodes.extend(defs_by_file.keys().map(|f| f.to_string()));
    nodes.extend(refs_by_file.iter().filter(|(_, m)| !m.is_empty()).map(|(f, _)| f.clone()));

    RefGraph { nodes: nodes.into_iter().collect(), edges }
}
