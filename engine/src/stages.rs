//! Staged assembly of candidate output entries.
//!
//! Stage 0: special prelude files. Stage 1: ranked definitions. Stage 2:
//! remaining graph nodes. Stage 3: everything else in the repository. Chat
//! files never appear; the list is non-decreasing in stage with no duplicate
//! files across stages 0/2/3.

use std::collections::BTreeSet;

use crate::rank::RankedDef;
use crate::special::is_special_file;

/// One candidate output entry. Stage 1 always carries an identifier; stages
/// 0, 2 and 3 never do.
#[derive(Debug, Clone, PartialEq)]
pub struct StageEntry {
    pub stage: u8,
    pub file: String,
    pub ident: Option<String>,
    pub rank: Option<f64>,
}

impl StageEntry {
    fn bare(stage: u8, file: &str) -> Self {
        StageEntry { stage, file: file.to_string(), ident: None, rank: None }
    }
}

/// Assemble the ordered candidate list.
///
/// `repo_files` is the full (already normalized, ascending in non-parity
/// mode) file universe; in parity mode its input order is preserved for
/// stage 3.
pub fn assemble(
    ranked_defs: &[RankedDef],
    graph_nodes: &[String],
    repo_files: &[String],
    chat_files: &BTreeSet<String>,
    parity: bool,
) -> Vec<StageEntry> {
    let ranked_file_set: BTreeSet<&str> = ranked_defs.iter().map(|d| d.file.as_str()).collect();

    let mut entries: Vec<StageEntry> = Vec::new();
    let mut claimed: BTreeSet<&str> = BTreeSet::new();

    // Stage 0: special prelude, minus files the ranking already covers.
    for file in repo_files {
        if chat_files.contains(file) || ranked_file_set.contains(file.as_str()) {
            continue;
        }
        if is_special_file(file) && claimed.insert(file) {
            entries.push(StageEntry::bare(0, file));
        }
    }

    // Stage 1: ranked definitions, in rank order.
    for def in ranked_defs {
        if def.ident.is_empty() || chat_files.contains(&def.file) {
            continue;
        }
        claimed.insert(def.file.as_str());
        entries.push(StageEntry {
            stage: 1,
            file: def.file.clone(),
            ident: Some(def.ident.clone()),
            rank: Some(def.rank),
        });
    }

    // Stage 2: graph nodes not materialized above.
    for node in graph_nodes {
        if chat_files.contains(node) || claimed.contains(node.as_str()) {
            continue;
        }
        claimed.insert(node);
        entries.push(StageEntry::bare(2, node));
    }

    // Stage 3: the rest of the repository.
    let mut rest: Vec<&String> = repo_files
        .iter()
        .filter(|f| !chat_files.contains(*f) && !claimed.contains(f.as_str()))
        .collect();
    if !parity {
        rest.sort();
    }
    for file in rest {
        entries.push(StageEntry::bare(3, file));
    }

    entries
}
