//! Personalized PageRank over the reference graph and distribution of file
//! ranks down to individual definitions.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;
use tracing::debug;

use crate::graph::RefGraph;
use crate::tags::{Tag, TagKind};

const DAMPING: f64 = 0.85;
const TOLERANCE: f64 = 1e-6;
const MAX_ITERATIONS: usize = 100;

/// A definition with its share of the graph rank.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedDef {
    pub file: String,
    pub ident: String,
    pub rank: f64,
    /// Earliest `def` line for `(file, ident)` in the tag table; 1-indexed.
    pub line: u32,
}

/// File-level aggregation of its definitions' ranks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedFile {
    pub path: String,
    pub rank: f64,
    pub defs: Vec<RankedDef>,
}

// ---------------------------------------------------------------------------
// Personalization
// ---------------------------------------------------------------------------

/// Build the personalization vector from the conversational hints. With
/// `N = |nodes|` and `base = 100/N`: chat files add `base`, mentioned file
/// names are lifted to at least `base`, and files whose path components
/// intersect the mentioned identifiers add `base`. Returns `None` when no
/// hint applies (uniform ranking).
pub fn personalization(
    nodes: &[String],
    chat_files: &BTreeSet<String>,
    mentioned_files: &BTreeSet<String>,
    mentioned_idents: &BTreeSet<String>,
) -> Option<BTreeMap<String, f64>> {
    if nodes.is_empty() {
        return None;
    }
    let base = 100.0 / nodes.len() as f64;
    let mut weights: BTreeMap<String, f64> = BTreeMap::new();

    for node in nodes {
        let mut w = 0.0;
        if chat_files.contains(node) {
            w += base;
        }
        if path_components_intersect(node, mentioned_idents) {
            w += base;
        }
        if w > 0.0 {
            weights.insert(node.clone(), w);
        }
        // Mentioned file names guarantee at least `base`.
        let basename = node.rsplit('/').next().unwrap_or(node);
        if mentioned_files.contains(node) || mentioned_files.contains(basename) {
            let entry = weights.entry(node.clone()).or_insert(0.0);
            if *entry < base {
                *entry = base;
            }
        }
    }

    if weights.is_empty() {
        None
    } else {
        Some(weights)
    }
}

/// Path segments, the basename, and the extension-less basename, checked
/// against the mentioned-identifiers set.
fn path_components_intersect(path: &str, idents: &BTreeSet<String>) -> bool {
    if idents.is_empty() {
        return false;
    }
    for segment in path.split('/') {
        if idents.contains(segment) {
            return true;
        }
    }
    let basename = path.rsplit('/').next().unwrap_or(path);
    if let Some((stem, _)) = basename.rsplit_once('.') {
        if idents.contains(stem) {
            return true;
        }
    }
    false
}

// ---------------------------------------------------------------------------
// PageRank
// ---------------------------------------------------------------------------

/// Personalized PageRank. Damping 0.85, L1 tolerance 1e-6, at most 100
/// iterations. If a personalized run fails to converge it is retried once
/// uniformly.
pub fn page_rank(
    graph: &RefGraph,
    personalization: Option<&BTreeMap<String, f64>>,
) -> BTreeMap<String, f64> {
    match page_rank_inner(graph, personalization) {
        Some(ranks) => ranks,
        None => {
            if personalization.is_some() {
                debug!("personalized ranking did not converge, retrying uniformly");
                page_rank_inner(graph, None).unwrap_or_default()
            } else {
                // Non-convergence without personalization: take the last
                // iterate rather than nothing.
                page_rank_last_iterate(graph, None)
            }
        }
    }
}

fn node_indices(graph: &RefGraph) -> HashMap<&str, usize> {
    graph.nodes.iter().enumerate().map(|(i, n)| (n.as_str(), i)).collect()
}

struct Flow {
    /// Per-node total outgoing edge weight.
    out_weight: Vec<f64>,
    /// Per-node incoming `(from, weight)` pairs.
    incoming: Vec<Vec<(usize, f64)>>,
}

fn build_flow(graph: &RefGraph, index: &HashMap<&str, usize>) -> Flow {
    let n = graph.nodes.len();
    let mut out_weight = vec![0.0; n];
    let mut incoming: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n];
    for edge in &graph.edges {
        let (Some(&from), Some(&to)) =
            (index.get(edge.from.as_str()), index.get(edge.to.as_str()))
        else {
            continue;
        };
        out_weight[from] += edge.weight;
        incoming[to].push((from, edge.weight));
    }
    Flow { out_weight, incoming }
}

fn teleport_vector(
    graph: &RefGraph,
    index: &HashMap<&str, usize>,
    personalization: Option<&BTreeMap<String, f64>>,
) -> Vec<f64> {
    let n = graph.nodes.len();
    match personalization {
        Some(map) if !map.is_empty() => {
            let mut p = vec![0.0; n];
            let mut total = 0.0;
            for (node, w) in map {
                if let Some(&i) = index.get(node.as_str()) {
                    p[i] = *w;
                    total += *w;
                }
            }
            if total > 0.0 {
                for v in &mut p {
                    *v /= total;
                }
                p
            } else {
                vec![1.0 / n as f64; n]
            }
        }
        _ => vec![1.0 / n as f64; n],
    }
}

fn page_rank_iterate(
    graph: &RefGraph,
    personalization: Option<&BTreeMap<String, f64>>,
) -> (Vec<f64>, bool) {
    let n = graph.nodes.len();
    if n == 0 {
        return (Vec::new(), true);
    }
    let index = node_indices(graph);
    let flow = build_flow(graph, &index);
    let p = teleport_vector(graph, &index, personalization);

    let mut rank = vec![1.0 / n as f64; n];
    let mut next = vec![0.0; n];

    for _ in 0..MAX_ITERATIONS {
        let dangling_mass: f64 = (0..n)
            .filter(|&j| flow.out_weight[j] == 0.0)
            .map(|j| rank[j])
            .sum();

        for i in 0..n {
            let mut inflow = dangling_mass * p[i];
            for &(j, w) in &flow.incoming[i] {
                inflow += rank[j] * w / flow.out_weight[j];
            }
            next[i] = (1.0 - DAMPING) * p[i] + DAMPING * inflow;
        }

        let delta: f64 = rank.iter().zip(&next).map(|(a, b)| (a - b).abs()).sum();
        std::mem::swap(&mut rank, &mut next);
        if delta < TOLERANCE {
            return (rank, true);
        }
    }
    (rank, false)
}

fn page_rank_inner(
    graph: &RefGraph,
    personalization: Option<&BTreeMap<String, f64>>,
) -> Option<BTreeMap<String, f64>> {
    let (rank, converged) = page_rank_iterate(graph, personalization);
    if !converged {
        return None;
    }
    Some(graph.nodes.iter().cloned().zip(rank).collect())
}

fn page_rank_last_iterate(
    graph: &RefGraph,
    personalization: Option<&BTreeMap<String, f64>>,
) -> BTreeMap<String, f64> {
    let (rank, _) = page_rank_iterate(graph, personalization);
    graph.nodes.iter().cloned().zip(rank).collect()
}

// ---------------------------------------------------------------------------
// Distribution to definitions
// ---------------------------------------------------------------------------

/// Attribute each node's rank to the definitions it references: an edge
/// carries `rank[from] * weight / out_weight[from]` to `(to, ident)`.
/// Sorted by `(-rank, file, ident)`.
pub fn distribute(graph: &RefGraph, ranks: &BTreeMap<String, f64>) -> Vec<RankedDef> {
    let index = node_indices(graph);
    let flow = build_flow(graph, &index);

    let mut by_def: BTreeMap<(String, String), f64> = BTreeMap::new();
    for edge in &graph.edges {
        if edge.weight <= 0.0 {
            continue;
        }
        let Some(&from) = index.get(edge.from.as_str()) else { continue };
        let out = flow.out_weight[from];
        if out <= 0.0 {
            continue;
        }
        let rank = ranks.get(&edge.from).copied().unwrap_or(0.0);
        *by_def.entry((edge.to.clone(), edge.ident.clone())).or_insert(0.0) +=
            rank * edge.weight / out;
    }

    let mut defs: Vec<RankedDef> = by_def
        .into_iter()
        .map(|((file, ident), rank)| RankedDef { file, ident, rank, line: 0 })
        .collect();
    defs.sort_by(|a, b| {
        b.rank
            .total_cmp(&a.rank)
            .then_with(|| a.file.cmp(&b.file))
            .then_with(|| a.ident.cmp(&b.ident))
    });
    defs
}

// ---------------------------------------------------------------------------
// File aggregation
// ---------------------------------------------------------------------------

/// Aggregate ranked definitions per file and attach the earliest `def` line
/// from the tag table. Files sort by `(-rank, path)`; defs within a file by
/// `(-rank, name, line)`.
pub fn aggregate(defs: &[RankedDef], tags: &[Tag]) -> Vec<RankedFile> {
    // Earliest def line per (file, name).
    let mut def_lines: HashMap<(&str, &str), u32> = HashMap::new();
    for tag in tags {
        if tag.kind != TagKind::Def {
            continue;
        }
        let key = (tag.rel_path.as_str(), tag.name.as_str());
        let entry = def_lines.entry(key).or_insert(tag.line);
        if tag.line < *entry {
            *entry = tag.line;
        }
    }

    let mut by_file: BTreeMap<String, Vec<RankedDef>> = BTreeMap::new();
    for def in defs {
        let line = def_lines
            .get(&(def.file.as_str(), def.ident.as_str()))
            .copied()
            .unwrap_or(0);
        by_file
            .entry(def.file.clone())
            .or_default()
            .push(RankedDef { line, ..def.clone() });
    }

    let mut files: Vec<RankedFile> = by_file
        .into_iter()
        .map(|(path, mut defs)| {
            defs.sort_by(|a, b| {
                b.rank
                    .total_cmp(&a.rank)
                    .then_with(|| a.ident.cmp(&b.ident))
                    .then_with(|| a.line.cmp(&b.line))
            });
            let rank = defs.iter().map(|d| d.rank).sum();
            RankedFile { path, rank, defs }
        })
        .collect();
    files.sort_by(|a, b| b.rank.total_cmp(&a.rank).then_with(|| a.path.cmp(&b.path)));
    files
}
