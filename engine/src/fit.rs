//! Budget fitting: binary search for the longest entry prefix that satisfies
//! the mode's acceptance predicate.
//!
//! Sizing uses a stage-flat serialization of the entries (one line per
//! entry); the scope-aware renderer produces larger text, which the facade
//! compensates for with an expansion factor and a post-render trim loop.

use tracing::debug;

use crate::ctx::Ctx;
use crate::error::MapError;
use crate::stages::StageEntry;
use crate::tokens::Accountant;

/// Acceptance semantics for the fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitMode {
    /// Accept when the comparator delta `|parity - budget| / budget` is at
    /// most 0.15.
    Parity,
    /// Accept when the conservative safety count fits the budget.
    Enhancement,
}

/// The comparator acceptance threshold shared by parity fitting and the
/// post-render check.
pub const COMPARATOR_TOLERANCE: f64 = 0.15;

/// One probe of the binary search, kept for final selection.
#[derive(Debug, Clone, PartialEq)]
pub struct FitCandidate {
    /// Prefix length in entries.
    pub entries: usize,
    /// Stages of the pruned tail, tail-first: trimming proceeds 3 -> 2 -> 1,
    /// with stage 0 prioritized for retention.
    pub trimmed_stages: Vec<u8>,
    pub parity_tokens: usize,
    pub safety_tokens: usize,
    pub accepted: bool,
    pub delta: f64,
}

#[derive(Debug, Clone)]
pub struct FitResult {
    pub entries: Vec<StageEntry>,
    pub candidate: FitCandidate,
}

impl FitResult {
    fn empty() -> Self {
        FitResult {
            entries: Vec::new(),
            candidate: FitCandidate {
                entries: 0,
                trimmed_stages: Vec::new(),
                parity_tokens: 0,
                safety_tokens: 0,
                accepted: true,
                delta: 1.0,
            },
        }
    }
}

/// Stage-flat serialization used only for sizing. Matches the renderer's
/// flat fallback shape so the sizes line up.
pub fn flat_render(entries: &[StageEntry]) -> String {
    let mut out = String::new();
    for e in entries {
        match &e.ident {
            Some(ident) => {
                out.push_str("S1|");
                out.push_str(&e.file);
                out.push('|');
                out.push_str(ident);
                out.push('\n');
            }
            None => {
                out.push_str(&e.file);
                out.push('\n');
            }
        }
    }
    out
}

fn trimmed_stages(entries: &[StageEntry], keep: usize) -> Vec<u8> {
    entries[keep..].iter().rev().map(|e| e.stage).collect()
}

/// Binary-search the prefix of `entries` to keep under `budget`.
pub fn fit(
    ctx: &Ctx,
    entries: &[StageEntry],
    mode: FitMode,
    budget: usize,
    accountant: &Accountant,
) -> Result<FitResult, MapError> {
    if budget == 0 || entries.is_empty() {
        return Ok(FitResult::empty());
    }

    let n = entries.len();
    let mut candidates: Vec<FitCandidate> = Vec::new();

    let mut lo = 0usize;
    let mut hi = n;
    let mut mid = (budget / 25).min(n);

    loop {
        ctx.check()?;
        let text = flat_render(&entries[..mid]);
        let parity = accountant.parity_tokens(ctx, &text)?;
        let safety = accountant.safety_tokens(ctx, &text)?;
        let delta = (parity as f64 - budget as f64).abs() / budget as f64;
        let accepted = match mode {
            FitMode::Parity => delta <= COMPARATOR_TOLERANCE,
            FitMode::Enhancement => safety <= budget,
        };
        candidates.push(FitCandidate {
            entries: mid,
            trimmed_stages: trimmed_stages(entries, mid),
            parity_tokens: parity,
            safety_tokens: safety,
            accepted,
            delta,
        });

        if mode == FitMode::Enhancement && accepted && delta <= COMPARATOR_TOLERANCE {
            break;
        }

        if parity <= budget {
            lo = mid + 1;
        } else {
            if mid == 0 {
                break;
            }
            hi = mid - 1;
        }
        if lo > hi {
            break;
        }
        mid = (lo + hi) / 2;
    }

    let best = select(&candidates, mode);
    debug!(
        probes = candidates.len(),
        keep = best.entries,
        parity = best.parity_tokens,
        safety = best.safety_tokens,
        accepted = best.accepted,
        "budget fit"
    );
    Ok(FitResult { entries: entries[..best.entries].to_vec(), candidate: best })
}

/// Pick the winning candidate. Parity prefers accepted, then smaller delta,
/// then more entries. Enhancement prefers accepted, then larger safety
/// (fullest use of the budget), then smaller delta, then more entries. With
/// no accepted candidate, the smallest delta wins.
fn select(candidates: &[FitCandidate], mode: FitMode) -> FitCandidate {
    let accepted: Vec<&FitCandidate> = candidates.iter().filter(|c| c.accepted).collect();
    if accepted.is_empty() {
        return candidates
            .iter()
            .min_by(|a, b| {
                a.delta
                    .total_cmp(&b.delta)
                    .then_with(|| b.entries.cmp(&a.entries))
            })
            .cloned()
            .unwrap_or_else(|| FitResult::empty().candidate);
    }
    let best = match mode {
        FitMode::Parity => accepted.iter().min_by(|a, b| {
            a.delta
                .total_cmp(&b.delta)
                .then_with(|| b.entries.cmp(&a.entries))
        }),
        FitMode::Enhancement => accepted.iter().min_by(|a, b| {
            b.safety_tokens
                .cmp(&a.safety_tokens)
                .then_with(|| a.delta.total_cmp(&b.delta))
                .then_with(|| b.entries.cmp(&a.entries))
        }),
    };
    (*best.expect("non-empty accepted set")).clone()
}
