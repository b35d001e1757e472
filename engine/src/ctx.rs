//! Cooperative cancellation and deadlines.
//!
//! Every blocking step in the pipeline (parser calls, filesystem reads,
//! storage queries, token-counter calls) checks a [`Ctx`] on entry. A `Ctx`
//! carries the caller's cancellation token, any layered service tokens, and
//! an optional wall-clock deadline; whichever fires first fails the step.

use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::error::MapError;

/// Cancellation scope handed down through the pipeline.
#[derive(Debug, Clone, Default)]
pub struct Ctx {
    cancels: Vec<CancellationToken>,
    deadline: Option<Instant>,
}

impl Ctx {
    /// A context that is never canceled and has no deadline.
    pub fn background() -> Self {
        Ctx::default()
    }

    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Ctx { cancels: vec![cancel], deadline: None }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Ctx { cancels: Vec::new(), deadline: Some(deadline) }
    }

    /// Derive a context that is also canceled when `token` is. The deadline
    /// is inherited.
    pub fn child(&self, token: &CancellationToken) -> Ctx {
        let mut cancels = self.cancels.clone();
        cancels.push(token.clone());
        Ctx { cancels, deadline: self.deadline }
    }

    /// Attach (or tighten) a deadline.
    pub fn with_deadline_at(&self, deadline: Instant) -> Ctx {
        let deadline = match self.deadline {
            Some(existing) => Some(existing.min(deadline)),
            None => Some(deadline),
        };
        Ctx { cancels: self.cancels.clone(), deadline }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Check for an expired deadline or cancellation. The deadline is checked
    /// first so a timed-out context reports `DeadlineExceeded` rather than
    /// the generic `Canceled`.
    pub fn check(&self) -> Result<(), MapError> {
        if let Some(d) = self.deadline {
            if Instant::now() >= d {
                return Err(MapError::DeadlineExceeded);
            }
        }
        if self.cancels.iter().any(|c| c.is_cancelled()) {
            return Err(MapError::Canceled);
        }
        Ok(())
    }

    pub fn is_done(&self) -> bool {
        self.check().is_err()
    }
}
