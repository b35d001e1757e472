//! Per-session guards: the at-most-once injection guard and the one-way
//! disable latch.

use std::collections::HashSet;

use dashmap::DashMap;

/// Identity of one logical conversational turn.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunKey {
    pub root_message_id: String,
    pub queue_generation: u64,
}

impl RunKey {
    pub fn new(root_message_id: &str, queue_generation: u64) -> Self {
        RunKey { root_message_id: root_message_id.to_string(), queue_generation }
    }
}

/// Tracks which `(session, run key)` pairs have already caused an injection.
#[derive(Default)]
pub struct InjectionGuard {
    seen: DashMap<String, HashSet<RunKey>>,
}

impl InjectionGuard {
    pub fn new() -> Self {
        InjectionGuard::default()
    }

    /// True exactly once per distinct `(session, key)`. An empty root message
    /// id never injects. The insert happens under the session's entry lock,
    /// so exactly one concurrent caller wins.
    pub fn should_inject(&self, session: &str, key: &RunKey) -> bool {
        if key.root_message_id.is_empty() {
            return false;
        }
        self.seen.entry(session.to_string()).or_default().insert(key.clone())
    }

    pub fn clear(&self, session: &str) {
        self.seen.remove(session);
    }
}

/// One-way per-session disable flag. Engaged when a parity-mode deadline
/// expires inside the generate pipeline; cleared only by an explicit reset.
#[derive(Default)]
pub struct DisableLatch {
    engaged: DashMap<String, ()>,
}

impl DisableLatch {
    pub fn new() -> Self {
        DisableLatch::default()
    }

    pub fn engage(&self, session: &str) {
        self.engaged.insert(session.to_string(), ());
    }

    pub fn is_engaged(&self, session: &str) -> bool {
        self.engaged.contains_key(session)
    }

    pub fn clear(&self, session: &str) {
        self.engaged.remove(session);
    }
}
