//! Per-session caches: the last-good map snapshot and the keyed render
//! cache.
//!
//! Snapshots are stored and loaded as one value, so a reader never observes
//! a torn `(map, tokens)` pair. Render-cache keys embed the renderer
//! version; bumping it retires all prior entries without deleting them.

use dashmap::DashMap;

use crate::config::{GenerateOptions, RefreshMode};
use crate::render::RENDERER_VERSION;

/// The `(last_good_map, last_token_count)` pair for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapSnapshot {
    pub map: String,
    pub tokens: usize,
}

impl MapSnapshot {
    pub fn new(map: String, tokens: usize) -> Self {
        MapSnapshot { map, tokens }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Session cache
// ---------------------------------------------------------------------------

/// Last-good snapshots keyed by session id. Each value is written in one
/// atomic step.
#[derive(Default)]
pub struct SessionCacheSet {
    inner: DashMap<String, MapSnapshot>,
}

impl SessionCacheSet {
    pub fn new() -> Self {
        SessionCacheSet::default()
    }

    pub fn get_or_create(&self, session: &str) -> MapSnapshot {
        self.inner.entry(session.to_string()).or_default().clone()
    }

    pub fn store(&self, session: &str, snapshot: MapSnapshot) {
        self.inner.insert(session.to_string(), snapshot);
    }

    pub fn load(&self, session: &str) -> Option<MapSnapshot> {
        self.inner.get(session).map(|s| s.clone())
    }

    /// Clearing resets both halves of the pair simultaneously.
    pub fn clear(&self, session: &str) {
        self.inner.remove(session);
    }

    pub fn clear_all(&self) {
        self.inner.clear();
    }

    pub fn size(&self) -> usize {
        self.inner.len()
    }
}

// ---------------------------------------------------------------------------
// Render cache
// ---------------------------------------------------------------------------

/// Keyed render results per session.
#[derive(Default)]
pub struct RenderCacheSet {
    inner: DashMap<String, DashMap<String, MapSnapshot>>,
}

impl RenderCacheSet {
    pub fn new() -> Self {
        RenderCacheSet::default()
    }

    pub fn load(&self, session: &str, key: &str) -> Option<MapSnapshot> {
        if key.is_empty() {
            return None;
        }
        self.inner.get(session)?.get(key).map(|s| s.clone())
    }

    pub fn store(&self, session: &str, key: &str, snapshot: MapSnapshot) {
        if key.is_empty() {
            return;
        }
        self.inner
            .entry(session.to_string())
            .or_default()
            .insert(key.to_string(), snapshot);
    }

    pub fn remove(&self, session: &str, key: &str) {
        if let Some(entries) = self.inner.get(session) {
            entries.remove(key);
        }
    }

    pub fn clear(&self, session: &str) {
        self.inner.remove(session);
    }

    pub fn clear_all(&self) {
        self.inner.clear();
    }

    pub fn size(&self) -> usize {
        self.inner.iter().map(|e| e.value().len()).sum()
    }
}

// ---------------------------------------------------------------------------
// Render cache keys
// ---------------------------------------------------------------------------

fn normalized(list: &[String]) -> Vec<String> {
    let mut items: Vec<String> = list.to_vec();
    items.sort();
    items.dedup();
    items
}

/// Derive the render-cache key for a call. `always` yields the empty key
/// (never cached); `manual` a constant key; `files` covers chat files and
/// budget; `auto` additionally covers the mentions. Every non-empty key
/// embeds the renderer version.
pub fn render_cache_key(mode: RefreshMode, opts: &GenerateOptions, budget: usize) -> String {
    match mode {
        RefreshMode::Always => String::new(),
        RefreshMode::Manual => format!("v{RENDERER_VERSION}:manual"),
        RefreshMode::Files => serde_json::json!({
            "v": RENDERER_VERSION,
            "mode": "files",
            "chat": normalized(&opts.chat_files),
            "tiers": opts.enhancement_tiers,
            "budget": budget,
        })
        .to_string(),
        RefreshMode::Auto => serde_json::json!({
            "v": RENDERER_VERSION,
            "mode": "auto",
            "chat": normalized(&opts.chat_files),
            "files": normalized(&opts.mentioned_file_names),
            "idents": normalized(&opts.mentioned_identifiers),
            "tiers": opts.enhancement_tiers,
            "budget": budget,
        })
        .to_string(),
    }
}
