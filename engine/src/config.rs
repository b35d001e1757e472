//! Service configuration and per-call generate options.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::tokens::TokenCounter;

/// How the generated map is refreshed across calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefreshMode {
    /// Cached result preferred; regenerate when nothing is cached.
    Auto,
    /// Like `Auto`, but the render-cache key only covers chat files + budget.
    Files,
    /// Only explicit refresh regenerates; generate serves cache or empty.
    Manual,
    /// Regenerate on every call; the render cache is never consulted.
    Always,
}

impl RefreshMode {
    /// Parse a configured mode string. Lowercased and trimmed; empty or
    /// unrecognized values fall back to `Auto`.
    pub fn parse(s: &str) -> RefreshMode {
        match s.trim().to_lowercase().as_str() {
            "files" => RefreshMode::Files,
            "manual" => RefreshMode::Manual,
            "always" => RefreshMode::Always,
            _ => RefreshMode::Auto,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RefreshMode::Auto => "auto",
            RefreshMode::Files => "files",
            RefreshMode::Manual => "manual",
            RefreshMode::Always => "always",
        }
    }
}

/// Runtime configuration for the map service. Supplied by the host; the
/// engine does no config-file parsing of its own.
#[derive(Clone, Serialize, Deserialize)]
pub struct MapConfig {
    /// Generation returns unavailable when set.
    pub disabled: bool,
    /// Overrides the dynamic budget when non-zero.
    pub max_tokens: usize,
    /// Post-walker exclusion globs (doublestar syntax). Malformed patterns
    /// are skipped with a warning at init.
    pub exclude_globs: Vec<String>,
    /// Configured refresh mode string; resolved per call.
    pub refresh_mode: String,
    /// Budget multiplier applied when the caller has no chat files.
    pub map_mul_no_files: f64,
    /// Worker pool size for the parse phase. 0 means CPU count.
    pub parser_pool_size: usize,
}

impl Default for MapConfig {
    fn default() -> Self {
        MapConfig {
            disabled: false,
            max_tokens: 0,
            exclude_globs: Vec::new(),
            refresh_mode: String::new(),
            map_mul_no_files: 1.0,
            parser_pool_size: 0,
        }
    }
}

/// Per-call options for `generate` / `refresh`.
#[derive(Clone, Default)]
pub struct GenerateOptions {
    /// Keys all per-session state. Empty means generate returns empty
    /// without error.
    pub session_id: String,
    /// Files the user is currently in conversation with. Personalize the
    /// ranking and are excluded from every output stage.
    pub chat_files: Vec<String>,
    /// Additional file-name personalization boosts.
    pub mentioned_file_names: Vec<String>,
    /// Identifier-level personalization and edge-weight multipliers.
    pub mentioned_identifiers: Vec<String>,
    /// Explicit token budget; 0 derives from the context window and config.
    pub token_budget: usize,
    /// Target model context window, for dynamic budget derivation.
    pub max_context_window: usize,
    /// Clear session + render caches before proceeding.
    pub force_refresh: bool,
    /// Stricter acceptance semantics: comparator delta against the budget,
    /// VCS-tracked file universe, mandatory token counter.
    pub parity_mode: bool,
    /// With parity mode and an effective `auto` mode, coerces the refresh
    /// mode to `files`.
    pub prompt_caching_enabled: bool,
    /// Pin the tokenizer binding; with parity mode this makes the absence of
    /// a counter a hard error (it already is) rather than a soft estimate.
    pub deterministic_mode: bool,
    /// Reserved staging knob carried through to the render cache key.
    pub enhancement_tiers: u8,
    /// Counter binding policy: "" / "auto" consult the provider,
    /// "estimate" skips it.
    pub token_counter_mode: String,
    /// Model identifier used for counter lookup and metadata resolution.
    pub model: String,
    /// Explicit counter; wins over the provider lookup.
    pub token_counter: Option<Arc<dyn TokenCounter>>,
}

/// Result of a generate / refresh call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MapOutput {
    pub text: String,
    pub token_count: usize,
}

impl MapOutput {
    pub fn empty() -> Self {
        MapOutput::default()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_mode_parsing() {
        assert_eq!(RefreshMode::parse(""), RefreshMode::Auto);
        assert_eq!(RefreshMode::parse("  AUTO "), RefreshMode::Auto);
        assert_eq!(RefreshMode::parse("Files"), RefreshMode::Files);
        assert_eq!(RefreshMode::parse("manual"), RefreshMode::Manual);
        assert_eq!(RefreshMode::parse("ALWAYS"), RefreshMode::Always);
        assert_eq!(RefreshMode::parse("bogus"), RefreshMode::Auto);
    }
}
