//! Token accounting: heuristic estimates, exact counting through a pluggable
//! counter, and the conservative safety bound used in enhancement mode.
//!
//! Follows the pluggable-tokenizer pattern: a trait object for the counter, a
//! dependency-free estimator always available, and a tiktoken-backed
//! implementation behind the `tiktoken` feature.

use std::sync::Arc;

use crate::ctx::Ctx;
use crate::error::MapError;

/// Exact token counting capability, bound to a model.
pub trait TokenCounter: Send + Sync {
    fn count(&self, ctx: &Ctx, model: &str, text: &str) -> Result<usize, MapError>;
    fn name(&self) -> &str;
}

/// Resolves counters and encoding metadata per model.
pub trait TokenCounterProvider: Send + Sync {
    fn counter_for_model(&self, model: &str) -> Option<Arc<dyn TokenCounter>>;
    fn metadata_for_model(&self, model: &str) -> ModelMetadata;
}

/// Resolved encoding metadata for a model string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelMetadata {
    pub family: &'static str,
    pub encoding: &'static str,
    /// True when the family has no native tokenizer here and is mapped onto
    /// the cl100k approximation (Anthropic, Google).
    pub approximate: bool,
}

// ---------------------------------------------------------------------------
// Model family resolution
// ---------------------------------------------------------------------------

/// `(family prefix, encoding, approximate)`. Resolution is exact match first,
/// then longest matching prefix.
const MODEL_FAMILIES: &[(&str, &str, bool)] = &[
    ("gpt-4o", "o200k_base", false),
    ("gpt-4.1", "o200k_base", false),
    ("gpt-4", "cl100k_base", false),
    ("gpt-3.5", "cl100k_base", false),
    ("o1", "o200k_base", false),
    ("o3", "o200k_base", false),
    ("o4", "o200k_base", false),
    ("chatgpt", "o200k_base", false),
    ("text-embedding", "cl100k_base", false),
    ("claude", "cl100k_base", true),
    ("anthropic", "cl100k_base", true),
    ("gemini", "cl100k_base", true),
    ("google", "cl100k_base", true),
];

const DEFAULT_METADATA: ModelMetadata =
    ModelMetadata { family: "", encoding: "cl100k_base", approximate: true };

/// Resolve a model string against the family table.
pub fn metadata_for_model(model: &str) -> ModelMetadata {
    let model = model.trim().to_lowercase();
    if let Some(&(family, encoding, approximate)) =
        MODEL_FAMILIES.iter().find(|(f, _, _)| *f == model)
    {
        return ModelMetadata { family, encoding, approximate };
    }
    let mut best: Option<&(&str, &str, bool)> = None;
    for entry in MODEL_FAMILIES {
        if model.starts_with(entry.0) && best.map_or(true, |b| entry.0.len() > b.0.len()) {
            best = Some(entry);
        }
    }
    match best {
        Some(&(family, encoding, approximate)) => ModelMetadata { family, encoding, approximate },
        None => DEFAULT_METADATA,
    }
}

// ---------------------------------------------------------------------------
// Heuristic estimation
// ---------------------------------------------------------------------------

/// Characters-per-token ratio by language hint.
fn ratio_for_language(lang: &str) -> f64 {
    match lang {
        "go" | "rust" => 3.2,
        "javascript" | "typescript" => 3.3,
        "python" => 3.5,
        "java" | "c" | "cpp" => 3.1,
        "markdown" | "text" => 3.8,
        "json" => 2.8,
        "yaml" | "toml" => 3.0,
        _ => 3.5,
    }
}

/// Fast dependency-free token estimate: `ceil(len / ratio(lang))`.
pub fn estimate_tokens(text: &str, lang: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    (text.len() as f64 / ratio_for_language(lang)).ceil() as usize
}

// ---------------------------------------------------------------------------
// Accountant
// ---------------------------------------------------------------------------

/// Bundles the optional counter with the model and language hint so the
/// fitter and facade can ask for parity and safety counts without re-plumbing
/// the binding everywhere.
#[derive(Clone)]
pub struct Accountant {
    counter: Option<Arc<dyn TokenCounter>>,
    model: String,
    lang_hint: String,
}

impl std::fmt::Debug for Accountant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accountant")
            .field("counter", &self.counter.as_ref().map(|c| c.name().to_string()))
            .field("model", &self.model)
            .field("lang_hint", &self.lang_hint)
            .finish()
    }
}

impl Accountant {
    pub fn new(counter: Option<Arc<dyn TokenCounter>>, model: &str, lang_hint: &str) -> Self {
        Accountant {
            counter,
            model: model.to_string(),
            lang_hint: lang_hint.to_string(),
        }
    }

    pub fn has_counter(&self) -> bool {
        self.counter.is_some()
    }

    /// Exact count when a counter is bound, estimate otherwise.
    pub fn parity_tokens(&self, ctx: &Ctx, text: &str) -> Result<usize, MapError> {
        match &self.counter {
            Some(c) => c.count(ctx, &self.model, text),
            None => Ok(estimate_tokens(text, &self.lang_hint)),
        }
    }

    /// Conservative bound: the larger of the parity count and the padded
    /// estimate, `max(parity, ceil(estimate * 1.15))`.
    pub fn safety_tokens(&self, ctx: &Ctx, text: &str) -> Result<usize, MapError> {
        let parity = self.parity_tokens(ctx, text)?;
        let padded = (estimate_tokens(text, &self.lang_hint) as f64 * 1.15).ceil() as usize;
        Ok(parity.max(padded))
    }
}

// ---------------------------------------------------------------------------
// Tiktoken backend (feature-gated)
// ---------------------------------------------------------------------------

#[cfg(feature = "tiktoken")]
pub struct TiktokenCounter {
    cl100k: tiktoken_rs::CoreBPE,
    o200k: tiktoken_rs::CoreBPE,
}

#[cfg(feature = "tiktoken")]
impl TiktokenCounter {
    pub fn new() -> Result<Self, MapError> {
        Ok(TiktokenCounter {
            cl100k: tiktoken_rs::cl100k_base()
                .map_err(|e| MapError::backend("load cl100k encoding", e))?,
            o200k: tiktoken_rs::o200k_base()
                .map_err(|e| MapError::backend("load o200k encoding", e))?,
        })
    }
}

#[cfg(feature = "tiktoken")]
impl TokenCounter for TiktokenCounter {
    fn count(&self, ctx: &Ctx, model: &str, text: &str) -> Result<usize, MapError> {
        ctx.check()?;
        let bpe = match metadata_for_model(model).encoding {
            "o200k_base" => &self.o200k,
            _ => &self.cl100k,
        };
        Ok(bpe.encode_with_special_tokens(text).len())
    }

    fn name(&self) -> &str {
        "tiktoken"
    }
}

#[cfg(feature = "tiktoken")]
pub struct TiktokenProvider {
    counter: Arc<TiktokenCounter>,
}

#[cfg(feature = "tiktoken")]
impl TiktokenProvider {
    pub fn new() -> Result<Self, MapError> {
        Ok(TiktokenProvider { counter: Arc::new(TiktokenCounter::new()?) })
    }
}

#[cfg(feature = "tiktoken")]
impl TokenCounterProvider for TiktokenProvider {
    fn counter_for_model(&self, _model: &str) -> Option<Arc<dyn TokenCounter>> {
        Some(self.counter.clone())
    }

    fn metadata_for_model(&self, model: &str) -> ModelMetadata {
        metadata_for_model(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_rounds_up() {
        assert_eq!(estimate_tokens("", "go"), 0);
        // 7 chars at ratio 3.2 -> ceil(2.1875) = 3
        assert_eq!(estimate_tokens("func f(", "go"), 3);
    }

    #[test]
    fn metadata_exact_match_wins() {
        let m = metadata_for_model("gpt-4o");
        assert_eq!(m.encoding, "o200k_base");
        assert!(!m.approximate);
    }

    #[test]
    fn metadata_longest_prefix_wins() {
        // "gpt-4o-mini" prefixes both "gpt-4" and "gpt-4o"; the longer wins.
        let m = metadata_for_model("gpt-4o-mini");
        assert_eq!(m.family, "gpt-4o");
        assert_eq!(m.encoding, "o200k_base");
        let m = metadata_for_model("gpt-4-turbo");
        assert_eq!(m.family, "gpt-4");
        assert_eq!(m.encoding, "cl100k_base");
    }

    #[test]
    fn anthropic_and_google_map_to_cl100k_approximation() {
        for model in ["claude-sonnet-4", "gemini-2.5-pro"] {
            let m = metadata_for_model(model);
            assert_eq!(m.encoding, "cl100k_base");
            assert!(m.approximate, "{model} should be approximate");
        }
    }

    #[test]
    fn unknown_model_gets_default() {
        let m = metadata_for_model("mystery-model-9000");
        assert_eq!(m.encoding, "cl100k_base");
        assert!(m.approximate);
    }

    struct FixedCounter(usize);
    impl TokenCounter for FixedCounter {
        fn count(&self, _ctx: &Ctx, _model: &str, _text: &str) -> Result<usize, MapError> {
            Ok(self.0)
        }
        fn name(&self) -> &str {
            "fixed"
        }
    }

    #[test]
    fn safety_is_max_of_parity_and_padded_estimate() {
        let ctx = Ctx::background();
        let text = "x".repeat(350); // estimate at 3.5 -> 100, padded -> 115

        let low = Accountant::new(Some(Arc::new(FixedCounter(10))), "m", "text2");
        assert_eq!(low.safety_tokens(&ctx, &text).unwrap(), 115);

        let high = Accountant::new(Some(Arc::new(FixedCounter(400))), "m", "text2");
        assert_eq!(high.safety_tokens(&ctx, &text).unwrap(), 400);
    }

    #[test]
    fn parity_falls_back_to_estimate_without_counter() {
        let ctx = Ctx::background();
        let acct = Accountant::new(None, "m", "go");
        assert_eq!(acct.parity_tokens(&ctx, "func f(").unwrap(), 3);
    }
}
