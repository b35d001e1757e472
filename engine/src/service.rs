//! The map service: configuration resolution, cache fast paths, the
//! generate pipeline, background refresh and pre-indexing, and lifecycle.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{render_cache_key, MapSnapshot, RenderCacheSet, SessionCacheSet};
use crate::config::{GenerateOptions, MapConfig, MapOutput, RefreshMode};
use crate::ctx::Ctx;
use crate::error::MapError;
use crate::fit::{fit, FitMode, COMPARATOR_TOLERANCE};
use crate::flight::Group;
use crate::graph::build_graph;
use crate::parser::SourceParser;
use crate::paths;
use crate::rank::{aggregate, distribute, page_rank, personalization};
use crate::render::Renderer;
use crate::session::{DisableLatch, InjectionGuard, RunKey};
use crate::stages::assemble;
use crate::store::{Queries, RankedPath};
use crate::tags::{Extractor, Tag};
use crate::tokens::{Accountant, TokenCounter, TokenCounterProvider};
use crate::vcs::TrackedFiles;
use crate::walk::{ConventionalSkips, SkipRules, Walker};

/// Scope-aware text runs larger than the flat sizing the fitter sees; the
/// budget handed to the fitter is divided by this factor and the post-render
/// trim loop enforces the real budget.
const EXPANSION_FACTOR: usize = 4;

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

/// Assembles a [`RepoMapService`] with its optional capabilities.
pub struct ServiceBuilder {
    root: String,
    config: MapConfig,
    queries: Option<Arc<dyn Queries>>,
    parser: Option<Arc<dyn SourceParser>>,
    counters: Option<Arc<dyn TokenCounterProvider>>,
    tracked: Option<Arc<dyn TrackedFiles>>,
    skips: Arc<dyn SkipRules>,
}

impl ServiceBuilder {
    pub fn new(root: &str, config: MapConfig) -> Self {
        ServiceBuilder {
            root: root.to_string(),
            config,
            queries: None,
            parser: None,
            counters: None,
            tracked: None,
            skips: Arc::new(ConventionalSkips::new()),
        }
    }

    pub fn queries(mut self, queries: Arc<dyn Queries>) -> Self {
        self.queries = Some(queries);
        self
    }

    pub fn parser(mut self, parser: Arc<dyn SourceParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    pub fn token_counters(mut self, counters: Arc<dyn TokenCounterProvider>) -> Self {
        self.counters = Some(counters);
        self
    }

    pub fn tracked_files(mut self, tracked: Arc<dyn TrackedFiles>) -> Self {
        self.tracked = Some(tracked);
        self
    }

    pub fn skip_rules(mut self, skips: Arc<dyn SkipRules>) -> Self {
        self.skips = skips;
        self
    }

    pub fn build(self) -> Result<RepoMapService, MapError> {
        let repo_key =
            paths::repo_key(&self.root).map_err(|e| MapError::Config(e.to_string()))?;
        let walker = Walker::new(&self.root, &self.config.exclude_globs, self.skips.clone());
        let extractor = Extractor::new(
            self.queries.clone(),
            self.parser.clone(),
            self.config.parser_pool_size,
        )?;
        let (preindex_tx, preindex_rx) = tokio::sync::watch::channel(false);
        Ok(RepoMapService {
            inner: Arc::new(Inner {
                root: self.root,
                repo_key,
                config: self.config,
                queries: self.queries,
                parser: self.parser,
                counters: self.counters,
                tracked: self.tracked,
                walker,
                extractor,
                session_cache: SessionCacheSet::new(),
                render_cache: RenderCacheSet::new(),
                latch: DisableLatch::new(),
                guard: InjectionGuard::new(),
                preindex_flight: Group::new(),
                refresh_flight: Group::new(),
                preindex_tx,
                preindex_rx,
                shutdown: CancellationToken::new(),
            }),
        })
    }
}

struct Inner {
    root: String,
    repo_key: String,
    config: MapConfig,
    queries: Option<Arc<dyn Queries>>,
    parser: Option<Arc<dyn SourceParser>>,
    counters: Option<Arc<dyn TokenCounterProvider>>,
    tracked: Option<Arc<dyn TrackedFiles>>,
    walker: Walker,
    extractor: Extractor,
    session_cache: SessionCacheSet,
    render_cache: RenderCacheSet,
    latch: DisableLatch,
    guard: InjectionGuard,
    preindex_flight: Group<bool>,
    refresh_flight: Group<bool>,
    preindex_tx: tokio::sync::watch::Sender<bool>,
    preindex_rx: tokio::sync::watch::Receiver<bool>,
    shutdown: CancellationToken,
}

/// Repository map service. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct RepoMapService {
    inner: Arc<Inner>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

impl RepoMapService {
    pub fn available(&self) -> bool {
        !self.inner.config.disabled
    }

    pub fn repo_key(&self) -> &str {
        &self.inner.repo_key
    }

    /// At-most-once injection decision per `(session, run key)`.
    pub fn should_inject(&self, session: &str, key: &RunKey) -> bool {
        self.inner.guard.should_inject(session, key)
    }

    pub fn last_good_map(&self, session: &str) -> String {
        self.inner.session_cache.load(session).map(|s| s.map).unwrap_or_default()
    }

    pub fn last_token_count(&self, session: &str) -> usize {
        self.inner.session_cache.load(session).map(|s| s.tokens).unwrap_or_default()
    }

    /// The walker's view of the repository, sorted.
    pub fn all_files(&self, ctx: &Ctx) -> Result<Vec<String>, MapError> {
        let ctx = ctx.child(&self.inner.shutdown);
        self.inner.walker.files(&ctx)
    }

    pub fn session_read_only_files(
        &self,
        ctx: &Ctx,
        session: &str,
    ) -> Result<Vec<String>, MapError> {
        let ctx = ctx.child(&self.inner.shutdown);
        ctx.check()?;
        match &self.inner.queries {
            Some(q) => q
                .list_session_read_only_paths(&self.inner.repo_key, session)
                .map_err(|e| MapError::backend("list session read-only paths", e)),
            None => Ok(Vec::new()),
        }
    }

    /// Clear every piece of per-session state: caches, latch, injection set,
    /// and session-scoped storage rows.
    pub fn reset(&self, ctx: &Ctx, session: &str) -> Result<(), MapError> {
        let ctx = ctx.child(&self.inner.shutdown);
        ctx.check()?;
        self.inner.session_cache.clear(session);
        self.inner.render_cache.clear(session);
        self.inner.latch.clear(session);
        self.inner.guard.clear(session);
        if let Some(q) = &self.inner.queries {
            q.clear_session(&self.inner.repo_key, session)
                .map_err(|e| MapError::backend("clear session repo-map state", e))?;
        }
        Ok(())
    }

    /// Cancel background work and release the parser.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
        if let Some(parser) = &self.inner.parser {
            parser.close();
        }
    }

    /// Kick off the background pre-index. Concurrent calls before completion
    /// collapse into one walk+extract pass.
    pub fn pre_index(&self) {
        let service = self.clone();
        tokio::spawn(async move {
            let key = service.inner.repo_key.clone();
            service
                .inner
                .preindex_flight
                .run(&key, || async {
                    let service = service.clone();
                    let result = tokio::task::spawn_blocking(move || {
                        let ctx = Ctx::with_cancel(service.inner.shutdown.clone());
                        let universe = service.inner.walker.files(&ctx)?;
                        service.inner.extractor.extract(
                            &ctx,
                            &service.inner.root,
                            &service.inner.repo_key,
                            &universe,
                            false,
                        )?;
                        Ok::<usize, MapError>(universe.len())
                    })
                    .await;
                    match result {
                        Ok(Ok(files)) => {
                            debug!(files, "pre-index complete");
                            true
                        }
                        Ok(Err(err)) => {
                            warn!(%err, "pre-index failed");
                            false
                        }
                        Err(err) => {
                            warn!(%err, "pre-index task panicked");
                            false
                        }
                    }
                })
                .await;
            let _ = service.inner.preindex_tx.send(true);
        });
    }

    /// Wait for the pre-index completion signal.
    pub async fn pre_index_wait(&self, ctx: &Ctx) -> Result<(), MapError> {
        let mut rx = self.inner.preindex_rx.clone();
        loop {
            ctx.check()?;
            if *rx.borrow() {
                return Ok(());
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                _ = self.inner.shutdown.cancelled() => return Err(MapError::Canceled),
                _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {}
            }
        }
    }

    /// Schedule a background refresh under the service's own context.
    /// Duplicate in-flight refreshes for the same `(session, options)`
    /// collapse into one; failures are logged, never surfaced.
    pub fn refresh_async(&self, session: &str, opts: GenerateOptions) {
        let service = self.clone();
        let session = session.to_string();
        tokio::spawn(async move {
            let mode = service.effective_mode(&opts);
            let budget = service.resolve_budget(&opts);
            let cache_key = render_cache_key(mode, &opts, budget);
            let flight_key = format!(
                "{}:{}:{}",
                service.inner.repo_key,
                session,
                if cache_key.is_empty() { mode.label().to_string() } else { cache_key }
            );
            service
                .inner
                .refresh_flight
                .run(&flight_key, || async {
                    let service = service.clone();
                    let session = session.clone();
                    let opts = opts.clone();
                    let result = tokio::task::spawn_blocking(move || {
                        let ctx = Ctx::with_cancel(service.inner.shutdown.clone());
                        service.refresh(&ctx, &session, &opts)
                    })
                    .await;
                    match result {
                        Ok(Ok(_)) => true,
                        Ok(Err(err)) => {
                            warn!(%err, "background refresh failed");
                            false
                        }
                        Err(err) => {
                            warn!(%err, "background refresh panicked");
                            false
                        }
                    }
                })
                .await;
        });
    }

    /// Synchronous refresh: clear caches when forced, regenerate, and
    /// re-store the result under both caches.
    pub fn refresh(
        &self,
        ctx: &Ctx,
        session: &str,
        opts: &GenerateOptions,
    ) -> Result<MapOutput, MapError> {
        let mut opts = opts.clone();
        opts.session_id = session.to_string();
        if opts.force_refresh {
            self.inner.session_cache.clear(session);
            self.inner.render_cache.clear(session);
        }
        let output = self.generate(ctx, &opts)?;

        let mode = self.effective_mode(&opts);
        let budget = self.resolve_budget(&opts);
        let cache_key = render_cache_key(mode, &opts, budget);
        if output.is_empty() {
            self.inner.render_cache.remove(session, &cache_key);
        } else {
            let snapshot = MapSnapshot::new(output.text.clone(), output.token_count);
            self.inner.session_cache.store(session, snapshot.clone());
            self.inner.render_cache.store(session, &cache_key, snapshot);
        }
        Ok(output)
    }

    /// Generate the repository map for a session.
    pub fn generate(&self, ctx: &Ctx, opts: &GenerateOptions) -> Result<MapOutput, MapError> {
        if !self.available() || opts.session_id.is_empty() {
            return Ok(MapOutput::empty());
        }
        let ctx = ctx.child(&self.inner.shutdown);
        ctx.check()?;

        let session = opts.session_id.as_str();
        let mode = self.effective_mode(opts);
        let budget = self.resolve_budget(opts);
        let cache_key = render_cache_key(mode, opts, budget);

        // The disable latch serves cached results only, force refresh
        // included.
        if self.inner.latch.is_engaged(session) {
            debug!(session, "map generation disabled for session, serving cache");
            if let Some(snap) = self.load_non_empty(session) {
                return Ok(MapOutput { text: snap.map, token_count: snap.tokens });
            }
            if let Some(snap) = self.inner.render_cache.load(session, &cache_key) {
                self.inner.session_cache.store(session, snap.clone());
                return Ok(MapOutput { text: snap.map, token_count: snap.tokens });
            }
            return Ok(MapOutput::empty());
        }

        if opts.force_refresh {
            self.inner.session_cache.clear(session);
            self.inner.render_cache.clear(session);
        } else {
            // Fast paths per effective refresh mode.
            if let Some(snap) = self.load_non_empty(session) {
                return Ok(MapOutput { text: snap.map, token_count: snap.tokens });
            }
            match mode {
                RefreshMode::Files | RefreshMode::Auto => {
                    if let Some(snap) = self.inner.render_cache.load(session, &cache_key) {
                        // Rehydrate the last-good snapshot from the keyed
                        // entry.
                        self.inner.session_cache.store(session, snap.clone());
                        return Ok(MapOutput { text: snap.map, token_count: snap.tokens });
                    }
                }
                RefreshMode::Manual => return Ok(MapOutput::empty()),
                RefreshMode::Always => {}
            }
        }

        match self.run_pipeline(&ctx, opts, mode, budget, &cache_key) {
            Ok(output) => Ok(output),
            Err(err) if err.is_deadline() => {
                if opts.parity_mode {
                    warn!(session, "deadline inside generate, disabling session map");
                    self.inner.latch.engage(session);
                }
                Err(err)
            }
            Err(err) if err.is_cancellation() => Err(err),
            Err(MapError::Config(msg)) => Err(MapError::Config(msg)),
            Err(err) => {
                // Backend failures fall back to cached results; the original
                // error surfaces only when both fallbacks are empty.
                warn!(session, %err, "generate failed, falling back to caches");
                if let Some(snap) = self.load_non_empty(session) {
                    return Ok(MapOutput { text: snap.map, token_count: snap.tokens });
                }
                if let Some(snap) = self.inner.render_cache.load(session, &cache_key) {
                    return Ok(MapOutput { text: snap.map, token_count: snap.tokens });
                }
                Err(err)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

impl RepoMapService {
    fn load_non_empty(&self, session: &str) -> Option<MapSnapshot> {
        self.inner.session_cache.load(session).filter(|s| !s.is_empty())
    }

    /// Resolve the effective refresh mode: configured mode, with parity +
    /// prompt caching coercing `auto` to `files`.
    fn effective_mode(&self, opts: &GenerateOptions) -> RefreshMode {
        let mode = RefreshMode::parse(&self.inner.config.refresh_mode);
        if mode == RefreshMode::Auto && opts.parity_mode && opts.prompt_caching_enabled {
            RefreshMode::Files
        } else {
            mode
        }
    }

    /// Budget resolution: explicit option, configured maximum, then the
    /// dynamic window-derived default.
    fn resolve_budget(&self, opts: &GenerateOptions) -> usize {
        if opts.token_budget > 0 {
            return opts.token_budget;
        }
        if self.inner.config.max_tokens > 0 {
            return self.inner.config.max_tokens;
        }
        let window = opts.max_context_window;
        let mut budget = (window / 8).max(1024).min(4096);
        if opts.chat_files.is_empty() && self.inner.config.map_mul_no_files > 0.0 {
            budget = (budget as f64 * self.inner.config.map_mul_no_files) as usize;
        }
        budget
    }

    /// Bind the token counter: the explicit option wins, then the provider,
    /// unless the counter mode opts out. Deterministic mode overrides the
    /// estimate opt-out (reproducible counts need the real counter). Parity
    /// mode without a counter is a configuration error.
    fn bind_counter(&self, opts: &GenerateOptions) -> Result<Accountant, MapError> {
        let estimate_only = !opts.deterministic_mode
            && opts.token_counter_mode.trim().eq_ignore_ascii_case("estimate");
        let counter: Option<Arc<dyn TokenCounter>> = match &opts.token_counter {
            Some(c) => Some(c.clone()),
            None if estimate_only => None,
            None => self
                .inner
                .counters
                .as_ref()
                .and_then(|p| p.counter_for_model(&opts.model)),
        };
        if opts.parity_mode && counter.is_none() {
            return Err(MapError::Config(
                "parity mode requires a bound token counter".to_string(),
            ));
        }
        Ok(Accountant::new(counter, &opts.model, ""))
    }

    /// The parity file universe: VCS-tracked files when available, otherwise
    /// the chat-files set. User exclude globs still apply.
    fn parity_universe(
        &self,
        ctx: &Ctx,
        chat_files: &BTreeSet<String>,
    ) -> Result<Vec<String>, MapError> {
        let raw = match &self.inner.tracked {
            Some(tracked) => tracked.list(ctx)?,
            None => chat_files.iter().cloned().collect(),
        };
        let normalized = paths::normalize_file_universe(&self.inner.root, &raw);
        Ok(self.inner.walker.filter_universe(normalized))
    }

    fn run_pipeline(
        &self,
        ctx: &Ctx,
        opts: &GenerateOptions,
        mode: RefreshMode,
        budget: usize,
        cache_key: &str,
    ) -> Result<MapOutput, MapError> {
        let inner = &self.inner;
        let session = opts.session_id.as_str();
        let accountant = self.bind_counter(opts)?;

        let chat_files: BTreeSet<String> =
            paths::normalize_file_universe(&inner.root, &opts.chat_files).into_iter().collect();
        let mentioned_files: BTreeSet<String> =
            opts.mentioned_file_names.iter().cloned().collect();
        let mentioned_idents: BTreeSet<String> =
            opts.mentioned_identifiers.iter().cloned().collect();

        // File universe.
        let universe = if opts.parity_mode {
            self.parity_universe(ctx, &chat_files)?
        } else {
            inner.walker.files(ctx)?
        };

        // Tags, graph, ranking.
        let tags = inner.extractor.extract(
            ctx,
            &inner.root,
            &inner.repo_key,
            &universe,
            opts.force_refresh,
        )?;
        let graph = build_graph(&tags, &chat_files, &mentioned_idents);
        let pers = personalization(&graph.nodes, &chat_files, &mentioned_files, &mentioned_idents);
        let ranks = page_rank(&graph, pers.as_ref());
        let ranked_defs = distribute(&graph, &ranks);
        let ranked_files = aggregate(&ranked_defs, &tags);

        // Candidate entries and flat fit under the reduced budget.
        let entries = assemble(&ranked_defs, &graph.nodes, &universe, &chat_files, opts.parity_mode);
        let fit_mode = if opts.parity_mode { FitMode::Parity } else { FitMode::Enhancement };
        let reduced_budget = (budget / EXPANSION_FACTOR).max(1);
        let fitted = fit(ctx, &entries, fit_mode, reduced_budget, &accountant)?;

        // Scope-aware render plus the mandatory post-render trim.
        let tags_by_file: BTreeMap<String, Vec<Tag>> = {
            let mut map: BTreeMap<String, Vec<Tag>> = BTreeMap::new();
            for tag in &tags {
                map.entry(tag.rel_path.clone()).or_default().push(tag.clone());
            }
            map
        };
        let parser = inner.parser.as_deref();
        let renderer = Renderer::new(&inner.root, parser, &tags_by_file);

        let mut kept = fitted.entries;
        let mut text = renderer.render(ctx, &kept)?;
        let mut safety = accountant.safety_tokens(ctx, &text)?;
        if safety > budget {
            let mut best: (usize, String, usize) = (0, String::new(), 0);
            let mut lo = 0usize;
            let mut hi = kept.len();
            while lo < hi {
                let mid = (lo + hi + 1) / 2;
                let candidate = renderer.render(ctx, &kept[..mid])?;
                let tokens = accountant.safety_tokens(ctx, &candidate)?;
                if tokens <= budget {
                    best = (mid, candidate, tokens);
                    lo = mid;
                } else {
                    hi = mid - 1;
                }
            }
            debug!(
                from = kept.len(),
                to = best.0,
                "post-render trim reduced the entry count"
            );
            kept.truncate(best.0);
            text = best.1;
            safety = best.2;
        }

        let token_count = if opts.parity_mode {
            let parity = accountant.parity_tokens(ctx, &text)?;
            let delta = (parity as f64 - budget as f64).abs() / budget.max(1) as f64;
            if delta > COMPARATOR_TOLERANCE {
                warn!(session, parity, budget, "final map misses the parity comparator window");
            }
            parity
        } else {
            safety
        };

        // Store and persist.
        let output = MapOutput { text: text.clone(), token_count };
        if output.is_empty() {
            inner.render_cache.remove(session, cache_key);
            return Ok(output);
        }
        let snapshot = MapSnapshot::new(text, token_count);
        inner.session_cache.store(session, snapshot.clone());
        if mode != RefreshMode::Manual {
            inner.render_cache.store(session, cache_key, snapshot);
        }

        if let Some(q) = &inner.queries {
            let rankings: Vec<RankedPath> = ranked_files
                .iter()
                .map(|f| RankedPath { rel_path: f.path.clone(), rank: f.rank })
                .collect();
            let mut read_only: Vec<String> = kept.iter().map(|e| e.file.clone()).collect();
            read_only.sort();
            read_only.dedup();
            if let Err(err) = q
                .replace_session_rankings(&inner.repo_key, session, &rankings)
                .and_then(|_| {
                    q.replace_session_read_only_paths(&inner.repo_key, session, &read_only)
                })
            {
                warn!(session, %err, "failed to persist session rankings");
            }
        }

        debug!(
            session,
            files = universe.len(),
            entries = kept.len(),
            tokens = output.token_count,
            budget,
            mode = mode.label(),
            "map generated"
        );
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(config: MapConfig) -> RepoMapService {
        let dir = tempfile::tempdir().unwrap();
        let svc = ServiceBuilder::new(dir.path().to_str().unwrap(), config).build().unwrap();
        // Leak the tempdir so the root outlives the service in these tests.
        std::mem::forget(dir);
        svc
    }

    #[test]
    fn budget_resolution_order() {
        let mut config = MapConfig::default();
        config.max_tokens = 2000;
        let svc = service(config);

        let mut opts = GenerateOptions::default();
        opts.token_budget = 512;
        assert_eq!(svc.resolve_budget(&opts), 512);

        opts.token_budget = 0;
        assert_eq!(svc.resolve_budget(&opts), 2000);
    }

    #[test]
    fn dynamic_budget_is_clamped() {
        let svc = service(MapConfig::default());
        let mut opts = GenerateOptions::default();
        opts.chat_files = vec!["x.go".into()];

        opts.max_context_window = 0;
        assert_eq!(svc.resolve_budget(&opts), 1024);

        opts.max_context_window = 16_384;
        assert_eq!(svc.resolve_budget(&opts), 2048);

        opts.max_context_window = 1_000_000;
        assert_eq!(svc.resolve_budget(&opts), 4096);
    }

    #[test]
    fn no_chat_files_multiplier_applies() {
        let mut config = MapConfig::default();
        config.map_mul_no_files = 2.0;
        let svc = service(config);

        let mut opts = GenerateOptions::default();
        opts.max_context_window = 16_384;
        assert_eq!(svc.resolve_budget(&opts), 4096);

        opts.chat_files = vec!["x.go".into()];
        assert_eq!(svc.resolve_budget(&opts), 2048);
    }

    #[test]
    fn auto_coerces_to_files_under_parity_prompt_caching() {
        let svc = service(MapConfig::default());
        let mut opts = GenerateOptions::default();
        assert_eq!(svc.effective_mode(&opts), RefreshMode::Auto);

        opts.parity_mode = true;
        opts.prompt_caching_enabled = true;
        assert_eq!(svc.effective_mode(&opts), RefreshMode::Files);

        opts.prompt_caching_enabled = false;
        assert_eq!(svc.effective_mode(&opts), RefreshMode::Auto);
    }

    #[test]
    fn configured_mode_is_not_coerced() {
        let mut config = MapConfig::default();
        config.refresh_mode = "manual".to_string();
        let svc = service(config);
        let mut opts = GenerateOptions::default();
        opts.parity_mode = true;
        opts.prompt_caching_enabled = true;
        assert_eq!(svc.effective_mode(&opts), RefreshMode::Manual);
    }

    #[test]
    fn parity_without_counter_is_a_config_error() {
        let svc = service(MapConfig::default());
        let mut opts = GenerateOptions::default();
        opts.parity_mode = true;
        let err = svc.bind_counter(&opts).unwrap_err();
        assert!(matches!(err, MapError::Config(_)));
    }

    mod scenarios {
        use super::*;
        use crate::error::StoreError;
        use crate::store::{FileCacheRow, RankedPath, TagTransaction};

        fn build(config: MapConfig) -> (tempfile::TempDir, RepoMapService) {
            let dir = tempfile::tempdir().unwrap();
            let svc =
                ServiceBuilder::new(dir.path().to_str().unwrap(), config).build().unwrap();
            (dir, svc)
        }

        fn opts_for(session: &str) -> GenerateOptions {
            let mut opts = GenerateOptions::default();
            opts.session_id = session.to_string();
            opts.token_budget = 1024;
            opts
        }

        #[test]
        fn empty_session_id_returns_empty() {
            let (_dir, svc) = build(MapConfig::default());
            let out = svc.generate(&Ctx::background(), &GenerateOptions::default()).unwrap();
            assert_eq!(out, MapOutput::empty());
        }

        #[test]
        fn disabled_service_returns_empty() {
            let mut config = MapConfig::default();
            config.disabled = true;
            let (_dir, svc) = build(config);
            assert!(!svc.available());
            let out = svc.generate(&Ctx::background(), &opts_for("s")).unwrap();
            assert_eq!(out, MapOutput::empty());
        }

        #[test]
        fn empty_universe_without_database_is_empty_and_ok() {
            let (_dir, svc) = build(MapConfig::default());
            let out = svc.generate(&Ctx::background(), &opts_for("s")).unwrap();
            assert_eq!(out.text, "");
            assert_eq!(out.token_count, 0);
        }

        #[test]
        fn cached_last_good_takes_precedence_in_every_mode() {
            for mode in ["auto", "files", "manual", "always"] {
                let mut config = MapConfig::default();
                config.refresh_mode = mode.to_string();
                let (_dir, svc) = build(config);
                svc.inner.session_cache.store("s", MapSnapshot::new("M".into(), 42));

                let out = svc.generate(&Ctx::background(), &opts_for("s")).unwrap();
                assert_eq!(out.text, "M", "mode {mode}");
                assert_eq!(out.token_count, 42, "mode {mode}");
            }
        }

        #[test]
        fn render_cache_rehydrates_last_good() {
            let mut config = MapConfig::default();
            config.refresh_mode = "files".to_string();
            let (_dir, svc) = build(config);

            let opts = opts_for("s");
            let key = render_cache_key(RefreshMode::Files, &opts, 1024);
            svc.inner.render_cache.store("s", &key, MapSnapshot::new("C".into(), 11));

            let out = svc.generate(&Ctx::background(), &opts).unwrap();
            assert_eq!(out.text, "C");
            assert_eq!(out.token_count, 11);
            assert_eq!(svc.last_good_map("s"), "C");
            assert_eq!(svc.last_token_count("s"), 11);
        }

        #[test]
        fn manual_mode_never_regenerates_cold() {
            let mut config = MapConfig::default();
            config.refresh_mode = "manual".to_string();
            let (_dir, svc) = build(config);
            let opts = opts_for("s");
            let key = render_cache_key(RefreshMode::Manual, &opts, 1024);
            svc.inner.render_cache.store("s", &key, MapSnapshot::new("C".into(), 11));

            // Manual serves last-good only; the render cache is not consulted.
            let out = svc.generate(&Ctx::background(), &opts).unwrap();
            assert_eq!(out, MapOutput::empty());
        }

        #[test]
        fn force_refresh_invalidates_both_caches() {
            let (_dir, svc) = build(MapConfig::default());
            let mut opts = opts_for("s");
            let key = render_cache_key(RefreshMode::Auto, &opts, 1024);
            svc.inner.session_cache.store("s", MapSnapshot::new("M".into(), 9));
            svc.inner.render_cache.store("s", &key, MapSnapshot::new("M".into(), 9));

            opts.force_refresh = true;
            let out = svc.generate(&Ctx::background(), &opts).unwrap();
            assert_eq!(out, MapOutput::empty());
            assert!(svc.inner.session_cache.load("s").is_none());
            assert!(svc.inner.render_cache.load("s", &key).is_none());
        }

        // --- latch discipline ---

        struct DeadlineTracked;
        impl TrackedFiles for DeadlineTracked {
            fn list(&self, _ctx: &Ctx) -> Result<Vec<String>, MapError> {
                Err(MapError::DeadlineExceeded)
            }
        }

        struct FixedCounter;
        impl TokenCounter for FixedCounter {
            fn count(&self, _ctx: &Ctx, _model: &str, _text: &str) -> Result<usize, MapError> {
                Ok(7)
            }
            fn name(&self) -> &str {
                "fixed"
            }
        }

        fn parity_opts(session: &str) -> GenerateOptions {
            let mut opts = opts_for(session);
            opts.parity_mode = true;
            opts.token_counter = Some(Arc::new(FixedCounter));
            opts
        }

        fn latch_service() -> (tempfile::TempDir, RepoMapService) {
            let dir = tempfile::tempdir().unwrap();
            let svc = ServiceBuilder::new(dir.path().to_str().unwrap(), MapConfig::default())
                .tracked_files(Arc::new(DeadlineTracked))
                .build()
                .unwrap();
            (dir, svc)
        }

        #[test]
        fn parity_deadline_engages_the_latch() {
            let (_dir, svc) = latch_service();
            let err = svc.generate(&Ctx::background(), &parity_opts("s")).unwrap_err();
            assert!(err.is_deadline());
            assert!(svc.inner.latch.is_engaged("s"));
        }

        #[test]
        fn latched_session_serves_cache_even_under_force_refresh() {
            let (_dir, svc) = latch_service();
            let _ = svc.generate(&Ctx::background(), &parity_opts("s"));
            assert!(svc.inner.latch.is_engaged("s"));

            svc.inner.session_cache.store("s", MapSnapshot::new("M".into(), 42));
            let mut opts = parity_opts("s");
            opts.force_refresh = true;
            let out = svc.generate(&Ctx::background(), &opts).unwrap();
            assert_eq!(out.text, "M");
            assert_eq!(out.token_count, 42);
            // The latch path never cleared the caches.
            assert_eq!(svc.last_good_map("s"), "M");
        }

        #[test]
        fn enhancement_deadline_is_transient() {
            let (_dir, svc) = latch_service();
            let mut opts = opts_for("s");
            opts.parity_mode = false;
            // The tracked-files stub is not consulted outside parity mode, so
            // trip the deadline at the context level instead.
            let ctx = Ctx::with_deadline(std::time::Instant::now());
            let err = svc.generate(&ctx, &opts).unwrap_err();
            assert!(err.is_deadline());
            assert!(!svc.inner.latch.is_engaged("s"));
        }

        #[test]
        fn cancellation_never_engages_the_latch() {
            let (_dir, svc) = latch_service();
            let token = CancellationToken::new();
            token.cancel();
            let err =
                svc.generate(&Ctx::with_cancel(token), &parity_opts("s")).unwrap_err();
            assert!(matches!(err, MapError::Canceled));
            assert!(!svc.inner.latch.is_engaged("s"));
        }

        #[test]
        fn reset_clears_the_latch_and_caches() {
            let (_dir, svc) = latch_service();
            let _ = svc.generate(&Ctx::background(), &parity_opts("s"));
            svc.inner.session_cache.store("s", MapSnapshot::new("M".into(), 1));
            assert!(svc.inner.latch.is_engaged("s"));

            svc.reset(&Ctx::background(), "s").unwrap();
            assert!(!svc.inner.latch.is_engaged("s"));
            assert_eq!(svc.last_good_map("s"), "");
            // The injection guard was cleared too.
            assert!(svc.should_inject("s", &RunKey::new("m1", 0)));
        }

        // --- backend failures ---

        struct FailingQueries;
        impl Queries for FailingQueries {
            fn list_file_cache(&self, _repo_key: &str) -> Result<Vec<FileCacheRow>, StoreError> {
                Err(StoreError::new("disk detached"))
            }
            fn tag_transaction<'a>(
                &'a self,
                _repo_key: &str,
            ) -> Result<Box<dyn TagTransaction + 'a>, StoreError> {
                Err(StoreError::new("disk detached"))
            }
            fn replace_session_rankings(
                &self,
                _repo_key: &str,
                _session_id: &str,
                _rows: &[RankedPath],
            ) -> Result<(), StoreError> {
                Err(StoreError::new("disk detached"))
            }
            fn replace_session_read_only_paths(
                &self,
                _repo_key: &str,
                _session_id: &str,
                _paths: &[String],
            ) -> Result<(), StoreError> {
                Err(StoreError::new("disk detached"))
            }
            fn list_session_read_only_paths(
                &self,
                _repo_key: &str,
                _session_id: &str,
            ) -> Result<Vec<String>, StoreError> {
                Err(StoreError::new("disk detached"))
            }
            fn clear_session(
                &self,
                _repo_key: &str,
                _session_id: &str,
            ) -> Result<(), StoreError> {
                Err(StoreError::new("disk detached"))
            }
        }

        #[test]
        fn backend_errors_name_the_action() {
            let dir = tempfile::tempdir().unwrap();
            let svc = ServiceBuilder::new(dir.path().to_str().unwrap(), MapConfig::default())
                .queries(Arc::new(FailingQueries))
                .build()
                .unwrap();
            let err = svc.generate(&Ctx::background(), &opts_for("s")).unwrap_err();
            assert!(err.to_string().starts_with("list repo-map file cache:"), "{err}");
            assert!(!svc.inner.latch.is_engaged("s"));
        }

        #[test]
        fn render_cache_serves_when_last_good_is_empty() {
            let dir = tempfile::tempdir().unwrap();
            let svc = ServiceBuilder::new(dir.path().to_str().unwrap(), MapConfig::default())
                .queries(Arc::new(FailingQueries))
                .build()
                .unwrap();
            // An empty last-good snapshot does not shadow the keyed entry.
            let opts = opts_for("s");
            let key = render_cache_key(RefreshMode::Auto, &opts, 1024);
            svc.inner.session_cache.store("s", MapSnapshot::default());
            svc.inner.render_cache.store("s", &key, MapSnapshot::new("C".into(), 3));

            let out = svc.generate(&Ctx::background(), &opts).unwrap();
            assert_eq!(out.text, "C");
        }
    }
}
