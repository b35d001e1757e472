//! Test harness for the end-to-end generate tests.
//!
//! Builds a [`RepoMapService`] over fixture files copied into a temp dir,
//! backed by the in-memory queries implementation and the tree-sitter
//! parser. No subprocess, no real database.

pub mod fixtures;

use std::path::PathBuf;
use std::sync::Arc;

use repomap_engine::parser::TreeSitterParser;
use repomap_engine::store::MemoryQueries;
use repomap_engine::{GenerateOptions, MapConfig, RepoMapService, ServiceBuilder};
use tempfile::TempDir;

pub struct TestHarness {
    pub service: RepoMapService,
    pub queries: Arc<MemoryQueries>,
    pub root: PathBuf,
    _temp_dir: TempDir,
}

impl TestHarness {
    /// Create a harness from a named fixture directory.
    pub fn from_fixture(name: &str) -> Self {
        Self::from_fixture_with(name, MapConfig::default())
    }

    pub fn from_fixture_with(name: &str, config: MapConfig) -> Self {
        let fixture_src = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests/fixtures")
            .join(name);
        assert!(
            fixture_src.exists(),
            "fixture '{name}' not found at {}",
            fixture_src.display()
        );

        let temp_dir = TempDir::new().expect("create temp dir");
        fixtures::copy_dir_recursive(&fixture_src, temp_dir.path());
        Self::over_dir(temp_dir, config)
    }

    /// A harness over an empty repository with no database at all.
    pub fn empty_without_db() -> Self {
        let temp_dir = TempDir::new().expect("create temp dir");
        let root = temp_dir.path().to_path_buf();
        let service = ServiceBuilder::new(root.to_str().unwrap(), MapConfig::default())
            .parser(Arc::new(TreeSitterParser::new()))
            .build()
            .expect("build service");
        TestHarness {
            service,
            queries: Arc::new(MemoryQueries::new()),
            root,
            _temp_dir: temp_dir,
        }
    }

    fn over_dir(temp_dir: TempDir, config: MapConfig) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().with_env_filter("debug").try_init();
        let root = temp_dir.path().to_path_buf();
        let queries = Arc::new(MemoryQueries::new());
        let service = ServiceBuilder::new(root.to_str().unwrap(), config)
            .queries(queries.clone())
            .parser(Arc::new(TreeSitterParser::new()))
            .build()
            .expect("build service");
        TestHarness { service, queries, root, _temp_dir: temp_dir }
    }

    /// Options for a plain generate call with a generous budget.
    pub fn opts(session: &str) -> GenerateOptions {
        let mut opts = GenerateOptions::default();
        opts.session_id = session.to_string();
        opts.token_budget = 4096;
        opts
    }
}
