//! The stage-0 special-file set.
//!
//! A static list of well-known root-scoped filenames (VCS, CI, editor,
//! lockfiles, build tools, docs, infra) plus a dynamic exception for CI
//! workflow definitions under `.github/workflows/`. Sub-directory occurrences
//! of root-scoped names (`src/README.md`) do not match.

/// Well-known root files. Matched against the whole relative path, so only
/// root-level occurrences qualify.
pub const ROOT_SPECIAL_FILES: &[&str] = &[
    // VCS and repo metadata
    ".gitignore",
    ".gitattributes",
    ".gitmodules",
    ".mailmap",
    ".authors",
    "AUTHORS",
    "CONTRIBUTORS",
    "COPYING",
    "COPYRIGHT",
    "LICENSE",
    "LICENSE.md",
    "LICENSE.txt",
    "LICENSE-APACHE",
    "LICENSE-MIT",
    "NOTICE",
    "PATENTS",
    // Docs
    "README",
    "README.md",
    "README.rst",
    "README.txt",
    "CHANGELOG",
    "CHANGELOG.md",
    "CHANGES",
    "CHANGES.md",
    "HISTORY.md",
    "NEWS",
    "NEWS.md",
    "RELEASE_NOTES.md",
    "CONTRIBUTING",
    "CONTRIBUTING.md",
    "CODE_OF_CONDUCT.md",
    "SECURITY.md",
    "SUPPORT.md",
    "GOVERNANCE.md",
    "MAINTAINERS",
    "MAINTAINERS.md",
    "ROADMAP.md",
    "TODO",
    "TODO.md",
    "FAQ.md",
    "INSTALL",
    "INSTALL.md",
    "USAGE.md",
    "API.md",
    "ARCHITECTURE.md",
    "DESIGN.md",
    "STYLE.md",
    "TESTING.md",
    "CITATION.cff",
    // CI / automation
    ".travis.yml",
    ".gitlab-ci.yml",
    "appveyor.yml",
    "azure-pipelines.yml",
    "Jenkinsfile",
    ".drone.yml",
    "bitbucket-pipelines.yml",
    "cloudbuild.yaml",
    "codecov.yml",
    ".codecov.yml",
    ".coveragerc",
    "renovate.json",
    ".renovaterc",
    "dependabot.yml",
    ".pre-commit-config.yaml",
    "commitlint.config.js",
    // Editors / formatting
    ".editorconfig",
    ".dir-locals.el",
    ".prettierrc",
    ".prettierrc.json",
    ".prettierrc.yaml",
    ".prettierignore",
    ".eslintrc",
    ".eslintrc.js",
    ".eslintrc.json",
    ".eslintignore",
    ".stylelintrc",
    ".flake8",
    ".pylintrc",
    ".rubocop.yml",
    "rustfmt.toml",
    ".rustfmt.toml",
    "clippy.toml",
    ".clang-format",
    ".clang-tidy",
    ".golangci.yml",
    ".shellcheckrc",
    // Environment / tooling
    ".env",
    ".env.example",
    ".envrc",
    ".tool-versions",
    ".nvmrc",
    ".node-version",
    ".python-version",
    ".ruby-version",
    ".terraform-version",
    ".dockerignore",
    ".npmignore",
    ".npmrc",
    ".yarnrc",
    ".yarnrc.yml",
    // Build systems and manifests
    "Makefile",
    "makefile",
    "GNUmakefile",
    "CMakeLists.txt",
    "configure",
    "configure.ac",
    "Makefile.am",
    "meson.build",
    "BUILD",
    "BUILD.bazel",
    "WORKSPACE",
    "SConstruct",
    "justfile",
    "Taskfile.yml",
    "Rakefile",
    "Gemfile",
    "Gemfile.lock",
    "build.gradle",
    "build.gradle.kts",
    "settings.gradle",
    "settings.gradle.kts",
    "pom.xml",
    "build.sbt",
    "Cargo.toml",
    "Cargo.lock",
    "go.mod",
    "go.sum",
    "go.work",
    "package.json",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "pnpm-workspace.yaml",
    "lerna.json",
    "tsconfig.json",
    "jsconfig.json",
    "webpack.config.js",
    "rollup.config.js",
    "vite.config.js",
    "vite.config.ts",
    "babel.config.js",
    ".babelrc",
    "jest.config.js",
    "vitest.config.ts",
    "pyproject.toml",
    "setup.py",
    "setup.cfg",
    "requirements.txt",
    "requirements-dev.txt",
    "Pipfile",
    "Pipfile.lock",
    "poetry.lock",
    "uv.lock",
    "tox.ini",
    "pytest.ini",
    "manage.py",
    "mix.exs",
    "mix.lock",
    "composer.json",
    "composer.lock",
    "deno.json",
    "bun.lockb",
    // Infra
    "Dockerfile",
    "docker-compose.yml",
    "docker-compose.yaml",
    "compose.yaml",
    "Vagrantfile",
    "Procfile",
    "fly.toml",
    "netlify.toml",
    "vercel.json",
    "serverless.yml",
    "main.tf",
    "variables.tf",
    "outputs.tf",
    "terraform.tfvars",
    "Chart.yaml",
    "values.yaml",
    "skaffold.yaml",
    "kustomization.yaml",
];

/// True iff `rel_path` is a stage-0 special file: a root-scoped known name
/// (no `/` in the path), or a workflow definition
/// `.github/workflows/<name>.yml|yaml`.
pub fn is_special_file(rel_path: &str) -> bool {
    if !rel_path.contains('/') {
        return ROOT_SPECIAL_FILES.contains(&rel_path);
    }
    if let Some(rest) = rel_path.strip_prefix(".github/workflows/") {
        return !rest.contains('/') && (rest.ends_with(".yml") || rest.ends_with(".yaml"));
    }
    false
}
