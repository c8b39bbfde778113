//! Configuration file support for tapdeploy (`.tapdeploy.toml`).
//!
//! The file describes the static input of a run: which markets to deploy,
//! the release label, base paths, cache roots and the external programs to
//! call. [`DeployConfig::build_run_options`] merges it with CLI flags and
//! the environment into a fully resolved [`RunOptions`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use tapdeploy_types::{Market, ReleaseVersion, deserialize_duration, serialize_duration};

/// Default config file name, looked up in the project root.
pub const CONFIG_FILE: &str = ".tapdeploy.toml";

/// Environment variable that overrides `release.version`.
pub const RELEASE_ENV: &str = "TAPDEPLOY_RELEASE";

const GIB: u64 = 1024 * 1024 * 1024;

/// What to do when the backend has no `composer.lock`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockFilePolicy {
    /// Fail the market before any install runs.
    #[default]
    Fatal,
    /// Record a degradation and let Composer resolve dependencies.
    Warn,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReleaseConfig {
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_backend_base")]
    pub backend_base: PathBuf,

    #[serde(default = "default_frontend_base")]
    pub frontend_base: PathBuf,

    /// Where receipts, events and the run lock live
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            backend_base: default_backend_base(),
            frontend_base: default_frontend_base(),
            state_dir: default_state_dir(),
        }
    }
}

/// Shared dependency caches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Composer cache root (default: `{state_dir}/cache/composer`)
    #[serde(default)]
    pub backend: Option<PathBuf>,

    /// npm cache root (default: `{state_dir}/cache/npm`)
    #[serde(default)]
    pub frontend: Option<PathBuf>,

    /// Give every market its own subdirectory under each cache root
    #[serde(default = "default_true")]
    pub per_market: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: None,
            frontend: None,
            per_market: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_composer")]
    pub composer: String,

    #[serde(default)]
    pub lock_file_policy: LockFilePolicy,

    /// Arguments for the preferred install strategy
    #[serde(default = "default_composer_install_args")]
    pub install_args: Vec<String>,

    /// Arguments for the single alternate attempt
    #[serde(default = "default_composer_alternate_args")]
    pub alternate_args: Vec<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            composer: default_composer(),
            lock_file_policy: LockFilePolicy::default(),
            install_args: default_composer_install_args(),
            alternate_args: default_composer_alternate_args(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontendConfig {
    #[serde(default = "default_npm")]
    pub npm: String,

    /// Memory budget for the build, in bytes
    #[serde(default = "default_memory_limit")]
    pub memory_limit: u64,

    /// Frozen install (`npm ci`)
    #[serde(default = "default_frozen_install_args")]
    pub frozen_install_args: Vec<String>,

    /// Resolving install used when the frozen one fails
    #[serde(default = "default_resolving_install_args")]
    pub resolving_install_args: Vec<String>,

    #[serde(default = "default_build_args")]
    pub build_args: Vec<String>,

    #[serde(default = "default_alternate_build_args")]
    pub alternate_build_args: Vec<String>,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            npm: default_npm(),
            memory_limit: default_memory_limit(),
            frozen_install_args: default_frozen_install_args(),
            resolving_install_args: default_resolving_install_args(),
            build_args: default_build_args(),
            alternate_build_args: default_alternate_build_args(),
        }
    }
}

/// Upper bounds for external commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_install_timeout"
    )]
    pub install: Duration,

    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_build_timeout"
    )]
    pub build: Duration,

    /// Service probes and package queries
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_probe_timeout"
    )]
    pub probe: Duration,

    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_checkout_timeout"
    )]
    pub checkout: Duration,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            install: default_install_timeout(),
            build: default_build_timeout(),
            probe: default_probe_timeout(),
            checkout: default_checkout_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyConfig {
    /// Services that must report `active` after a deploy
    #[serde(default = "default_services")]
    pub services: Vec<String>,

    #[serde(default = "default_systemctl")]
    pub systemctl: String,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            services: default_services(),
            systemctl: default_systemctl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionConfig {
    #[serde(default = "default_package_manager")]
    pub package_manager: String,

    #[serde(default = "default_package_query")]
    pub package_query: String,

    #[serde(default = "default_packages")]
    pub packages: Vec<String>,

    /// Services to start and enable
    #[serde(default = "default_services")]
    pub services: Vec<String>,

    /// Minimum free space on the base paths, in bytes (0 disables the check)
    #[serde(default = "default_min_free_space")]
    pub min_free_space: u64,

    #[serde(default = "default_df")]
    pub df: String,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            package_manager: default_package_manager(),
            package_query: default_package_query(),
            packages: default_packages(),
            services: default_services(),
            min_free_space: default_min_free_space(),
            df: default_df(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_git")]
    pub program: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            program: default_git(),
        }
    }
}

/// Source checkout for one market
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoConfig {
    #[serde(default)]
    pub backend_remote: Option<String>,

    #[serde(default)]
    pub frontend_remote: Option<String>,

    #[serde(default = "default_branch")]
    pub branch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_concurrent: default_max_concurrent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Locks older than this are considered stale
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_lock_timeout"
    )]
    pub timeout: Duration,

    /// How long a market waits for a shared cache root
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_cache_wait"
    )]
    pub cache_wait: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout: default_lock_timeout(),
            cache_wait: default_cache_wait(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Output lines kept as evidence per command
    #[serde(default = "default_output_lines")]
    pub lines: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            lines: default_output_lines(),
        }
    }
}

/// Configuration loaded from `.tapdeploy.toml`
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeployConfig {
    /// Market codes in deployment order
    #[serde(default)]
    pub markets: Vec<String>,

    #[serde(default)]
    pub release: ReleaseConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub frontend: FrontendConfig,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    #[serde(default)]
    pub verify: VerifyConfig,

    #[serde(default)]
    pub provision: ProvisionConfig,

    #[serde(default)]
    pub git: GitConfig,

    /// Optional per-market source checkouts, keyed by market code
    #[serde(default)]
    pub repos: BTreeMap<String, RepoConfig>,

    #[serde(default)]
    pub parallel: ParallelConfig,

    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub output: OutputConfig,
}

fn default_true() -> bool {
    true
}

fn default_backend_base() -> PathBuf {
    PathBuf::from("/var/www/backend")
}

fn default_frontend_base() -> PathBuf {
    PathBuf::from("/var/www/frontend")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".tapdeploy")
}

fn default_composer() -> String {
    "composer".to_string()
}

fn default_npm() -> String {
    "npm".to_string()
}

fn default_git() -> String {
    "git".to_string()
}

fn default_systemctl() -> String {
    "systemctl".to_string()
}

fn default_df() -> String {
    "df".to_string()
}

fn default_package_manager() -> String {
    "apt-get".to_string()
}

fn default_package_query() -> String {
    "dpkg-query".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn default_composer_install_args() -> Vec<String> {
    strings(&[
        "install",
        "--no-dev",
        "--prefer-dist",
        "--no-interaction",
        "--optimize-autoloader",
    ])
}

fn default_composer_alternate_args() -> Vec<String> {
    strings(&["install", "--no-dev", "--prefer-source", "--no-interaction"])
}

fn default_frozen_install_args() -> Vec<String> {
    strings(&["ci", "--no-audit", "--no-fund"])
}

fn default_resolving_install_args() -> Vec<String> {
    strings(&["install", "--no-audit", "--no-fund"])
}

fn default_build_args() -> Vec<String> {
    strings(&["run", "build"])
}

fn default_alternate_build_args() -> Vec<String> {
    strings(&["run", "production"])
}

fn default_services() -> Vec<String> {
    strings(&["apache2", "php-fpm"])
}

fn default_packages() -> Vec<String> {
    strings(&["git", "apache2", "php-fpm", "composer", "nodejs", "npm"])
}

fn default_memory_limit() -> u64 {
    4 * GIB
}

fn default_min_free_space() -> u64 {
    2 * GIB
}

fn default_install_timeout() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_build_timeout() -> Duration {
    Duration::from_secs(20 * 60)
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_checkout_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_max_concurrent() -> usize {
    4
}

fn default_lock_timeout() -> Duration {
    Duration::from_secs(3600) // 1 hour
}

fn default_cache_wait() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_output_lines() -> usize {
    50
}

/// CLI overrides for merging with config file values.
///
/// `Option` fields mean "user did not pass this flag" when `None`.
/// `bool` fields mean "user explicitly enabled this" when `true`.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub version: Option<String>,
    /// Restrict the run to these markets (configured order is kept)
    pub markets: Vec<String>,
    pub state_dir: Option<PathBuf>,
    pub parallel: bool,
    pub max_concurrent: Option<usize>,
}

/// Fully resolved settings for one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub version: ReleaseVersion,
    pub markets: Vec<Market>,
    pub backend_base: PathBuf,
    pub frontend_base: PathBuf,
    pub state_dir: PathBuf,
    pub backend_cache: PathBuf,
    pub frontend_cache: PathBuf,
    pub per_market_cache: bool,
    pub backend: BackendConfig,
    pub frontend: FrontendConfig,
    pub timeouts: TimeoutsConfig,
    pub verify: VerifyConfig,
    pub provision: ProvisionConfig,
    pub git: GitConfig,
    pub repos: BTreeMap<Market, RepoConfig>,
    pub parallel: ParallelConfig,
    pub lock_timeout: Duration,
    pub cache_wait: Duration,
    pub output_lines: usize,
}

impl DeployConfig {
    /// Load configuration from `dir/.tapdeploy.toml`.
    ///
    /// Returns `Ok(None)` if no config file exists.
    pub fn load_from_dir(dir: &Path) -> Result<Option<Self>> {
        let config_path = dir.join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(None);
        }
        Self::load_from_file(&config_path).map(Some)
    }

    /// Load configuration from a specific file path
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: DeployConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.markets.is_empty() {
            bail!("markets must list at least one market");
        }

        let mut seen = BTreeSet::new();
        for code in &self.markets {
            Market::parse(code).map_err(anyhow::Error::new)?;
            if !seen.insert(code.as_str()) {
                bail!("duplicate market {code:?} in markets");
            }
        }

        if let Some(version) = &self.release.version {
            ReleaseVersion::parse(version).map_err(anyhow::Error::new)?;
        }

        if self.paths.backend_base.as_os_str().is_empty() {
            bail!("paths.backend_base cannot be empty");
        }
        if self.paths.frontend_base.as_os_str().is_empty() {
            bail!("paths.frontend_base cannot be empty");
        }
        if self.paths.state_dir.as_os_str().is_empty() {
            bail!("paths.state_dir cannot be empty");
        }
        if self.paths.backend_base == self.paths.frontend_base {
            bail!("paths.backend_base and paths.frontend_base must differ");
        }

        if self.backend.composer.trim().is_empty() {
            bail!("backend.composer cannot be empty");
        }
        if self.backend.install_args.is_empty() {
            bail!("backend.install_args cannot be empty");
        }
        if self.frontend.npm.trim().is_empty() {
            bail!("frontend.npm cannot be empty");
        }
        if self.frontend.memory_limit == 0 {
            bail!("frontend.memory_limit must be greater than 0");
        }
        if self.frontend.build_args.is_empty() {
            bail!("frontend.build_args cannot be empty");
        }

        for (name, timeout) in [
            ("timeouts.install", self.timeouts.install),
            ("timeouts.build", self.timeouts.build),
            ("timeouts.probe", self.timeouts.probe),
            ("timeouts.checkout", self.timeouts.checkout),
            ("lock.timeout", self.lock.timeout),
        ] {
            if timeout.is_zero() {
                bail!("{name} must be greater than 0");
            }
        }

        if self.output.lines == 0 {
            bail!("output.lines must be greater than 0");
        }

        if self.parallel.max_concurrent == 0 {
            bail!("parallel.max_concurrent must be greater than 0");
        }

        for (code, repo) in &self.repos {
            if !self.markets.contains(code) {
                bail!("repos.{code} does not match any configured market");
            }
            if repo.branch.trim().is_empty() {
                bail!("repos.{code}.branch cannot be empty");
            }
        }

        Ok(())
    }

    /// State directory resolved against `project_root`, with an optional
    /// CLI override. Usable without a release version.
    pub fn state_dir(&self, project_root: &Path, cli_state_dir: Option<&Path>) -> PathBuf {
        let dir = cli_state_dir.unwrap_or(&self.paths.state_dir);
        resolve_against(project_root, dir)
    }

    /// Build `RunOptions` by merging CLI overrides with config file values.
    ///
    /// The release version comes from the CLI, then `TAPDEPLOY_RELEASE`, then
    /// `release.version`. Relative paths are resolved against `project_root`.
    pub fn build_run_options(&self, project_root: &Path, cli: CliOverrides) -> Result<RunOptions> {
        self.validate()?;

        let env_version = std::env::var(RELEASE_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty());
        let raw_version = cli
            .version
            .or(env_version)
            .or_else(|| self.release.version.clone())
            .with_context(|| {
                format!("no release version: set release.version, {RELEASE_ENV} or --release")
            })?;
        let version = ReleaseVersion::parse(&raw_version).map_err(anyhow::Error::new)?;

        let configured: Vec<Market> = self
            .markets
            .iter()
            .map(|m| Market::parse(m).map_err(anyhow::Error::new))
            .collect::<Result<_>>()?;

        let markets = if cli.markets.is_empty() {
            configured
        } else {
            for wanted in &cli.markets {
                if !self.markets.contains(wanted) {
                    bail!("market {wanted:?} is not configured");
                }
            }
            configured
                .into_iter()
                .filter(|m| cli.markets.iter().any(|w| w == m.as_str()))
                .collect()
        };

        let state_dir = self.state_dir(project_root, cli.state_dir.as_deref());
        let backend_cache = self
            .cache
            .backend
            .as_deref()
            .map(|p| resolve_against(project_root, p))
            .unwrap_or_else(|| state_dir.join("cache").join("composer"));
        let frontend_cache = self
            .cache
            .frontend
            .as_deref()
            .map(|p| resolve_against(project_root, p))
            .unwrap_or_else(|| state_dir.join("cache").join("npm"));

        let mut repos = BTreeMap::new();
        for (code, repo) in &self.repos {
            let market = Market::parse(code).map_err(anyhow::Error::new)?;
            repos.insert(market, repo.clone());
        }

        let max_concurrent = cli.max_concurrent.unwrap_or(self.parallel.max_concurrent);
        if max_concurrent == 0 {
            bail!("--max-concurrent must be greater than 0");
        }

        Ok(RunOptions {
            version,
            markets,
            backend_base: resolve_against(project_root, &self.paths.backend_base),
            frontend_base: resolve_against(project_root, &self.paths.frontend_base),
            state_dir,
            backend_cache,
            frontend_cache,
            per_market_cache: self.cache.per_market,
            backend: self.backend.clone(),
            frontend: self.frontend.clone(),
            timeouts: self.timeouts.clone(),
            verify: self.verify.clone(),
            provision: self.provision.clone(),
            git: self.git.clone(),
            repos,
            parallel: ParallelConfig {
                enabled: cli.parallel || self.parallel.enabled,
                max_concurrent,
            },
            lock_timeout: self.lock.timeout,
            cache_wait: self.lock.cache_wait,
            output_lines: self.output.lines,
        })
    }

    /// Generate a default configuration file content as TOML string
    pub fn default_toml_template() -> String {
        r#"# tapdeploy configuration file
# Place this file in the project root as .tapdeploy.toml

# Markets in deployment order
markets = ["pl", "uk"]

[release]
# Release label shared by every market (overridden by TAPDEPLOY_RELEASE or --release)
version = "20240724"

[paths]
backend_base = "/var/www/backend"
frontend_base = "/var/www/frontend"
# Receipts, events and the run lock (relative to the project root)
state_dir = ".tapdeploy"

[cache]
# Shared dependency caches (default: <state_dir>/cache/composer and <state_dir>/cache/npm)
# backend = "/var/cache/tapdeploy/composer"
# frontend = "/var/cache/tapdeploy/npm"
# One subdirectory per market; when false, parallel runs lock each cache root
per_market = true

[backend]
composer = "composer"
# What to do without composer.lock: fatal (skip the market) or warn
lock_file_policy = "fatal"
install_args = ["install", "--no-dev", "--prefer-dist", "--no-interaction", "--optimize-autoloader"]
alternate_args = ["install", "--no-dev", "--prefer-source", "--no-interaction"]

[frontend]
npm = "npm"
# Build memory budget in bytes (4 GiB)
memory_limit = 4294967296
frozen_install_args = ["ci", "--no-audit", "--no-fund"]
resolving_install_args = ["install", "--no-audit", "--no-fund"]
build_args = ["run", "build"]
alternate_build_args = ["run", "production"]

[timeouts]
install = "15m"
build = "20m"
probe = "30s"
checkout = "5m"

[verify]
services = ["apache2", "php-fpm"]
systemctl = "systemctl"

[provision]
package_manager = "apt-get"
package_query = "dpkg-query"
packages = ["git", "apache2", "php-fpm", "composer", "nodejs", "npm"]
services = ["apache2", "php-fpm"]
# Minimum free space on the base paths in bytes (0 disables the check)
min_free_space = 2147483648

[git]
program = "git"

# Optional source checkout per market
# [repos.pl]
# backend_remote = "git@example.com:shop/backend.git"
# frontend_remote = "git@example.com:shop/frontend.git"
# branch = "main"

[parallel]
# Deploy several markets at once
enabled = false
max_concurrent = 4

[lock]
# Lock files older than this are considered stale
timeout = "1h"
# How long a market waits for a shared cache root
cache_wait = "30m"

[output]
# Output lines kept as evidence per command
lines = 50
"#
        .to_string()
    }
}

fn resolve_against(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serial_test::serial;
    use tempfile::tempdir;

    use super::*;

    fn minimal() -> DeployConfig {
        DeployConfig::parse(
            r#"
markets = ["pl", "uk", "gr"]

[release]
version = "20240724"
"#,
        )
        .expect("parse")
    }

    #[test]
    fn parses_full_config() {
        let toml = r#"
markets = ["pl", "uk"]

[release]
version = "20240724"

[paths]
backend_base = "/srv/backend"
frontend_base = "/srv/frontend"
state_dir = "/srv/state"

[cache]
backend = "/srv/cache/composer"
per_market = false

[backend]
lock_file_policy = "warn"
composer = "/usr/local/bin/composer"

[frontend]
memory_limit = 2147483648
build_args = ["run", "build:prod"]

[timeouts]
install = "5m"
probe = "2s"

[verify]
services = ["nginx"]

[repos.pl]
backend_remote = "git@example.com:shop/backend.git"

[parallel]
enabled = true
max_concurrent = 2

[lock]
timeout = "30m"

[output]
lines = 10
"#;

        let config = DeployConfig::parse(toml).expect("parse");
        assert_eq!(config.markets, vec!["pl", "uk"]);
        assert_eq!(config.release.version.as_deref(), Some("20240724"));
        assert_eq!(config.paths.backend_base, PathBuf::from("/srv/backend"));
        assert_eq!(config.paths.state_dir, PathBuf::from("/srv/state"));
        assert_eq!(
            config.cache.backend,
            Some(PathBuf::from("/srv/cache/composer"))
        );
        assert!(config.cache.frontend.is_none());
        assert!(!config.cache.per_market);
        assert_eq!(config.backend.lock_file_policy, LockFilePolicy::Warn);
        assert_eq!(config.backend.composer, "/usr/local/bin/composer");
        assert_eq!(config.frontend.memory_limit, 2 * GIB);
        assert_eq!(config.frontend.build_args, vec!["run", "build:prod"]);
        assert_eq!(config.frontend.npm, "npm");
        assert_eq!(config.timeouts.install, Duration::from_secs(300));
        assert_eq!(config.timeouts.probe, Duration::from_secs(2));
        assert_eq!(config.timeouts.build, Duration::from_secs(1200));
        assert_eq!(config.verify.services, vec!["nginx"]);
        assert_eq!(config.repos["pl"].branch, "main");
        assert!(config.parallel.enabled);
        assert_eq!(config.parallel.max_concurrent, 2);
        assert_eq!(config.lock.timeout, Duration::from_secs(1800));
        assert_eq!(config.output.lines, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_sections_use_defaults() {
        let config = minimal();
        assert_eq!(config.paths.state_dir, PathBuf::from(".tapdeploy"));
        assert!(config.cache.per_market);
        assert_eq!(config.backend.lock_file_policy, LockFilePolicy::Fatal);
        assert_eq!(config.backend.install_args[0], "install");
        assert_eq!(config.frontend.frozen_install_args[0], "ci");
        assert_eq!(config.frontend.resolving_install_args[0], "install");
        assert_eq!(config.frontend.memory_limit, 4 * GIB);
        assert_eq!(config.lock.timeout, Duration::from_secs(3600));
        assert_eq!(config.output.lines, 50);
        assert!(!config.parallel.enabled);
        assert_eq!(config.parallel.max_concurrent, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unknown_lock_file_policy_is_rejected() {
        let err = DeployConfig::parse(
            r#"
markets = ["pl"]
[backend]
lock_file_policy = "ignore"
"#,
        )
        .expect_err("must fail");
        assert!(format!("{err:#}").contains("ignore"));
    }

    #[test]
    fn invalid_duration_is_rejected() {
        assert!(DeployConfig::parse("[timeouts]\ninstall = \"soon\"\n").is_err());
    }

    #[test]
    fn validate_rejects_empty_market_list() {
        let config = DeployConfig::default();
        let err = config.validate().expect_err("must fail");
        assert!(err.to_string().contains("at least one market"));
    }

    #[test]
    fn validate_rejects_duplicate_markets() {
        let mut config = minimal();
        config.markets.push("pl".to_string());
        let err = config.validate().expect_err("must fail");
        assert!(err.to_string().contains("duplicate market"));
    }

    #[test]
    fn validate_rejects_invalid_market_code() {
        let mut config = minimal();
        config.markets.push("../etc".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_release_version() {
        let mut config = minimal();
        config.release.version = Some("production".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_values() {
        let mut config = minimal();
        config.output.lines = 0;
        assert!(
            config
                .validate()
                .expect_err("lines")
                .to_string()
                .contains("output.lines")
        );

        let mut config = minimal();
        config.parallel.max_concurrent = 0;
        assert!(config.validate().is_err());

        let mut config = minimal();
        config.timeouts.probe = Duration::ZERO;
        assert!(
            config
                .validate()
                .expect_err("probe")
                .to_string()
                .contains("timeouts.probe")
        );

        let mut config = minimal();
        config.frontend.memory_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_shared_base_paths() {
        let mut config = minimal();
        config.paths.frontend_base = config.paths.backend_base.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_repo_for_unknown_market() {
        let mut config = minimal();
        config.repos.insert(
            "de".to_string(),
            RepoConfig {
                backend_remote: None,
                frontend_remote: None,
                branch: "main".to_string(),
            },
        );
        let err = config.validate().expect_err("must fail");
        assert!(err.to_string().contains("repos.de"));
    }

    #[test]
    fn load_from_dir_returns_none_without_file() {
        let td = tempdir().expect("tempdir");
        assert!(
            DeployConfig::load_from_dir(td.path())
                .expect("load")
                .is_none()
        );
    }

    #[test]
    fn load_from_file_reports_path_on_parse_error() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join(CONFIG_FILE);
        std::fs::write(&path, "markets = [").expect("write");

        let err = DeployConfig::load_from_file(&path).expect_err("must fail");
        assert!(format!("{err:#}").contains("Failed to parse config file"));
    }

    #[test]
    fn default_template_parses_and_validates() {
        let config =
            DeployConfig::parse(&DeployConfig::default_toml_template()).expect("template parses");
        config.validate().expect("template validates");
        assert_eq!(config.markets, vec!["pl", "uk"]);
        assert_eq!(config.frontend.memory_limit, 4 * GIB);
        assert_eq!(config.provision.min_free_space, 2 * GIB);
    }

    #[test]
    #[serial]
    fn file_version_used_without_overrides() {
        temp_env::with_var_unset(RELEASE_ENV, || {
            let opts = minimal()
                .build_run_options(Path::new("/project"), CliOverrides::default())
                .expect("options");
            assert_eq!(opts.version.as_str(), "20240724");
        });
    }

    #[test]
    #[serial]
    fn env_version_overrides_file() {
        temp_env::with_var(RELEASE_ENV, Some("20250101"), || {
            let opts = minimal()
                .build_run_options(Path::new("/project"), CliOverrides::default())
                .expect("options");
            assert_eq!(opts.version.as_str(), "20250101");
        });
    }

    #[test]
    #[serial]
    fn cli_version_overrides_env_and_file() {
        temp_env::with_var(RELEASE_ENV, Some("20250101"), || {
            let cli = CliOverrides {
                version: Some("20260202".to_string()),
                ..CliOverrides::default()
            };
            let opts = minimal()
                .build_run_options(Path::new("/project"), cli)
                .expect("options");
            assert_eq!(opts.version.as_str(), "20260202");
        });
    }

    #[test]
    #[serial]
    fn missing_version_is_a_config_error() {
        temp_env::with_var_unset(RELEASE_ENV, || {
            let mut config = minimal();
            config.release.version = None;
            let err = config
                .build_run_options(Path::new("/project"), CliOverrides::default())
                .expect_err("must fail");
            assert!(err.to_string().contains("no release version"));
        });
    }

    #[test]
    #[serial]
    fn market_filter_keeps_configured_order() {
        temp_env::with_var_unset(RELEASE_ENV, || {
            let cli = CliOverrides {
                markets: vec!["gr".to_string(), "pl".to_string()],
                ..CliOverrides::default()
            };
            let opts = minimal()
                .build_run_options(Path::new("/project"), cli)
                .expect("options");
            let codes: Vec<&str> = opts.markets.iter().map(Market::as_str).collect();
            assert_eq!(codes, vec!["pl", "gr"]);
        });
    }

    #[test]
    #[serial]
    fn market_filter_rejects_unknown_market() {
        temp_env::with_var_unset(RELEASE_ENV, || {
            let cli = CliOverrides {
                markets: vec!["de".to_string()],
                ..CliOverrides::default()
            };
            let err = minimal()
                .build_run_options(Path::new("/project"), cli)
                .expect_err("must fail");
            assert!(err.to_string().contains("not configured"));
        });
    }

    #[test]
    #[serial]
    fn relative_paths_resolve_against_project_root() {
        temp_env::with_var_unset(RELEASE_ENV, || {
            let mut config = minimal();
            config.paths.backend_base = PathBuf::from("www/backend");
            config.paths.frontend_base = PathBuf::from("/abs/frontend");

            let opts = config
                .build_run_options(Path::new("/project"), CliOverrides::default())
                .expect("options");
            assert_eq!(opts.backend_base, PathBuf::from("/project/www/backend"));
            assert_eq!(opts.frontend_base, PathBuf::from("/abs/frontend"));
            assert_eq!(opts.state_dir, PathBuf::from("/project/.tapdeploy"));
            assert_eq!(
                opts.backend_cache,
                PathBuf::from("/project/.tapdeploy/cache/composer")
            );
            assert_eq!(
                opts.frontend_cache,
                PathBuf::from("/project/.tapdeploy/cache/npm")
            );
        });
    }

    #[test]
    #[serial]
    fn cli_flags_merge_with_parallel_section() {
        temp_env::with_var_unset(RELEASE_ENV, || {
            let cli = CliOverrides {
                parallel: true,
                max_concurrent: Some(2),
                state_dir: Some(PathBuf::from("/tmp/state")),
                ..CliOverrides::default()
            };
            let opts = minimal()
                .build_run_options(Path::new("/project"), cli)
                .expect("options");
            assert!(opts.parallel.enabled);
            assert_eq!(opts.parallel.max_concurrent, 2);
            assert_eq!(opts.state_dir, PathBuf::from("/tmp/state"));
        });
    }

    #[test]
    #[serial]
    fn cli_zero_concurrency_is_rejected() {
        temp_env::with_var_unset(RELEASE_ENV, || {
            let cli = CliOverrides {
                max_concurrent: Some(0),
                ..CliOverrides::default()
            };
            assert!(
                minimal()
                    .build_run_options(Path::new("/project"), cli)
                    .is_err()
            );
        });
    }

    proptest! {
        #[test]
        fn any_valid_unique_market_list_validates(
            codes in proptest::collection::btree_set("[a-z][a-z0-9_-]{0,7}", 1..8)
        ) {
            let mut config = minimal();
            config.markets = codes.into_iter().collect();
            prop_assert!(config.validate().is_ok());
        }
    }
}
