//! Dependency installs and the frontend build.
//!
//! Each step is an ordered strategy list (see [`crate::strategy`]). Backend
//! installs run Composer with `COMPOSER_CACHE_DIR` pointing at the market's
//! cache directory; frontend installs run npm with `--cache`. The build runs
//! with a bounded Node heap and writes into the release directory given by
//! `TAPDEPLOY_OUTPUT_DIR`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use tapdeploy_config::{BackendConfig, FrontendConfig, LockFilePolicy, RunOptions};
use tapdeploy_process::CommandRequest;
use tapdeploy_types::{
    BACKEND_LOCK_FILE, BuildResult, FRONTEND_LOCK_FILE, InstallResult, InstallTarget,
    ReleaseVersion, StepOutcome, StrategyAttempt,
};

use crate::error::DeployError;
use crate::publish::{clear_dir, dir_has_entries, is_placeholder};
use crate::strategy::{Strategy, run_strategies};

/// Environment variable that tells the build where to write its output.
pub const OUTPUT_DIR_ENV: &str = "TAPDEPLOY_OUTPUT_DIR";
/// Environment variable carrying the release label into the build.
pub const RELEASE_ENV: &str = "TAPDEPLOY_RELEASE";

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct DependencyInstaller {
    backend: BackendConfig,
    frontend: FrontendConfig,
    install_timeout: Duration,
    build_timeout: Duration,
    output_lines: usize,
}

impl DependencyInstaller {
    pub fn from_options(opts: &RunOptions) -> Self {
        Self {
            backend: opts.backend.clone(),
            frontend: opts.frontend.clone(),
            install_timeout: opts.timeouts.install,
            build_timeout: opts.timeouts.build,
            output_lines: opts.output_lines,
        }
    }

    /// Install Composer dependencies in `path`.
    ///
    /// Without `composer.lock` this fails with [`DeployError::MissingLockFile`]
    /// under the default policy. Install failures are reported in the
    /// returned outcome, not as an error.
    pub fn install_backend_deps(
        &self,
        path: &Path,
        cache_dir: &Path,
        on_attempt: impl FnMut(&StrategyAttempt),
    ) -> Result<InstallResult, DeployError> {
        let lock_file = path.join(BACKEND_LOCK_FILE);
        let lock_missing = !lock_file.is_file();
        if lock_missing && self.backend.lock_file_policy == LockFilePolicy::Fatal {
            return Err(DeployError::MissingLockFile { path: lock_file });
        }

        let (used_cache, cache_note) = prepare_cache(cache_dir);

        let request = |args: &[String]| {
            CommandRequest::new(&self.backend.composer, args.iter().cloned())
                .in_dir(path)
                .env("COMPOSER_CACHE_DIR", cache_dir.to_string_lossy())
                .with_timeout(self.install_timeout)
        };
        let mut strategies = vec![Strategy::new(
            "composer install",
            request(&self.backend.install_args),
        )];
        if !self.backend.alternate_args.is_empty() {
            strategies.push(Strategy::new(
                "composer install (alternate)",
                request(&self.backend.alternate_args),
            ));
        }

        let mut chain = run_strategies(&strategies, self.output_lines, on_attempt);
        if lock_missing {
            chain.degrade(format!(
                "{BACKEND_LOCK_FILE} missing; dependencies resolved without a lock file"
            ));
        }
        if let Some(note) = cache_note {
            chain.degrade(note);
        }

        Ok(InstallResult {
            target: InstallTarget::Backend,
            strategy: chain.selected,
            outcome: chain.outcome,
            used_cache,
            cache_dir: cache_dir.to_path_buf(),
            duration_ms: chain.duration_ms,
            attempts: chain.attempts,
        })
    }

    /// Install npm dependencies in `path`: `npm ci` first, `npm install` when
    /// the frozen install is unavailable (no `package-lock.json`) or fails.
    pub fn install_frontend_deps(
        &self,
        path: &Path,
        cache_dir: &Path,
        on_attempt: impl FnMut(&StrategyAttempt),
    ) -> InstallResult {
        let frozen_available = path.join(FRONTEND_LOCK_FILE).is_file();
        let (used_cache, cache_note) = prepare_cache(cache_dir);

        let request = |args: &[String]| {
            let mut args = args.to_vec();
            args.push("--cache".to_string());
            args.push(cache_dir.to_string_lossy().into_owned());
            CommandRequest::new(&self.frontend.npm, args)
                .in_dir(path)
                .with_timeout(self.install_timeout)
        };

        let mut strategies = Vec::with_capacity(2);
        if frozen_available {
            strategies.push(Strategy::new(
                "npm ci",
                request(&self.frontend.frozen_install_args),
            ));
        }
        strategies.push(Strategy::new(
            "npm install",
            request(&self.frontend.resolving_install_args),
        ));

        let mut chain = run_strategies(&strategies, self.output_lines, on_attempt);
        if !frozen_available {
            chain.degrade(format!(
                "{FRONTEND_LOCK_FILE} missing; frozen install unavailable"
            ));
        }
        if let Some(note) = cache_note {
            chain.degrade(note);
        }

        InstallResult {
            target: InstallTarget::Frontend,
            strategy: chain.selected,
            outcome: chain.outcome,
            used_cache,
            cache_dir: cache_dir.to_path_buf(),
            duration_ms: chain.duration_ms,
            attempts: chain.attempts,
        }
    }

    /// Build the frontend in `path` into `output_dir` with a bounded heap.
    ///
    /// Placeholder assets left by an earlier run of the same version are
    /// removed first. On failure one alternate build command runs. If both
    /// fail and the output directory was empty beforehand, partial output is
    /// removed so the publisher falls back to placeholder assets; when that
    /// removal fails the error is returned as [`DeployError::PublishIo`].
    pub fn build_frontend(
        &self,
        path: &Path,
        output_dir: &Path,
        version: &ReleaseVersion,
        memory_limit_bytes: u64,
        on_attempt: impl FnMut(&StrategyAttempt),
    ) -> Result<BuildResult, DeployError> {
        if let Err(err) = fs::create_dir_all(output_dir) {
            return Ok(BuildResult {
                strategy: None,
                outcome: StepOutcome::Failed {
                    reason: format!("cannot create {}: {err}", output_dir.display()),
                },
                memory_limit_bytes,
                duration_ms: 0,
                attempts: vec![],
            });
        }
        if is_placeholder(output_dir) {
            clear_dir(output_dir).map_err(|e| DeployError::publish_io(output_dir, e))?;
        }
        let had_output = dir_has_entries(output_dir);

        let request = |args: &[String]| {
            CommandRequest::new(&self.frontend.npm, args.iter().cloned())
                .in_dir(path)
                .env("NODE_OPTIONS", node_options(memory_limit_bytes))
                .env(OUTPUT_DIR_ENV, output_dir.to_string_lossy())
                .env(RELEASE_ENV, version.as_str())
                .with_timeout(self.build_timeout)
        };
        let mut strategies = vec![Strategy::new("build", request(&self.frontend.build_args))];
        if !self.frontend.alternate_build_args.is_empty() {
            strategies.push(Strategy::new(
                "alternate build",
                request(&self.frontend.alternate_build_args),
            ));
        }

        let chain = run_strategies(&strategies, self.output_lines, on_attempt);
        if chain.outcome.is_failure() && !had_output {
            // A failed build must not be published as if it were complete.
            clear_dir(output_dir).map_err(|e| DeployError::publish_io(output_dir, e))?;
        }

        Ok(BuildResult {
            strategy: chain.selected,
            outcome: chain.outcome,
            memory_limit_bytes,
            duration_ms: chain.duration_ms,
            attempts: chain.attempts,
        })
    }
}

/// `NODE_OPTIONS` value for a heap limit given in bytes.
pub fn node_options(memory_limit_bytes: u64) -> String {
    let mb = (memory_limit_bytes / MIB).max(1);
    format!("--max-old-space-size={mb}")
}

/// Ensure the cache directory exists. Returns whether it already held
/// entries, plus a degradation note when it could not be created.
fn prepare_cache(cache_dir: &Path) -> (bool, Option<String>) {
    let used_cache = dir_has_entries(cache_dir);
    match fs::create_dir_all(cache_dir) {
        Ok(()) => (used_cache, None),
        Err(err) => (
            false,
            Some(format!(
                "cache directory {} unavailable: {err}",
                cache_dir.display()
            )),
        ),
    }
}
