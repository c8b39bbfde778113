//! # tapdeploy
//!
//! Atomic release deployment for a PHP (Composer) backend and an npm-built
//! frontend replicated across many markets.
//!
//! Every market gets the same release: dependencies are installed into the
//! market's own checkout, the frontend is built into
//! `<frontend>/<market>/dist/<version>`, and the `dist/production` pointer is
//! swapped to that directory with a single rename. A failure in one market
//! never prevents the others from being deployed.
//!
//! ## Pipeline
//!
//! 1. [`plan::build_plan`] resolves [`types::DeploymentPaths`] for every
//!    configured market and derives a deterministic run id.
//! 2. [`engine::run_deploy`] drives each market through
//!    `INSTALLING -> PUBLISHING -> VERIFYING -> DONE` (or `FAILED`),
//!    sequentially or in waves of parallel workers.
//! 3. [`state::write_receipt`] persists the run receipt; the event log under
//!    the state directory records every step as it happens.
//!
//! ## Example
//!
//! ```ignore
//! use std::path::Path;
//! use tapdeploy::{cancel::CancelToken, config::{CliOverrides, DeployConfig}, engine};
//!
//! let cfg = DeployConfig::load_from_dir(Path::new("."))?.unwrap_or_default();
//! let opts = cfg.build_run_options(Path::new("."), CliOverrides::default())?;
//! let receipt = engine::run_deploy(&opts, &mut reporter, &CancelToken::with_sentinel(&opts.state_dir))?;
//! println!("{}", receipt.result);
//! ```

/// Cooperative cancellation and the abort sentinel.
pub mod cancel;

/// Configuration file (`.tapdeploy.toml`) loading and merging.
/// Re-exported from tapdeploy-config microcrate.
pub use tapdeploy_config as config;

/// Market runner: install, publish and verify per market.
pub mod engine;

/// Wave-based parallel market runner.
mod engine_parallel;

/// Environment fingerprinting (hostname, OS, tool versions).
pub mod environment;

/// Step failure taxonomy.
pub mod error;

/// Append-only JSONL event log.
/// Re-exported from tapdeploy-events microcrate.
pub use tapdeploy_events as events;

/// Composer and npm installs and the frontend build.
pub mod install;

/// Run lock and cache-root locks.
/// Re-exported from tapdeploy-lock microcrate.
pub use tapdeploy_lock as lock;

/// Deterministic per-market path layout.
pub mod paths;

/// Market list and run id.
pub mod plan;

/// External command execution with timeouts.
/// Re-exported from tapdeploy-process microcrate.
pub use tapdeploy_process as process;

/// Host preparation: packages, checkouts, services, disk space.
pub mod provision;

/// Version directory, placeholder fallback and the pointer swap.
pub mod publish;

/// Receipt persistence and the abort request file.
pub mod state;

/// Ordered fallback strategies for external commands.
pub mod strategy;

/// Domain types: markets, paths, outcomes, receipts, events.
/// Re-exported from tapdeploy-types microcrate.
pub use tapdeploy_types as types;

/// Post-publication health checks.
pub mod verify;

/// Property-based tests for path and publish invariants.
#[cfg(test)]
mod property_tests;

/// Stress tests for concurrent pointer swaps and parallel runs.
#[cfg(test)]
mod stress_tests;
