//! Market runner: drives every configured market through
//! `PENDING -> INSTALLING -> PUBLISHING -> VERIFYING -> DONE`.
//!
//! A market that hits a market-fatal error ends in `FAILED` and the run moves
//! on to the next market. Recoverable errors are recorded as degradations.
//! Only infrastructure errors of the run itself (state directory, run lock,
//! event log) abort [`run_deploy`].

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use tapdeploy_config::RunOptions;
use tapdeploy_events::{EventLog, events_path};
use tapdeploy_lock::LockFile;
use tapdeploy_types::{
    BuildResult, DeployEvent, DeploymentPaths, EventType, InstallResult, InstallTarget, Market,
    MarketFailure, MarketHealth, MarketPhase, MarketReceipt, PublishResult, RunReceipt, RunResult,
    StepOutcome, StrategyAttempt, VerificationReport,
};

use crate::cancel::CancelToken;
use crate::engine_parallel;
use crate::environment::collect_environment_fingerprint;
use crate::error::{DeployError, Fatality};
use crate::install::DependencyInstaller;
use crate::paths::cache_dir_for;
use crate::plan::{RunPlan, build_plan};
use crate::provision::{CheckoutOutcome, check_disk_space, ensure_checkout};
use crate::publish::publish;
use crate::state;
use crate::verify::HealthVerifier;

/// Market label used for run-level events.
pub const RUN_EVENT_LABEL: &str = "all";

pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Info,
    Warn,
    Error,
}

/// Reporter that keeps messages until they can be replayed in order.
///
/// Parallel workers each get one, and the runner replays them into the real
/// reporter in market order once the worker is joined.
#[derive(Debug, Default)]
pub struct BufferedReporter {
    messages: Vec<(Level, String)>,
}

impl BufferedReporter {
    pub fn replay(&self, reporter: &mut dyn Reporter) {
        for (level, msg) in &self.messages {
            match level {
                Level::Info => reporter.info(msg),
                Level::Warn => reporter.warn(msg),
                Level::Error => reporter.error(msg),
            }
        }
    }
}

impl Reporter for BufferedReporter {
    fn info(&mut self, msg: &str) {
        self.messages.push((Level::Info, msg.to_string()));
    }

    fn warn(&mut self, msg: &str) {
        self.messages.push((Level::Warn, msg.to_string()));
    }

    fn error(&mut self, msg: &str) {
        self.messages.push((Level::Error, msg.to_string()));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Event log shared by every worker of a run.
pub(crate) struct EventSink {
    path: PathBuf,
    log: Mutex<EventLog>,
}

impl EventSink {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            log: Mutex::new(EventLog::new()),
        }
    }

    pub(crate) fn record(&self, market: &str, event_type: EventType) {
        lock(&self.log).record(DeployEvent::now(market, event_type));
    }

    pub(crate) fn flush(&self) -> Result<()> {
        lock(&self.log).flush_to(&self.path)
    }
}

/// In-process guards for shared cache roots. Combined with a lock file in
/// the cache root when markets share a cache directory.
#[derive(Default)]
struct CacheLocks {
    backend: Mutex<()>,
    frontend: Mutex<()>,
}

pub(crate) struct RunContext<'a> {
    pub(crate) opts: &'a RunOptions,
    installer: DependencyInstaller,
    verifier: HealthVerifier,
    pub(crate) events: &'a EventSink,
    pub(crate) cancel: &'a CancelToken,
    cache_locks: CacheLocks,
}

impl RunContext<'_> {
    /// Run `f` with the cache directory for `target`, holding the cache-root
    /// locks when markets share one directory.
    fn with_cache<T>(
        &self,
        target: InstallTarget,
        market: &Market,
        f: impl FnOnce(&Path) -> T,
    ) -> std::result::Result<T, String> {
        let (root, guard) = match target {
            InstallTarget::Backend => (&self.opts.backend_cache, &self.cache_locks.backend),
            InstallTarget::Frontend => (&self.opts.frontend_cache, &self.cache_locks.frontend),
        };
        if self.opts.per_market_cache {
            return Ok(f(&cache_dir_for(root, market, true)));
        }

        let _in_process = lock(guard);
        let _file = LockFile::acquire_cache(
            root,
            &format!("cache:{target}"),
            self.opts.cache_wait,
            self.opts.lock_timeout,
        )
        .map_err(|e| format!("{e:#}"))?;
        Ok(f(root))
    }
}

/// Deploy every market in `opts` and write the run receipt.
pub fn run_deploy(
    opts: &RunOptions,
    reporter: &mut dyn Reporter,
    cancel: &CancelToken,
) -> Result<RunReceipt> {
    let state_dir = &opts.state_dir;
    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("failed to create state dir {}", state_dir.display()))?;

    let lock = LockFile::acquire_with_timeout(state_dir, opts.lock_timeout)
        .context("another deploy appears to be running")?;

    if state::abort_requested(state_dir) {
        reporter.warn("removing abort request left over from an earlier run");
        state::clear_abort(state_dir)?;
    }

    let plan = build_plan(opts);
    lock.set_run_id(&plan.run_id)?;

    let run_started = Utc::now();
    let environment = collect_environment_fingerprint(opts);
    let events = EventSink::new(events_path(state_dir));

    reporter.info(&format!(
        "run {}: deploying {} to {} market(s)",
        short_id(&plan.run_id),
        plan.version,
        plan.markets.len()
    ));
    events.record(
        RUN_EVENT_LABEL,
        EventType::RunStarted {
            run_id: plan.run_id.clone(),
            version: plan.version.to_string(),
            market_count: plan.markets.len(),
        },
    );
    events.flush()?;

    if check_disk_space(opts, reporter).iter().any(|d| !d.ok) {
        reporter.warn("free space check did not pass; continuing");
    }

    let ctx = RunContext {
        opts,
        installer: DependencyInstaller::from_options(opts),
        verifier: HealthVerifier::from_options(opts),
        events: &events,
        cancel,
        cache_locks: CacheLocks::default(),
    };

    let (receipts, not_started) = if opts.parallel.enabled && plan.markets.len() > 1 {
        engine_parallel::run_markets_parallel(&ctx, &plan, reporter)?
    } else {
        run_markets_sequential(&ctx, &plan, reporter)?
    };

    if !not_started.is_empty() {
        reporter.warn(&format!(
            "run cancelled: {} market(s) not started",
            not_started.len()
        ));
        events.record(
            RUN_EVENT_LABEL,
            EventType::RunCancelled {
                remaining: not_started.len(),
            },
        );
    }

    let result = if not_started.is_empty() {
        RunResult::from_health(receipts.iter().map(|r| &r.health))
    } else {
        RunResult::PartialFailure
    };
    events.record(RUN_EVENT_LABEL, EventType::RunFinished { result });
    events.flush()?;

    let receipt = RunReceipt {
        receipt_version: state::CURRENT_RECEIPT_VERSION.to_string(),
        run_id: plan.run_id.clone(),
        version: plan.version.clone(),
        started_at: run_started,
        finished_at: Utc::now(),
        result,
        not_started,
        markets: receipts,
        event_log_path: events_path(state_dir),
        environment,
    };
    state::write_receipt(state_dir, &receipt)?;

    if cancel.is_cancelled() {
        state::clear_abort(state_dir)?;
    }
    drop(lock);

    Ok(receipt)
}

fn run_markets_sequential(
    ctx: &RunContext<'_>,
    plan: &RunPlan,
    reporter: &mut dyn Reporter,
) -> Result<(Vec<MarketReceipt>, Vec<Market>)> {
    let mut receipts = Vec::with_capacity(plan.markets.len());
    let mut not_started = Vec::new();

    for (index, paths) in plan.markets.iter().enumerate() {
        if ctx.cancel.is_cancelled() {
            not_started.extend(plan.markets[index..].iter().map(|p| p.market.clone()));
            break;
        }
        receipts.push(deploy_market(ctx, paths, reporter));
        ctx.events.flush()?;
    }

    Ok((receipts, not_started))
}

/// Per-market progress through the state machine.
struct MarketRun<'a> {
    ctx: &'a RunContext<'a>,
    paths: &'a DeploymentPaths,
    label: String,
    phase: MarketPhase,
    installs: Vec<InstallResult>,
    build: Option<BuildResult>,
    publish: Option<PublishResult>,
    verification: Option<VerificationReport>,
    failure: Option<MarketFailure>,
    degradations: Vec<String>,
}

impl<'a> MarketRun<'a> {
    fn new(ctx: &'a RunContext<'a>, paths: &'a DeploymentPaths) -> Self {
        Self {
            ctx,
            paths,
            label: paths.market.to_string(),
            phase: MarketPhase::Pending,
            installs: Vec::new(),
            build: None,
            publish: None,
            verification: None,
            failure: None,
            degradations: Vec::new(),
        }
    }

    fn advance(&mut self, next: MarketPhase) {
        debug_assert!(
            self.phase.can_transition_to(next),
            "invalid transition {} -> {}",
            self.phase,
            next
        );
        self.ctx.events.record(
            &self.label,
            EventType::PhaseChanged {
                from: self.phase,
                to: next,
            },
        );
        self.phase = next;
    }

    /// Apply the error's fatality: market-fatal errors are returned, the
    /// rest are recorded and swallowed.
    fn absorb(&mut self, err: DeployError, reporter: &mut dyn Reporter) -> Result<(), DeployError> {
        match err.fatality() {
            Fatality::Market => Err(err),
            Fatality::Recoverable => {
                reporter.warn(&format!("{}: {err}", self.label));
                self.ctx.events.record(
                    &self.label,
                    EventType::StepDegraded {
                        step: err.kind().to_string(),
                        reason: err.to_string(),
                    },
                );
                self.degradations.push(format!("{}: {err}", err.kind()));
                Ok(())
            }
            Fatality::Never => {
                reporter.warn(&format!("{}: {err}", self.label));
                self.degradations.push(format!("{}: {err}", err.kind()));
                Ok(())
            }
        }
    }

    fn note_degraded(&mut self, step: &str, outcome: &StepOutcome, reporter: &mut dyn Reporter) {
        if let StepOutcome::Degraded { reason } = outcome {
            reporter.warn(&format!("{}: {step} degraded: {reason}", self.label));
            self.ctx.events.record(
                &self.label,
                EventType::StepDegraded {
                    step: step.to_string(),
                    reason: reason.clone(),
                },
            );
            self.degradations.push(format!("{step}: {reason}"));
        }
    }

    fn fail(&mut self, err: DeployError, reporter: &mut dyn Reporter) {
        reporter.error(&format!("{}: {} failed: {err}", self.label, self.phase));
        self.ctx.events.record(
            &self.label,
            EventType::MarketFailed {
                kind: err.kind(),
                message: err.to_string(),
            },
        );
        self.failure = Some(MarketFailure {
            phase: self.phase,
            kind: err.kind(),
            message: err.to_string(),
        });
        self.advance(MarketPhase::Failed);
    }

    fn attempt_recorder(&self, step: &'static str) -> impl FnMut(&StrategyAttempt) + use<'a> {
        let events = self.ctx.events;
        let label = self.label.clone();
        move |attempt: &StrategyAttempt| {
            events.record(
                &label,
                EventType::StrategyAttempted {
                    step: step.to_string(),
                    attempt: attempt.clone(),
                },
            );
        }
    }

    fn install(&mut self, reporter: &mut dyn Reporter) -> Result<(), DeployError> {
        let ctx = self.ctx;
        let paths = self.paths;
        let market = &paths.market;

        if let Some(repo) = ctx.opts.repos.get(market) {
            let sources = [
                (&paths.backend_dir, repo.backend_remote.as_deref()),
                (&paths.frontend_dir, repo.frontend_remote.as_deref()),
            ];
            for (dir, remote) in sources {
                let Some(remote) = remote else { continue };
                match ensure_checkout(
                    &ctx.opts.git.program,
                    dir,
                    remote,
                    &repo.branch,
                    ctx.opts.timeouts.checkout,
                ) {
                    CheckoutOutcome::Clean => {
                        reporter.info(&format!("{}: {} is up to date", self.label, dir.display()))
                    }
                    CheckoutOutcome::Updated => {
                        reporter.info(&format!("{}: updated {}", self.label, dir.display()))
                    }
                    CheckoutOutcome::Failed { reason } => {
                        return Err(DeployError::Checkout {
                            path: dir.clone(),
                            reason,
                        });
                    }
                }
            }
        }

        reporter.info(&format!("{}: installing backend dependencies...", self.label));
        let record = self.attempt_recorder("backend install");
        let backend = ctx
            .with_cache(InstallTarget::Backend, market, |cache| {
                ctx.installer
                    .install_backend_deps(&paths.backend_dir, cache, record)
            })
            .unwrap_or_else(|reason| {
                Ok(cache_unavailable(
                    InstallTarget::Backend,
                    &ctx.opts.backend_cache,
                    reason,
                ))
            })?;
        self.record_install(backend, reporter)?;

        reporter.info(&format!("{}: installing frontend dependencies...", self.label));
        let record = self.attempt_recorder("frontend install");
        let frontend = ctx
            .with_cache(InstallTarget::Frontend, market, |cache| {
                ctx.installer
                    .install_frontend_deps(&paths.frontend_dir, cache, record)
            })
            .unwrap_or_else(|reason| {
                cache_unavailable(InstallTarget::Frontend, &ctx.opts.frontend_cache, reason)
            });
        let frontend_ok = !frontend.outcome.is_failure();
        self.record_install(frontend, reporter)?;

        let build = if frontend_ok {
            reporter.info(&format!("{}: building frontend...", self.label));
            ctx.installer.build_frontend(
                &paths.frontend_dir,
                &paths.version_dir,
                &ctx.opts.version,
                ctx.opts.frontend.memory_limit,
                self.attempt_recorder("build"),
            )?
        } else {
            BuildResult {
                strategy: None,
                outcome: StepOutcome::Failed {
                    reason: "skipped: frontend dependencies not installed".to_string(),
                },
                memory_limit_bytes: ctx.opts.frontend.memory_limit,
                duration_ms: 0,
                attempts: vec![],
            }
        };
        let outcome = build.outcome.clone();
        let timed_out = build.attempts.last().map(|a| a.timed_out).unwrap_or(false);
        self.build = Some(build);
        match outcome {
            StepOutcome::Failed { reason } => {
                let err = if timed_out {
                    DeployError::Timeout {
                        step: "frontend build".to_string(),
                        after: ctx.opts.timeouts.build,
                    }
                } else {
                    DeployError::BuildFailed { reason }
                };
                self.absorb(err, reporter)?;
            }
            other => self.note_degraded("build", &other, reporter),
        }

        Ok(())
    }

    fn record_install(
        &mut self,
        result: InstallResult,
        reporter: &mut dyn Reporter,
    ) -> Result<(), DeployError> {
        let target = result.target;
        let outcome = result.outcome.clone();
        let timed_out = result.attempts.last().map(|a| a.timed_out).unwrap_or(false);
        self.installs.push(result);

        match outcome {
            StepOutcome::Failed { reason } => {
                let err = if timed_out {
                    DeployError::Timeout {
                        step: format!("{target} install"),
                        after: self.ctx.opts.timeouts.install,
                    }
                } else {
                    DeployError::DependencyInstallFailed {
                        target: target.to_string(),
                        reason,
                    }
                };
                self.absorb(err, reporter)
            }
            other => {
                self.note_degraded(&format!("{target} install"), &other, reporter);
                Ok(())
            }
        }
    }

    fn publish(&mut self, reporter: &mut dyn Reporter) -> Result<(), DeployError> {
        reporter.info(&format!("{}: publishing {}...", self.label, self.ctx.opts.version));
        let result = publish(self.paths, &self.ctx.opts.version)?;

        if result.emergency_fallback_used {
            reporter.warn(&format!(
                "{}: build output empty; serving placeholder assets",
                self.label
            ));
            self.ctx.events.record(
                &self.label,
                EventType::EmergencyFallbackUsed {
                    version_dir: result.version_dir.clone(),
                },
            );
            self.degradations
                .push("emergency placeholder assets published".to_string());
        }
        self.ctx.events.record(
            &self.label,
            EventType::PointerSwapped {
                link: self.paths.production_link.clone(),
                target: result.version_dir.clone(),
            },
        );
        self.publish = Some(result);
        Ok(())
    }

    fn verify(&mut self, reporter: &mut dyn Reporter) {
        reporter.info(&format!("{}: verifying...", self.label));
        let report = self.ctx.verifier.verify(
            &self.paths.market,
            self.paths,
            &self.ctx.opts.version,
            &self.ctx.opts.verify.services,
        );

        let mut checks: Vec<(String, bool)> = vec![
            ("backend_dir_exists".to_string(), report.backend_dir_exists),
            ("frontend_dir_exists".to_string(), report.frontend_dir_exists),
            (
                "dependency_manifest_exists".to_string(),
                report.dependency_manifest_exists,
            ),
            ("version_dir_exists".to_string(), report.version_dir_exists),
            (
                "production_points_to_version".to_string(),
                report.production_points_to_version,
            ),
            ("build_output_present".to_string(), report.build_output_present),
        ];
        checks.extend(
            report
                .service_states
                .iter()
                .map(|(name, state)| (format!("service:{name}"), state.is_active())),
        );
        for (check, passed) in checks {
            self.ctx
                .events
                .record(&self.label, EventType::CheckRecorded { check, passed });
        }

        for check in report.failed_checks() {
            // Verification failures never stop a market.
            let _ = self.absorb(DeployError::VerificationCheckFailed { check }, reporter);
        }
        self.verification = Some(report);
    }
}

fn cache_unavailable(target: InstallTarget, cache_dir: &Path, reason: String) -> InstallResult {
    InstallResult {
        target,
        strategy: None,
        outcome: StepOutcome::Failed { reason },
        used_cache: false,
        cache_dir: cache_dir.to_path_buf(),
        duration_ms: 0,
        attempts: vec![],
    }
}

pub(crate) fn deploy_market(
    ctx: &RunContext<'_>,
    paths: &DeploymentPaths,
    reporter: &mut dyn Reporter,
) -> MarketReceipt {
    let started_at = Utc::now();
    let start = Instant::now();
    let mut run = MarketRun::new(ctx, paths);

    ctx.events.record(&run.label, EventType::MarketStarted);
    run.advance(MarketPhase::Installing);

    if let Err(err) = run.install(reporter) {
        run.fail(err, reporter);
    } else if ctx.cancel.is_cancelled() {
        run.fail(
            DeployError::Cancelled {
                step: "publishing".to_string(),
            },
            reporter,
        );
    } else {
        run.advance(MarketPhase::Publishing);
        match run.publish(reporter) {
            Err(err) => run.fail(err, reporter),
            Ok(()) => {
                run.advance(MarketPhase::Verifying);
                run.verify(reporter);
                run.advance(MarketPhase::Done);
            }
        }
    }

    let health = if run.failure.is_some() {
        MarketHealth::Failed
    } else if run.degradations.is_empty() {
        MarketHealth::Healthy
    } else {
        MarketHealth::Degraded
    };
    let duration_ms = start.elapsed().as_millis() as u64;

    ctx.events.record(
        &run.label,
        EventType::MarketFinished {
            health,
            duration_ms,
        },
    );
    match health {
        MarketHealth::Healthy => reporter.info(&format!("{}: healthy", run.label)),
        MarketHealth::Degraded => reporter.warn(&format!(
            "{}: degraded ({} note(s))",
            run.label,
            run.degradations.len()
        )),
        MarketHealth::Failed => reporter.error(&format!("{}: failed", run.label)),
    }

    MarketReceipt {
        market: paths.market.clone(),
        phase: run.phase,
        health,
        installs: run.installs,
        build: run.build,
        publish: run.publish,
        verification: run.verification,
        failure: run.failure,
        degradations: run.degradations,
        started_at,
        finished_at: Utc::now(),
        duration_ms,
    }
}

/// Run the health checks for every market without deploying.
pub fn run_verify(opts: &RunOptions, reporter: &mut dyn Reporter) -> Vec<VerificationReport> {
    let plan = build_plan(opts);
    let verifier = HealthVerifier::from_options(opts);
    plan.markets
        .iter()
        .map(|paths| {
            let report =
                verifier.verify(&paths.market, paths, &plan.version, &opts.verify.services);
            let failed = report.failed_checks();
            if failed.is_empty() {
                reporter.info(&format!("{}: all checks passed", paths.market));
            } else {
                reporter.warn(&format!(
                    "{}: failed checks: {}",
                    paths.market,
                    failed.join(", ")
                ));
            }
            report
        })
        .collect()
}

pub fn short_id(run_id: &str) -> &str {
    run_id.get(..12).unwrap_or(run_id)
}
