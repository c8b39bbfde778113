use std::fmt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use chrono::SecondsFormat;
use clap::{Parser, Subcommand};

use tapdeploy::cancel::CancelToken;
use tapdeploy::engine::{self, Reporter};
use tapdeploy::lock::LockFile;
use tapdeploy::plan;
use tapdeploy::process::tool_version;
use tapdeploy::provision::{self, ProvisionReport};
use tapdeploy::state;
use tapdeploy_config::{CONFIG_FILE, CliOverrides, DeployConfig, RunOptions};
use tapdeploy_types::{MarketHealth, RunReceipt, RunResult, VerificationReport};

mod progress;

#[derive(Parser, Debug)]
#[command(name = "tapdeploy", version)]
#[command(about = "Atomic multi-market releases for Composer + npm applications")]
struct Cli {
    /// Path to the configuration file (default: ./.tapdeploy.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Release label to deploy (overrides TAPDEPLOY_RELEASE and release.version)
    #[arg(long = "release")]
    release: Option<String>,

    /// Restrict to specific markets (repeatable). Defaults to every configured market.
    #[arg(long = "market")]
    markets: Vec<String>,

    /// Directory for the run lock, events and receipts (default: paths.state_dir)
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Deploy markets concurrently.
    #[arg(long)]
    parallel: bool,

    /// Max markets deployed at the same time in parallel mode.
    #[arg(long)]
    max_concurrent: Option<usize>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the run id and the resolved paths for every market.
    Plan,
    /// Install, build, publish and verify every selected market.
    Deploy,
    /// Run the health checks without deploying.
    Verify {
        /// Print the reports as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Ensure OS packages, services and free disk space.
    Provision,
    /// Summarise the last run receipt.
    Status {
        /// Print the full receipt as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Print tool versions, resolved configuration and lock state.
    Doctor,
    /// Ask a running deploy to stop before starting more markets.
    Abort,
    /// Write a default .tapdeploy.toml.
    Init {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

/// Marks errors that come from loading or validating configuration.
#[derive(Debug)]
struct ConfigError;

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid configuration")
    }
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("[error] {err:#}");
            if err.downcast_ref::<ConfigError>().is_some() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let mut reporter = CliReporter;

    match &cli.cmd {
        Commands::Init { force } => {
            let path = cli
                .config
                .clone()
                .unwrap_or_else(|| PathBuf::from(CONFIG_FILE));
            run_init(&path, *force)?;
            println!("wrote {}", path.display());
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Abort => {
            let (root, cfg) = load_config(&cli, false)?;
            let state_dir = cfg.state_dir(&root, cli.state_dir.as_deref());
            let path = state::request_abort(&state_dir)?;
            println!("abort requested: {}", path.display());
            if !LockFile::is_locked(&state_dir) {
                reporter.warn("no deploy appears to be running");
            }
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Status { json } => {
            let (root, cfg) = load_config(&cli, false)?;
            let state_dir = cfg.state_dir(&root, cli.state_dir.as_deref());
            return run_status(&state_dir, *json, &mut reporter);
        }
        Commands::Doctor => {
            let (root, cfg) = load_config(&cli, false)?;
            run_doctor(&cli, &root, &cfg, &mut reporter);
            return Ok(ExitCode::SUCCESS);
        }
        _ => {}
    }

    let (root, mut cfg) = load_config(&cli, true)?;
    if matches!(cli.cmd, Commands::Provision) {
        // Provisioning does not depend on a release label.
        cfg.release
            .version
            .get_or_insert_with(|| "unreleased".to_string());
    }
    let opts = cfg
        .build_run_options(&root, overrides(&cli))
        .context(ConfigError)?;

    match cli.cmd {
        Commands::Plan => {
            print_plan(&plan::build_plan(&opts));
            Ok(ExitCode::SUCCESS)
        }
        Commands::Deploy => {
            let mut progress = progress::ProgressReporter::new(opts.markets.len());
            let cancel = CancelToken::with_sentinel(&opts.state_dir);
            let receipt = engine::run_deploy(&opts, &mut progress, &cancel);
            progress.finish();
            let receipt = receipt?;
            print_receipt(&receipt, &opts.state_dir);
            Ok(match receipt.result {
                RunResult::PartialFailure => ExitCode::FAILURE,
                RunResult::Success | RunResult::Degraded => ExitCode::SUCCESS,
            })
        }
        Commands::Verify { json } => {
            let reports = engine::run_verify(&opts, &mut reporter);
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&reports).context("failed to serialize reports")?
                );
            } else {
                print_reports(&reports);
            }
            let all_passed = reports.iter().all(VerificationReport::all_passed);
            Ok(if all_passed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Provision => {
            let report = provision::provision(&opts, &mut reporter);
            print_provision(&report);
            Ok(if report.all_ok() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Status { .. } | Commands::Doctor | Commands::Abort | Commands::Init { .. } => {
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn overrides(cli: &Cli) -> CliOverrides {
    CliOverrides {
        version: cli.release.clone(),
        markets: cli.markets.clone(),
        state_dir: cli.state_dir.clone(),
        parallel: cli.parallel,
        max_concurrent: cli.max_concurrent,
    }
}

/// Project root and configuration. Without `required`, a missing default
/// config file yields the built-in defaults.
fn load_config(cli: &Cli, required: bool) -> Result<(PathBuf, DeployConfig)> {
    let cwd = std::env::current_dir().context("failed to read current directory")?;

    if let Some(path) = &cli.config {
        let path = if path.is_absolute() {
            path.clone()
        } else {
            cwd.join(path)
        };
        let root = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| cwd.clone());
        let cfg = DeployConfig::load_from_file(&path).context(ConfigError)?;
        return Ok((root, cfg));
    }

    match DeployConfig::load_from_dir(&cwd).context(ConfigError)? {
        Some(cfg) => Ok((cwd, cfg)),
        None if required => Err(anyhow::anyhow!(
            "no {CONFIG_FILE} in {}; run `tapdeploy init` first",
            cwd.display()
        )
        .context(ConfigError)),
        None => Ok((cwd, DeployConfig::default())),
    }
}

fn run_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    std::fs::write(path, DeployConfig::default_toml_template())
        .with_context(|| format!("failed to write {}", path.display()))
}

fn print_plan(plan: &plan::RunPlan) {
    println!("run_id: {}", plan.run_id);
    println!("version: {}", plan.version);
    println!();

    for (idx, paths) in plan.markets.iter().enumerate() {
        println!("{:>3}. {}", idx + 1, paths.market);
        println!("     backend:    {}", paths.backend_dir.display());
        println!("     frontend:   {}", paths.frontend_dir.display());
        println!("     release:    {}", paths.version_dir.display());
        println!("     production: {}", paths.production_link.display());
    }
}

fn print_receipt(receipt: &RunReceipt, state_dir: &Path) {
    println!("run_id: {}", receipt.run_id);
    println!("version: {}", receipt.version);
    println!("receipt: {}", state::receipt_path(state_dir).display());
    println!("events:  {}", receipt.event_log_path.display());
    println!();

    for m in &receipt.markets {
        let fallback = if m.emergency_fallback_used() {
            ", placeholder"
        } else {
            ""
        };
        println!(
            "{}: {} ({}{fallback}, {})",
            m.market,
            m.health,
            m.phase,
            humantime::format_duration(std::time::Duration::from_millis(m.duration_ms))
        );
        if let Some(failure) = &m.failure {
            println!("  ! {}: {}", failure.kind, failure.message);
        }
        for note in &m.degradations {
            println!("  - {note}");
        }
    }
    if !receipt.not_started.is_empty() {
        let names: Vec<&str> = receipt.not_started.iter().map(|m| m.as_str()).collect();
        println!("not started: {}", names.join(", "));
    }
    println!();
    println!("result: {}", receipt.result);
}

fn print_reports(reports: &[VerificationReport]) {
    for report in reports {
        let failed = report.failed_checks();
        if failed.is_empty() {
            println!("{}: ok", report.market);
        } else {
            println!("{}: {}", report.market, failed.join(", "));
        }
    }
}

fn print_provision(report: &ProvisionReport) {
    println!("packages: {:?}", report.packages);
    for (name, outcome) in &report.services {
        println!("service {name}: {outcome:?}");
    }
    for disk in &report.disk {
        let available = disk
            .available_bytes
            .map(|b| b.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        println!(
            "disk {}: {available} bytes free, {} required",
            disk.path.display(),
            disk.required_bytes
        );
    }
}

fn run_status(state_dir: &Path, json: bool, reporter: &mut dyn Reporter) -> Result<ExitCode> {
    let Some(receipt) = state::load_receipt(state_dir)? else {
        reporter.warn(&format!("no receipt in {}", state_dir.display()));
        return Ok(ExitCode::FAILURE);
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&receipt).context("failed to serialize receipt")?
        );
        return Ok(ExitCode::SUCCESS);
    }

    println!("run_id: {}", receipt.run_id);
    println!("version: {}", receipt.version);
    println!(
        "finished_at: {}",
        receipt
            .finished_at
            .to_rfc3339_opts(SecondsFormat::Secs, true)
    );
    println!("result: {}", receipt.result);
    println!();
    for m in &receipt.markets {
        let marker = match m.health {
            MarketHealth::Healthy => "ok",
            MarketHealth::Degraded => "degraded",
            MarketHealth::Failed => "FAILED",
        };
        println!("{}: {marker}", m.market);
    }
    for m in &receipt.not_started {
        println!("{m}: not started");
    }
    Ok(ExitCode::SUCCESS)
}

fn run_doctor(cli: &Cli, root: &Path, cfg: &DeployConfig, reporter: &mut dyn Reporter) {
    let state_dir = cfg.state_dir(root, cli.state_dir.as_deref());
    println!("project_root: {}", root.display());
    println!("state_dir: {}", state_dir.display());
    match cfg.validate() {
        Ok(()) => println!("config: ok ({} market(s))", cfg.markets.len()),
        Err(err) => println!("config: {err:#}"),
    }

    if LockFile::is_locked(&state_dir) {
        match LockFile::read_lock_info(&state_dir) {
            Ok(info) => println!(
                "lock: held by pid {} on {} since {}",
                info.pid, info.hostname, info.acquired_at
            ),
            Err(_) => println!("lock: held"),
        }
    } else {
        println!("lock: free");
    }
    println!("abort_requested: {}", state::abort_requested(&state_dir));
    println!();

    for (label, program) in [
        ("composer", cfg.backend.composer.as_str()),
        ("npm", cfg.frontend.npm.as_str()),
        ("git", cfg.git.program.as_str()),
        ("systemctl", cfg.verify.systemctl.as_str()),
    ] {
        match tool_version(program) {
            Some(v) => println!("{label}: {v}"),
            None => reporter.warn(&format!("unable to run {program} --version")),
        }
    }
}
