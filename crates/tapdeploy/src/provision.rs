//! Host preparation: OS packages, source checkouts, services and disk space.
//!
//! These wrap external tools (`dpkg-query`/`apt-get`, `git`, `systemctl`,
//! `df`) and report a small outcome per request. None of them return
//! errors for tool failures; the caller decides what a failure means.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tapdeploy_config::RunOptions;
use tapdeploy_process::{CommandOutput, CommandRequest, run_command};

use crate::engine::Reporter;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PackageOutcome {
    /// Every package was already installed.
    Satisfied,
    Installed { packages: Vec<String> },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CheckoutOutcome {
    /// Already at the remote branch head.
    Clean,
    /// Cloned or moved to the remote branch head.
    Updated,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ServiceOutcome {
    Running,
    Started,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskCheck {
    pub path: PathBuf,
    pub available_bytes: Option<u64>,
    pub required_bytes: u64,
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvisionReport {
    pub packages: PackageOutcome,
    pub services: BTreeMap<String, ServiceOutcome>,
    pub disk: Vec<DiskCheck>,
}

impl ProvisionReport {
    pub fn all_ok(&self) -> bool {
        !matches!(self.packages, PackageOutcome::Failed { .. })
            && self
                .services
                .values()
                .all(|s| !matches!(s, ServiceOutcome::Failed { .. }))
            && self.disk.iter().all(|d| d.ok)
    }
}

/// Ensure the configured packages, services and free space.
pub fn provision(opts: &RunOptions, reporter: &mut dyn Reporter) -> ProvisionReport {
    let p = &opts.provision;

    reporter.info(&format!("ensuring {} package(s)...", p.packages.len()));
    let packages = ensure_packages(
        &p.package_query,
        &p.package_manager,
        &p.packages,
        opts.timeouts.probe,
        opts.timeouts.install,
    );
    match &packages {
        PackageOutcome::Satisfied => reporter.info("packages: already present"),
        PackageOutcome::Installed { packages } => {
            reporter.info(&format!("packages: installed {}", packages.join(", ")))
        }
        PackageOutcome::Failed { reason } => reporter.error(&format!("packages: {reason}")),
    }

    let mut services = BTreeMap::new();
    for name in &p.services {
        let outcome = ensure_service(&opts.verify.systemctl, name, opts.timeouts.probe);
        match &outcome {
            ServiceOutcome::Running => reporter.info(&format!("{name}: running")),
            ServiceOutcome::Started => reporter.info(&format!("{name}: started and enabled")),
            ServiceOutcome::Failed { reason } => reporter.error(&format!("{name}: {reason}")),
        }
        services.insert(name.clone(), outcome);
    }

    let disk = check_disk_space(opts, reporter);

    ProvisionReport {
        packages,
        services,
        disk,
    }
}

/// Free-space checks for both base paths (skipped when disabled).
pub fn check_disk_space(opts: &RunOptions, reporter: &mut dyn Reporter) -> Vec<DiskCheck> {
    let required = opts.provision.min_free_space;
    if required == 0 {
        return vec![];
    }
    let mut checks = Vec::new();
    for base in [&opts.backend_base, &opts.frontend_base] {
        let available = match available_space(&opts.provision.df, base, opts.timeouts.probe) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                reporter.warn(&format!(
                    "free space check for {} failed: {err:#}",
                    base.display()
                ));
                None
            }
        };
        let ok = available.map(|a| a >= required).unwrap_or(false);
        if !ok && available.is_some() {
            reporter.warn(&format!(
                "{}: only {} bytes free, {} required",
                base.display(),
                available.unwrap_or(0),
                required
            ));
        }
        checks.push(DiskCheck {
            path: base.clone(),
            available_bytes: available,
            required_bytes: required,
            ok,
        });
    }
    checks
}

/// Ensure `packages` are installed, installing the missing ones.
pub fn ensure_packages(
    query: &str,
    manager: &str,
    packages: &[String],
    probe_timeout: Duration,
    install_timeout: Duration,
) -> PackageOutcome {
    let missing: Vec<String> = packages
        .iter()
        .filter(|pkg| !package_installed(query, pkg, probe_timeout))
        .cloned()
        .collect();
    if missing.is_empty() {
        return PackageOutcome::Satisfied;
    }

    let mut args = vec![
        "install".to_string(),
        "-y".to_string(),
        "--no-install-recommends".to_string(),
    ];
    args.extend(missing.iter().cloned());
    let req = CommandRequest::new(manager, args)
        .env("DEBIAN_FRONTEND", "noninteractive")
        .with_timeout(install_timeout);

    match run_command(&req) {
        Ok(out) if out.success() => PackageOutcome::Installed { packages: missing },
        Ok(out) => PackageOutcome::Failed {
            reason: format!("{} failed: {}", req.display(), failure_reason(&out)),
        },
        Err(err) => PackageOutcome::Failed {
            reason: format!("{err:#}"),
        },
    }
}

fn package_installed(query: &str, package: &str, timeout: Duration) -> bool {
    let req = CommandRequest::new(query, ["-W", "-f=${Status}", package]).with_timeout(timeout);
    match run_command(&req) {
        Ok(out) => out.success() && out.stdout.contains("install ok installed"),
        Err(_) => false,
    }
}

/// Ensure `path` is a checkout of `remote` at the head of `branch`.
///
/// A checkout with local modifications is never touched.
pub fn ensure_checkout(
    git: &str,
    path: &Path,
    remote: &str,
    branch: &str,
    timeout: Duration,
) -> CheckoutOutcome {
    let failed = |reason: String| CheckoutOutcome::Failed { reason };

    if !path.join(".git").exists() {
        if fs::read_dir(path)
            .map(|mut e| e.next().is_some())
            .unwrap_or(false)
        {
            return failed(format!(
                "{} exists and is not a git checkout",
                path.display()
            ));
        }
        if let Some(parent) = path.parent()
            && let Err(err) = fs::create_dir_all(parent)
        {
            return failed(format!("cannot create {}: {err}", parent.display()));
        }
        let req = CommandRequest::new(
            git,
            [
                "clone".to_string(),
                "--branch".to_string(),
                branch.to_string(),
                "--single-branch".to_string(),
                remote.to_string(),
                path.to_string_lossy().into_owned(),
            ],
        )
        .with_timeout(timeout);
        return match git_step(&req) {
            Ok(_) => CheckoutOutcome::Updated,
            Err(reason) => failed(reason),
        };
    }

    let in_repo = |args: &[&str]| {
        CommandRequest::new(git, args.iter().copied())
            .in_dir(path)
            .with_timeout(timeout)
    };

    let status = match git_step(&in_repo(&["status", "--porcelain"])) {
        Ok(out) => out,
        Err(reason) => return failed(reason),
    };
    if !status.stdout.trim().is_empty() {
        return failed(format!("{} has local changes", path.display()));
    }
    if let Err(reason) = git_step(&in_repo(&["fetch", "--quiet", remote, branch])) {
        return failed(reason);
    }
    let head = match git_step(&in_repo(&["rev-parse", "HEAD"])) {
        Ok(out) => out.stdout.trim().to_string(),
        Err(reason) => return failed(reason),
    };
    let fetched = match git_step(&in_repo(&["rev-parse", "FETCH_HEAD"])) {
        Ok(out) => out.stdout.trim().to_string(),
        Err(reason) => return failed(reason),
    };
    if head == fetched {
        return CheckoutOutcome::Clean;
    }
    match git_step(&in_repo(&["checkout", "--quiet", "-B", branch, "FETCH_HEAD"])) {
        Ok(_) => CheckoutOutcome::Updated,
        Err(reason) => failed(reason),
    }
}

fn git_step(req: &CommandRequest) -> Result<CommandOutput, String> {
    match run_command(req) {
        Ok(out) if out.success() => Ok(out),
        Ok(out) => Err(format!("{} failed: {}", req.display(), failure_reason(&out))),
        Err(err) => Err(format!("{err:#}")),
    }
}

/// Ensure a service is running and enabled.
pub fn ensure_service(systemctl: &str, name: &str, timeout: Duration) -> ServiceOutcome {
    let probe = CommandRequest::new(systemctl, ["is-active", name]).with_timeout(timeout);
    if let Ok(out) = run_command(&probe)
        && out.stdout.trim() == "active"
    {
        return ServiceOutcome::Running;
    }

    let start = CommandRequest::new(systemctl, ["enable", "--now", name]).with_timeout(timeout);
    match run_command(&start) {
        Ok(out) if out.success() => ServiceOutcome::Started,
        Ok(out) => ServiceOutcome::Failed {
            reason: format!("{} failed: {}", start.display(), failure_reason(&out)),
        },
        Err(err) => ServiceOutcome::Failed {
            reason: format!("{err:#}"),
        },
    }
}

/// Bytes available on the filesystem holding `path` (or its nearest
/// existing ancestor), as reported by `df -Pk`.
pub fn available_space(df: &str, path: &Path, timeout: Duration) -> Result<u64> {
    let existing = path
        .ancestors()
        .find(|p| p.exists())
        .unwrap_or(Path::new("/"));
    let req = CommandRequest::new(
        df,
        ["-Pk".to_string(), existing.to_string_lossy().into_owned()],
    )
    .with_timeout(timeout);
    let out = run_command(&req)?;
    if !out.success() {
        bail!("{} failed: {}", req.display(), failure_reason(&out));
    }
    parse_df_available(&out.stdout)
}

/// Parse the "Available" column (KiB) of POSIX `df -Pk` output into bytes.
pub fn parse_df_available(output: &str) -> Result<u64> {
    let line = output
        .lines()
        .skip(1)
        .find(|l| !l.trim().is_empty())
        .context("df output has no data line")?;
    let field = line
        .split_whitespace()
        .nth(3)
        .with_context(|| format!("unexpected df line: {line:?}"))?;
    let kib: u64 = field
        .parse()
        .with_context(|| format!("invalid available size {field:?}"))?;
    Ok(kib * 1024)
}

fn failure_reason(out: &CommandOutput) -> String {
    if out.timed_out {
        return format!("timed out after {}", humantime::format_duration(out.duration()));
    }
    let detail = out.stderr_tail(3);
    let code = out
        .exit_code
        .map(|c| format!("exit code {c}"))
        .unwrap_or_else(|| "terminated by signal".to_string());
    if detail.trim().is_empty() {
        code
    } else {
        format!("{code}: {}", detail.trim())
    }
}
