//! Core domain types for tapdeploy.
//!
//! This crate provides the types shared across the tapdeploy workspace:
//! market and release identifiers, derived deployment paths, per-step
//! results, verification reports, receipts and the event log schema.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_with::skip_serializing_none;

/// Name of the "current release" pointer inside each market's `dist` directory.
pub const PRODUCTION_LINK: &str = "production";

/// Backend dependency lock file that must exist before a backend install.
pub const BACKEND_LOCK_FILE: &str = "composer.lock";

/// Frontend lock file that enables the frozen install strategy.
pub const FRONTEND_LOCK_FILE: &str = "package-lock.json";

/// Error raised when a market code or release label is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidIdentifier {
    pub kind: &'static str,
    pub value: String,
    pub reason: &'static str,
}

impl fmt::Display for InvalidIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {} {:?}: {}", self.kind, self.value, self.reason)
    }
}

impl std::error::Error for InvalidIdentifier {}

/// A market code such as `pl` or `uk`.
///
/// Market codes become path segments, so they are restricted to lowercase
/// ASCII letters, digits, `-` and `_`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Market(String);

impl Market {
    pub fn parse(code: &str) -> Result<Self, InvalidIdentifier> {
        let invalid = |reason| InvalidIdentifier {
            kind: "market code",
            value: code.to_string(),
            reason,
        };
        if code.is_empty() {
            return Err(invalid("must not be empty"));
        }
        if code.len() > 32 {
            return Err(invalid("must be at most 32 characters"));
        }
        if !code
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(invalid("only [a-z0-9_-] is allowed"));
        }
        Ok(Self(code.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Market {
    type Error = InvalidIdentifier;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Market::parse(&value)
    }
}

impl From<Market> for String {
    fn from(value: Market) -> Self {
        value.0
    }
}

/// Release label shared by every market in a run (e.g. `20240724`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ReleaseVersion(String);

impl ReleaseVersion {
    pub fn parse(label: &str) -> Result<Self, InvalidIdentifier> {
        let invalid = |reason| InvalidIdentifier {
            kind: "release version",
            value: label.to_string(),
            reason,
        };
        if label.trim().is_empty() {
            return Err(invalid("must not be empty"));
        }
        if label == "." || label == ".." {
            return Err(invalid("must not be a relative path component"));
        }
        if label == PRODUCTION_LINK {
            return Err(invalid("collides with the production pointer"));
        }
        if label.starts_with('.') {
            return Err(invalid("must not start with '.'"));
        }
        if label
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_whitespace() || c.is_control())
        {
            return Err(invalid("must not contain separators or whitespace"));
        }
        Ok(Self(label.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReleaseVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ReleaseVersion {
    type Error = InvalidIdentifier;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ReleaseVersion::parse(&value)
    }
}

impl From<ReleaseVersion> for String {
    fn from(value: ReleaseVersion) -> Self {
        value.0
    }
}

/// Filesystem locations for one market and one release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentPaths {
    pub market: Market,
    /// `{backend_base}/{market}`
    pub backend_dir: PathBuf,
    /// `{frontend_base}/{market}`
    pub frontend_dir: PathBuf,
    /// `{frontend_base}/{market}/dist`
    pub dist_dir: PathBuf,
    /// `{frontend_base}/{market}/dist/{version}`
    pub version_dir: PathBuf,
    /// `{frontend_base}/{market}/dist/production`
    pub production_link: PathBuf,
}

impl DeploymentPaths {
    pub fn backend_lock_file(&self) -> PathBuf {
        self.backend_dir.join(BACKEND_LOCK_FILE)
    }

    pub fn frontend_lock_file(&self) -> PathBuf {
        self.frontend_dir.join(FRONTEND_LOCK_FILE)
    }
}

/// Outcome declared by a single strategy or step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    Degraded { reason: String },
    Failed { reason: String },
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Succeeded)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, StepOutcome::Failed { .. })
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOutcome::Succeeded => write!(f, "succeeded"),
            StepOutcome::Degraded { reason } => write!(f, "degraded ({reason})"),
            StepOutcome::Failed { reason } => write!(f, "failed ({reason})"),
        }
    }
}

/// Evidence for one attempted strategy (one external command).
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyAttempt {
    pub strategy: String,
    pub command: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub outcome: StepOutcome,
    pub stdout_tail: Option<String>,
    pub stderr_tail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallTarget {
    Backend,
    Frontend,
}

impl fmt::Display for InstallTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallTarget::Backend => write!(f, "backend"),
            InstallTarget::Frontend => write!(f, "frontend"),
        }
    }
}

/// Result of a dependency install.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallResult {
    pub target: InstallTarget,
    /// Strategy that produced the final outcome.
    pub strategy: Option<String>,
    pub outcome: StepOutcome,
    /// Whether the cache directory already held entries before the install.
    pub used_cache: bool,
    pub cache_dir: PathBuf,
    pub duration_ms: u64,
    pub attempts: Vec<StrategyAttempt>,
}

/// Result of the frontend build.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResult {
    pub strategy: Option<String>,
    pub outcome: StepOutcome,
    pub memory_limit_bytes: u64,
    pub duration_ms: u64,
    pub attempts: Vec<StrategyAttempt>,
}

/// Record produced once per market by the release publisher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResult {
    pub market: Market,
    pub version_published: ReleaseVersion,
    pub version_dir: PathBuf,
    pub symlink_swapped: bool,
    pub emergency_fallback_used: bool,
}

/// Active state of an OS service as reported by the service manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Active,
    Inactive,
    Activating,
    Failed,
    /// The probe itself could not run or returned something unexpected.
    Unknown,
}

impl ServiceState {
    /// Parse the single-word output of `systemctl is-active`.
    pub fn from_probe_output(raw: &str) -> Self {
        match raw.trim() {
            "active" => ServiceState::Active,
            "inactive" => ServiceState::Inactive,
            "activating" | "reloading" => ServiceState::Activating,
            "failed" => ServiceState::Failed,
            _ => ServiceState::Unknown,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, ServiceState::Active)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Active => "active",
            ServiceState::Inactive => "inactive",
            ServiceState::Activating => "activating",
            ServiceState::Failed => "failed",
            ServiceState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Post-publication checks for one market. Every field is populated even
/// when earlier checks fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub market: Market,
    pub expected_version: ReleaseVersion,
    pub backend_dir_exists: bool,
    pub frontend_dir_exists: bool,
    pub dependency_manifest_exists: bool,
    pub version_dir_exists: bool,
    pub production_points_to_version: bool,
    /// Build-quality flag: false when the version directory only holds
    /// emergency placeholder content.
    pub build_output_present: bool,
    pub service_states: BTreeMap<String, ServiceState>,
    pub checked_at: DateTime<Utc>,
}

impl VerificationReport {
    /// Names of the checks that did not pass.
    pub fn failed_checks(&self) -> Vec<String> {
        let mut failed = Vec::new();
        let flags = [
            ("backend_dir_exists", self.backend_dir_exists),
            ("frontend_dir_exists", self.frontend_dir_exists),
            ("dependency_manifest_exists", self.dependency_manifest_exists),
            ("version_dir_exists", self.version_dir_exists),
            (
                "production_points_to_version",
                self.production_points_to_version,
            ),
            ("build_output_present", self.build_output_present),
        ];
        for (name, ok) in flags {
            if !ok {
                failed.push(name.to_string());
            }
        }
        for (service, state) in &self.service_states {
            if !state.is_active() {
                failed.push(format!("service:{service}={state}"));
            }
        }
        failed
    }

    pub fn all_passed(&self) -> bool {
        self.failed_checks().is_empty()
    }
}

/// Per-market lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketPhase {
    Pending,
    Installing,
    Publishing,
    Verifying,
    Done,
    Failed,
}

impl MarketPhase {
    /// Whether `self -> next` is an allowed transition.
    pub fn can_transition_to(self, next: MarketPhase) -> bool {
        use MarketPhase::*;
        matches!(
            (self, next),
            (Pending, Installing)
                | (Pending, Failed)
                | (Installing, Publishing)
                | (Installing, Failed)
                | (Publishing, Verifying)
                | (Publishing, Failed)
                | (Verifying, Done)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MarketPhase::Done | MarketPhase::Failed)
    }
}

impl fmt::Display for MarketPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MarketPhase::Pending => "pending",
            MarketPhase::Installing => "installing",
            MarketPhase::Publishing => "publishing",
            MarketPhase::Verifying => "verifying",
            MarketPhase::Done => "done",
            MarketPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Operator-facing classification of a market's final state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketHealth {
    Healthy,
    /// Done, but placeholder content is served or a step was degraded.
    Degraded,
    Failed,
}

impl fmt::Display for MarketHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketHealth::Healthy => write!(f, "healthy"),
            MarketHealth::Degraded => write!(f, "degraded"),
            MarketHealth::Failed => write!(f, "failed"),
        }
    }
}

/// Classification of a step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    MissingLockFile,
    DependencyInstallFailed,
    BuildFailed,
    PublishIo,
    VerificationCheckFailed,
    Timeout,
    Checkout,
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::MissingLockFile => "missing_lock_file",
            FailureKind::DependencyInstallFailed => "dependency_install_failed",
            FailureKind::BuildFailed => "build_failed",
            FailureKind::PublishIo => "publish_io",
            FailureKind::VerificationCheckFailed => "verification_check_failed",
            FailureKind::Timeout => "timeout",
            FailureKind::Checkout => "checkout",
            FailureKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Why a market ended in [`MarketPhase::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketFailure {
    /// Phase the market was in when it failed.
    pub phase: MarketPhase,
    pub kind: FailureKind,
    pub message: String,
}

/// Evidence for one market in a run.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketReceipt {
    pub market: Market,
    pub phase: MarketPhase,
    pub health: MarketHealth,
    pub installs: Vec<InstallResult>,
    pub build: Option<BuildResult>,
    pub publish: Option<PublishResult>,
    pub verification: Option<VerificationReport>,
    pub failure: Option<MarketFailure>,
    /// Human-readable notes for every degraded step.
    #[serde(default)]
    pub degradations: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl MarketReceipt {
    pub fn emergency_fallback_used(&self) -> bool {
        self.publish
            .as_ref()
            .map(|p| p.emergency_fallback_used)
            .unwrap_or(false)
    }
}

/// Aggregate outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunResult {
    /// Every market is healthy.
    Success,
    /// No market failed but at least one is degraded.
    Degraded,
    /// At least one market failed.
    PartialFailure,
}

impl RunResult {
    pub fn from_health<'a>(health: impl IntoIterator<Item = &'a MarketHealth>) -> Self {
        let mut result = RunResult::Success;
        for h in health {
            match h {
                MarketHealth::Failed => return RunResult::PartialFailure,
                MarketHealth::Degraded => result = RunResult::Degraded,
                MarketHealth::Healthy => {}
            }
        }
        result
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunResult::Success => write!(f, "success"),
            RunResult::Degraded => write!(f, "degraded"),
            RunResult::PartialFailure => write!(f, "partial_failure"),
        }
    }
}

/// Environment fingerprint recorded in every receipt.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentFingerprint {
    pub tapdeploy_version: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub composer_version: Option<String>,
    pub npm_version: Option<String>,
    pub git_version: Option<String>,
}

/// Run-level receipt persisted after every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReceipt {
    pub receipt_version: String,
    pub run_id: String,
    pub version: ReleaseVersion,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub result: RunResult,
    /// Markets that never started because the run was cancelled.
    #[serde(default)]
    pub not_started: Vec<Market>,
    pub markets: Vec<MarketReceipt>,
    pub event_log_path: PathBuf,
    pub environment: EnvironmentFingerprint,
}

/// Event types for the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventType {
    RunStarted {
        run_id: String,
        version: String,
        market_count: usize,
    },
    RunFinished {
        result: RunResult,
    },
    RunCancelled {
        remaining: usize,
    },
    MarketStarted,
    PhaseChanged {
        from: MarketPhase,
        to: MarketPhase,
    },
    StrategyAttempted {
        step: String,
        attempt: StrategyAttempt,
    },
    StepDegraded {
        step: String,
        reason: String,
    },
    EmergencyFallbackUsed {
        version_dir: PathBuf,
    },
    PointerSwapped {
        link: PathBuf,
        target: PathBuf,
    },
    CheckRecorded {
        check: String,
        passed: bool,
    },
    MarketFailed {
        kind: FailureKind,
        message: String,
    },
    MarketFinished {
        health: MarketHealth,
        duration_ms: u64,
    },
}

/// A single entry in `events.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event_type: EventType,
    /// Market this event relates to, or `all` for run-level events.
    pub market: String,
}

impl DeployEvent {
    pub fn now(market: impl Into<String>, event_type: EventType) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            market: market.into(),
        }
    }
}

/// Deserialize a humantime string (`"30s"`, `"10m"`) into a [`Duration`].
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

/// Serialize a [`Duration`] as a humantime string.
pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*duration).to_string())
}
