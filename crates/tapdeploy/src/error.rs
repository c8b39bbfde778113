use std::path::PathBuf;
use std::time::Duration;

use tapdeploy_types::FailureKind;
use thiserror::Error;

/// How far a step failure reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fatality {
    /// The market stops and ends in `FAILED`. Other markets continue.
    Market,
    /// Recorded as a degradation; the market proceeds to the next phase.
    Recoverable,
    /// Recorded as data only.
    Never,
}

/// Step failures inside a market run.
///
/// Infrastructure problems that are not specific to one market (state
/// directory, run lock, configuration) travel as `anyhow::Error` instead.
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("dependency lock file missing: {}", path.display())]
    MissingLockFile { path: PathBuf },

    #[error("{target} dependency install failed: {reason}")]
    DependencyInstallFailed { target: String, reason: String },

    #[error("frontend build failed: {reason}")]
    BuildFailed { reason: String },

    #[error("publish I/O error at {}: {source}", path.display())]
    PublishIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("verification check {check} failed")]
    VerificationCheckFailed { check: String },

    #[error("{step} timed out after {}", humantime::format_duration(*.after))]
    Timeout { step: String, after: Duration },

    #[error("checkout of {} failed: {reason}", path.display())]
    Checkout { path: PathBuf, reason: String },

    #[error("cancelled before {step}")]
    Cancelled { step: String },
}

impl DeployError {
    pub fn publish_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DeployError::PublishIo {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            DeployError::MissingLockFile { .. } => FailureKind::MissingLockFile,
            DeployError::DependencyInstallFailed { .. } => FailureKind::DependencyInstallFailed,
            DeployError::BuildFailed { .. } => FailureKind::BuildFailed,
            DeployError::PublishIo { .. } => FailureKind::PublishIo,
            DeployError::VerificationCheckFailed { .. } => FailureKind::VerificationCheckFailed,
            DeployError::Timeout { .. } => FailureKind::Timeout,
            DeployError::Checkout { .. } => FailureKind::Checkout,
            DeployError::Cancelled { .. } => FailureKind::Cancelled,
        }
    }

    pub fn fatality(&self) -> Fatality {
        match self {
            DeployError::MissingLockFile { .. }
            | DeployError::PublishIo { .. }
            | DeployError::Timeout { .. }
            | DeployError::Checkout { .. }
            | DeployError::Cancelled { .. } => Fatality::Market,
            DeployError::DependencyInstallFailed { .. } | DeployError::BuildFailed { .. } => {
                Fatality::Recoverable
            }
            DeployError::VerificationCheckFailed { .. } => Fatality::Never,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_fatality_matches_policy() {
        let missing = DeployError::MissingLockFile {
            path: PathBuf::from("/b/pl/composer.lock"),
        };
        assert_eq!(missing.fatality(), Fatality::Market);
        assert_eq!(missing.kind(), FailureKind::MissingLockFile);

        let install = DeployError::DependencyInstallFailed {
            target: "frontend".into(),
            reason: "exit 1".into(),
        };
        assert_eq!(install.fatality(), Fatality::Recoverable);

        let build = DeployError::BuildFailed {
            reason: "exit 2".into(),
        };
        assert_eq!(build.fatality(), Fatality::Recoverable);

        let timeout = DeployError::Timeout {
            step: "backend install".into(),
            after: Duration::from_millis(200),
        };
        assert_eq!(timeout.fatality(), Fatality::Market);
        assert_eq!(timeout.kind(), FailureKind::Timeout);

        let io = DeployError::publish_io(
            "/f/pl/dist",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(io.fatality(), Fatality::Market);
        assert_eq!(io.kind(), FailureKind::PublishIo);

        let check = DeployError::VerificationCheckFailed {
            check: "version_dir_exists".into(),
        };
        assert_eq!(check.fatality(), Fatality::Never);
    }

    #[test]
    fn messages_name_the_failing_thing() {
        let err = DeployError::Timeout {
            step: "frontend build".into(),
            after: Duration::from_secs(90),
        };
        assert_eq!(err.to_string(), "frontend build timed out after 1m 30s");

        let err = DeployError::MissingLockFile {
            path: PathBuf::from("/b/gr/composer.lock"),
        };
        assert_eq!(
            err.to_string(),
            "dependency lock file missing: /b/gr/composer.lock"
        );
    }
}
