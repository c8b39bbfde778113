use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

use chrono::Utc;
use tapdeploy_config::RunOptions;
use tapdeploy_process::{CommandRequest, run_command};
use tapdeploy_types::{
    DeploymentPaths, Market, ReleaseVersion, ServiceState, VerificationReport,
};

use crate::publish::{dir_has_entries, is_placeholder};

/// Post-publication health checks.
///
/// Every check runs regardless of earlier results; a failed check is a
/// `false` (or non-active service state) in the report, never an error.
#[derive(Debug, Clone)]
pub struct HealthVerifier {
    systemctl: String,
    probe_timeout: Duration,
}

impl HealthVerifier {
    pub fn new(systemctl: impl Into<String>, probe_timeout: Duration) -> Self {
        Self {
            systemctl: systemctl.into(),
            probe_timeout,
        }
    }

    pub fn from_options(opts: &RunOptions) -> Self {
        Self::new(opts.verify.systemctl.clone(), opts.timeouts.probe)
    }

    pub fn verify(
        &self,
        market: &Market,
        paths: &DeploymentPaths,
        expected_version: &ReleaseVersion,
        expected_services: &[String],
    ) -> VerificationReport {
        let version_dir_exists = paths.version_dir.is_dir();
        let production_points_to_version = points_to(paths);
        let build_output_present = version_dir_exists
            && dir_has_entries(&paths.version_dir)
            && !is_placeholder(&paths.version_dir);

        let mut service_states = BTreeMap::new();
        for service in expected_services {
            service_states.insert(service.clone(), self.service_state(service));
        }

        VerificationReport {
            market: market.clone(),
            expected_version: expected_version.clone(),
            backend_dir_exists: paths.backend_dir.is_dir(),
            frontend_dir_exists: paths.frontend_dir.is_dir(),
            dependency_manifest_exists: paths.backend_lock_file().is_file(),
            version_dir_exists,
            production_points_to_version,
            build_output_present,
            service_states,
            checked_at: Utc::now(),
        }
    }

    /// Active state reported by `systemctl is-active <name>`.
    pub fn service_state(&self, name: &str) -> ServiceState {
        let req = CommandRequest::new(&self.systemctl, ["is-active", name])
            .with_timeout(self.probe_timeout);
        match run_command(&req) {
            // is-active exits non-zero for inactive units but still prints the state.
            Ok(out) if !out.timed_out => ServiceState::from_probe_output(&out.stdout),
            _ => ServiceState::Unknown,
        }
    }
}

fn points_to(paths: &DeploymentPaths) -> bool {
    match (
        fs::canonicalize(&paths.production_link),
        fs::canonicalize(&paths.version_dir),
    ) {
        (Ok(link), Ok(dir)) => link == dir,
        _ => false,
    }
}
