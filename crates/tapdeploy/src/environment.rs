use tapdeploy_config::RunOptions;
use tapdeploy_process::tool_version;
use tapdeploy_types::EnvironmentFingerprint;

/// Collect environment fingerprint information
pub fn collect_environment_fingerprint(opts: &RunOptions) -> EnvironmentFingerprint {
    let hostname = gethostname::gethostname().to_string_lossy().into_owned();

    EnvironmentFingerprint {
        tapdeploy_version: env!("CARGO_PKG_VERSION").to_string(),
        hostname,
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        composer_version: tool_version(&opts.backend.composer),
        npm_version: tool_version(&opts.frontend.npm),
        git_version: tool_version(&opts.git.program),
    }
}
