use sha2::{Digest, Sha256};
use tapdeploy_config::RunOptions;
use tapdeploy_types::{DeploymentPaths, ReleaseVersion};

use crate::paths::PathResolver;

/// Markets and paths for one run, in deployment order.
#[derive(Debug, Clone)]
pub struct RunPlan {
    /// SHA-256 over the version, the base paths and the market list.
    pub run_id: String,
    pub version: ReleaseVersion,
    pub markets: Vec<DeploymentPaths>,
}

pub fn build_plan(opts: &RunOptions) -> RunPlan {
    let resolver = PathResolver::new(&opts.backend_base, &opts.frontend_base);
    let markets: Vec<DeploymentPaths> = opts
        .markets
        .iter()
        .map(|m| resolver.resolve(m, &opts.version))
        .collect();
    let run_id = compute_run_id(&resolver, &opts.version, &markets);

    RunPlan {
        run_id,
        version: opts.version.clone(),
        markets,
    }
}

fn compute_run_id(
    resolver: &PathResolver,
    version: &ReleaseVersion,
    markets: &[DeploymentPaths],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(version.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(resolver.backend_base().to_string_lossy().as_bytes());
    hasher.update(b"\n");
    hasher.update(resolver.frontend_base().to_string_lossy().as_bytes());
    hasher.update(b"\n");
    for m in markets {
        hasher.update(m.market.as_str().as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    hex::encode(digest)
}
