use std::path::{Path, PathBuf};

use tapdeploy_types::{DeploymentPaths, Market, PRODUCTION_LINK, ReleaseVersion};

/// Directory inside each market's frontend checkout that holds releases.
pub const DIST_DIR: &str = "dist";

/// Derives per-market locations from the configured base paths.
///
/// Market codes and release labels are validated on construction, so every
/// market maps to its own directory below each base and no label can escape
/// the `dist` directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathResolver {
    backend_base: PathBuf,
    frontend_base: PathBuf,
}

impl PathResolver {
    pub fn new(backend_base: impl Into<PathBuf>, frontend_base: impl Into<PathBuf>) -> Self {
        Self {
            backend_base: backend_base.into(),
            frontend_base: frontend_base.into(),
        }
    }

    pub fn backend_base(&self) -> &Path {
        &self.backend_base
    }

    pub fn frontend_base(&self) -> &Path {
        &self.frontend_base
    }

    pub fn resolve(&self, market: &Market, version: &ReleaseVersion) -> DeploymentPaths {
        let backend_dir = self.backend_base.join(market.as_str());
        let frontend_dir = self.frontend_base.join(market.as_str());
        let dist_dir = frontend_dir.join(DIST_DIR);
        DeploymentPaths {
            market: market.clone(),
            backend_dir,
            version_dir: dist_dir.join(version.as_str()),
            production_link: dist_dir.join(PRODUCTION_LINK),
            dist_dir,
            frontend_dir,
        }
    }
}

/// Cache directory a market installs into.
///
/// With `per_market` every market writes a disjoint subdirectory of the
/// shared root, so parallel installs never write the same cache.
pub fn cache_dir_for(cache_root: &Path, market: &Market, per_market: bool) -> PathBuf {
    if per_market {
        cache_root.join(market.as_str())
    } else {
        cache_root.to_path_buf()
    }
}
