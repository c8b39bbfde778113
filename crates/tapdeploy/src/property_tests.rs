//! Property-based tests for tapdeploy invariants.
//!
//! - Path layout: distinct markets never share a directory
//! - Publication: the pointer always resolves to the version directory
//! - Fatality: only market-fatal errors stop a market

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use proptest::prelude::*;
    use tempfile::tempdir;

    use crate::error::{DeployError, Fatality};
    use crate::paths::{PathResolver, cache_dir_for};
    use crate::publish::{dir_has_entries, publish};
    use crate::types::*;

    fn market_strategy() -> impl Strategy<Value = Market> {
        "[a-z][a-z0-9_-]{0,11}".prop_map(|s| Market::parse(&s).expect("valid market"))
    }

    fn version_strategy() -> impl Strategy<Value = ReleaseVersion> {
        "[0-9]{8}(-[a-z0-9]{1,6})?"
            .prop_map(|s| ReleaseVersion::parse(&s).expect("valid version"))
    }

    proptest! {
        /// Two different markets resolve to fully disjoint directories.
        #[test]
        fn market_paths_never_collide(
            a in market_strategy(),
            b in market_strategy(),
            version in version_strategy(),
        ) {
            prop_assume!(a != b);
            let resolver = PathResolver::new("/var/www/backend", "/var/www/frontend");
            let pa = resolver.resolve(&a, &version);
            let pb = resolver.resolve(&b, &version);

            prop_assert_ne!(&pa.backend_dir, &pb.backend_dir);
            prop_assert_ne!(&pa.frontend_dir, &pb.frontend_dir);
            prop_assert!(!pa.version_dir.starts_with(&pb.frontend_dir));
            prop_assert!(!pb.production_link.starts_with(&pa.frontend_dir));

            let cache = PathBuf::from("/var/cache/composer");
            prop_assert_ne!(cache_dir_for(&cache, &a, true), cache_dir_for(&cache, &b, true));
        }

        /// Resolution is a pure function of its inputs.
        #[test]
        fn resolution_is_deterministic(market in market_strategy(), version in version_strategy()) {
            let resolver = PathResolver::new("/b", "/f");
            prop_assert_eq!(resolver.resolve(&market, &version), resolver.resolve(&market, &version));
            let paths = resolver.resolve(&market, &version);
            prop_assert_eq!(paths.version_dir.parent(), Some(paths.dist_dir.as_path()));
            prop_assert_eq!(paths.production_link.parent(), Some(paths.dist_dir.as_path()));
        }

        /// Whatever the build left behind, the published release is non-empty
        /// and `production` resolves to it.
        #[test]
        fn published_pointer_resolves_to_non_empty_release(
            version in version_strategy(),
            files in prop::collection::vec("[a-z]{1,8}\\.(js|css|html)", 0..4),
        ) {
            let td = tempdir().expect("tempdir");
            let resolver = PathResolver::new(td.path().join("b"), td.path().join("f"));
            let market = Market::parse("pl").expect("market");
            let paths = resolver.resolve(&market, &version);
            fs::create_dir_all(&paths.version_dir).expect("mkdir");
            for name in &files {
                fs::write(paths.version_dir.join(name), "x").expect("write");
            }

            let result = publish(&paths, &version).expect("publish");
            prop_assert_eq!(result.emergency_fallback_used, files.is_empty());
            prop_assert!(dir_has_entries(&paths.production_link));
            prop_assert_eq!(
                fs::canonicalize(&paths.production_link).expect("resolve"),
                fs::canonicalize(&paths.version_dir).expect("resolve")
            );
        }

        /// Every non-fatal error kind keeps the market going.
        #[test]
        fn recoverable_errors_are_not_market_fatal(reason in "[a-z ]{1,20}") {
            let errors = [
                DeployError::DependencyInstallFailed { target: "backend".into(), reason: reason.clone() },
                DeployError::BuildFailed { reason: reason.clone() },
                DeployError::VerificationCheckFailed { check: reason.clone() },
            ];
            for err in errors {
                prop_assert_ne!(err.fatality(), Fatality::Market);
            }
        }
    }

    /// Phase transitions never leave a terminal state.
    #[test]
    fn terminal_phases_have_no_exits() {
        let phases = [
            MarketPhase::Pending,
            MarketPhase::Installing,
            MarketPhase::Publishing,
            MarketPhase::Verifying,
            MarketPhase::Done,
            MarketPhase::Failed,
        ];
        for from in phases.into_iter().filter(|p| p.is_terminal()) {
            for to in phases {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }
}
