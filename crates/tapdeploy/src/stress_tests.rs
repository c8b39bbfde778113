//! Stress tests for concurrent pointer swaps and parallel runs.
//!
//! - Readers never observe a missing `production` pointer during swaps
//! - Concurrent publishes to one market leave a consistent pointer
//! - Many markets deployed in parallel stay isolated

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    use tempfile::TempDir;

    use crate::lock::LockFile;
    use crate::paths::PathResolver;
    use crate::publish::{current_target, publish, swap_pointer};
    use crate::types::*;

    fn resolve(root: &Path, version: &str) -> (DeploymentPaths, ReleaseVersion) {
        let resolver = PathResolver::new(root.join("backend"), root.join("frontend"));
        let version = ReleaseVersion::parse(version).expect("version");
        let paths = resolver.resolve(&Market::parse("pl").expect("market"), &version);
        (paths, version)
    }

    #[test]
    fn stress_pointer_is_never_missing_during_swaps() {
        let temp_dir = TempDir::new().expect("tempdir");
        let (a, _) = resolve(temp_dir.path(), "20240723");
        let (b, _) = resolve(temp_dir.path(), "20240724");
        fs::create_dir_all(&a.version_dir).expect("mkdir a");
        fs::create_dir_all(&b.version_dir).expect("mkdir b");
        swap_pointer(&a.production_link, Path::new("20240723")).expect("initial");

        let done = Arc::new(AtomicBool::new(false));
        let misses = Arc::new(AtomicUsize::new(0));
        let link = a.production_link.clone();

        let reader = {
            let done = Arc::clone(&done);
            let misses = Arc::clone(&misses);
            thread::spawn(move || {
                while !done.load(Ordering::SeqCst) {
                    if fs::read_link(&link).is_err() {
                        misses.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
        };

        for i in 0..500 {
            let target = if i % 2 == 0 { "20240724" } else { "20240723" };
            swap_pointer(&a.production_link, Path::new(target))
                .unwrap_or_else(|e| panic!("swap {i} failed: {e}"));
        }
        done.store(true, Ordering::SeqCst);
        reader.join().expect("reader");

        assert_eq!(misses.load(Ordering::SeqCst), 0);
        assert_eq!(
            current_target(&a.production_link),
            Some(PathBuf::from("20240723"))
        );
    }

    #[test]
    fn stress_concurrent_publishes_leave_one_valid_pointer() {
        let temp_dir = TempDir::new().expect("tempdir");
        let root = temp_dir.path().to_path_buf();
        let versions = ["20240720", "20240721", "20240722", "20240723", "20240724"];

        let handles: Vec<_> = versions
            .iter()
            .map(|v| {
                let root = root.clone();
                let v = v.to_string();
                thread::spawn(move || {
                    let (paths, version) = resolve(&root, &v);
                    for _ in 0..20 {
                        publish(&paths, &version).expect("publish");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("publisher");
        }

        let (paths, _) = resolve(&root, "20240724");
        let target = current_target(&paths.production_link).expect("pointer");
        assert!(versions.iter().any(|v| Path::new(v) == target));
        let leftovers: Vec<_> = fs::read_dir(&paths.dist_dir)
            .expect("read")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn stress_lock_acquire_release_cycle() {
        let temp_dir = TempDir::new().expect("tempdir");
        let state_dir = temp_dir.path().join(".tapdeploy");

        for i in 0..100 {
            let lock = LockFile::acquire(&state_dir)
                .unwrap_or_else(|_| panic!("Failed to acquire lock on iteration {i}"));
            assert!(LockFile::is_locked(&state_dir));
            drop(lock);
            assert!(!LockFile::is_locked(&state_dir));
        }
    }

    #[cfg(unix)]
    #[test]
    fn stress_parallel_run_with_many_markets() {
        use crate::cancel::CancelToken;
        use crate::engine::run_deploy;
        use crate::engine::test_support::{CollectingReporter, Fixture};

        let temp_dir = TempDir::new().expect("tempdir");
        let names: Vec<String> = (0..16).map(|i| format!("m{i:02}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let mut fx = Fixture::new(temp_dir.path(), &refs);
        fx.config.parallel.enabled = true;
        fx.config.parallel.max_concurrent = 8;

        let receipt = run_deploy(
            &fx.options(),
            &mut CollectingReporter::default(),
            &CancelToken::new(),
        )
        .expect("deploy");

        assert_eq!(receipt.markets.len(), 16);
        assert_eq!(receipt.result, RunResult::Success);
        for (market, name) in receipt.markets.iter().zip(&names) {
            assert_eq!(market.market.as_str(), name);
            let index = fx.frontend(name).join("dist/production/index.html");
            assert!(fs::read_to_string(index).expect("index").contains("20240724"));
        }
    }
}
