//! Release publication: version directory, placeholder fallback and the
//! atomic `production` pointer swap.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tapdeploy_types::{DeploymentPaths, PublishResult, ReleaseVersion};

use crate::error::DeployError;

/// Marker written next to placeholder assets.
pub const PLACEHOLDER_MARKER: &str = ".tapdeploy-placeholder";

const PLACEHOLDER_INDEX: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="robots" content="noindex">
<title>Maintenance</title>
</head>
<body>
<h1>We'll be back shortly</h1>
<p>This site is being updated. Please try again in a few minutes.</p>
</body>
</html>
"#;

static TEMP_LINK_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Publish `version` for one market.
///
/// Creates the version directory if needed, fills it with placeholder assets
/// when it is empty, then repoints `production` at it with a rename so
/// readers never observe a missing pointer. Publishing the same version again
/// yields the same layout and the same result.
pub fn publish(paths: &DeploymentPaths, version: &ReleaseVersion) -> Result<PublishResult, DeployError> {
    let version_dir = &paths.version_dir;
    fs::create_dir_all(version_dir).map_err(|e| DeployError::publish_io(version_dir, e))?;

    let emergency_fallback_used = if is_placeholder(version_dir) {
        true
    } else if dir_has_entries(version_dir) {
        false
    } else {
        write_placeholder(version_dir)?;
        true
    };

    swap_pointer(&paths.production_link, Path::new(version.as_str()))?;

    Ok(PublishResult {
        market: paths.market.clone(),
        version_published: version.clone(),
        version_dir: version_dir.clone(),
        symlink_swapped: true,
        emergency_fallback_used,
    })
}

/// Whether the directory holds emergency placeholder content.
pub fn is_placeholder(dir: &Path) -> bool {
    dir.join(PLACEHOLDER_MARKER).is_file()
}

/// Whether `dir` exists and has at least one entry.
pub fn dir_has_entries(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Remove every entry below `dir`, keeping `dir` itself.
pub fn clear_dir(dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

fn write_placeholder(dir: &Path) -> Result<(), DeployError> {
    let index = dir.join("index.html");
    fs::write(&index, PLACEHOLDER_INDEX).map_err(|e| DeployError::publish_io(&index, e))?;
    let marker = dir.join(PLACEHOLDER_MARKER);
    fs::write(&marker, chrono::Utc::now().to_rfc3339())
        .map_err(|e| DeployError::publish_io(&marker, e))?;
    Ok(())
}

/// Point `link` at `target` atomically.
///
/// A uniquely named temporary link is created next to `link` and renamed
/// over it. The final name is never removed first, so concurrent readers see
/// either the old or the new target and concurrent writers leave the last
/// rename in place.
pub fn swap_pointer(link: &Path, target: &Path) -> Result<(), DeployError> {
    let parent = link.parent().unwrap_or(Path::new("."));
    let name = link
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = parent.join(format!(
        ".{name}.tmp-{}-{}",
        std::process::id(),
        TEMP_LINK_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    if fs::symlink_metadata(&tmp).is_ok() {
        fs::remove_file(&tmp).map_err(|e| DeployError::publish_io(&tmp, e))?;
    }
    make_symlink(target, &tmp).map_err(|e| DeployError::publish_io(&tmp, e))?;

    if let Err(e) = fs::rename(&tmp, link) {
        let _ = fs::remove_file(&tmp);
        return Err(DeployError::publish_io(link, e));
    }
    Ok(())
}

/// Directory the pointer currently resolves to, if any.
pub fn current_target(link: &Path) -> Option<PathBuf> {
    fs::read_link(link).ok()
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

#[cfg(test)]
mod tests {
    use tapdeploy_types::Market;
    use tempfile::tempdir;

    use super::*;
    use crate::paths::PathResolver;

    fn resolve(root: &Path, market: &str, version: &str) -> (DeploymentPaths, ReleaseVersion) {
        let resolver = PathResolver::new(root.join("backend"), root.join("frontend"));
        let version = ReleaseVersion::parse(version).expect("version");
        let paths = resolver.resolve(&Market::parse(market).expect("market"), &version);
        (paths, version)
    }

    #[test]
    fn publishes_existing_build_without_fallback() {
        let td = tempdir().expect("tempdir");
        let (paths, version) = resolve(td.path(), "pl", "20240724");
        fs::create_dir_all(&paths.version_dir).expect("mkdir");
        fs::write(paths.version_dir.join("app.js"), "console.log(1)").expect("write");

        let result = publish(&paths, &version).expect("publish");
        assert!(result.symlink_swapped);
        assert!(!result.emergency_fallback_used);
        assert_eq!(
            current_target(&paths.production_link),
            Some(PathBuf::from("20240724"))
        );
        assert_eq!(
            fs::canonicalize(&paths.production_link).expect("resolve"),
            fs::canonicalize(&paths.version_dir).expect("resolve")
        );
    }

    #[test]
    fn empty_build_yields_non_empty_placeholder_release() {
        let td = tempdir().expect("tempdir");
        let (paths, version) = resolve(td.path(), "gr", "20240724");

        let result = publish(&paths, &version).expect("publish");
        assert!(result.emergency_fallback_used);
        assert!(dir_has_entries(&paths.production_link));
        let index =
            fs::read_to_string(paths.production_link.join("index.html")).expect("placeholder");
        assert!(index.contains("Maintenance"));
        assert!(is_placeholder(&paths.version_dir));
    }

    #[test]
    fn publish_is_idempotent() {
        let td = tempdir().expect("tempdir");
        let (paths, version) = resolve(td.path(), "gr", "20240724");

        let first = publish(&paths, &version).expect("first");
        let listing = |dir: &Path| {
            let mut names: Vec<String> = fs::read_dir(dir)
                .expect("read")
                .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            names
        };
        let version_entries = listing(&paths.version_dir);
        let dist_entries = listing(&paths.dist_dir);

        let second = publish(&paths, &version).expect("second");
        assert_eq!(first, second);
        assert_eq!(listing(&paths.version_dir), version_entries);
        assert_eq!(listing(&paths.dist_dir), dist_entries);
        assert_eq!(dist_entries, vec!["20240724", "production"]);
    }

    #[test]
    fn rebuilt_placeholder_release_publishes_without_fallback() {
        let td = tempdir().expect("tempdir");
        let (paths, version) = resolve(td.path(), "gr", "20240724");
        let first = publish(&paths, &version).expect("first");
        assert!(first.emergency_fallback_used);

        // A later build of the same version replaces the placeholder.
        clear_dir(&paths.version_dir).expect("clear");
        fs::write(paths.version_dir.join("index.html"), "real").expect("write");

        let second = publish(&paths, &version).expect("second");
        assert!(!second.emergency_fallback_used);
        assert!(!is_placeholder(&paths.version_dir));
        assert_eq!(
            current_target(&paths.production_link),
            Some(PathBuf::from("20240724"))
        );
        let served = fs::read_to_string(paths.production_link.join("index.html")).expect("read");
        assert_eq!(served, "real");
    }

    #[test]
    fn publishing_a_new_version_moves_the_pointer() {
        let td = tempdir().expect("tempdir");
        let (old_paths, old) = resolve(td.path(), "uk", "20240723");
        let (new_paths, new) = resolve(td.path(), "uk", "20240724");
        fs::create_dir_all(&new_paths.version_dir).expect("mkdir");
        fs::write(new_paths.version_dir.join("index.html"), "new").expect("write");

        publish(&old_paths, &old).expect("old");
        publish(&new_paths, &new).expect("new");

        assert_eq!(
            current_target(&new_paths.production_link),
            Some(PathBuf::from("20240724"))
        );
        assert!(old_paths.version_dir.is_dir());
    }

    #[test]
    fn swap_refuses_to_replace_a_real_directory() {
        let td = tempdir().expect("tempdir");
        let (paths, version) = resolve(td.path(), "pl", "20240724");
        fs::create_dir_all(paths.production_link.join("keep")).expect("mkdir");

        let err = publish(&paths, &version).expect_err("must fail");
        assert!(matches!(err, DeployError::PublishIo { .. }));
        assert!(paths.production_link.join("keep").is_dir());
        let leftovers: Vec<_> = fs::read_dir(&paths.dist_dir)
            .expect("read")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn unwritable_dist_is_publish_io() {
        use std::os::unix::fs::PermissionsExt;

        let td = tempdir().expect("tempdir");
        let (paths, version) = resolve(td.path(), "pl", "20240724");
        fs::create_dir_all(&paths.frontend_dir).expect("mkdir");
        let mut perms = fs::metadata(&paths.frontend_dir).expect("meta").permissions();
        perms.set_mode(0o555);
        fs::set_permissions(&paths.frontend_dir, perms).expect("chmod");

        let result = publish(&paths, &version);

        let mut perms = fs::metadata(&paths.frontend_dir).expect("meta").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&paths.frontend_dir, perms).expect("chmod back");

        // Root ignores directory permissions.
        if paths.dist_dir.exists() {
            return;
        }
        assert!(matches!(result, Err(DeployError::PublishIo { .. })));
    }

    #[test]
    fn clear_dir_keeps_the_directory() {
        let td = tempdir().expect("tempdir");
        let dir = td.path().join("out");
        fs::create_dir_all(dir.join("nested/deeper")).expect("mkdir");
        fs::write(dir.join("a.txt"), "a").expect("write");

        clear_dir(&dir).expect("clear");
        assert!(dir.is_dir());
        assert!(!dir_has_entries(&dir));
    }
}
