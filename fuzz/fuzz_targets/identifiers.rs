#![no_main]

use std::path::{Component, Path};

use libfuzzer_sys::fuzz_target;
use tapdeploy::paths::PathResolver;
use tapdeploy_types::{Market, ReleaseVersion};

fuzz_target!(|input: (&str, &str)| {
    let (market, version) = input;
    let (Ok(market), Ok(version)) = (Market::parse(market), ReleaseVersion::parse(version)) else {
        return;
    };

    // Accepted identifiers never escape their base directories.
    let paths = PathResolver::new("/b", "/f").resolve(&market, &version);
    assert!(paths.backend_dir.starts_with("/b"));
    assert!(paths.version_dir.starts_with(&paths.dist_dir));
    assert_ne!(paths.version_dir, paths.production_link);
    for component in Path::new(version.as_str()).components() {
        assert!(matches!(component, Component::Normal(_)));
    }
});
