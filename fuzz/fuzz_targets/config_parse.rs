#![no_main]

use std::path::Path;

use libfuzzer_sys::fuzz_target;
use tapdeploy_config::{CliOverrides, DeployConfig};

fuzz_target!(|data: &[u8]| {
    let Ok(content) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(cfg) = DeployConfig::parse(content) else {
        return;
    };
    if cfg.validate().is_ok() {
        // A valid config with a release label always yields run options.
        let cli = CliOverrides {
            version: Some("20240724".to_string()),
            ..CliOverrides::default()
        };
        let opts = cfg
            .build_run_options(Path::new("/srv/project"), cli)
            .expect("valid config must build");
        assert_eq!(opts.markets.len(), cfg.markets.len());
    }
});
