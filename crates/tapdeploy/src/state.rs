use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tapdeploy_types::RunReceipt;

/// Current receipt schema version
pub const CURRENT_RECEIPT_VERSION: &str = "tapdeploy.receipt.v1";

pub const RECEIPT_FILE: &str = "receipt.json";

/// Sentinel file that asks a running deploy to stop starting markets.
pub const ABORT_FILE: &str = "abort";

pub fn receipt_path(state_dir: &Path) -> PathBuf {
    state_dir.join(RECEIPT_FILE)
}

pub fn abort_path(state_dir: &Path) -> PathBuf {
    state_dir.join(ABORT_FILE)
}

pub fn write_receipt(state_dir: &Path, receipt: &RunReceipt) -> Result<()> {
    fs::create_dir_all(state_dir)
        .with_context(|| format!("failed to create state dir {}", state_dir.display()))?;

    let path = receipt_path(state_dir);
    atomic_write_json(&path, receipt)
}

pub fn load_receipt(state_dir: &Path) -> Result<Option<RunReceipt>> {
    let path = receipt_path(state_dir);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read receipt file {}", path.display()))?;
    parse_receipt(&content)
        .with_context(|| format!("failed to parse receipt JSON {}", path.display()))
        .map(Some)
}

/// Parse and version-check a receipt document.
pub fn parse_receipt(content: &str) -> Result<RunReceipt> {
    let receipt: RunReceipt = serde_json::from_str(content)?;
    if receipt.receipt_version != CURRENT_RECEIPT_VERSION {
        bail!(
            "unsupported receipt version {:?} (expected {CURRENT_RECEIPT_VERSION})",
            receipt.receipt_version
        );
    }
    Ok(receipt)
}

pub fn request_abort(state_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(state_dir)
        .with_context(|| format!("failed to create state dir {}", state_dir.display()))?;
    let path = abort_path(state_dir);
    fs::write(&path, chrono::Utc::now().to_rfc3339())
        .with_context(|| format!("failed to write abort file {}", path.display()))?;
    Ok(path)
}

pub fn abort_requested(state_dir: &Path) -> bool {
    abort_path(state_dir).exists()
}

pub fn clear_abort(state_dir: &Path) -> Result<()> {
    let path = abort_path(state_dir);
    if path.exists() {
        fs::remove_file(&path)
            .with_context(|| format!("failed to remove abort file {}", path.display()))?;
    }
    Ok(())
}

fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let data = serde_json::to_vec_pretty(value).context("failed to serialize JSON")?;

    {
        let mut f = fs::File::create(&tmp)
            .with_context(|| format!("failed to create tmp file {}", tmp.display()))?;
        f.write_all(&data)
            .with_context(|| format!("failed to write tmp file {}", tmp.display()))?;
        f.sync_all().ok();
    }

    fs::rename(&tmp, path).with_context(|| {
        format!(
            "failed to rename tmp file {} to {}",
            tmp.display(),
            path.display()
        )
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tapdeploy_types::{EnvironmentFingerprint, ReleaseVersion, RunResult};
    use tempfile::tempdir;

    use super::*;

    fn sample_receipt(state_dir: &Path) -> RunReceipt {
        RunReceipt {
            receipt_version: CURRENT_RECEIPT_VERSION.to_string(),
            run_id: "abc123".to_string(),
            version: ReleaseVersion::parse("20240724").expect("version"),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            result: RunResult::Success,
            not_started: vec![],
            markets: vec![],
            event_log_path: state_dir.join("events.jsonl"),
            environment: EnvironmentFingerprint {
                tapdeploy_version: "0.1.0".to_string(),
                hostname: "deploy-1".to_string(),
                os: "linux".to_string(),
                arch: "x86_64".to_string(),
                composer_version: None,
                npm_version: None,
                git_version: None,
            },
        }
    }

    #[test]
    fn receipt_write_and_load() {
        let td = tempdir().expect("tempdir");
        let state_dir = td.path().join("state");

        assert!(load_receipt(&state_dir).expect("load").is_none());

        write_receipt(&state_dir, &sample_receipt(&state_dir)).expect("write");
        let loaded = load_receipt(&state_dir).expect("load").expect("receipt");
        assert_eq!(loaded.run_id, "abc123");
        assert_eq!(loaded.result, RunResult::Success);
        assert!(!state_dir.join("receipt.tmp").exists());
    }

    #[test]
    fn rejects_foreign_receipt_version() {
        let td = tempdir().expect("tempdir");
        let mut receipt = sample_receipt(td.path());
        receipt.receipt_version = "tapdeploy.receipt.v0".to_string();
        let json = serde_json::to_string(&receipt).expect("json");

        let err = parse_receipt(&json).expect_err("must fail");
        assert!(err.to_string().contains("unsupported receipt version"));
    }

    #[test]
    fn corrupt_receipt_reports_path() {
        let td = tempdir().expect("tempdir");
        fs::write(receipt_path(td.path()), "{not json").expect("write");
        let err = load_receipt(td.path()).expect_err("must fail");
        assert!(format!("{err:#}").contains("failed to parse receipt JSON"));
    }

    #[test]
    fn abort_sentinel_lifecycle() {
        let td = tempdir().expect("tempdir");
        assert!(!abort_requested(td.path()));
        let path = request_abort(td.path()).expect("abort");
        assert_eq!(path, abort_path(td.path()));
        assert!(abort_requested(td.path()));
        clear_abort(td.path()).expect("clear");
        assert!(!abort_requested(td.path()));
        clear_abort(td.path()).expect("clear twice");
    }
}
