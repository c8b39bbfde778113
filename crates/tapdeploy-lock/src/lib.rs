//! Lock files for tapdeploy.
//!
//! Two kinds of lock use the same mechanism:
//!
//! - the run lock (`<state_dir>/lock`) prevents two deploy runs from
//!   operating on the same state directory at once;
//! - cache-root locks (`<cache_dir>/.tapdeploy.lock`) serialize writers of a
//!   shared dependency cache when markets run in parallel.
//!
//! A lock file contains JSON metadata about the holder (PID, hostname,
//! timestamp, run id). Creation uses `create_new`, so two contenders can
//! never both believe they hold the lock.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// File name of the run lock inside the state directory.
pub const LOCK_FILE: &str = "lock";

/// File name of a cache-root lock.
pub const CACHE_LOCK_FILE: &str = ".tapdeploy.lock";

/// Information stored in the lock file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Process ID of the lock holder
    pub pid: u32,
    /// Hostname where the lock was acquired
    pub hostname: String,
    /// When the lock was acquired
    pub acquired_at: DateTime<Utc>,
    /// Run being executed by the holder, once known
    pub run_id: Option<String>,
    /// Free-form label of what the lock protects (e.g. `cache:backend`)
    pub purpose: Option<String>,
}

/// Lock file handle that releases on Drop
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    released: bool,
}

impl LockFile {
    /// Acquire the run lock in `state_dir`.
    ///
    /// Fails if a lock already exists. Use [`LockFile::acquire_with_timeout`]
    /// for stale lock handling.
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        Self::acquire_at(&state_dir.join(LOCK_FILE), None)
    }

    /// Acquire the run lock, replacing an existing lock older than `stale_after`.
    pub fn acquire_with_timeout(state_dir: &Path, stale_after: Duration) -> Result<Self> {
        let lock_path = state_dir.join(LOCK_FILE);
        remove_if_stale(&lock_path, stale_after)?;
        Self::acquire_at(&lock_path, None)
    }

    /// Acquire the lock guarding a cache root, waiting up to `wait` for the
    /// current holder to release it.
    pub fn acquire_cache(
        cache_dir: &Path,
        purpose: &str,
        wait: Duration,
        stale_after: Duration,
    ) -> Result<Self> {
        let lock_path = cache_dir.join(CACHE_LOCK_FILE);
        let deadline = Instant::now() + wait;
        loop {
            remove_if_stale(&lock_path, stale_after)?;
            match Self::acquire_at(&lock_path, Some(purpose)) {
                Ok(lock) => return Ok(lock),
                Err(err) if Instant::now() >= deadline => {
                    return Err(err.context(format!(
                        "timed out after {:?} waiting for cache lock {}",
                        wait,
                        lock_path.display()
                    )));
                }
                Err(_) => thread::sleep(Duration::from_millis(50)),
            }
        }
    }

    fn acquire_at(lock_path: &Path, purpose: Option<&str>) -> Result<Self> {
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create lock dir {}", parent.display()))?;
        }

        let info = LockInfo {
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            acquired_at: Utc::now(),
            run_id: None,
            purpose: purpose.map(str::to_string),
        };
        let json = serde_json::to_string_pretty(&info).context("failed to serialize lock info")?;

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return match read_lock_info_from_path(lock_path) {
                    Ok(existing) => bail!(
                        "lock already held by pid {} on {} since {} (run_id: {:?})",
                        existing.pid,
                        existing.hostname,
                        existing.acquired_at,
                        existing.run_id
                    ),
                    Err(_) => bail!("lock already held at {}", lock_path.display()),
                };
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to create lock file {}", lock_path.display()));
            }
        };

        let written = file
            .write_all(json.as_bytes())
            .and_then(|_| file.sync_all());
        if let Err(e) = written {
            let _ = fs::remove_file(lock_path);
            return Err(e)
                .with_context(|| format!("failed to write lock file {}", lock_path.display()));
        }

        Ok(Self {
            path: lock_path.to_path_buf(),
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock file
    pub fn release(&mut self) -> Result<()> {
        if !self.released && self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("failed to remove lock file {}", self.path.display()))?;
        }
        self.released = true;
        Ok(())
    }

    /// Record the run id in the lock file
    pub fn set_run_id(&self, run_id: &str) -> Result<()> {
        if !self.path.exists() {
            bail!("lock file does not exist at {}", self.path.display());
        }

        let mut info = read_lock_info_from_path(&self.path)?;
        info.run_id = Some(run_id.to_string());

        let json = serde_json::to_string_pretty(&info).context("failed to serialize lock info")?;

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp_path).with_context(|| {
                format!("failed to create lock tmp file {}", tmp_path.display())
            })?;
            file.write_all(json.as_bytes())
                .with_context(|| format!("failed to write lock tmp file {}", tmp_path.display()))?;
            file.sync_all().context("failed to sync lock file")?;
        }

        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to rename lock file to {}", self.path.display()))?;

        Ok(())
    }

    /// Check if the run lock exists
    pub fn is_locked(state_dir: &Path) -> bool {
        state_dir.join(LOCK_FILE).exists()
    }

    /// Read the run lock information
    pub fn read_lock_info(state_dir: &Path) -> Result<LockInfo> {
        read_lock_info_from_path(&state_dir.join(LOCK_FILE))
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

fn remove_if_stale(lock_path: &Path, stale_after: Duration) -> Result<()> {
    if !lock_path.exists() {
        return Ok(());
    }
    match read_lock_info_from_path(lock_path) {
        Ok(info) => {
            let age = Utc::now() - info.acquired_at;
            if age.num_seconds().unsigned_abs() > stale_after.as_secs() {
                remove_lock(lock_path, "stale")?;
            }
        }
        // A half-written lock from a contender that is still writing it looks
        // corrupt; only treat it as garbage once it is old enough.
        Err(_) => {
            let old_enough = fs::metadata(lock_path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.elapsed().ok())
                .is_some_and(|age| age > Duration::from_secs(5));
            if old_enough {
                remove_lock(lock_path, "corrupt")?;
            }
        }
    }
    Ok(())
}

fn remove_lock(lock_path: &Path, why: &str) -> Result<()> {
    match fs::remove_file(lock_path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| {
            format!("failed to remove {why} lock file {}", lock_path.display())
        }),
    }
}

fn read_lock_info_from_path(path: &Path) -> Result<LockInfo> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read lock file {}", path.display()))?;
    let info: LockInfo = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse lock JSON from {}", path.display()))?;
    Ok(info)
}

/// Get the run lock path for a state directory
pub fn lock_path(state_dir: &Path) -> PathBuf {
    state_dir.join(LOCK_FILE)
}
