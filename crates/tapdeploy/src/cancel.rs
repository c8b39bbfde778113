use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::state;

/// Cooperative cancellation shared by every worker of a run.
///
/// A run is cancelled when [`CancelToken::cancel`] is called or when the
/// abort sentinel file appears in the state directory (`tapdeploy abort`
/// from another shell). Workers only check the token between phases, so an
/// in-flight publish always completes.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    sentinel: Option<PathBuf>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token that also observes the abort sentinel under `state_dir`.
    pub fn with_sentinel(state_dir: &Path) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            sentinel: Some(state::abort_path(state_dir)),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        match &self.sentinel {
            Some(path) if path.exists() => {
                self.flag.store(true, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn cancel_is_visible_to_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn sentinel_file_cancels_and_sticks() {
        let td = tempdir().expect("tempdir");
        let token = CancelToken::with_sentinel(td.path());
        assert!(!token.is_cancelled());

        state::request_abort(td.path()).expect("abort");
        assert!(token.is_cancelled());

        state::clear_abort(td.path()).expect("clear");
        assert!(token.is_cancelled());
    }
}
