//! Progress reporting with TTY detection.
//!
//! On a terminal the deploy shows a spinner with the latest step and prints
//! messages above it; otherwise it degrades to the plain `[info]` lines the
//! other commands use.

use std::time::{Duration, Instant};

use atty::Stream;
use indicatif::{ProgressBar, ProgressStyle};
use tapdeploy::engine::Reporter;

/// Detects whether stderr is connected to a TTY.
pub fn is_tty() -> bool {
    atty::is(Stream::Stderr)
}

/// Reporter for `deploy` that keeps a spinner on TTYs.
pub struct ProgressReporter {
    is_tty: bool,
    /// Number of markets in the run
    total_markets: usize,
    /// Markets that reported a final health so far
    finished: usize,
    progress_bar: Option<ProgressBar>,
    start_time: Instant,
}

impl ProgressReporter {
    pub fn new(total_markets: usize) -> Self {
        let is_tty = is_tty();
        let progress_bar = if is_tty {
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner} [{elapsed}] {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            pb.enable_steady_tick(Duration::from_millis(120));
            Some(pb)
        } else {
            None
        };

        Self {
            is_tty,
            total_markets,
            finished: 0,
            progress_bar,
            start_time: Instant::now(),
        }
    }

    /// Reporter that never draws, regardless of the terminal.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn silent(total_markets: usize) -> Self {
        Self {
            is_tty: false,
            total_markets,
            finished: 0,
            progress_bar: None,
            start_time: Instant::now(),
        }
    }

    fn emit(&mut self, level: &str, msg: &str) {
        if is_market_summary(msg) {
            self.finished += 1;
        }
        match &self.progress_bar {
            Some(pb) if self.is_tty => {
                pb.println(format!("[{level}] {msg}"));
                pb.set_message(format!(
                    "[{}/{}] {msg}",
                    self.finished, self.total_markets
                ));
            }
            _ => eprintln!("[{level}] {msg}"),
        }
    }

    pub fn finish(self) {
        let elapsed = humantime::format_duration(Duration::from_secs(
            self.start_time.elapsed().as_secs(),
        ));
        let msg = format!(
            "finished {}/{} market(s) in {elapsed}",
            self.finished, self.total_markets
        );
        match self.progress_bar {
            Some(pb) if self.is_tty => pb.finish_with_message(msg),
            _ => eprintln!("[info] {msg}"),
        }
    }
}

impl Reporter for ProgressReporter {
    fn info(&mut self, msg: &str) {
        self.emit("info", msg);
    }

    fn warn(&mut self, msg: &str) {
        self.emit("warn", msg);
    }

    fn error(&mut self, msg: &str) {
        self.emit("error", msg);
    }
}

/// Whether `msg` is the engine's final line for a market.
fn is_market_summary(msg: &str) -> bool {
    msg.ends_with(": healthy")
        || msg.ends_with(": failed")
        || (msg.contains(": degraded (") && msg.ends_with("note(s))"))
}
