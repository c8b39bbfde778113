//! Event logging for tapdeploy runs.
//!
//! Events are buffered in memory and appended to `events.jsonl` in the
//! state directory, one JSON object per line. The log is append-only across
//! runs; every line carries the market it relates to (or `all`).
//!
//! # Example
//!
//! ```
//! use tapdeploy_events::EventLog;
//! use tapdeploy_types::{DeployEvent, EventType};
//!
//! let mut log = EventLog::new();
//! log.record(DeployEvent::now("pl", EventType::MarketStarted));
//! assert_eq!(log.len(), 1);
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tapdeploy_types::DeployEvent;

/// Default events file name
pub const EVENTS_FILE: &str = "events.jsonl";

/// Get the events file path for a state directory
pub fn events_path(state_dir: &Path) -> PathBuf {
    state_dir.join(EVENTS_FILE)
}

/// Append-only event log for deploy runs.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<DeployEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn record(&mut self, event: DeployEvent) {
        self.events.push(event);
    }

    /// Append all buffered events to `path` in JSONL format.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create events dir {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;

        let mut writer = std::io::BufWriter::new(file);

        for event in &self.events {
            let line = serde_json::to_string(event).context("failed to serialize event to JSON")?;
            writeln!(writer, "{}", line).context("failed to write event line")?;
        }

        writer.flush().context("failed to flush events file")?;

        Ok(())
    }

    /// Append buffered events to `path` and clear the buffer.
    pub fn flush_to(&mut self, path: &Path) -> Result<()> {
        self.write_to_file(path)?;
        self.clear();
        Ok(())
    }

    /// Read all events from a JSONL file. A missing file is an empty log.
    pub fn read_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let file = File::open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;

        let reader = BufReader::new(file);
        let mut events = Vec::new();

        for line in reader.lines() {
            let line = line.with_context(|| {
                format!("failed to read line from events file {}", path.display())
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let event: DeployEvent = serde_json::from_str(&line)
                .with_context(|| format!("failed to parse event JSON from line: {}", line))?;
            events.push(event);
        }

        Ok(Self { events })
    }

    pub fn events_for_market(&self, market: &str) -> Vec<&DeployEvent> {
        self.events.iter().filter(|e| e.market == market).collect()
    }

    pub fn all_events(&self) -> &[DeployEvent] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
