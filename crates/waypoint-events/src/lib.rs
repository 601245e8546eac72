//! Structured event trail for the bundle engine.
//!
//! The out-of-scope UI front-end (`spec.md` §1) consumes progress and decision
//! notifications as a callback sink; internally, every component appends a
//! structured record of what it decided to an append-only JSONL log so the
//! sink — or a human debugging a failed Apply — has a durable, replayable
//! trail without the core depending on any concrete logging backend.
//!
//! # Example
//!
//! ```
//! use waypoint_events::{EventLog, events_path};
//! use waypoint_types::EngineEvent;
//! use chrono::Utc;
//!
//! let mut log = EventLog::new();
//! log.record(EngineEvent::PlanComputed { action: "install".into(), packages_total: 3 });
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use waypoint_types::EngineEvent;

pub const EVENTS_FILE: &str = "events.jsonl";

pub fn events_path(root: &Path) -> PathBuf {
    root.join(EVENTS_FILE)
}

/// Append-only event log for engine decisions.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<EngineEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn record(&mut self, event: EngineEvent) {
        self.events.push(event);
    }

    /// Append all recorded-but-unwritten events to `path` in JSONL format.
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
            let line = serde_json::to_string(event).context("failed to serialize event")?;
            writeln!(writer, "{line}").context("failed to write event line")?;
        }
        writer.flush().context("failed to flush events file")?;
        Ok(())
    }

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
            let event: EngineEvent = serde_json::from_str(&line)
                .with_context(|| format!("failed to parse event JSON from line: {line}"))?;
            events.push(event);
        }

        Ok(Self { events })
    }

    pub fn events_for_package<'a>(&'a self, package_id: &str) -> Vec<&'a EngineEvent> {
        self.events.iter().filter(|e| e.package_id() == Some(package_id)).collect()
    }

    pub fn all_events(&self) -> &[EngineEvent] {
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

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use waypoint_types::ExitCodeClass;

    fn sample(package_id: &str) -> EngineEvent {
        EngineEvent::PackageExecuteStarted { package_id: package_id.to_string() }
    }

    #[test]
    fn new_event_log_is_empty() {
        let log = EventLog::new();
        assert!(log.is_empty());
    }

    #[test]
    fn record_adds_event() {
        let mut log = EventLog::new();
        log.record(sample("P"));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn events_for_package_filters() {
        let mut log = EventLog::new();
        log.record(sample("A"));
        log.record(sample("B"));
        assert_eq!(log.events_for_package("A").len(), 1);
    }

    #[test]
    fn write_then_read_round_trips() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("events.jsonl");

        let mut log = EventLog::new();
        log.record(sample("P"));
        log.record(EngineEvent::PackageExecuteFinished {
            package_id: "P".into(),
            class: ExitCodeClass::Ok,
        });
        log.write_to_file(&path).expect("write");

        let loaded = EventLog::read_from_file(&path).expect("read");
        assert_eq!(loaded.len(), 2);
    }

    #[test]
    fn write_appends_across_calls() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("events.jsonl");

        let mut log1 = EventLog::new();
        log1.record(sample("P"));
        log1.write_to_file(&path).expect("write first");

        let mut log2 = EventLog::new();
        log2.record(sample("Q"));
        log2.write_to_file(&path).expect("write second");

        let loaded = EventLog::read_from_file(&path).expect("read");
        assert_eq!(loaded.len(), 2);
    }

    #[test]
    fn read_missing_file_returns_empty() {
        let td = tempdir().expect("tempdir");
        let loaded = EventLog::read_from_file(&td.path().join("missing.jsonl")).expect("read");
        assert!(loaded.is_empty());
    }

    #[test]
    fn path_helper() {
        let base = PathBuf::from("x");
        assert_eq!(events_path(&base), PathBuf::from("x").join(EVENTS_FILE));
    }

    #[test]
    fn clear_empties_log() {
        let mut log = EventLog::new();
        log.record(sample("P"));
        log.clear();
        assert!(log.is_empty());
    }
}
