//! Hand-rolled file outputs for `events.log` and `events.jsonl`.
//!
//! These two files have an exact, externally consumed format (a
//! log4j-style text line and one JSON object per line), so they are
//! written directly rather than routed through `tracing`'s formatting
//! layers — `tracing` is reserved for the agent's own operational
//! diagnostics (see `main.rs`). Each sink owns its `File` handle behind
//! a `Mutex` and can be rebuilt in place on config reload or log
//! rotation.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use agent_core::{time::system_time_log_format, EventKind, Error, Result};
use serde::Serialize;

struct Sink {
    path: PathBuf,
    enabled: bool,
    file: Option<File>,
}

impl Sink {
    fn build(path: PathBuf, enabled: bool) -> Self {
        let file = if enabled { open_append(&path).ok() } else { None };
        Self { path, enabled, file }
    }

    fn reconfigure(&mut self, path: &Path, enabled: bool) {
        if self.path == path && self.enabled == enabled && (!enabled || self.file.is_some()) {
            return;
        }
        self.path = path.to_path_buf();
        self.enabled = enabled;
        self.file = if enabled { open_append(&self.path).ok() } else { None };
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let file = self.ensure_open()?;
        writeln!(file, "{line}").map_err(|e| Error::io(format!("writing {}", self.path.display()), e))
    }

    fn ensure_open(&mut self) -> Result<&mut File> {
        if self.file.is_none() {
            self.file = Some(open_append(&self.path)?);
        }
        Ok(self.file.as_mut().expect("just ensured Some"))
    }

    fn rotate(&mut self, ts_suffix: &str) -> Result<Option<PathBuf>> {
        self.file = None;
        if !self.path.exists() {
            return Ok(None);
        }
        let stem = self.path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
        let ext = self.path.extension().map(|s| s.to_string_lossy().to_string());
        let rotated_name = match ext {
            Some(ext) => format!("{stem}.{ts_suffix}.{ext}"),
            None => format!("{stem}.{ts_suffix}"),
        };
        let rotated = self.path.with_file_name(rotated_name);
        std::fs::rename(&self.path, &rotated)
            .map_err(|e| Error::io(format!("rotating {}", self.path.display()), e))?;
        if self.enabled {
            self.file = Some(open_append(&self.path)?);
        }
        Ok(Some(rotated))
    }
}

fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::io(format!("creating directory {}", parent.display()), e))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::io(format!("opening {}", path.display()), e))
}

/// The two product log outputs, `events.log` and `events.jsonl`.
pub struct LogSink {
    text: Mutex<Sink>,
    jsonl: Mutex<Sink>,
}

impl LogSink {
    /// Opens both sinks per the initial config's paths and feature flags.
    #[must_use]
    pub fn new(log_path: &Path, jsonl_path: &Path, text_enabled: bool, jsonl_enabled: bool) -> Self {
        Self {
            text: Mutex::new(Sink::build(log_path.to_path_buf(), text_enabled)),
            jsonl: Mutex::new(Sink::build(jsonl_path.to_path_buf(), jsonl_enabled)),
        }
    }

    /// Re-points and/or re-enables each sink if the reloaded config changed it.
    pub fn reconfigure(&self, log_path: &Path, jsonl_path: &Path, text_enabled: bool, jsonl_enabled: bool) {
        self.text.lock().unwrap_or_else(std::sync::PoisonError::into_inner).reconfigure(log_path, text_enabled);
        self.jsonl.lock().unwrap_or_else(std::sync::PoisonError::into_inner).reconfigure(jsonl_path, jsonl_enabled);
    }

    /// Appends one `events.log` line: `TIMESTAMP - INFO - KIND - rel_path`.
    pub fn write_text_event(&self, at: std::time::SystemTime, kind: EventKind, rel_path: &str) -> Result<()> {
        let line = format!("{} - INFO - {} - {rel_path}", system_time_log_format(at), kind.log_token());
        self.text.lock().unwrap_or_else(std::sync::PoisonError::into_inner).write_line(&line)
    }

    /// Appends one `events.jsonl` record for a single filtered event.
    pub fn write_jsonl_event(&self, ts: &str, kind: EventKind, path_rel: &str, path_abs: &str) -> Result<()> {
        let record = EventRecord {
            ts,
            event: kind_token(kind),
            path_rel,
            path_abs,
            is_dir: false,
        };
        self.write_jsonl_value(&record)
    }

    /// Appends one `events.jsonl` aggregate record.
    pub fn write_jsonl_aggregate(
        &self,
        ts: &str,
        window_ms: f64,
        window_start_ts: &str,
        window_end_ts: &str,
        counts: &BTreeMap<&'static str, u64>,
        debounced_skipped: Option<u64>,
    ) -> Result<()> {
        let record = AggregateRecord {
            ts,
            event: "aggregate",
            window_ms,
            window_start_ts,
            window_end_ts,
            counts,
            debounced_skipped,
        };
        self.write_jsonl_value(&record)
    }

    fn write_jsonl_value<T: Serialize>(&self, value: &T) -> Result<()> {
        let line = serde_json::to_string(value).map_err(|e| Error::json("serializing jsonl record", e))?;
        self.jsonl.lock().unwrap_or_else(std::sync::PoisonError::into_inner).write_line(&line)
    }

    /// Rotates both log files by renaming them with a timestamp suffix
    /// and reopening fresh files at the original paths. Returns the
    /// rotated paths that were actually renamed (a file that doesn't
    /// yet exist is skipped, not an error).
    pub fn rotate(&self, ts_suffix: &str) -> Result<RotatedPaths> {
        let log = self
            .text
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .rotate(ts_suffix)?;
        let jsonl = self
            .jsonl
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .rotate(ts_suffix)?;
        Ok(RotatedPaths { log, jsonl })
    }
}

/// The paths actually rotated by a `rotate_logs` command, if any.
#[derive(Debug, Default)]
pub struct RotatedPaths {
    /// The renamed `events.log`, if it existed.
    pub log: Option<PathBuf>,
    /// The renamed `events.jsonl`, if it existed.
    pub jsonl: Option<PathBuf>,
}

fn kind_token(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Created => "created",
        EventKind::Modified => "modified",
        EventKind::Deleted => "deleted",
    }
}

#[derive(Serialize)]
struct EventRecord<'a> {
    ts: &'a str,
    event: &'static str,
    path_rel: &'a str,
    path_abs: &'a str,
    is_dir: bool,
}

#[derive(Serialize)]
struct AggregateRecord<'a> {
    ts: &'a str,
    event: &'static str,
    window_ms: f64,
    window_start_ts: &'a str,
    window_end_ts: &'a str,
    counts: &'a BTreeMap<&'static str, u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    debounced_skipped: Option<u64>,
}
