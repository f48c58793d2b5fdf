//! JSONL output: the shared append-only record logs and the activity log.
//!
//! [`append_record`] serves the incident, metrics and heartbeat logs. Each
//! line is assembled in memory and handed to a single `write_all` on an
//! `O_APPEND` descriptor, so concurrent writers never interleave partial
//! lines. Failures propagate: those logs are part of the contract.
//!
//! [`ActivityWriter`] is the engine's own diagnostic trail. It never fails a
//! cycle and walks a four-level chain instead:
//! 1. Primary file path
//! 2. Fallback path
//! 3. stderr with `[RMD-JSONL]` prefix
//! 4. Silent discard

#![allow(missing_docs)]

use std::fs::{self, File, OpenOptions, rename};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::clock::format_utc_now;
use crate::core::errors::{RemedyError, Result};

// ──────────────────── record logs ────────────────────

/// Append one serialized record as a single line and `sync_data` it.
pub fn append_record<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    let (mut file, _) = open_append(path)?;
    file.write_all(line.as_bytes())
        .and_then(|()| file.sync_data())
        .map_err(|source| RemedyError::io(path, source))
}

/// Append several records, one line each, in order.
///
/// Stops at the first failure; lines already written stay written.
pub fn append_records<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    if records.is_empty() {
        return Ok(());
    }
    let mut buf = String::new();
    let (mut file, _) = open_append(path)?;
    for record in records {
        buf.clear();
        buf.push_str(&serde_json::to_string(record)?);
        buf.push('\n');
        file.write_all(buf.as_bytes())
            .map_err(|source| RemedyError::io(path, source))?;
    }
    file.sync_data().map_err(|source| RemedyError::io(path, source))
}

// ──────────────────── activity log ────────────────────

/// Activity event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityEvent {
    CycleStart,
    CycleComplete,
    LockBusy,
    LockRecovered,
    Decision,
    StateWriteFailed,
    ActionExecuted,
    ActionFailed,
    ProbeTimeout,
    Heartbeat,
    MarkerEmitted,
    Error,
}

/// Activity log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Warning,
    Critical,
}

/// One activity line. Only `ts`, `event` and `level` are always present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub ts: String,
    pub event: ActivityEvent,
    pub level: Level,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// `plan` or `real`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incident_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// RMD error code when the event reports a failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ActivityEntry {
    /// New entry stamped with the current UTC time.
    pub fn new(event: ActivityEvent, level: Level) -> Self {
        Self {
            ts: format_utc_now(),
            event,
            level,
            run_id: None,
            mode: None,
            incident_key: None,
            action: None,
            allowed: None,
            reason: None,
            duration_ms: None,
            error_code: None,
            details: None,
        }
    }

    #[must_use]
    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    #[must_use]
    pub fn error(mut self, err: &RemedyError) -> Self {
        self.error_code = Some(err.code().to_string());
        self.details = Some(err.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Normal,
    Fallback,
    Stderr,
    Discard,
}

/// Activity writer settings.
#[derive(Debug, Clone)]
pub struct ActivityConfig {
    pub path: PathBuf,
    pub fallback_path: Option<PathBuf>,
    /// Rotate once the current file would exceed this size.
    pub max_size_bytes: u64,
    pub max_rotated_files: u32,
}

impl ActivityConfig {
    /// Defaults for `path`, falling back to the system temp dir.
    #[must_use]
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fallback_path: Some(std::env::temp_dir().join("remedy-activity.jsonl")),
            max_size_bytes: 10 * 1024 * 1024,
            max_rotated_files: 3,
        }
    }
}

/// Best-effort activity log with rotation and degradation.
pub struct ActivityWriter {
    config: ActivityConfig,
    writer: Option<BufWriter<File>>,
    state: WriterState,
    bytes_written: u64,
    run_id: Option<String>,
    mode: Option<String>,
}

impl ActivityWriter {
    /// Open the activity log, degrading as far as needed.
    pub fn open(config: ActivityConfig) -> Self {
        let mut w = Self {
            config,
            writer: None,
            state: WriterState::Discard,
            bytes_written: 0,
            run_id: None,
            mode: None,
        };
        w.try_open_primary();
        w
    }

    /// Writer that drops everything.
    pub fn disabled() -> Self {
        Self {
            config: ActivityConfig::for_path(PathBuf::new()),
            writer: None,
            state: WriterState::Discard,
            bytes_written: 0,
            run_id: None,
            mode: None,
        }
    }

    /// Stamp every later entry with this run id and mode unless already set.
    pub fn set_context(&mut self, run_id: Option<String>, mode: &str) {
        self.run_id = run_id;
        self.mode = Some(mode.to_string());
    }

    pub fn write(&mut self, mut entry: ActivityEntry) {
        if entry.run_id.is_none() {
            entry.run_id.clone_from(&self.run_id);
        }
        if entry.mode.is_none() {
            entry.mode.clone_from(&self.mode);
        }
        let line = match serde_json::to_string(&entry) {
            Ok(json) => format!("{json}\n"),
            Err(e) => {
                let _ = writeln!(io::stderr(), "[RMD-JSONL] serialize error: {e}");
                return;
            }
        };
        self.write_line(&line);
    }

    /// Shorthand for an entry carrying only `details`.
    pub fn event(&mut self, event: ActivityEvent, level: Level, details: impl Into<String>) {
        self.write(ActivityEntry::new(event, level).details(details));
    }

    /// Flush buffered lines and sync them to disk.
    pub fn flush(&mut self) {
        if let Some(w) = self.writer.as_mut() {
            let _ = w.flush();
            let _ = w.get_ref().sync_data();
        }
    }

    pub fn state(&self) -> &str {
        match self.state {
            WriterState::Normal => "normal",
            WriterState::Fallback => "fallback",
            WriterState::Stderr => "stderr",
            WriterState::Discard => "discard",
        }
    }

    fn write_line(&mut self, line: &str) {
        if self.bytes_written + line.len() as u64 > self.config.max_size_bytes
            && matches!(self.state, WriterState::Normal | WriterState::Fallback)
        {
            self.rotate();
        }

        match self.state {
            WriterState::Normal | WriterState::Fallback => {
                if let Some(w) = self.writer.as_mut() {
                    if w.write_all(line.as_bytes()).is_err() {
                        self.degrade();
                        self.write_line(line);
                        return;
                    }
                    self.bytes_written += line.len() as u64;
                } else {
                    self.degrade();
                    self.write_line(line);
                }
            }
            WriterState::Stderr => {
                let _ = write!(io::stderr(), "[RMD-JSONL] {line}");
            }
            WriterState::Discard => {}
        }
    }

    fn try_open_primary(&mut self) {
        if self.config.path.as_os_str().is_empty() {
            return;
        }
        match open_append(&self.config.path) {
            Ok((file, size)) => {
                self.writer = Some(BufWriter::new(file));
                self.state = WriterState::Normal;
                self.bytes_written = size;
            }
            Err(_) => self.try_open_fallback(),
        }
    }

    fn try_open_fallback(&mut self) {
        let opened = self
            .config
            .fallback_path
            .as_deref()
            .map(|fb| (fb, open_append(fb)));
        match opened {
            Some((fb, Ok((file, size)))) => {
                let _ = writeln!(
                    io::stderr(),
                    "[RMD-JSONL] activity log unwritable, using fallback: {}",
                    fb.display()
                );
                self.writer = Some(BufWriter::new(file));
                self.state = WriterState::Fallback;
                self.bytes_written = size;
            }
            _ => {
                self.state = WriterState::Stderr;
                let _ = writeln!(
                    io::stderr(),
                    "[RMD-JSONL] activity log paths failed, using stderr"
                );
            }
        }
    }

    fn degrade(&mut self) {
        self.writer = None;
        match self.state {
            WriterState::Normal => self.try_open_fallback(),
            WriterState::Fallback => {
                self.state = WriterState::Stderr;
                let _ = writeln!(io::stderr(), "[RMD-JSONL] fallback write failed, using stderr");
            }
            WriterState::Stderr => self.state = WriterState::Discard,
            WriterState::Discard => {}
        }
    }

    fn rotate(&mut self) {
        if let Some(w) = self.writer.as_mut() {
            let _ = w.flush();
        }
        self.writer = None;

        let base = match (self.state, &self.config.fallback_path) {
            (WriterState::Normal, _) => self.config.path.clone(),
            (WriterState::Fallback, Some(fb)) => fb.clone(),
            _ => return,
        };

        for i in (1..self.config.max_rotated_files).rev() {
            let _ = rename(rotated_name(&base, i), rotated_name(&base, i + 1));
        }
        let _ = rename(&base, rotated_name(&base, 1));

        match open_append(&base) {
            Ok((file, _)) => {
                self.writer = Some(BufWriter::new(file));
                self.bytes_written = 0;
            }
            Err(_) => self.degrade(),
        }
    }
}

impl Drop for ActivityWriter {
    fn drop(&mut self) {
        self.flush();
    }
}

// ──────────────────── helpers ────────────────────

/// Open or create a file for appending. Returns `(File, current_size)`.
fn open_append(path: &Path) -> Result<(File, u64)> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|source| RemedyError::io(parent, source))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| RemedyError::io(path, source))?;
    let size = file.metadata().map(|m| m.len()).unwrap_or(0);
    Ok((file, size))
}

/// `activity.jsonl` → `activity.jsonl.2`.
fn rotated_name(base: &Path, index: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}
