//! Per-cycle metrics and heartbeat records.

use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::clock::Timestamp;
use crate::core::errors::{RemedyError, Result};
use crate::daemon::runner::Mode;

/// Planned outgoing messages, split by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageEventsByType {
    /// Guard trips and other policy incidents.
    pub alert: u64,
    /// Allowed `escalate` actions.
    pub escalation: u64,
    /// Markers and probe warnings.
    pub other: u64,
}

impl MessageEventsByType {
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.alert + self.escalation + self.other
    }
}

/// One line of the metrics log, written once per completed cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub ts: Timestamp,
    pub mode: Mode,
    #[serde(default = "one")]
    pub runs_total: u64,
    #[serde(default)]
    pub planned_safe_auto: u64,
    #[serde(default)]
    pub planned_risky: u64,
    /// 0 or 1.
    #[serde(default)]
    pub state_write_failed: u8,
    /// 0 or 1.
    #[serde(default)]
    pub restart_loop_blocked: u8,
    /// 0 or 1.
    #[serde(default)]
    pub circuit_breaker_triggered: u8,
    #[serde(default)]
    pub malformed_lines: u64,
    #[serde(default)]
    pub dedup_suppressed: u64,
    #[serde(default)]
    pub stale_cleaned: u64,
    #[serde(default)]
    pub executed: u64,
    #[serde(default)]
    pub message_events_total: u64,
    #[serde(default)]
    pub message_events_by_type: MessageEventsByType,
    #[serde(default)]
    pub message_events_suppressed: u64,
}

const fn one() -> u64 {
    1
}

impl MetricsRecord {
    /// Zeroed record for a cycle that ran in `mode` at `ts`.
    #[must_use]
    pub fn new(ts: Timestamp, mode: Mode) -> Self {
        Self {
            ts,
            mode,
            runs_total: 1,
            planned_safe_auto: 0,
            planned_risky: 0,
            state_write_failed: 0,
            restart_loop_blocked: 0,
            circuit_breaker_triggered: 0,
            malformed_lines: 0,
            dedup_suppressed: 0,
            stale_cleaned: 0,
            executed: 0,
            message_events_total: 0,
            message_events_by_type: MessageEventsByType::default(),
            message_events_suppressed: 0,
        }
    }
}

/// Written when a cycle found nothing to act on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub ts: Timestamp,
    pub source: String,
    pub mode: Mode,
    pub status: String,
    pub active_incidents: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

/// Metrics lines at or after `since`, plus the count of unparseable lines.
pub fn read_metrics(path: &Path, since: Timestamp) -> Result<(Vec<MetricsRecord>, usize)> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(RemedyError::io(path, e)),
    };
    let mut records = Vec::new();
    let mut malformed = 0;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| RemedyError::io(path, e))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<MetricsRecord>(line) {
            Ok(rec) if rec.ts >= since => records.push(rec),
            Ok(_) => {}
            Err(_) => malformed += 1,
        }
    }
    Ok((records, malformed))
}
