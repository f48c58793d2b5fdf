//! Incident-log record variants, identity keys, and strict line parsing.
//!
//! Every line of the incident log is validated here and turned into a tagged
//! [`LogRecord`]. Anything that cannot be validated is reported as
//! [`Malformed`] and never travels further downstream.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::core::clock::{Timestamp, parse_utc};

/// Incident types the engine itself appends.
pub mod kinds {
    /// Type of resolution markers (`ref_id` closes an earlier record).
    pub const RESOLVED: &str = "resolved";
    /// Failure report for a previously allowed action; feeds the breaker.
    pub const REMEDIATION_FAILED: &str = "remediation_failed";
    pub const CIRCUIT_BREAKER: &str = "mekhanik_circuit_breaker";
    pub const RETRY_BUDGET_EXCEEDED: &str = "retry_budget_exceeded";
    pub const RESTART_LOOP_BLOCKED: &str = "restart_loop_blocked";
    pub const INVALID_INPUT: &str = "invalid_input";
    pub const STATE_WRITE_FAILED: &str = "state_write_failed";
    pub const STALE_LOCK_RECOVERED: &str = "stale_lock_recovered";
    pub const PROBE_TIMEOUT: &str = "probe_timeout";
    /// Real-mode marker: active criticals were seen, nothing was executed.
    pub const REAL_DETECTED_CRITICAL: &str = "mekhanik_real_detected_critical";
}

// ──────────────────── severity ────────────────────

/// Incident severity as written by collectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    #[serde(alias = "warning")]
    Warn,
    Critical,
}

impl Severity {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "critical" => Some(Self::Critical),
            "warn" | "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::Warn => write!(f, "warn"),
            Self::Info => write!(f, "info"),
        }
    }
}

// ──────────────────── records ────────────────────

/// A single reported fault or state change. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Incident type. Empty when the producer omitted it.
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: Severity,
    #[serde(default)]
    pub source: String,
    #[serde(rename = "jobId", alias = "job", default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub ts: Timestamp,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl IncidentRecord {
    /// Build a record authored by the engine, with a content-derived id.
    #[must_use]
    pub fn emitted(
        kind: &str,
        severity: Severity,
        source: &str,
        ts: Timestamp,
        msg: impl Into<String>,
        detail: Option<Value>,
    ) -> Self {
        let msg = msg.into();
        let digest = short_hash(&format!("{kind}|{source}|{}|{msg}", ts.timestamp_millis()));
        Self {
            id: Some(format!("{source}-{digest}")),
            kind: kind.to_string(),
            severity,
            source: source.to_string(),
            job_id: None,
            ts,
            msg,
            resolved: false,
            detail,
        }
    }

    /// Whether the producer supplied a usable type.
    #[must_use]
    pub fn has_type(&self) -> bool {
        !self.kind.trim().is_empty()
    }

    fn non_empty_id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }
}

/// Logical close of an earlier record sharing `ref_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMarker {
    pub ref_id: String,
    pub ts: Timestamp,
}

/// Observation that a previously allowed action for `incident_key` failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    pub incident_key: IncidentKey,
    pub ts: Timestamp,
}

/// One validated incident-log line.
#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    Incident(IncidentRecord),
    Resolved(ResolvedMarker),
    FailureReport(FailureReport),
}

impl LogRecord {
    /// Timestamp of the underlying line.
    #[must_use]
    pub fn ts(&self) -> Timestamp {
        match self {
            Self::Incident(rec) => rec.ts,
            Self::Resolved(marker) => marker.ts,
            Self::FailureReport(report) => report.ts,
        }
    }
}

/// Why a line was rejected at the ingestion boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Malformed {
    NotJson,
    NotObject,
    MissingTimestamp,
    BadTimestamp,
    BadSeverity,
    MissingRefId,
}

impl fmt::Display for Malformed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NotJson => "not_json",
            Self::NotObject => "not_object",
            Self::MissingTimestamp => "missing_ts",
            Self::BadTimestamp => "bad_ts",
            Self::BadSeverity => "bad_severity",
            Self::MissingRefId => "missing_ref_id",
        };
        f.write_str(label)
    }
}

/// Validate one incident-log line.
pub fn parse_line(line: &str) -> Result<LogRecord, Malformed> {
    let value: Value = serde_json::from_str(line).map_err(|_| Malformed::NotJson)?;
    let Value::Object(obj) = value else {
        return Err(Malformed::NotObject);
    };

    let ts = match obj.get("ts") {
        Some(Value::String(raw)) => parse_utc(raw).ok_or(Malformed::BadTimestamp)?,
        Some(_) => return Err(Malformed::BadTimestamp),
        None => return Err(Malformed::MissingTimestamp),
    };

    let kind = str_field(&obj, "type").unwrap_or_default();

    if kind == kinds::RESOLVED {
        let ref_id = str_field(&obj, "ref_id")
            .filter(|id| !id.is_empty())
            .ok_or(Malformed::MissingRefId)?;
        return Ok(LogRecord::Resolved(ResolvedMarker { ref_id, ts }));
    }

    if kind == kinds::REMEDIATION_FAILED
        && let Some(key) = obj
            .get("detail")
            .and_then(|d| d.get("incident_key"))
            .and_then(Value::as_str)
            .filter(|k| !k.is_empty())
    {
        return Ok(LogRecord::FailureReport(FailureReport {
            incident_key: IncidentKey::from_raw(key),
            ts,
        }));
    }

    let severity = match obj.get("severity") {
        Some(Value::String(raw)) => Severity::parse(raw).ok_or(Malformed::BadSeverity)?,
        _ => return Err(Malformed::BadSeverity),
    };

    let job_id = str_field(&obj, "jobId")
        .or_else(|| str_field(&obj, "job"))
        .filter(|job| !job.is_empty());

    Ok(LogRecord::Incident(IncidentRecord {
        id: str_field(&obj, "id").filter(|id| !id.is_empty()),
        kind,
        severity,
        source: str_field(&obj, "source").unwrap_or_default(),
        job_id,
        ts,
        msg: str_field(&obj, "msg").unwrap_or_default(),
        resolved: obj.get("resolved").and_then(Value::as_bool).unwrap_or(false),
        detail: obj.get("detail").cloned(),
    }))
}

fn str_field(obj: &Map<String, Value>, name: &str) -> Option<String> {
    obj.get(name).and_then(Value::as_str).map(str::to_string)
}

// ──────────────────── keys ────────────────────

/// Stable identity scoping all guard state for one occurrence class.
///
/// `id` when the record carries one, else `type:job` (job may be empty).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IncidentKey(String);

impl IncidentKey {
    /// Derive the policy key for a record.
    #[must_use]
    pub fn for_record(rec: &IncidentRecord) -> Self {
        rec.non_empty_id().map_or_else(
            || {
                let kind = if rec.has_type() { rec.kind.as_str() } else { "unknown" };
                Self(format!("{kind}:{}", rec.job_id.as_deref().unwrap_or("")))
            },
            |id| Self(id.to_string()),
        )
    }

    /// Wrap an already-derived key (e.g. from the state document or a failure report).
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IncidentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Occurrence identity used to suppress re-alerting on an unresolved record.
///
/// `id` when present, else `type|job|source|bucket|msg-hash` where `bucket`
/// is the record timestamp floored to `bucket_s` seconds.
#[must_use]
pub fn dedup_key(rec: &IncidentRecord, bucket_s: u64) -> String {
    if let Some(id) = rec.non_empty_id() {
        return id.to_string();
    }
    let width = i64::try_from(bucket_s.max(1)).unwrap_or(i64::MAX);
    let bucket = rec.ts.timestamp().div_euclid(width);
    format!(
        "{}|{}|{}|{bucket}|{}",
        rec.kind,
        rec.job_id.as_deref().unwrap_or(""),
        rec.source,
        short_hash(&rec.msg)
    )
}

fn short_hash(input: &str) -> String {
    use std::fmt::Write;
    let digest = Sha256::digest(input.as_bytes());
    digest
        .iter()
        .take(8)
        .fold(String::with_capacity(16), |mut s, b| {
            let _ = write!(s, "{b:02x}");
            s
        })
}
