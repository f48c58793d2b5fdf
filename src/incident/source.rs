//! Incident-log reader: full or tail-bounded, windowed, with resolution filtering.

use std::collections::HashSet;
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

use crate::core::clock::Timestamp;
use crate::core::errors::{RemedyError, Result};
use crate::incident::record::{FailureReport, IncidentRecord, LogRecord, Severity, parse_line};

/// How much of the log to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadScope {
    /// Every line in the file.
    Full,
    /// Only the last `max_bytes` bytes, and at most `max_lines` non-empty lines of those.
    Tail { max_bytes: u64, max_lines: usize },
}

/// Result of reading the incident log.
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    /// Valid records in log order.
    pub records: Vec<LogRecord>,
    /// Lines rejected at the ingestion boundary.
    pub malformed: usize,
}

/// Read and validate the incident log at `path`.
///
/// Records older than `since` are dropped. A missing file is an empty log.
pub fn read_incident_log(
    path: &Path,
    scope: ReadScope,
    since: Option<Timestamp>,
) -> Result<IngestReport> {
    let bytes = match read_scoped(path, scope) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(IngestReport::default()),
        Err(e) => return Err(RemedyError::io(path, e)),
    };

    let mut lines = split_lines(&bytes);
    if let ReadScope::Tail { max_lines, .. } = scope
        && lines.len() > max_lines
    {
        lines.drain(..lines.len() - max_lines);
    }

    let mut report = IngestReport::default();
    for raw in lines {
        let line = String::from_utf8_lossy(raw);
        match parse_line(&line) {
            Ok(record) => {
                if since.is_none_or(|cutoff| record.ts() >= cutoff) {
                    report.records.push(record);
                }
            }
            Err(_) => report.malformed += 1,
        }
    }
    Ok(report)
}

fn read_scoped(path: &Path, scope: ReadScope) -> std::io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let mut buf = Vec::new();
    match scope {
        ReadScope::Full => {
            file.read_to_end(&mut buf)?;
        }
        ReadScope::Tail { max_bytes, .. } => {
            let size = file.metadata()?.len();
            let start = size.saturating_sub(max_bytes);
            file.seek(SeekFrom::Start(start))?;
            file.read_to_end(&mut buf)?;
            if start > 0 {
                // The first line is almost certainly cut mid-record.
                match memchr::memchr(b'\n', &buf) {
                    Some(nl) => {
                        buf.drain(..=nl);
                    }
                    None => buf.clear(),
                }
            }
        }
    }
    Ok(buf)
}

fn split_lines(buf: &[u8]) -> Vec<&[u8]> {
    let mut out = Vec::new();
    let mut start = 0;
    for nl in memchr::memchr_iter(b'\n', buf) {
        push_trimmed(&mut out, &buf[start..nl]);
        start = nl + 1;
    }
    push_trimmed(&mut out, &buf[start..]);
    out
}

fn push_trimmed<'a>(out: &mut Vec<&'a [u8]>, line: &'a [u8]) {
    let line = line.trim_ascii();
    if !line.is_empty() {
        out.push(line);
    }
}

// ──────────────────── active set ────────────────────

/// Records the engine must act on this cycle.
#[derive(Debug, Clone, Default)]
pub struct ActiveSet {
    /// Unresolved critical incidents from other producers, in log order.
    pub incidents: Vec<IncidentRecord>,
    /// Failure reports to replay into the breaker history.
    pub failures: Vec<FailureReport>,
    /// Criticals dropped because they were resolved.
    pub resolved_filtered: usize,
}

/// Filter validated records down to the active critical set.
///
/// A record is dropped when its own `resolved` flag is set, when a
/// `resolved` marker with a matching `ref_id` appears later in the log, or
/// when it was authored by `own_source` (the engine never re-evaluates its
/// own guard and marker emissions).
#[must_use]
pub fn active_critical(records: &[LogRecord], own_source: &str) -> ActiveSet {
    let mut set = ActiveSet::default();
    let mut closed_later: HashSet<&str> = HashSet::new();
    let mut incidents_rev = Vec::new();

    for record in records.iter().rev() {
        match record {
            LogRecord::Resolved(marker) => {
                closed_later.insert(marker.ref_id.as_str());
            }
            LogRecord::FailureReport(report) => set.failures.push(report.clone()),
            LogRecord::Incident(rec) => {
                if rec.severity != Severity::Critical || rec.source == own_source {
                    continue;
                }
                let closed = rec.resolved
                    || rec
                        .id
                        .as_deref()
                        .is_some_and(|id| closed_later.contains(id));
                if closed {
                    set.resolved_filtered += 1;
                } else {
                    incidents_rev.push(rec.clone());
                }
            }
        }
    }

    incidents_rev.reverse();
    set.incidents = incidents_rev;
    set.failures.reverse();
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::parse_utc;
    use std::io::Write;

    fn write_log(lines: &[&str]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("incidents.jsonl");
        let mut f = File::create(&path).unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
        (dir, path)
    }

    #[test]
    fn missing_log_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let report =
            read_incident_log(&dir.path().join("absent.jsonl"), ReadScope::Full, None).unwrap();
        assert!(report.records.is_empty());
        assert_eq!(report.malformed, 0);
    }

    #[test]
    fn malformed_lines_are_counted_not_fatal() {
        let (_dir, path) = write_log(&[
            r#"{"id":"a","type":"gateway_down","severity":"critical","ts":"2026-05-01T10:00:00Z"}"#,
            "garbage",
            "",
            r#"{"type":"cron_error","severity":"critical"}"#,
            r#"{"id":"b","type":"cron_error","severity":"critical","ts":"2026-05-01T10:05:00Z"}"#,
        ]);
        let report = read_incident_log(&path, ReadScope::Full, None).unwrap();
        assert_eq!(report.records.len(), 2);
        assert_eq!(report.malformed, 2);
    }

    #[test]
    fn since_filters_old_records() {
        let (_dir, path) = write_log(&[
            r#"{"id":"old","type":"gateway_down","severity":"critical","ts":"2026-05-01T04:00:00Z"}"#,
            r#"{"id":"new","type":"gateway_down","severity":"critical","ts":"2026-05-01T09:00:00Z"}"#,
        ]);
        let since = parse_utc("2026-05-01T06:00:00Z");
        let report = read_incident_log(&path, ReadScope::Full, since).unwrap();
        assert_eq!(report.records.len(), 1);
    }

    #[test]
    fn tail_read_drops_cut_first_line_and_caps_lines() {
        let lines: Vec<String> = (0..50)
            .map(|i| {
                format!(
                    r#"{{"id":"r{i}","type":"gateway_down","severity":"critical","ts":"2026-05-01T10:00:00Z"}}"#
                )
            })
            .collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let (_dir, path) = write_log(&refs);

        let line_len = lines[0].len() as u64 + 1;
        let report = read_incident_log(
            &path,
            ReadScope::Tail {
                max_bytes: line_len * 10 + 5,
                max_lines: 6,
            },
            None,
        )
        .unwrap();
        assert_eq!(report.malformed, 0, "a cut line must not count as malformed");
        assert_eq!(report.records.len(), 6);
        match report.records.last().unwrap() {
            LogRecord::Incident(rec) => assert_eq!(rec.id.as_deref(), Some("r49")),
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn active_set_applies_resolution_rules() {
        let (_dir, path) = write_log(&[
            r#"{"id":"a","type":"gateway_down","severity":"critical","ts":"2026-05-01T10:00:00Z"}"#,
            r#"{"id":"b","type":"cron_error","severity":"critical","ts":"2026-05-01T10:01:00Z","resolved":true}"#,
            r#"{"id":"c","type":"cron_error","severity":"critical","ts":"2026-05-01T10:02:00Z"}"#,
            r#"{"type":"resolved","ref_id":"c","ts":"2026-05-01T10:03:00Z"}"#,
            r#"{"id":"d","type":"git_dirty","severity":"warn","ts":"2026-05-01T10:04:00Z"}"#,
            r#"{"id":"e","type":"restart_loop_blocked","severity":"critical","source":"mekhanik","ts":"2026-05-01T10:05:00Z"}"#,
            r#"{"type":"remediation_failed","severity":"critical","source":"mekhanik","ts":"2026-05-01T10:06:00Z","detail":{"incident_key":"a"}}"#,
        ]);
        let report = read_incident_log(&path, ReadScope::Full, None).unwrap();
        let set = active_critical(&report.records, "mekhanik");
        let ids: Vec<_> = set
            .incidents
            .iter()
            .map(|r| r.id.clone().unwrap())
            .collect();
        assert_eq!(ids, vec!["a"]);
        assert_eq!(set.resolved_filtered, 2);
        assert_eq!(set.failures.len(), 1);
        assert_eq!(set.failures[0].incident_key.as_str(), "a");
    }

    #[test]
    fn resolution_marker_before_record_does_not_close_it() {
        let (_dir, path) = write_log(&[
            r#"{"type":"resolved","ref_id":"a","ts":"2026-05-01T09:59:00Z"}"#,
            r#"{"id":"a","type":"gateway_down","severity":"critical","ts":"2026-05-01T10:00:00Z"}"#,
        ]);
        let report = read_incident_log(&path, ReadScope::Full, None).unwrap();
        let set = active_critical(&report.records, "mekhanik");
        assert_eq!(set.incidents.len(), 1);
    }
}
