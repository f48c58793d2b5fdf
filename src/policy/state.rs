//! Durable per-key guard state and the alert ledger.
//!
//! Both documents are read once at cycle start and replaced wholesale once at
//! cycle end via tmp-file + `sync_all` + rename, so a reader only ever sees a
//! complete document.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::clock::{Timestamp, secs};
use crate::core::errors::{RemedyError, Result};
use crate::incident::record::IncidentKey;
use crate::monitor::window::KeyedWindows;

/// Schema version written into both documents.
pub const STATE_VERSION: u32 = 1;

// ──────────────────── incident state ────────────────────

/// Guard history for one incident key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentState {
    /// Safe-auto actions allowed since `window_start`.
    #[serde(default)]
    pub attempts: u32,
    /// Observed failures of previously allowed actions, oldest first.
    #[serde(default)]
    pub fail_events: Vec<Timestamp>,
    /// Timestamps of allowed restarts, backing the sliding restart guard.
    #[serde(default)]
    pub restart_events: Vec<Timestamp>,
    pub window_start: Timestamp,
    /// Last time the key was evaluated. `None` until the first decision.
    #[serde(default)]
    pub last_action_ts: Option<Timestamp>,
}

impl IncidentState {
    /// Zero-valued state whose attempt window opens at `now`.
    #[must_use]
    pub fn fresh(now: Timestamp) -> Self {
        Self {
            attempts: 0,
            fail_events: Vec::new(),
            restart_events: Vec::new(),
            window_start: now,
            last_action_ts: None,
        }
    }

    /// Most recent instant anything happened to this key.
    ///
    /// Keys only ever touched by the failure path have no `last_action_ts`;
    /// their newest failure (or window start) stands in for it.
    #[must_use]
    pub fn last_activity(&self) -> Timestamp {
        let newest_failure = self.fail_events.iter().max().copied();
        [self.last_action_ts, newest_failure, Some(self.window_start)]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(self.window_start)
    }
}

// ──────────────────── policy state store ────────────────────

/// The single unit of durable guard state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyStateStore {
    pub version: u32,
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
    #[serde(default)]
    pub incidents: BTreeMap<IncidentKey, IncidentState>,
}

impl Default for PolicyStateStore {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            updated_at: None,
            incidents: BTreeMap::new(),
        }
    }
}

impl PolicyStateStore {
    /// Load the document at `path`.
    ///
    /// A missing file is an empty store. A file that exists but does not
    /// parse is [`RemedyError::StateLoadFailure`]: it is never reset silently.
    pub fn load(path: &Path) -> Result<Self> {
        let store: Self = read_document(path)?.unwrap_or_default();
        check_version(path, store.version)?;
        Ok(store)
    }

    /// State for `key`, or a fresh zero state that is not stored until [`put`](Self::put).
    #[must_use]
    pub fn get(&self, key: &IncidentKey, now: Timestamp) -> IncidentState {
        self.incidents
            .get(key)
            .cloned()
            .unwrap_or_else(|| IncidentState::fresh(now))
    }

    pub fn put(&mut self, key: IncidentKey, state: IncidentState) {
        self.incidents.insert(key, state);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.incidents.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.incidents.is_empty()
    }

    /// Drop keys inactive for longer than `ttl_s`. Returns how many were dropped.
    ///
    /// A key evaluated this cycle has `last_action_ts == now` and always survives.
    pub fn cleanup_stale(&mut self, now: Timestamp, ttl_s: u64) -> usize {
        let cutoff = now - secs(ttl_s);
        let before = self.incidents.len();
        self.incidents
            .retain(|_, state| state.last_activity() >= cutoff);
        before - self.incidents.len()
    }

    /// Stamp `updated_at` and atomically replace the document at `path`.
    pub fn save(&mut self, path: &Path, now: Timestamp) -> Result<()> {
        self.updated_at = Some(now);
        write_document_atomic(path, self)
    }
}

// ──────────────────── alert ledger ────────────────────

/// Windowed memory of what was already evaluated and alerted.
///
/// Kept apart from per-key guard state: its keys are dedup keys and
/// `(type, incident key)` pairs, and its windows are the dedup and alerting
/// windows rather than guard windows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertLedger {
    pub version: u32,
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
    /// Dedup key -> when that occurrence was first evaluated.
    #[serde(default)]
    pub dedup: KeyedWindows,
    /// `type|incident_key` -> when an incident of that type was appended.
    #[serde(default)]
    pub alerts: KeyedWindows,
}

impl Default for AlertLedger {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            updated_at: None,
            dedup: KeyedWindows::default(),
            alerts: KeyedWindows::default(),
        }
    }
}

impl AlertLedger {
    /// Same contract as [`PolicyStateStore::load`].
    pub fn load(path: &Path) -> Result<Self> {
        let ledger: Self = read_document(path)?.unwrap_or_default();
        check_version(path, ledger.version)?;
        Ok(ledger)
    }

    /// `true` the first time an occurrence is seen inside `window_s`, `false` after.
    pub fn admit_occurrence(&mut self, dedup_key: &str, now: Timestamp, window_s: u64) -> bool {
        self.dedup.allow(dedup_key, now, window_s, 1)
    }

    /// Rate-limit appended incidents per `(kind, key)`.
    pub fn admit_alert(
        &mut self,
        kind: &str,
        key: &str,
        now: Timestamp,
        window_s: u64,
        max: usize,
    ) -> bool {
        self.alerts.allow(&format!("{kind}|{key}"), now, window_s, max)
    }

    /// Forget entries that fell out of their windows.
    pub fn prune(&mut self, now: Timestamp, dedup_window_s: u64, alert_window_s: u64) {
        self.dedup.prune_all(now, dedup_window_s);
        self.alerts.prune_all(now, alert_window_s);
    }

    pub fn save(&mut self, path: &Path, now: Timestamp) -> Result<()> {
        self.updated_at = Some(now);
        write_document_atomic(path, self)
    }
}

// ──────────────────── persistence ────────────────────

fn check_version(path: &Path, version: u32) -> Result<()> {
    if version == 0 || version > STATE_VERSION {
        return Err(RemedyError::StateLoadFailure {
            path: path.to_path_buf(),
            details: format!("unsupported document version {version}"),
        });
    }
    Ok(())
}

fn read_document<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(RemedyError::io(path, e)),
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| RemedyError::StateLoadFailure {
            path: path.to_path_buf(),
            details: e.to_string(),
        })
}

/// Write `doc` next to `path`, sync it, then rename it over `path`.
///
/// The rename is the only observable transition; on any failure the
/// temporary file is removed and the previous document stays in place.
pub fn write_document_atomic<T: Serialize>(path: &Path, doc: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(doc)?;
    let tmp_path = path.with_extension("json.tmp");

    let result = (|| -> std::io::Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        {
            let mut opts = OpenOptions::new();
            opts.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt as _;
                opts.mode(0o644);
            }
            let mut file = opts.open(&tmp_path)?;
            file.write_all(json.as_bytes())?;
            file.write_all(b"\n")?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;
        Ok(())
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp_path);
        return Err(RemedyError::StateWrite {
            path: path.to_path_buf(),
            details: e.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::parse_utc;
    use chrono::TimeDelta;

    fn t0() -> Timestamp {
        parse_utc("2026-05-01T12:00:00Z").unwrap()
    }

    fn key(raw: &str) -> IncidentKey {
        IncidentKey::from_raw(raw)
    }

    #[test]
    fn missing_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = PolicyStateStore::load(&dir.path().join("state.json")).unwrap();
        assert_eq!(store.version, STATE_VERSION);
        assert!(store.is_empty());
    }

    #[test]
    fn corrupt_file_is_fatal_and_left_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{\"version\":1,\"incidents\":").unwrap();
        let err = PolicyStateStore::load(&path).unwrap_err();
        assert_eq!(err.code(), "RMD-2001");
        assert!(!err.is_retryable());
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "{\"version\":1,\"incidents\":"
        );
    }

    #[test]
    fn future_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, r#"{"version":9,"incidents":{}}"#).unwrap();
        assert!(matches!(
            PolicyStateStore::load(&path),
            Err(RemedyError::StateLoadFailure { .. })
        ));
    }

    #[test]
    fn get_does_not_persist_until_put() {
        let mut store = PolicyStateStore::default();
        let state = store.get(&key("i1"), t0());
        assert_eq!(state.attempts, 0);
        assert_eq!(state.window_start, t0());
        assert!(store.is_empty());
        store.put(key("i1"), state);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn save_then_load_preserves_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let mut store = PolicyStateStore::default();
        let mut state = IncidentState::fresh(t0());
        state.attempts = 2;
        state.fail_events.push(t0());
        state.last_action_ts = Some(t0());
        store.put(key("gw1"), state.clone());
        store.save(&path, t0()).unwrap();

        let loaded = PolicyStateStore::load(&path).unwrap();
        assert_eq!(loaded.updated_at, Some(t0()));
        assert_eq!(loaded.incidents[&key("gw1")], state);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn documents_without_restart_events_still_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(
            &path,
            r#"{"version":1,"updated_at":"2026-05-01T12:00:00Z","incidents":{"i1":{"attempts":1,"fail_events":[],"window_start":"2026-05-01T11:00:00Z","last_action_ts":"2026-05-01T11:00:00Z"}}}"#,
        )
        .unwrap();
        let store = PolicyStateStore::load(&path).unwrap();
        assert!(store.incidents[&key("i1")].restart_events.is_empty());
    }

    #[test]
    fn failed_save_leaves_previous_document_intact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut store = PolicyStateStore::default();
        store.save(&path, t0()).unwrap();
        let before = fs::read_to_string(&path).unwrap();

        // A directory squatting on the tmp path makes the write fail.
        fs::create_dir(path.with_extension("json.tmp")).unwrap();
        store.put(key("i1"), IncidentState::fresh(t0()));
        let err = store.save(&path, t0()).unwrap_err();
        assert_eq!(err.code(), "RMD-2002");
        assert_eq!(fs::read_to_string(&path).unwrap(), before);
    }

    #[test]
    fn cleanup_respects_ttl_and_current_cycle() {
        let now = t0();
        let mut store = PolicyStateStore::default();

        let mut old = IncidentState::fresh(now - TimeDelta::hours(30));
        old.last_action_ts = Some(now - TimeDelta::hours(25));
        store.put(key("old"), old);

        let mut recent = IncidentState::fresh(now - TimeDelta::hours(30));
        recent.last_action_ts = Some(now - TimeDelta::hours(23));
        store.put(key("recent"), recent);

        let mut failure_only = IncidentState::fresh(now - TimeDelta::hours(30));
        failure_only.fail_events.push(now - TimeDelta::minutes(5));
        store.put(key("failure_only"), failure_only);

        let mut this_cycle = IncidentState::fresh(now - TimeDelta::hours(48));
        this_cycle.last_action_ts = Some(now);
        store.put(key("this_cycle"), this_cycle);

        let dropped = store.cleanup_stale(now, 24 * 3600);
        assert_eq!(dropped, 1);
        assert!(!store.incidents.contains_key(&key("old")));
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn ledger_dedups_occurrences_within_window() {
        let mut ledger = AlertLedger::default();
        assert!(ledger.admit_occurrence("i1", t0(), 10_800));
        assert!(!ledger.admit_occurrence("i1", t0() + TimeDelta::hours(1), 10_800));
        assert!(ledger.admit_occurrence("i1", t0() + TimeDelta::hours(4), 10_800));
    }

    #[test]
    fn ledger_rate_limits_per_kind_and_key() {
        let mut ledger = AlertLedger::default();
        assert!(ledger.admit_alert("restart_loop_blocked", "i1", t0(), 1800, 1));
        assert!(!ledger.admit_alert("restart_loop_blocked", "i1", t0(), 1800, 1));
        assert!(ledger.admit_alert("restart_loop_blocked", "i2", t0(), 1800, 1));
        assert!(ledger.admit_alert("mekhanik_circuit_breaker", "i1", t0(), 1800, 1));
    }

    #[test]
    fn ledger_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alerts.json");
        let mut ledger = AlertLedger::default();
        ledger.admit_occurrence("dk", t0(), 600);
        ledger.save(&path, t0()).unwrap();
        let mut loaded = AlertLedger::load(&path).unwrap();
        assert!(!loaded.admit_occurrence("dk", t0(), 600));
        loaded.prune(t0() + TimeDelta::seconds(601), 600, 600);
        assert!(loaded.dedup.is_empty());
    }
}
