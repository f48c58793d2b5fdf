//! One evaluation cycle, in plan-only or real mode.
//!
//! Order of a cycle: take the run lock, load the state document and alert
//! ledger, read the incident log, replay failure reports, dedup, decide each
//! active record, clean up stale keys, persist once, apply the mode, append
//! incidents and the heartbeat or marker, write the metrics line, release.
//!
//! If either document cannot be persisted the cycle fails safe-closed: every
//! allowed verdict is downgraded and the cycle falls back to `safe_stop`.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::core::clock::{Timestamp, secs};
use crate::core::config::Config;
use crate::core::errors::{RemedyError, Result};
use crate::daemon::command::{
    CommandExecutor, ExecutionOutcome, ProbeStatus, RemediationExecutor,
};
use crate::daemon::lock::{LockAcquire, LockInfo, RunLock};
use crate::incident::record::{IncidentKey, IncidentRecord, Severity, dedup_key, kinds};
use crate::incident::source::{ActiveSet, ReadScope, active_critical, read_incident_log};
use crate::logger::jsonl::{
    ActivityConfig, ActivityEntry, ActivityEvent, ActivityWriter, Level, append_record,
    append_records,
};
use crate::logger::metrics::{HeartbeatRecord, MetricsRecord};
use crate::policy::classifier::{ActionKind, RiskClass};
use crate::policy::engine::{DecisionEngine, DenyReason, Evaluation, Verdict};
use crate::policy::state::{AlertLedger, PolicyStateStore};

/// At most this many active records are sampled into the real-mode marker.
const MARKER_SAMPLE: usize = 5;

// ──────────────────── mode ────────────────────

/// Execution mode of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Full evaluation and persistence; nothing is ever executed.
    Plan,
    /// Staged execution, gated by `rollout.safe_auto_enabled`.
    Real,
}

impl Mode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Real => "real",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "plan" => Ok(Self::Plan),
            "real" => Ok(Self::Real),
            other => Err(format!("unknown mode {other:?}")),
        }
    }
}

// ──────────────────── report ────────────────────

/// Whether the cycle ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Completed,
    /// Another run held a live lock; nothing was touched.
    Skipped,
}

/// Counts from the ingestion phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub records: usize,
    pub malformed: usize,
    pub active: usize,
    pub resolved_filtered: usize,
    pub failures_applied: usize,
    pub dedup_suppressed: usize,
}

/// One real-mode execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionRecord {
    pub incident_key: IncidentKey,
    pub action: ActionKind,
    pub probe: ProbeStatus,
    /// `None` when the probe deferred the action.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ExecutionOutcome>,
}

/// Everything a cycle did, for the CLI and for tests.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub mode: Mode,
    pub status: CycleStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Holder of the lock when the cycle was skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_holder: Option<LockInfo>,
    pub ingest: IngestSummary,
    pub evaluations: Vec<Evaluation>,
    /// Incidents appended to the incident log by this cycle.
    pub appended: Vec<IncidentRecord>,
    pub executions: Vec<ExecutionRecord>,
    /// `safe_stop` when the cycle failed safe-closed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_action: Option<ActionKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_error: Option<String>,
    pub heartbeat: bool,
    pub marker: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsRecord>,
}

impl CycleReport {
    fn new(mode: Mode, status: CycleStatus, run_id: Option<String>) -> Self {
        Self {
            mode,
            status,
            run_id,
            lock_holder: None,
            ingest: IngestSummary::default(),
            evaluations: Vec::new(),
            appended: Vec::new(),
            executions: Vec::new(),
            fallback_action: None,
            state_error: None,
            heartbeat: false,
            marker: false,
            metrics: None,
        }
    }

    /// Number of allowed verdicts left after fail-safe and mode handling.
    #[must_use]
    pub fn allowed_count(&self) -> usize {
        self.evaluations
            .iter()
            .flat_map(|e| &e.plans)
            .filter(|p| p.allowed)
            .count()
    }

    /// Appended incidents of `kind`.
    #[must_use]
    pub fn appended_of(&self, kind: &str) -> usize {
        self.appended.iter().filter(|r| r.kind == kind).count()
    }
}

// ──────────────────── runner ────────────────────

/// Drives cycles against the configured files.
pub struct Runner {
    config: Config,
    engine: DecisionEngine,
    executor: Box<dyn RemediationExecutor>,
    activity: ActivityWriter,
}

impl Runner {
    /// Runner with the command executor and activity log from `config`.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let engine =
            DecisionEngine::new(config.guards.clone()).with_source(config.source_label.clone());
        let executor = Box::new(CommandExecutor::from_config(&config));
        let activity = ActivityWriter::open(ActivityConfig::for_path(&config.paths.activity_log));
        Self {
            config,
            engine,
            executor,
            activity,
        }
    }

    /// Replace the remediation executor.
    #[must_use]
    pub fn with_executor(mut self, executor: Box<dyn RemediationExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Replace the activity writer.
    #[must_use]
    pub fn with_activity(mut self, activity: ActivityWriter) -> Self {
        self.activity = activity;
        self
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// One cycle at the current wall-clock time.
    pub fn run(&mut self, mode: Mode) -> Result<CycleReport> {
        self.run_cycle(mode, Utc::now())
    }

    /// One cycle evaluated at `now`.
    ///
    /// Returns `Err` only for cycle-health failures (lock I/O, unreadable or
    /// corrupt state, log I/O). Verdicts are data in the report.
    pub fn run_cycle(&mut self, mode: Mode, now: Timestamp) -> Result<CycleReport> {
        let paths = &self.config.paths;
        let lock = match RunLock::acquire(&paths.lock_file, self.config.lock.ttl_s, now)? {
            LockAcquire::Acquired(lock) => lock,
            LockAcquire::Busy(holder) => {
                self.activity.set_context(None, mode.as_str());
                let held_by = holder
                    .as_ref()
                    .map_or_else(|| "unknown".to_string(), |h| format!("pid {} run {}", h.pid, h.run_id));
                self.activity
                    .event(ActivityEvent::LockBusy, Level::Info, format!("lock held by {held_by}"));
                self.activity.flush();
                let mut report = CycleReport::new(mode, CycleStatus::Skipped, None);
                report.lock_holder = holder;
                return Ok(report);
            }
        };

        self.activity
            .set_context(Some(lock.run_id().to_string()), mode.as_str());
        let config_hash = self
            .config
            .stable_hash()
            .unwrap_or_else(|_| "unavailable".to_string());
        self.activity.event(
            ActivityEvent::CycleStart,
            Level::Info,
            format!("config_hash={config_hash}"),
        );

        let result = self.run_locked(mode, now, &lock);
        match &result {
            Ok(report) => {
                let details = format!(
                    "evaluated={} allowed={} appended={} state_write_failed={}",
                    report.evaluations.len(),
                    report.allowed_count(),
                    report.appended.len(),
                    report.state_error.is_some()
                );
                self.activity
                    .event(ActivityEvent::CycleComplete, Level::Info, details);
            }
            Err(err) => {
                self.activity
                    .write(ActivityEntry::new(ActivityEvent::Error, Level::Critical).error(err));
            }
        }
        lock.release();
        self.activity.flush();
        result
    }

    fn run_locked(&mut self, mode: Mode, now: Timestamp, lock: &RunLock) -> Result<CycleReport> {
        let mut report = CycleReport::new(mode, CycleStatus::Completed, Some(lock.run_id().to_string()));
        let mut metrics = MetricsRecord::new(now, mode);
        let source = self.config.source_label.clone();

        let paths = self.config.paths.clone();
        if let Some(stale) = lock.recovered() {
            self.activity.event(
                ActivityEvent::LockRecovered,
                Level::Warning,
                format!("reclaimed stale lock of pid {} run {}", stale.pid, stale.run_id),
            );
            let recovered = IncidentRecord::emitted(
                kinds::STALE_LOCK_RECOVERED,
                Severity::Critical,
                &source,
                now,
                format!("reclaimed stale run lock left by pid {}", stale.pid),
                Some(json!({
                    "pid": stale.pid,
                    "run_id": stale.run_id,
                    "created_at": stale.created_at,
                    "ttl_seconds": stale.ttl_seconds,
                })),
            );
            // Written before state loads so a corrupt document cannot hide it.
            append_record(&paths.incidents_log, &recovered)?;
            report.appended.push(recovered);
        }
        let written_early = report.appended.len();

        let mut store = PolicyStateStore::load(&paths.state_file)?;
        let mut ledger = AlertLedger::load(&paths.alerts_file)?;

        let ingest_cfg = self.config.ingest;
        let (scope, lookback_s) = match mode {
            Mode::Plan => (ReadScope::Full, ingest_cfg.plan_lookback_s),
            Mode::Real => (
                ReadScope::Tail {
                    max_bytes: ingest_cfg.tail_bytes,
                    max_lines: ingest_cfg.tail_lines,
                },
                ingest_cfg.real_lookback_s,
            ),
        };
        let ingest = read_incident_log(&paths.incidents_log, scope, Some(now - secs(lookback_s)))?;
        let active = active_critical(&ingest.records, &source);
        report.ingest.records = ingest.records.len();
        report.ingest.malformed = ingest.malformed;
        report.ingest.active = active.incidents.len();
        report.ingest.resolved_filtered = active.resolved_filtered;

        for failure in &active.failures {
            if self
                .engine
                .record_failure(&mut store, &failure.incident_key, failure.ts, now)
            {
                report.ingest.failures_applied += 1;
            }
        }

        let mut rate_limited = 0u64;
        let mut policy_alerts = 0u64;
        for rec in &active.incidents {
            let occurrence = dedup_key(rec, self.config.dedup.bucket_s);
            if !ledger.admit_occurrence(&occurrence, now, self.config.dedup.window_s) {
                report.ingest.dedup_suppressed += 1;
                continue;
            }

            let eval = self.engine.decide(&mut store, rec, now);
            let scope_key = eval
                .key
                .as_ref()
                .map_or_else(|| occurrence.clone(), ToString::to_string);
            for emitted in &eval.emitted {
                policy_alerts += 1;
                if ledger.admit_alert(
                    &emitted.kind,
                    &scope_key,
                    now,
                    self.config.alerting.window_s,
                    self.config.alerting.max_per_window,
                ) {
                    report.appended.push(emitted.clone());
                } else {
                    rate_limited += 1;
                }
            }
            self.log_decision(&eval, &scope_key);
            report.evaluations.push(eval);
        }

        let stale_cleaned = store.cleanup_stale(now, self.config.guards.stale_ttl_s);
        ledger.prune(now, self.config.dedup.window_s, self.config.alerting.window_s);

        let persisted = store
            .save(&paths.state_file, now)
            .and_then(|()| ledger.save(&paths.alerts_file, now));
        if let Err(err) = persisted {
            self.fail_safe_closed(&mut report, &err, &source, now);
            metrics.state_write_failed = 1;
            policy_alerts += 1;
        }

        for plan in report.evaluations.iter().flat_map(|e| &e.plans) {
            if plan.allowed && plan.risk_class == RiskClass::SafeAuto {
                metrics.planned_safe_auto += 1;
            }
            if plan.risk_class == RiskClass::Risky {
                metrics.planned_risky += 1;
            }
            if plan.allowed && plan.kind == ActionKind::Escalate {
                metrics.message_events_by_type.escalation += 1;
            }
        }
        metrics.restart_loop_blocked = u8::from(
            report
                .evaluations
                .iter()
                .any(|e| e.denied_with(DenyReason::RestartLoopBlocked)),
        );
        metrics.circuit_breaker_triggered = u8::from(
            report
                .evaluations
                .iter()
                .any(|e| e.verdict == Verdict::BlockedBreaker),
        );

        if mode == Mode::Real {
            if self.config.rollout.safe_auto_enabled {
                self.execute_allowed(&mut report, &source, now);
            } else {
                for plan in report.evaluations.iter_mut().flat_map(|e| &mut e.plans) {
                    plan.downgrade(DenyReason::SafeAutoDisabled);
                }
            }
        }
        metrics.executed = report
            .executions
            .iter()
            .filter(|x| matches!(x.outcome, Some(ExecutionOutcome::Succeeded { .. })))
            .count() as u64;

        if active.incidents.is_empty() {
            self.write_heartbeat(&mut report, &source, now)?;
        } else if mode == Mode::Real && !self.config.rollout.safe_auto_enabled {
            self.push_marker(&mut report, &active, &source, now);
        }

        let other_events = report
            .appended
            .iter()
            .filter(|r| {
                r.kind == kinds::REAL_DETECTED_CRITICAL
                    || r.kind == kinds::PROBE_TIMEOUT
                    || r.kind == kinds::REMEDIATION_FAILED
            })
            .count() as u64;
        metrics.message_events_by_type.alert = policy_alerts;
        metrics.message_events_by_type.other = other_events;
        metrics.message_events_total = metrics.message_events_by_type.total();
        metrics.message_events_suppressed = match mode {
            Mode::Plan => metrics.message_events_total,
            Mode::Real => rate_limited,
        };
        metrics.malformed_lines = report.ingest.malformed as u64;
        metrics.dedup_suppressed = report.ingest.dedup_suppressed as u64;
        metrics.stale_cleaned = stale_cleaned as u64;

        append_records(&paths.incidents_log, &report.appended[written_early..])?;
        append_record(&paths.metrics_log, &metrics)?;
        report.metrics = Some(metrics);
        Ok(report)
    }

    fn fail_safe_closed(
        &mut self,
        report: &mut CycleReport,
        err: &RemedyError,
        source: &str,
        now: Timestamp,
    ) {
        eprintln!("[RMD-STATE] {err}; failing safe-closed for this cycle");
        for plan in report.evaluations.iter_mut().flat_map(|e| &mut e.plans) {
            plan.downgrade(DenyReason::StateWriteFailed);
        }
        report.fallback_action = Some(ActionKind::SafeStop);
        report.state_error = Some(err.to_string());
        report.appended.push(IncidentRecord::emitted(
            kinds::STATE_WRITE_FAILED,
            Severity::Critical,
            source,
            now,
            "policy state could not be persisted; all actions denied this cycle",
            Some(json!({
                "error_code": err.code(),
                "error": err.to_string(),
                "fallback_action": ActionKind::SafeStop.as_str(),
            })),
        ));
        self.activity.write(
            ActivityEntry::new(ActivityEvent::StateWriteFailed, Level::Critical).error(err),
        );
    }

    fn execute_allowed(&mut self, report: &mut CycleReport, source: &str, now: Timestamp) {
        let mut appended = Vec::new();
        for eval in &mut report.evaluations {
            let Some(key) = eval.key.clone() else {
                continue;
            };
            for plan in eval.plans.iter_mut().filter(|p| p.allowed) {
                let probe = match self.executor.probe() {
                    Ok(status) => status,
                    Err(err) => {
                        self.activity.write(
                            ActivityEntry::new(ActivityEvent::Error, Level::Warning).error(&err),
                        );
                        plan.downgrade(DenyReason::ProbeFailed);
                        continue;
                    }
                };
                if probe == ProbeStatus::TimedOut {
                    plan.downgrade(DenyReason::ProbeTimeout);
                    self.activity.event(
                        ActivityEvent::ProbeTimeout,
                        Level::Warning,
                        format!("deferred {} for {key}", plan.kind),
                    );
                    appended.push(IncidentRecord::emitted(
                        kinds::PROBE_TIMEOUT,
                        Severity::Warn,
                        source,
                        now,
                        format!("status probe timed out; {} for {key} deferred", plan.kind),
                        Some(json!({
                            "incident_key": key.as_str(),
                            "action": plan.kind.as_str(),
                        })),
                    ));
                    report.executions.push(ExecutionRecord {
                        incident_key: key.clone(),
                        action: plan.kind.clone(),
                        probe,
                        outcome: None,
                    });
                    continue;
                }

                let outcome = self
                    .executor
                    .execute(&plan.kind, &key)
                    .unwrap_or_else(|err| ExecutionOutcome::Failed {
                        details: err.to_string(),
                    });
                let mut entry = ActivityEntry::new(
                    if matches!(outcome, ExecutionOutcome::Succeeded { .. }) {
                        ActivityEvent::ActionExecuted
                    } else {
                        ActivityEvent::ActionFailed
                    },
                    if outcome.is_failure() {
                        Level::Warning
                    } else {
                        Level::Info
                    },
                );
                entry.incident_key = Some(key.to_string());
                entry.action = Some(plan.kind.to_string());
                if let ExecutionOutcome::Succeeded { duration_ms } = outcome {
                    entry.duration_ms = Some(duration_ms);
                }
                if let ExecutionOutcome::Failed { details } = &outcome {
                    entry.details = Some(details.clone());
                }
                if outcome == ExecutionOutcome::NotConfigured {
                    entry.details = Some("no command configured".to_string());
                }
                self.activity.write(entry);

                if outcome.is_failure() {
                    appended.push(IncidentRecord::emitted(
                        kinds::REMEDIATION_FAILED,
                        Severity::Critical,
                        source,
                        now,
                        format!("{} for {key} failed", plan.kind),
                        Some(json!({
                            "incident_key": key.as_str(),
                            "action": plan.kind.as_str(),
                            "outcome": outcome,
                        })),
                    ));
                }
                report.executions.push(ExecutionRecord {
                    incident_key: key.clone(),
                    action: plan.kind.clone(),
                    probe,
                    outcome: Some(outcome),
                });
            }
        }
        report.appended.extend(appended);
    }

    fn push_marker(
        &mut self,
        report: &mut CycleReport,
        active: &ActiveSet,
        source: &str,
        now: Timestamp,
    ) {
        let sample: Vec<_> = active
            .incidents
            .iter()
            .take(MARKER_SAMPLE)
            .map(|rec| {
                json!({
                    "type": rec.kind,
                    "source": rec.source,
                    "jobId": rec.job_id,
                    "id": rec.id,
                })
            })
            .collect();
        let count = active.incidents.len();
        report.appended.push(IncidentRecord::emitted(
            kinds::REAL_DETECTED_CRITICAL,
            Severity::Critical,
            source,
            now,
            format!(
                "detected {count} active critical incidents (safe_auto disabled; no actions executed)"
            ),
            Some(json!({ "count": count, "sample": sample })),
        ));
        report.marker = true;
        self.activity.event(
            ActivityEvent::MarkerEmitted,
            Level::Warning,
            format!("{count} active critical incidents"),
        );
    }

    fn write_heartbeat(
        &mut self,
        report: &mut CycleReport,
        source: &str,
        now: Timestamp,
    ) -> Result<()> {
        let heartbeat = HeartbeatRecord {
            ts: now,
            source: source.to_string(),
            mode: report.mode,
            status: "ok".to_string(),
            active_incidents: 0,
            run_id: report.run_id.clone(),
        };
        append_record(&self.config.paths.heartbeat_log, &heartbeat)?;
        report.heartbeat = true;
        self.activity
            .event(ActivityEvent::Heartbeat, Level::Info, "no active incidents");
        Ok(())
    }

    fn log_decision(&mut self, eval: &Evaluation, scope_key: &str) {
        if eval.plans.is_empty() {
            let mut entry = ActivityEntry::new(ActivityEvent::Decision, Level::Warning);
            entry.incident_key = Some(scope_key.to_string());
            entry.reason = Some("invalid_input".to_string());
            self.activity.write(entry);
            return;
        }
        for plan in &eval.plans {
            let mut entry = ActivityEntry::new(ActivityEvent::Decision, Level::Info);
            entry.incident_key = Some(scope_key.to_string());
            entry.action = Some(plan.kind.to_string());
            entry.allowed = Some(plan.allowed);
            entry.reason = plan.reason.map(|r| r.to_string());
            self.activity.write(entry);
        }
    }

    /// Failure write path under the run lock: record that an action for `key`
    /// failed at `now` and persist.
    pub fn record_failure(&mut self, key: &IncidentKey, now: Timestamp) -> Result<bool> {
        let paths = &self.config.paths;
        let lock = match RunLock::acquire(&paths.lock_file, self.config.lock.ttl_s, now)? {
            LockAcquire::Acquired(lock) => lock,
            LockAcquire::Busy(holder) => {
                return Err(RemedyError::LockIo {
                    path: paths.lock_file.clone(),
                    details: holder.map_or_else(
                        || "lock held by another run".to_string(),
                        |h| format!("lock held by pid {} run {}", h.pid, h.run_id),
                    ),
                });
            }
        };
        let mut store = PolicyStateStore::load(&paths.state_file)?;
        let recorded = self.engine.record_failure(&mut store, key, now, now);
        if recorded {
            store.save(&paths.state_file, now)?;
        }
        lock.release();
        Ok(recorded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parses_and_displays() {
        assert_eq!("plan".parse::<Mode>().unwrap(), Mode::Plan);
        assert_eq!(Mode::Real.to_string(), "real");
        assert!("live".parse::<Mode>().is_err());
        assert_eq!(serde_json::to_value(Mode::Plan).unwrap(), "plan");
    }
}
