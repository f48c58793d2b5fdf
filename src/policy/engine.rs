//! Per-key guard state machine: circuit breaker → retry budget → per-action
//! classification with the restart guard on safe-auto kinds.
//!
//! The engine is a pure function of `(store, record, now)` plus its static
//! [`GuardPolicy`]: the same inputs always reproduce the same verdicts and the
//! same emitted incidents, so a cycle can be replayed after a crash.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::core::clock::{Timestamp, format_utc, secs};
use crate::core::config::GuardPolicy;
use crate::incident::record::{IncidentKey, IncidentRecord, Severity, kinds};
use crate::monitor::window::WindowedCounter;
use crate::policy::classifier::{ActionKind, RiskClass, classify};
use crate::policy::state::PolicyStateStore;

/// Source label used when none is configured.
pub const DEFAULT_SOURCE: &str = "mekhanik";

// ──────────────────── verdicts ────────────────────

/// Why an action was not allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    CircuitBreaker,
    RetryBudget,
    BlockedMvp,
    ApprovalRequired,
    RestartLoopBlocked,
    UnknownAction,
    /// Guard state could not be persisted; the cycle fails safe-closed.
    StateWriteFailed,
    /// Real mode with automatic execution switched off at the rollout layer.
    SafeAutoDisabled,
    /// The pre-action status probe did not answer in time.
    ProbeTimeout,
    /// The pre-action status probe could not be run at all.
    ProbeFailed,
}

impl DenyReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CircuitBreaker => "circuit_breaker",
            Self::RetryBudget => "retry_budget",
            Self::BlockedMvp => "blocked_mvp",
            Self::ApprovalRequired => "approval_required",
            Self::RestartLoopBlocked => "restart_loop_blocked",
            Self::UnknownAction => "unknown_action",
            Self::StateWriteFailed => "state_write_failed",
            Self::SafeAutoDisabled => "safe_auto_disabled",
            Self::ProbeTimeout => "probe_timeout",
            Self::ProbeFailed => "probe_failed",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict for one candidate action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionPlan {
    pub kind: ActionKind,
    pub risk_class: RiskClass,
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenyReason>,
    pub approval_required: bool,
    /// Earliest instant the blocking guard reopens, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<Timestamp>,
}

impl ActionPlan {
    fn allowed(kind: ActionKind) -> Self {
        Self {
            risk_class: kind.risk_class(),
            kind,
            allowed: true,
            reason: None,
            approval_required: false,
            retry_after: None,
        }
    }

    fn denied(kind: ActionKind, reason: DenyReason) -> Self {
        Self {
            risk_class: kind.risk_class(),
            approval_required: matches!(
                reason,
                DenyReason::ApprovalRequired | DenyReason::UnknownAction
            ),
            kind,
            allowed: false,
            reason: Some(reason),
            retry_after: None,
        }
    }

    fn with_retry_after(mut self, at: Option<Timestamp>) -> Self {
        self.retry_after = at;
        self
    }

    /// Turn an allowed verdict into a denial; denied verdicts keep their reason.
    pub fn downgrade(&mut self, reason: DenyReason) {
        if self.allowed {
            self.allowed = false;
            self.reason = Some(reason);
        }
    }
}

/// Terminal state of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Record lacked a type; nothing was planned or mutated.
    InvalidInput,
    BlockedBreaker,
    BlockedRetry,
    /// Each action carries its own verdict.
    Evaluated,
}

/// Everything one `decide` call produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    /// `None` only for invalid input.
    pub key: Option<IncidentKey>,
    pub incident_type: String,
    pub verdict: Verdict,
    pub plans: Vec<ActionPlan>,
    /// Policy incidents to append to the incident log.
    #[serde(skip)]
    pub emitted: Vec<IncidentRecord>,
}

impl Evaluation {
    /// Whether at least one action was allowed.
    #[must_use]
    pub fn any_allowed(&self) -> bool {
        self.plans.iter().any(|p| p.allowed)
    }

    /// Whether any plan was denied with `reason`.
    #[must_use]
    pub fn denied_with(&self, reason: DenyReason) -> bool {
        self.plans.iter().any(|p| p.reason == Some(reason))
    }
}

// ──────────────────── engine ────────────────────

/// Guard evaluation over a [`PolicyStateStore`].
#[derive(Debug, Clone)]
pub struct DecisionEngine {
    policy: GuardPolicy,
    source: String,
}

impl DecisionEngine {
    #[must_use]
    pub fn new(policy: GuardPolicy) -> Self {
        Self {
            policy,
            source: DEFAULT_SOURCE.to_string(),
        }
    }

    /// Stamp emitted incidents with `source` instead of the default label.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    #[must_use]
    pub fn policy(&self) -> &GuardPolicy {
        &self.policy
    }

    /// Evaluate `record` at `now`, updating the key's state in `store`.
    pub fn decide(
        &self,
        store: &mut PolicyStateStore,
        record: &IncidentRecord,
        now: Timestamp,
    ) -> Evaluation {
        if !record.has_type() {
            let emitted = self.emit(
                kinds::INVALID_INPUT,
                Severity::Critical,
                now,
                "incident without a type was not evaluated",
                json!({
                    "ref_id": record.id,
                    "source": record.source,
                }),
            );
            return Evaluation {
                key: None,
                incident_type: String::new(),
                verdict: Verdict::InvalidInput,
                plans: Vec::new(),
                emitted: vec![emitted],
            };
        }

        let key = IncidentKey::for_record(record);
        let candidates = classify(&record.kind);
        let mut state = store.get(&key, now);
        state.last_action_ts = Some(now);

        let cb = self.policy.circuit_breaker;
        let mut breaker = WindowedCounter::from_events(
            cb.window_s,
            cb.max_failures,
            std::mem::take(&mut state.fail_events),
        );
        let recent_failures = breaker.count(now);
        let breaker_reopens = breaker.reopens_at(now);
        state.fail_events = breaker.into_events();

        if let Some(reopens) = breaker_reopens {
            let plans = candidates
                .into_iter()
                .map(|kind| {
                    ActionPlan::denied(kind, DenyReason::CircuitBreaker)
                        .with_retry_after(Some(reopens))
                })
                .collect();
            let emitted = self.emit(
                kinds::CIRCUIT_BREAKER,
                Severity::Critical,
                now,
                format!(
                    "circuit breaker open for {key}: {recent_failures} failures within {}s",
                    cb.window_s
                ),
                json!({
                    "incident_key": key.as_str(),
                    "incident_type": record.kind,
                    "failures": recent_failures,
                    "retry_after": format_utc(reopens),
                }),
            );
            store.put(key.clone(), state);
            return Evaluation {
                key: Some(key),
                incident_type: record.kind.clone(),
                verdict: Verdict::BlockedBreaker,
                plans,
                emitted: vec![emitted],
            };
        }

        let guard = self.policy.restart_guard;
        let window = secs(guard.window_s);
        if now - state.window_start > window {
            state.attempts = 0;
            state.window_start = now;
        }

        let max_attempts = self.policy.retry_budget.max_attempts;
        if state.attempts >= max_attempts && recent_failures > 0 {
            let rollover = state.window_start + window + chrono::TimeDelta::milliseconds(1);
            let plans = candidates
                .into_iter()
                .map(|kind| {
                    ActionPlan::denied(kind, DenyReason::RetryBudget)
                        .with_retry_after(Some(rollover))
                })
                .collect();
            let emitted = self.emit(
                kinds::RETRY_BUDGET_EXCEEDED,
                Severity::Critical,
                now,
                format!(
                    "retry budget exhausted for {key}: {} attempts, {recent_failures} recent failures",
                    state.attempts
                ),
                json!({
                    "incident_key": key.as_str(),
                    "incident_type": record.kind,
                    "attempts": state.attempts,
                    "max_attempts": max_attempts,
                }),
            );
            store.put(key.clone(), state);
            return Evaluation {
                key: Some(key),
                incident_type: record.kind.clone(),
                verdict: Verdict::BlockedRetry,
                plans,
                emitted: vec![emitted],
            };
        }

        let mut restarts = WindowedCounter::from_events(
            guard.window_s,
            guard.max,
            std::mem::take(&mut state.restart_events),
        );
        let mut plans = Vec::with_capacity(candidates.len());
        let mut emitted = Vec::new();

        for kind in candidates {
            let plan = match kind.risk_class() {
                RiskClass::Blocked => ActionPlan::denied(kind, DenyReason::BlockedMvp),
                RiskClass::Risky => ActionPlan::denied(kind, DenyReason::ApprovalRequired),
                RiskClass::Unknown => ActionPlan::denied(kind, DenyReason::UnknownAction),
                RiskClass::SafeAuto => {
                    if restarts.allow(now) {
                        state.attempts = state.attempts.saturating_add(1);
                        ActionPlan::allowed(kind)
                    } else {
                        let reopens = restarts.reopens_at(now);
                        if emitted.is_empty() {
                            emitted.push(self.emit(
                                kinds::RESTART_LOOP_BLOCKED,
                                Severity::Critical,
                                now,
                                format!(
                                    "restart guard tripped for {key}: {} actions within {}s",
                                    guard.max, guard.window_s
                                ),
                                json!({
                                    "incident_key": key.as_str(),
                                    "incident_type": record.kind,
                                    "action": kind.as_str(),
                                }),
                            ));
                        }
                        ActionPlan::denied(kind, DenyReason::RestartLoopBlocked)
                            .with_retry_after(reopens)
                    }
                }
            };
            plans.push(plan);
        }

        state.restart_events = restarts.into_events();
        store.put(key.clone(), state);
        Evaluation {
            key: Some(key),
            incident_type: record.kind.clone(),
            verdict: Verdict::Evaluated,
            plans,
            emitted,
        }
    }

    /// Record that an action previously allowed for `key` failed at `at`.
    ///
    /// Separate from the decision path: touches only `fail_events`. Returns
    /// `false` when the failure was already recorded or is already outside
    /// the breaker window.
    pub fn record_failure(
        &self,
        store: &mut PolicyStateStore,
        key: &IncidentKey,
        at: Timestamp,
        now: Timestamp,
    ) -> bool {
        let mut state = store.get(key, now);
        let mut breaker = WindowedCounter::from_events(
            self.policy.circuit_breaker.window_s,
            usize::MAX,
            std::mem::take(&mut state.fail_events),
        );
        breaker.count(now);
        let fresh = !breaker.contains(at);
        if fresh {
            breaker.record(at);
            breaker.count(now);
        }
        let kept = breaker.contains(at);
        let mut events = breaker.into_events();
        events.sort_unstable();
        state.fail_events = events;
        if fresh && kept {
            store.put(key.clone(), state);
            true
        } else {
            if store.incidents.contains_key(key) {
                store.put(key.clone(), state);
            }
            false
        }
    }

    fn emit(
        &self,
        kind: &str,
        severity: Severity,
        now: Timestamp,
        msg: impl Into<String>,
        detail: serde_json::Value,
    ) -> IncidentRecord {
        IncidentRecord::emitted(kind, severity, &self.source, now, msg, Some(detail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::parse_utc;
    use chrono::TimeDelta;
    use proptest::prelude::*;

    fn t0() -> Timestamp {
        parse_utc("2026-05-01T12:00:00Z").unwrap()
    }

    fn at(offset_s: i64) -> Timestamp {
        t0() + TimeDelta::seconds(offset_s)
    }

    fn incident(id: Option<&str>, kind: &str) -> IncidentRecord {
        IncidentRecord {
            id: id.map(str::to_string),
            kind: kind.to_string(),
            severity: Severity::Critical,
            source: "uchastkovy".to_string(),
            job_id: None,
            ts: t0(),
            msg: String::new(),
            resolved: false,
            detail: None,
        }
    }

    fn engine() -> DecisionEngine {
        DecisionEngine::new(GuardPolicy::default())
    }

    #[test]
    fn restart_guard_throttles_then_resets_after_window() {
        let engine = engine();
        let mut store = PolicyStateStore::default();
        let rec = incident(Some("i1"), "gateway_down");
        let key = IncidentKey::from_raw("i1");

        let first = engine.decide(&mut store, &rec, at(0));
        assert!(first.any_allowed());
        assert_eq!(store.incidents[&key].attempts, 1);

        let second = engine.decide(&mut store, &rec, at(60));
        assert!(second.any_allowed());
        assert_eq!(store.incidents[&key].attempts, 2);

        let third = engine.decide(&mut store, &rec, at(120));
        assert!(!third.any_allowed());
        assert!(third.denied_with(DenyReason::RestartLoopBlocked));
        assert_eq!(third.emitted.len(), 1);
        assert_eq!(third.emitted[0].kind, kinds::RESTART_LOOP_BLOCKED);
        assert!(third.plans[0].retry_after.is_some());

        let fourth = engine.decide(&mut store, &rec, at(1860));
        assert!(fourth.any_allowed());
        assert_eq!(store.incidents[&key].attempts, 1);
        assert!(fourth.emitted.is_empty());
    }

    #[test]
    fn breaker_denies_every_kind_after_three_failures() {
        let engine = engine();
        let mut store = PolicyStateStore::default();
        let key = IncidentKey::from_raw("gw1");
        for off in [0, 300, 600] {
            assert!(engine.record_failure(&mut store, &key, at(off), at(off)));
        }

        let eval = engine.decide(&mut store, &incident(Some("gw1"), "gateway_down"), at(700));
        assert_eq!(eval.verdict, Verdict::BlockedBreaker);
        assert!(!eval.plans.is_empty());
        assert!(
            eval.plans
                .iter()
                .all(|p| !p.allowed && p.reason == Some(DenyReason::CircuitBreaker))
        );
        assert_eq!(eval.emitted.len(), 1);
        assert_eq!(eval.emitted[0].kind, kinds::CIRCUIT_BREAKER);
        // Breaker trips do not consume attempts.
        assert_eq!(store.incidents[&key].attempts, 0);

        // Reopens once the oldest failure ages out.
        let reopen = eval.plans[0].retry_after.unwrap();
        assert!(reopen > at(1800));
        let later = engine.decide(&mut store, &incident(Some("gw1"), "gateway_down"), reopen);
        assert_ne!(later.verdict, Verdict::BlockedBreaker);
    }

    #[test]
    fn guard_trips_stay_with_their_own_key() {
        let engine = engine();
        let mut store = PolicyStateStore::default();
        let looping = incident(Some("gw-a"), "gateway_down");
        let neighbour = incident(Some("gw-b"), "gateway_down");

        for off in [0, 60] {
            assert!(engine.decide(&mut store, &looping, at(off)).any_allowed());
        }
        let blocked = engine.decide(&mut store, &looping, at(120));
        assert!(blocked.denied_with(DenyReason::RestartLoopBlocked));

        let other = engine.decide(&mut store, &neighbour, at(120));
        assert!(other.any_allowed());
        assert!(other.emitted.is_empty());
        assert_eq!(store.incidents[&IncidentKey::from_raw("gw-b")].attempts, 1);

        let broken = IncidentKey::from_raw("cron-a");
        for off in [0, 300, 600] {
            assert!(engine.record_failure(&mut store, &broken, at(off), at(off)));
        }
        let tripped = engine.decide(&mut store, &incident(Some("cron-a"), "cron_error"), at(700));
        assert_eq!(tripped.verdict, Verdict::BlockedBreaker);

        let healthy = engine.decide(&mut store, &incident(Some("cron-b"), "cron_error"), at(700));
        assert_ne!(healthy.verdict, Verdict::BlockedBreaker);
        assert!(!healthy.denied_with(DenyReason::CircuitBreaker));
    }

    #[test]
    fn breaker_applies_regardless_of_risk_class() {
        let engine = engine();
        let mut store = PolicyStateStore::default();
        let key = IncidentKey::from_raw("cron:nightly");
        for off in [0, 1, 2] {
            engine.record_failure(&mut store, &key, at(off), at(off));
        }
        let eval = engine.decide(&mut store, &incident(Some("cron:nightly"), "cron_error"), at(3));
        assert_eq!(eval.plans[0].risk_class, RiskClass::Risky);
        assert_eq!(eval.plans[0].reason, Some(DenyReason::CircuitBreaker));
    }

    #[test]
    fn missing_type_is_invalid_and_mutates_nothing() {
        let engine = engine();
        let mut store = PolicyStateStore::default();
        let eval = engine.decide(&mut store, &incident(Some("x"), ""), at(0));
        assert_eq!(eval.verdict, Verdict::InvalidInput);
        assert!(eval.plans.is_empty());
        assert!(eval.key.is_none());
        assert!(store.is_empty());
        assert_eq!(eval.emitted[0].kind, kinds::INVALID_INPUT);
    }

    #[test]
    fn retry_budget_caps_retries_after_failure() {
        let engine = engine();
        let mut store = PolicyStateStore::default();
        let rec = incident(Some("i9"), "gateway_memory_high");
        let key = IncidentKey::from_raw("i9");

        assert!(engine.decide(&mut store, &rec, at(0)).any_allowed());
        assert!(engine.decide(&mut store, &rec, at(60)).any_allowed());
        engine.record_failure(&mut store, &key, at(90), at(90));

        let eval = engine.decide(&mut store, &rec, at(120));
        assert_eq!(eval.verdict, Verdict::BlockedRetry);
        assert!(eval.denied_with(DenyReason::RetryBudget));
        assert_eq!(eval.emitted[0].kind, kinds::RETRY_BUDGET_EXCEEDED);
    }

    #[test]
    fn risky_blocked_and_unknown_kinds_are_never_allowed() {
        let engine = engine();
        let mut store = PolicyStateStore::default();

        let risky = engine.decide(&mut store, &incident(None, "cron_error"), at(0));
        assert_eq!(risky.plans[0].reason, Some(DenyReason::ApprovalRequired));
        assert!(risky.plans[0].approval_required);

        let snapshot = engine.decide(&mut store, &incident(None, "snapshot_stale"), at(0));
        assert_eq!(snapshot.plans[0].kind, ActionKind::RunHetznerSnapshot);
        assert!(!snapshot.any_allowed());

        let mut plan = ActionPlan::denied(ActionKind::RmFiles, DenyReason::BlockedMvp);
        assert!(!plan.approval_required);
        plan.downgrade(DenyReason::StateWriteFailed);
        assert_eq!(plan.reason, Some(DenyReason::BlockedMvp));
    }

    #[test]
    fn unknown_type_escalates_under_restart_guard() {
        let engine = engine();
        let mut store = PolicyStateStore::default();
        let eval = engine.decide(&mut store, &incident(None, "disk_smart_warning"), at(0));
        assert_eq!(eval.plans[0].kind, ActionKind::Escalate);
        assert!(eval.any_allowed());
        assert_eq!(
            eval.key.unwrap().as_str(),
            "disk_smart_warning:",
            "fallback key uses type and empty job"
        );
    }

    #[test]
    fn every_evaluation_refreshes_last_action_ts() {
        let engine = engine();
        let mut store = PolicyStateStore::default();
        let rec = incident(Some("c1"), "cron_skip");
        engine.decide(&mut store, &rec, at(0));
        engine.decide(&mut store, &rec, at(500));
        let state = &store.incidents[&IncidentKey::from_raw("c1")];
        assert_eq!(state.last_action_ts, Some(at(500)));
        assert_eq!(state.attempts, 0);
    }

    #[test]
    fn record_failure_is_idempotent() {
        let engine = engine();
        let mut store = PolicyStateStore::default();
        let key = IncidentKey::from_raw("gw1");
        assert!(engine.record_failure(&mut store, &key, at(0), at(5)));
        assert!(!engine.record_failure(&mut store, &key, at(0), at(10)));
        assert_eq!(store.incidents[&key].fail_events.len(), 1);
        // Already outside the breaker window: nothing to record.
        assert!(!engine.record_failure(&mut store, &key, at(-4000), at(10)));
        assert_eq!(store.incidents[&key].fail_events.len(), 1);
    }

    #[test]
    fn decisions_replay_identically() {
        let engine = engine();
        let mut store = PolicyStateStore::default();
        let rec = incident(Some("i1"), "gateway_down");
        engine.decide(&mut store, &rec, at(0));
        engine.decide(&mut store, &rec, at(30));

        let mut replay = store.clone();
        let a = engine.decide(&mut store, &rec, at(45));
        let b = engine.decide(&mut replay, &rec, at(45));
        assert_eq!(a, b);
        assert_eq!(store, replay);
    }

    #[test]
    fn emitted_incidents_carry_configured_source() {
        let engine = engine().with_source("remedy-test");
        let mut store = PolicyStateStore::default();
        let eval = engine.decide(&mut store, &incident(None, ""), at(0));
        assert_eq!(eval.emitted[0].source, "remedy-test");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        /// Allowed safe-auto actions per key never exceed the restart guard
        /// in any rolling window, whatever the decision cadence.
        #[test]
        fn allowed_actions_respect_restart_guard(
            mut offsets in prop::collection::vec(0i64..14_400, 1..80),
            max in 1usize..4,
            window_s in 60u64..3600,
        ) {
            offsets.sort_unstable();
            let mut policy = GuardPolicy::default();
            policy.restart_guard.max = max;
            policy.restart_guard.window_s = window_s;
            policy.retry_budget.max_attempts = 1;
            let engine = DecisionEngine::new(policy);
            let mut store = PolicyStateStore::default();
            let rec = incident(Some("p1"), "gateway_down");

            let mut allowed = Vec::new();
            for off in offsets {
                let now = at(off);
                if engine.decide(&mut store, &rec, now).any_allowed() {
                    allowed.push(now);
                }
            }
            for (i, start) in allowed.iter().enumerate() {
                let end = *start + secs(window_s);
                let inside = allowed[i..].iter().filter(|ts| **ts <= end).count();
                prop_assert!(inside <= max);
            }
        }
    }
}
