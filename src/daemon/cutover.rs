//! Offline rollout gate: should automatic safe-auto execution be switched on?
//!
//! Reads the metrics log over the evaluation window and recommends enabling
//! only after a full cadence of clean runs. This never changes configuration
//! itself; an operator flips `rollout.safe_auto_enabled`.

use std::path::Path;

use serde::Serialize;

use crate::core::clock::{Timestamp, secs};
use crate::core::config::RolloutConfig;
use crate::core::errors::Result;
use crate::logger::metrics::{MetricsRecord, read_metrics};

/// Sums over the evaluation window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CutoverAggregate {
    pub runs: u64,
    pub state_write_failed: u64,
    pub restart_loop_blocked: u64,
    pub circuit_breaker_triggered: u64,
    pub planned_safe_auto: u64,
    pub planned_risky: u64,
    pub executed: u64,
    /// Metrics lines that could not be parsed.
    pub malformed_lines: u64,
}

impl CutoverAggregate {
    fn add(&mut self, rec: &MetricsRecord) {
        self.runs += 1;
        self.state_write_failed += u64::from(rec.state_write_failed);
        self.restart_loop_blocked += u64::from(rec.restart_loop_blocked);
        self.circuit_breaker_triggered += u64::from(rec.circuit_breaker_triggered);
        self.planned_safe_auto += rec.planned_safe_auto;
        self.planned_risky += rec.planned_risky;
        self.executed += rec.executed;
    }
}

/// Recommendation plus the evidence behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CutoverDecision {
    pub ts: Timestamp,
    pub ok_to_enable_safe_auto: bool,
    pub window_s: u64,
    pub agg: CutoverAggregate,
    /// Why the gate is closed; empty when it is open.
    pub reasons: Vec<String>,
}

/// Aggregate metrics from `metrics_log` and apply the rollout gate.
pub fn evaluate_cutover(
    metrics_log: &Path,
    rollout: &RolloutConfig,
    now: Timestamp,
) -> Result<CutoverDecision> {
    let since = now - secs(rollout.evaluation_window_s);
    let (records, malformed) = read_metrics(metrics_log, since)?;

    let mut agg = CutoverAggregate {
        malformed_lines: malformed as u64,
        ..CutoverAggregate::default()
    };
    for rec in records.iter().filter(|r| r.ts <= now) {
        agg.add(rec);
    }

    let mut reasons = Vec::new();
    if agg.runs < rollout.min_runs {
        reasons.push(format!(
            "only {} runs in window, need {}",
            agg.runs, rollout.min_runs
        ));
    }
    for (name, count) in [
        ("state_write_failed", agg.state_write_failed),
        ("restart_loop_blocked", agg.restart_loop_blocked),
        ("circuit_breaker_triggered", agg.circuit_breaker_triggered),
    ] {
        if count > 0 {
            reasons.push(format!("{name} observed {count} times"));
        }
    }

    Ok(CutoverDecision {
        ts: now,
        ok_to_enable_safe_auto: reasons.is_empty(),
        window_s: rollout.evaluation_window_s,
        agg,
        reasons,
    })
}
