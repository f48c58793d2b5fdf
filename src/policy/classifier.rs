//! Incident type → candidate actions, and the static risk class of each action.
//!
//! Pure lookups: no state, no side effects.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Remediation action the engine may propose.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    RestartGateway,
    CronRunMonitor,
    Escalate,
    RunHetznerSnapshot,
    ModifyCronJob,
    GitCommitPush,
    DeleteRemoteResource,
    RmFiles,
    AutoForcePush,
    ChangeModel,
    /// Conservative halt recorded when guard state could not be persisted.
    SafeStop,
    /// Anything outside the catalogue; never executed.
    #[serde(untagged)]
    Other(String),
}

/// Static risk class of an action kind. The three named sets are disjoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskClass {
    /// May execute automatically, subject to guards.
    SafeAuto,
    /// Always requires manual approval; never auto-executed.
    Risky,
    /// Always denied in this rollout phase, approval or not.
    Blocked,
    Unknown,
}

impl ActionKind {
    /// Wire name of the action.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::RestartGateway => "restart_gateway",
            Self::CronRunMonitor => "cron_run_monitor",
            Self::Escalate => "escalate",
            Self::RunHetznerSnapshot => "run_hetzner_snapshot",
            Self::ModifyCronJob => "modify_cron_job",
            Self::GitCommitPush => "git_commit_push",
            Self::DeleteRemoteResource => "delete_remote_resource",
            Self::RmFiles => "rm_files",
            Self::AutoForcePush => "auto_force_push",
            Self::ChangeModel => "change_model",
            Self::SafeStop => "safe_stop",
            Self::Other(name) => name,
        }
    }

    /// Risk class is a property of the kind alone.
    #[must_use]
    pub fn risk_class(&self) -> RiskClass {
        match self {
            Self::RestartGateway | Self::CronRunMonitor | Self::Escalate => RiskClass::SafeAuto,
            Self::RunHetznerSnapshot
            | Self::ModifyCronJob
            | Self::GitCommitPush
            | Self::DeleteRemoteResource => RiskClass::Risky,
            Self::RmFiles | Self::AutoForcePush | Self::ChangeModel | Self::SafeStop => {
                RiskClass::Blocked
            }
            Self::Other(_) => RiskClass::Unknown,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for RiskClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SafeAuto => write!(f, "safe_auto"),
            Self::Risky => write!(f, "risky"),
            Self::Blocked => write!(f, "blocked"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Candidate actions for an incident type.
///
/// Unrecognized types are routed to [`ActionKind::Escalate`], never dropped.
/// Returns an empty plan for an empty type; callers treat that as invalid input.
#[must_use]
pub fn classify(incident_type: &str) -> Vec<ActionKind> {
    match incident_type.trim() {
        "" => Vec::new(),
        "gateway_down" | "gateway_memory_high" | "announce_queue_loop" => {
            vec![ActionKind::RestartGateway]
        }
        "cron_error" | "cron_skip" => vec![ActionKind::ModifyCronJob],
        "snapshot_stale" => vec![ActionKind::RunHetznerSnapshot],
        _ => vec![ActionKind::Escalate],
    }
}
