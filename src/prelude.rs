//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use remedy_engine::prelude::*;
//! ```

// Core
pub use crate::core::config::{Config, GuardPolicy};
pub use crate::core::errors::{RemedyError, Result};

// Incidents
pub use crate::incident::record::{IncidentKey, IncidentRecord, Severity};
pub use crate::incident::source::{ReadScope, active_critical, read_incident_log};

// Policy
pub use crate::policy::classifier::{ActionKind, RiskClass, classify};
pub use crate::policy::engine::{ActionPlan, DecisionEngine, DenyReason, Evaluation, Verdict};
pub use crate::policy::state::{AlertLedger, PolicyStateStore};

// Runtime
pub use crate::daemon::command::{CommandExecutor, RemediationExecutor};
pub use crate::daemon::cutover::{CutoverDecision, evaluate_cutover};
pub use crate::daemon::runner::{CycleReport, CycleStatus, Mode, Runner};
