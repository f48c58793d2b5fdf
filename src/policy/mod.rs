//! Remediation policy: action classification, guard decisions, persisted state.

pub mod classifier;
pub mod engine;
pub mod state;
