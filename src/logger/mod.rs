//! Append-only JSONL output: activity log with graceful degradation, plus the
//! per-cycle metrics and heartbeat records.

pub mod jsonl;
pub mod metrics;
