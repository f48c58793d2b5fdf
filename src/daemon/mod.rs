//! Cycle runtime: run lock, timed external commands, the cycle runner and the
//! offline rollout gate.

pub mod command;
pub mod cutover;
pub mod lock;
pub mod runner;
