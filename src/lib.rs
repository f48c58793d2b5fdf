#![forbid(unsafe_code)]

//! Remedy engine: incident remediation policy for a single-host service fleet.
//!
//! Each scheduled cycle reads the shared incident log, decides what may be done
//! about every active critical incident, and persists the guard state that
//! keeps those decisions honest across runs:
//! 1. **Restart guard** caps automatic restarts per incident in a sliding window
//! 2. **Retry budget** stops retrying an incident that keeps failing
//! 3. **Circuit breaker** holds off everything for an incident after repeated failures
//!
//! Cycles run in plan-only mode (evaluate and persist, never act) or staged real
//! mode, where execution is gated by an explicit rollout flag that the
//! [`daemon::cutover`] check recommends flipping.
//!
//! # Library usage
//!
//! ```rust,no_run
//! use remedy_engine::prelude::*;
//!
//! let config = Config::load(None).expect("config");
//! let mut runner = Runner::new(config);
//! let report = runner.run(Mode::Plan).expect("cycle");
//! println!("{} evaluations", report.evaluations.len());
//! ```

pub mod prelude;

pub mod core;
pub mod daemon;
pub mod incident;
pub mod logger;
pub mod monitor;
pub mod policy;
