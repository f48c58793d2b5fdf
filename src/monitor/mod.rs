//! Sliding time-window counters shared by the guards, dedup and alert limits.

pub mod window;
