//! Core types: errors, configuration, timestamps.

pub mod clock;
pub mod config;
pub mod errors;
