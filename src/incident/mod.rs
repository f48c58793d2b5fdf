//! Incident log records and the bounded reader that builds the active set.

pub mod record;
pub mod source;
