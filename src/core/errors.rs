//! RMD-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, RemedyError>;

/// Top-level error type for the remediation engine.
#[derive(Debug, Error)]
pub enum RemedyError {
    #[error("[RMD-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[RMD-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[RMD-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[RMD-2001] state document at {path} is unreadable: {details}")]
    StateLoadFailure { path: PathBuf, details: String },

    #[error("[RMD-2002] state write failed for {path}: {details}")]
    StateWrite { path: PathBuf, details: String },

    #[error("[RMD-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[RMD-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[RMD-3101] lock failure at {path}: {details}")]
    LockIo { path: PathBuf, details: String },

    #[error("[RMD-3201] failed to spawn {program}: {details}")]
    CommandSpawn { program: String, details: String },

    #[error("[RMD-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl RemedyError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "RMD-1001",
            Self::MissingConfig { .. } => "RMD-1002",
            Self::ConfigParse { .. } => "RMD-1003",
            Self::StateLoadFailure { .. } => "RMD-2001",
            Self::StateWrite { .. } => "RMD-2002",
            Self::Serialization { .. } => "RMD-2101",
            Self::Io { .. } => "RMD-3002",
            Self::LockIo { .. } => "RMD-3101",
            Self::CommandSpawn { .. } => "RMD-3201",
            Self::Runtime { .. } => "RMD-3900",
        }
    }

    /// Whether a later scheduled run might succeed without operator action.
    ///
    /// A corrupt state document is never retryable: it needs a human.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::StateWrite { .. }
                | Self::LockIo { .. }
                | Self::CommandSpawn { .. }
                | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl From<serde_json::Error> for RemedyError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for RemedyError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}
