use std::path::PathBuf;

use thiserror::Error;

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, ScanError>;

/// Errors surfaced synchronously to the caller.
///
/// Conditions that happen while a scan is running (nonzero exit, timeout, malformed output)
/// are recorded on the session instead; see [`crate::types::FailureReason`].
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("invalid target `{target}`: {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("flag `{flag}` is not allowed: {reason}")]
    DisallowedFlag { flag: String, reason: String },

    #[error("unknown preset `{0}`")]
    UnknownPreset(String),

    #[error("scanner `{binary}` not found. {hint}")]
    ToolNotFound { binary: String, hint: String },

    #[error("failed to start scanner: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("target file {path}: {reason}")]
    TargetFile { path: PathBuf, reason: String },

    #[error("export failed: {0}")]
    Export(String),

    #[error("import failed: {0}")]
    Import(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no connectable host `{0}` in current results")]
    NotFound(String),
}

impl ScanError {
    pub fn invalid_target(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTarget {
            target: target.into(),
            reason: reason.into(),
        }
    }

    pub fn disallowed_flag(flag: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DisallowedFlag {
            flag: flag.into(),
            reason: reason.into(),
        }
    }

    /// True for request-building errors where re-prompting the user makes sense.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InvalidTarget { .. }
                | Self::DisallowedFlag { .. }
                | Self::UnknownPreset(_)
                | Self::TargetFile { .. }
        )
    }
}

impl From<csv::Error> for ScanError {
    fn from(e: csv::Error) -> Self {
        Self::Export(e.to_string())
    }
}
