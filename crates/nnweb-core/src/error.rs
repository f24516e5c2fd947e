//! Error types for backend selection.

use std::fmt;

use nnweb_runtime::{BackendKind, ParseBackendKindError};
use thiserror::Error;

/// Errors that end initialization.
///
/// Individual backend failures never surface here; they are recorded as
/// [`BackendAttempt`]s and the next candidate is tried.
#[derive(Error, Debug)]
pub enum InitError {
    /// The caller asked for something that cannot be configured.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Every candidate backend was exhausted.
    #[error("no backend available: {}", describe_attempts(.attempts))]
    NoBackendAvailable { attempts: Vec<BackendAttempt> },
}

/// Configuration and programming errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A backend name that matches no kind.
    #[error("unknown backend '{0}'")]
    UnknownBackend(String),

    /// A kind with no registered runner factory.
    #[error("backend '{0}' is not registered")]
    UnregisteredBackend(BackendKind),

    /// A configuration value that cannot be used.
    #[error("invalid option {key}: {reason}")]
    InvalidOption { key: String, reason: String },

    /// I/O error reading or writing configuration.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed configuration file.
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

impl From<ParseBackendKindError> for ConfigError {
    fn from(err: ParseBackendKindError) -> Self {
        ConfigError::UnknownBackend(err.0)
    }
}

/// Errors from persisted state stores.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The store's backing data could not be decoded.
    #[error("corrupt state: {0}")]
    Corrupt(String),

    /// The platform offers no durable storage.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Where a backend attempt stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStage {
    /// Excluded by the capability probe or the crash tracker.
    Unavailable,
    Construct,
    Init,
    Load,
}

impl fmt::Display for AttemptStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttemptStage::Unavailable => "unavailable",
            AttemptStage::Construct => "construct",
            AttemptStage::Init => "init",
            AttemptStage::Load => "load",
        };
        f.write_str(s)
    }
}

/// One candidate that did not make it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendAttempt {
    pub kind: BackendKind,
    pub stage: AttemptStage,
    pub reason: String,
}

impl fmt::Display for BackendAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}: {})", self.kind, self.stage, self.reason)
    }
}

fn describe_attempts(attempts: &[BackendAttempt]) -> String {
    if attempts.is_empty() {
        return "no candidates".to_string();
    }
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type for initialization.
pub type Result<T> = std::result::Result<T, InitError>;
