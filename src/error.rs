use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::RunId;

/// Why a task was cancelled rather than allowed to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// A sibling in a concurrent composition failed first.
    SiblingFailed,
    /// A newer trigger replaced this inner task (latest-only flattening).
    Superseded,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::SiblingFailed => write!(f, "sibling failed"),
            CancelReason::Superseded => write!(f, "superseded by a newer trigger"),
        }
    }
}

/// Failure surfaced by a task or a composition of tasks.
///
/// Failures are stored in tracker nodes and session outcomes, so unlike
/// [`Error`] they are cheap to clone and comparable.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Failure {
    #[error("Transport error {code}: {message}")]
    Transport { code: u16, message: String },

    #[error("Cancelled: {reason}")]
    Cancelled { reason: CancelReason },

    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { last: Box<Failure>, attempts: u32 },
}

impl Failure {
    pub fn transport(code: u16, message: impl Into<String>) -> Self {
        Self::Transport {
            code,
            message: message.into(),
        }
    }

    pub fn cancelled(reason: CancelReason) -> Self {
        Self::Cancelled { reason }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Failure::Cancelled { .. })
    }

    /// Status code of the underlying transport failure, if any.
    pub fn code(&self) -> Option<u16> {
        match self {
            Failure::Transport { code, .. } => Some(*code),
            Failure::RetriesExhausted { last, .. } => last.code(),
            Failure::Cancelled { .. } => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task failed: {0}")]
    Task(#[from] Failure),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Run {0} was superseded by a newer request")]
    Superseded(RunId),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Result of running a task or a composition of tasks.
pub type TaskResult<T> = std::result::Result<T, Failure>;
