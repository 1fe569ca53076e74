//! Typed errors for the scheduling core.
//!
//! `TaskflowError` keeps store and registry failures pattern-matchable;
//! `anyhow` stays inside task executors and the CLI boundary.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TaskflowError>;

#[derive(Debug, Error)]
pub enum TaskflowError {
    /// Registration-time rejection: bad dependency, self-cycle, duplicate.
    /// Fatal at startup.
    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    /// A cron expression failed to parse. The offending definition is
    /// skipped by the scheduler, not the whole run.
    #[error("invalid schedule `{expression}`: {reason}")]
    InvalidSchedule { expression: String, reason: String },

    /// An insert violated the partial unique index on `(name, "unique")`.
    #[error("an active instance with this unique key already exists")]
    UniqueConflict,

    /// A task or workflow name is unknown to the registry or the store.
    #[error("{kind} `{name}` not found")]
    NotFound { kind: &'static str, name: String },

    /// Network or otherwise retryable database failure. Rolled back and
    /// retried on the next scheduler tick.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// A push destination's remote executor could not be reached.
    #[error("remote executor error: {0}")]
    RemoteExecutor(String),
}

impl TaskflowError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }
}
