//! Typed error hierarchy for the orchestration core.
//!
//! Two top-level enums:
//! - `OrchestratorError`: state machine, queue and operator-surface failures
//! - `ExecutorError`: failures raised while invoking an executor for one job

use std::time::Duration;

use thiserror::Error;

/// Errors from the protocol state machine, job queue and operator API.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Cannot {action} {entity} {id} while it is {from}")]
    InvalidTransition {
        entity: &'static str,
        id: i64,
        from: String,
        action: String,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Transient executor failure: {0}")]
    TransientExecutor(String),

    #[error("Executor cannot proceed: {0}")]
    StructuralBlock(String),

    #[error("Quality gate failed: {0}")]
    GateFailure(String),

    #[error("Checklist failed: {0}")]
    ChecklistFailure(String),

    #[error("Loop limit exceeded: {count} of {limit} {what}")]
    LoopLimitExceeded {
        what: &'static str,
        limit: u32,
        count: u32,
    },

    #[error("Protocol run {id} was updated concurrently (expected status {expected})")]
    ConcurrentUpdate { id: i64, expected: String },

    #[error("Job {job_id} is not leased by {worker_id}")]
    LeaseLost { job_id: i64, worker_id: String },

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn invalid_transition(
        entity: &'static str,
        id: i64,
        from: impl ToString,
        action: impl Into<String>,
    ) -> Self {
        Self::InvalidTransition {
            entity,
            id,
            from: from.to_string(),
            action: action.into(),
        }
    }
}

/// Errors from a single executor invocation.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Executor timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to spawn executor process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Executor I/O failed: {0}")]
    Io(#[source] std::io::Error),

    #[error("Executor crashed with exit code {code:?}")]
    Crashed { code: Option<i32> },

    #[error("No executor registered under '{0}'")]
    Unknown(String),
}

impl ExecutorError {
    /// Whether the failure is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Io(_) | Self::Crashed { .. } => true,
            Self::Spawn(_) | Self::Unknown(_) => false,
        }
    }
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;
