//! Worker dispatch: the executor capability and the workers that drive it.
//!
//! ## Module map
//!
//! - this module: the [`Executor`] contract (`ExecutionRequest` in,
//!   `ExecutionResult` out). The core never learns how work is run.
//! - [`worker`]: [`WorkerDispatch`], which claims jobs, runs them under a
//!   timeout with a lease heartbeat, and hands results to the state machine.

pub mod worker;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ExecutorError;

pub use worker::{DispatchSettings, JobOutcome, JobReport, WorkerDispatch};

/// What an executor is asked to do for one step run.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub step_run_id: i64,
    pub protocol_run_id: i64,
    pub step_name: String,
    pub prompt: String,
    pub working_dir: PathBuf,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Failed,
    /// The executor cannot proceed without outside input.
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: String,
    pub path: String,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub output: String,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn completed(output: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Completed,
            output: output.into(),
            artifacts: Vec::new(),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            output: String::new(),
            artifacts: Vec::new(),
            error: Some(error.into()),
        }
    }

    pub fn blocked(reason: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Blocked,
            output: String::new(),
            artifacts: Vec::new(),
            error: Some(reason.into()),
        }
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    /// Short human-readable summary kept on the step run.
    pub fn summary(&self) -> String {
        let text = match self.status {
            ExecutionStatus::Completed => self.output.trim(),
            _ => self.error.as_deref().unwrap_or(self.output.trim()),
        };
        let first: String = text.lines().take(5).collect::<Vec<_>>().join("\n");
        if first.chars().count() > 500 {
            first.chars().take(500).collect()
        } else {
            first
        }
    }
}

/// Runs the work behind a step. Subprocess, container or remote API; the
/// dispatcher only sees this contract.
#[async_trait]
pub trait Executor: Send + Sync {
    fn id(&self) -> &str;

    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, ExecutorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_prefers_error_for_failures() {
        let mut r = ExecutionResult::failed("exit code 2");
        r.output = "partial output".into();
        assert_eq!(r.summary(), "exit code 2");
        assert_eq!(ExecutionResult::completed("  done\n").summary(), "done");
    }

    #[test]
    fn summary_is_truncated() {
        let long = "x".repeat(2000);
        assert_eq!(ExecutionResult::completed(long).summary().len(), 500);
    }

    #[test]
    fn result_deserializes_with_defaults() {
        let r: ExecutionResult = serde_json::from_str(r#"{"status":"blocked","output":""}"#).unwrap();
        assert_eq!(r.status, ExecutionStatus::Blocked);
        assert!(r.artifacts.is_empty());
        assert!(r.error.is_none());
    }
}
