//! Operator action surface.
//!
//! Every action answers with an [`ActionOutcome`]: whether it succeeded, the
//! protocol status afterwards, and a message. Rejected actions change
//! nothing and come back with `success: false` rather than an error.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;

use crate::errors::{OrchestratorError, Result};
use crate::events::OpContext;
use crate::machine::{ProtocolStateMachine, QaRequest};
use crate::store::{DbHandle, ProtocolStatus, StoreDb};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Start,
    Pause,
    Resume,
    Cancel,
    RunNextStep,
    RetryLatest,
    RunQa,
    Approve,
    OpenPr,
}

impl Action {
    pub const ALL: [Action; 9] = [
        Action::Start,
        Action::Pause,
        Action::Resume,
        Action::Cancel,
        Action::RunNextStep,
        Action::RetryLatest,
        Action::RunQa,
        Action::Approve,
        Action::OpenPr,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Pause => "pause",
            Action::Resume => "resume",
            Action::Cancel => "cancel",
            Action::RunNextStep => "run_next_step",
            Action::RetryLatest => "retry_latest",
            Action::RunQa => "run_qa",
            Action::Approve => "approve",
            Action::OpenPr => "open_pr",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts `run_next_step` and `run-next-step` alike.
impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Action::ALL
            .into_iter()
            .find(|a| a.as_str() == normalized)
            .ok_or_else(|| {
                let known: Vec<&str> = Action::ALL.iter().map(Action::as_str).collect();
                format!("unknown action '{s}' (expected one of: {})", known.join(", "))
            })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionOutcome {
    pub action: Action,
    pub protocol_run_id: i64,
    pub success: bool,
    /// Protocol status after the action; `None` if the run does not exist.
    pub status: Option<ProtocolStatus>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnswerOutcome {
    pub clarification_id: i64,
    pub success: bool,
    pub protocol_run_id: Option<i64>,
    pub status: Option<ProtocolStatus>,
    pub message: String,
}

pub struct OperatorApi {
    db: DbHandle,
    machine: Arc<ProtocolStateMachine>,
}

impl OperatorApi {
    pub fn new(db: DbHandle, machine: Arc<ProtocolStateMachine>) -> Self {
        Self { db, machine }
    }

    /// Run `action` against a protocol run. `step_id` narrows `run_qa` and
    /// `approve` to one step; other actions ignore it.
    pub async fn perform(&self, protocol_id: i64, action: Action, step_id: Option<i64>) -> ActionOutcome {
        let machine = self.machine.clone();
        let done = self
            .db
            .call_op(move |db| {
                let ctx = OpContext::new();
                let result = apply(&machine, db, &ctx, protocol_id, action, step_id);
                let status = db.get_protocol_run(protocol_id)?.map(|p| p.status);
                Ok((result, status))
            })
            .await;

        let outcome = match done {
            Ok((Ok((message, job_id)), status)) => ActionOutcome {
                action,
                protocol_run_id: protocol_id,
                success: true,
                status,
                message,
                job_id,
            },
            Ok((Err(e), status)) => ActionOutcome {
                action,
                protocol_run_id: protocol_id,
                success: false,
                status,
                message: e.to_string(),
                job_id: None,
            },
            Err(e) => ActionOutcome {
                action,
                protocol_run_id: protocol_id,
                success: false,
                status: None,
                message: e.to_string(),
                job_id: None,
            },
        };
        if outcome.success {
            tracing::info!(protocol_id, action = %action, status = ?outcome.status, "operator action applied");
        } else {
            tracing::warn!(protocol_id, action = %action, reason = %outcome.message, "operator action rejected");
        }
        outcome
    }

    /// Answer a clarification. With `resume`, a protocol blocked on it goes
    /// back to `running` once no other blocking clarification is open.
    pub async fn answer(
        &self,
        clarification_id: i64,
        answer: String,
        answered_by: Option<String>,
        resume: bool,
    ) -> AnswerOutcome {
        let machine = self.machine.clone();
        let done = self
            .db
            .call_op(move |db| {
                let ctx = OpContext::new();
                let answered = db.atomically(|db| {
                    let c = machine.answer_clarification(db, &ctx, clarification_id, &answer, answered_by.as_deref())?;
                    let mut message = format!("clarification {clarification_id} answered");
                    if let (true, Some(protocol_id)) = (resume, c.protocol_run_id) {
                        message.push_str(&resume_if_clear(&machine, db, &ctx, protocol_id)?);
                    }
                    Ok::<_, OrchestratorError>((c.protocol_run_id, message))
                });
                let protocol_id = match &answered {
                    Ok((id, _)) => *id,
                    Err(_) => db.get_clarification(clarification_id)?.and_then(|c| c.protocol_run_id),
                };
                let status = match protocol_id {
                    Some(id) => db.get_protocol_run(id)?.map(|p| p.status),
                    None => None,
                };
                Ok((answered.map(|(_, m)| m), protocol_id, status))
            })
            .await;

        match done {
            Ok((Ok(message), protocol_run_id, status)) => AnswerOutcome {
                clarification_id,
                success: true,
                protocol_run_id,
                status,
                message,
            },
            Ok((Err(e), protocol_run_id, status)) => AnswerOutcome {
                clarification_id,
                success: false,
                protocol_run_id,
                status,
                message: e.to_string(),
            },
            Err(e) => AnswerOutcome {
                clarification_id,
                success: false,
                protocol_run_id: None,
                status: None,
                message: e.to_string(),
            },
        }
    }
}

fn apply(
    machine: &ProtocolStateMachine,
    db: &StoreDb,
    ctx: &OpContext,
    id: i64,
    action: Action,
    step_id: Option<i64>,
) -> Result<(String, Option<i64>)> {
    let queued = |job: Option<crate::store::Job>, idle: &str| match job {
        Some(job) => (format!("queued {} job {}", job.action, job.id), Some(job.id)),
        None => (idle.to_string(), None),
    };
    Ok(match action {
        Action::Start => queued(machine.start(db, ctx, id)?, "started"),
        Action::Pause => {
            machine.pause(db, ctx, id)?;
            ("paused".to_string(), None)
        }
        Action::Resume => queued(machine.resume(db, ctx, id)?, "resumed"),
        Action::Cancel => {
            machine.cancel(db, ctx, id)?;
            ("cancelled".to_string(), None)
        }
        Action::RunNextStep => queued(machine.run_next_step(db, ctx, id)?, "nothing to run"),
        Action::RetryLatest => queued(Some(machine.retry_latest(db, ctx, id)?), ""),
        Action::RunQa => match machine.request_qa(db, ctx, id, step_id)? {
            QaRequest::Enqueued(job) => (format!("QA queued as job {}", job.id), Some(job.id)),
            QaRequest::AlreadyQueued(job) => (format!("QA already queued as job {}", job.id), Some(job.id)),
            QaRequest::BlockedByClarifications(ids) => {
                let ids: Vec<String> = ids.iter().map(i64::to_string).collect();
                return Err(OrchestratorError::invalid_transition(
                    "protocol run",
                    id,
                    format!("waiting on clarification(s) {}", ids.join(", ")),
                    "run QA for",
                ));
            }
        },
        Action::Approve => {
            let step = machine.approve(db, ctx, id, step_id)?;
            (format!("step '{}' approved", step.name), None)
        }
        Action::OpenPr => {
            machine.open_pr(db, ctx, id)?;
            ("pull request requested".to_string(), None)
        }
    })
}

fn resume_if_clear(machine: &ProtocolStateMachine, db: &StoreDb, ctx: &OpContext, protocol_id: i64) -> Result<String> {
    let protocol = machine.load_protocol(db, protocol_id)?;
    if protocol.status != ProtocolStatus::Blocked {
        return Ok(String::new());
    }
    let open = db.open_blocking_clarifications(protocol_id, None)?;
    if !open.is_empty() {
        return Ok(format!("; {} blocking clarification(s) still open", open.len()));
    }
    machine.resume(db, ctx, protocol_id)?;
    Ok("; protocol resumed".to_string())
}
