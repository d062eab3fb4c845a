//! Append-only event log.
//!
//! Every state change, queue operation and routing decision appends one row
//! through [`EventBuilder::record`]. Rows are never updated or deleted; they
//! carry the protocol id, optional step and job ids, and the request id of
//! the operation that caused them.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::store::{NewEvent, StoreDb};

/// Clock reading and correlation id shared by everything one operation writes.
#[derive(Debug, Clone)]
pub struct OpContext {
    pub now: DateTime<Utc>,
    pub request_id: String,
}

impl OpContext {
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now,
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Continue an earlier request (e.g. the one that enqueued a job).
    pub fn resume(now: DateTime<Utc>, request_id: Option<&str>) -> Self {
        match request_id {
            Some(id) => Self {
                now,
                request_id: id.to_string(),
            },
            None => Self::at(now),
        }
    }
}

impl Default for OpContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    ProtocolCreated,
    ProtocolPlanning,
    ProtocolPlanned,
    ProtocolStarted,
    ProtocolPaused,
    ProtocolResumed,
    ProtocolBlocked,
    ProtocolFailed,
    ProtocolCancelled,
    ProtocolCompleted,
    ProtocolReplanned,
    ProtocolRecovered,
    StepRunning,
    StepNeedsQa,
    StepCompleted,
    StepFailed,
    StepBlocked,
    StepRetried,
    StepApproved,
    JobEnqueued,
    JobClaimed,
    JobCompleted,
    JobRetryScheduled,
    JobDead,
    JobCancelled,
    ResultIgnored,
    ArtifactsRecorded,
    QaVerdict,
    QaSkipped,
    QaBlockedClarifications,
    FeedbackRouted,
    ClarificationRaised,
    ClarificationAnswered,
    PrRequested,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProtocolCreated => "protocol_created",
            Self::ProtocolPlanning => "protocol_planning",
            Self::ProtocolPlanned => "protocol_planned",
            Self::ProtocolStarted => "protocol_started",
            Self::ProtocolPaused => "protocol_paused",
            Self::ProtocolResumed => "protocol_resumed",
            Self::ProtocolBlocked => "protocol_blocked",
            Self::ProtocolFailed => "protocol_failed",
            Self::ProtocolCancelled => "protocol_cancelled",
            Self::ProtocolCompleted => "protocol_completed",
            Self::ProtocolReplanned => "protocol_replanned",
            Self::ProtocolRecovered => "protocol_recovered",
            Self::StepRunning => "step_running",
            Self::StepNeedsQa => "step_needs_qa",
            Self::StepCompleted => "step_completed",
            Self::StepFailed => "step_failed",
            Self::StepBlocked => "step_blocked",
            Self::StepRetried => "step_retried",
            Self::StepApproved => "step_approved",
            Self::JobEnqueued => "job_enqueued",
            Self::JobClaimed => "job_claimed",
            Self::JobCompleted => "job_completed",
            Self::JobRetryScheduled => "job_retry_scheduled",
            Self::JobDead => "job_dead",
            Self::JobCancelled => "job_cancelled",
            Self::ResultIgnored => "result_ignored",
            Self::ArtifactsRecorded => "artifacts_recorded",
            Self::QaVerdict => "qa_verdict",
            Self::QaSkipped => "qa_skipped",
            Self::QaBlockedClarifications => "qa_blocked_clarifications",
            Self::FeedbackRouted => "feedback_routed",
            Self::ClarificationRaised => "clarification_raised",
            Self::ClarificationAnswered => "clarification_answered",
            Self::PrRequested => "pr_requested",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Start building an event for a protocol run.
pub fn event(kind: EventKind, protocol_run_id: i64) -> EventBuilder {
    EventBuilder {
        kind,
        protocol_run_id,
        step_run_id: None,
        job_id: None,
        message: String::new(),
        metadata: Value::Object(Default::default()),
    }
}

#[must_use = "an event is only written by calling record()"]
pub struct EventBuilder {
    kind: EventKind,
    protocol_run_id: i64,
    step_run_id: Option<i64>,
    job_id: Option<i64>,
    message: String,
    metadata: Value,
}

impl EventBuilder {
    pub fn step(mut self, step_run_id: i64) -> Self {
        self.step_run_id = Some(step_run_id);
        self
    }

    pub fn job(mut self, job_id: i64) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn meta(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn record(self, db: &StoreDb, ctx: &OpContext) -> Result<i64> {
        tracing::debug!(
            kind = %self.kind,
            protocol_id = self.protocol_run_id,
            step_id = ?self.step_run_id,
            job_id = ?self.job_id,
            request_id = %ctx.request_id,
            "{}",
            self.message
        );
        db.insert_event(
            &NewEvent {
                protocol_run_id: self.protocol_run_id,
                step_run_id: self.step_run_id,
                job_id: self.job_id,
                kind: self.kind.as_str(),
                message: &self.message,
                metadata: &self.metadata,
                request_id: Some(&ctx.request_id),
            },
            ctx.now,
        )
    }
}
