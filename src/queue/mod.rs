//! Durable job queue with leases, retries and exponential backoff.
//!
//! A job is `queued` until a worker claims it, `leased` while that worker
//! holds an unexpired lease, and then `completed`, `dead` or `cancelled`.
//! A failed attempt goes back to `queued` with a delay of
//! `base * 2^attempt` (capped) until `max_attempts` is spent. Leases that run
//! out without a `complete` or `fail` are swept by [`JobQueue::reclaim_expired`]
//! and treated as a retryable failure, which is how worker crashes are
//! tolerated.
//!
//! Every enqueue, claim, complete and fail writes one event.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::config::QueueSection;
use crate::errors::{OrchestratorError, Result};
use crate::events::{EventKind, OpContext, event};
use crate::store::{Job, JobAction, JobStatus, NewJob, StepRun, StoreDb};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub lease: Duration,
    pub job_timeout: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from(&QueueSection::default())
    }
}

/// Upper bound for every queue duration. Timestamps are compared as RFC 3339
/// text, so deadlines must stay within four-digit years.
pub const MAX_QUEUE_SECS: u64 = 30 * 24 * 60 * 60;

fn bounded_secs(secs: u64) -> Duration {
    Duration::from_secs(secs.min(MAX_QUEUE_SECS))
}

impl From<&QueueSection> for QueueSettings {
    fn from(q: &QueueSection) -> Self {
        Self {
            max_attempts: q.max_attempts.max(1),
            backoff_base: bounded_secs(q.backoff_base_secs),
            backoff_cap: bounded_secs(q.backoff_cap_secs),
            lease: bounded_secs(q.lease_secs.max(1)),
            job_timeout: bounded_secs(q.job_timeout_secs),
        }
    }
}

/// `base * 2^attempt`, saturating, capped at `cap`.
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

fn plus(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Enqueued {
    pub job: Job,
    /// False when an active job for the step already existed and was returned.
    pub created: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying {
        attempt: u32,
        available_at: DateTime<Utc>,
    },
    Dead,
}

#[derive(Debug, Clone)]
pub struct Reclaimed {
    pub job: Job,
    pub outcome: FailOutcome,
}

#[derive(Debug, Clone)]
pub struct JobQueue {
    settings: QueueSettings,
}

impl JobQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Queue `action` for a step. A step has at most one active job, so an
    /// existing queued or leased job is returned instead of a new one.
    pub fn enqueue(
        &self,
        db: &StoreDb,
        ctx: &OpContext,
        step: &StepRun,
        action: JobAction,
    ) -> Result<Enqueued> {
        if let Some(existing) = db.active_job_for_step(step.id, None)? {
            tracing::debug!(
                step_id = step.id,
                job_id = existing.id,
                action = %existing.action,
                "step already has an active job"
            );
            return Ok(Enqueued {
                job: existing,
                created: false,
            });
        }
        let job = db.insert_job(
            &NewJob {
                step_run_id: step.id,
                protocol_run_id: step.protocol_run_id,
                action,
                max_attempts: self.settings.max_attempts,
                timeout_secs: self.settings.job_timeout.as_secs(),
                request_id: Some(&ctx.request_id),
            },
            ctx.now,
        )?;
        event(EventKind::JobEnqueued, step.protocol_run_id)
            .step(step.id)
            .job(job.id)
            .message(format!("{} queued for step '{}'", action, step.name))
            .meta(json!({ "action": action.as_str(), "max_attempts": job.max_attempts }))
            .record(db, ctx)?;
        tracing::info!(job_id = job.id, step_id = step.id, action = %action, "job enqueued");
        Ok(Enqueued { job, created: true })
    }

    /// Lease the next available job to `worker_id`, or `None` if there is none.
    pub fn claim(&self, db: &StoreDb, ctx: &OpContext, worker_id: &str) -> Result<Option<Job>> {
        let expires = plus(ctx.now, self.settings.lease);
        let Some(job) = db.claim_next_job(worker_id, expires, ctx.now)? else {
            return Ok(None);
        };
        event(EventKind::JobClaimed, job.protocol_run_id)
            .step(job.step_run_id)
            .job(job.id)
            .message(format!("claimed by {worker_id}"))
            .meta(json!({
                "worker_id": worker_id,
                "attempt": job.attempt,
                "lease_expires_at": expires,
            }))
            .record(db, ctx)?;
        tracing::info!(job_id = job.id, worker_id, attempt = job.attempt, "job claimed");
        Ok(Some(job))
    }

    /// Push the lease out by another lease period. False if it was lost.
    pub fn heartbeat(&self, db: &StoreDb, now: DateTime<Utc>, job_id: i64, worker_id: &str) -> Result<bool> {
        Ok(db.extend_lease(job_id, worker_id, plus(now, self.settings.lease), now)?)
    }

    fn leased_job(&self, db: &StoreDb, job_id: i64) -> Result<Job> {
        db.get_job(job_id)?
            .ok_or(OrchestratorError::NotFound { entity: "job", id: job_id })
    }

    pub fn complete(
        &self,
        db: &StoreDb,
        ctx: &OpContext,
        job_id: i64,
        worker_id: &str,
        summary: &str,
    ) -> Result<Job> {
        let job = self.leased_job(db, job_id)?;
        if !db.finish_job(job_id, Some(worker_id), JobStatus::Completed, None, ctx.now)? {
            return Err(OrchestratorError::LeaseLost {
                job_id,
                worker_id: worker_id.to_string(),
            });
        }
        event(EventKind::JobCompleted, job.protocol_run_id)
            .step(job.step_run_id)
            .job(job_id)
            .message(summary.to_string())
            .meta(json!({ "worker_id": worker_id, "attempt": job.attempt }))
            .record(db, ctx)?;
        tracing::info!(job_id, worker_id, "job completed");
        self.leased_job(db, job_id)
    }

    /// Record a failed attempt. Retryable failures with attempts left are
    /// requeued with backoff; everything else marks the job `dead`.
    ///
    /// `worker_id` of `None` acts for an expired lease holder (the sweep).
    pub fn fail(
        &self,
        db: &StoreDb,
        ctx: &OpContext,
        job_id: i64,
        worker_id: Option<&str>,
        error: &str,
        retryable: bool,
    ) -> Result<FailOutcome> {
        let job = self.leased_job(db, job_id)?;
        let lost = || OrchestratorError::LeaseLost {
            job_id,
            worker_id: worker_id.unwrap_or("sweeper").to_string(),
        };

        if retryable && job.attempt < job.max_attempts {
            let delay = backoff_delay(self.settings.backoff_base, self.settings.backoff_cap, job.attempt);
            let available_at = plus(ctx.now, delay);
            let attempt = job.attempt + 1;
            if !db.requeue_job(job_id, worker_id, attempt, available_at, error, ctx.now)? {
                return Err(lost());
            }
            event(EventKind::JobRetryScheduled, job.protocol_run_id)
                .step(job.step_run_id)
                .job(job_id)
                .message(format!("attempt {} failed: {error}", job.attempt))
                .meta(json!({
                    "error": error,
                    "retryable": true,
                    "failed_attempt": job.attempt,
                    "next_attempt": attempt,
                    "delay_secs": delay.as_secs(),
                }))
                .record(db, ctx)?;
            tracing::warn!(job_id, attempt = job.attempt, delay_secs = delay.as_secs(), error, "job attempt failed, retrying");
            return Ok(FailOutcome::Retrying { attempt, available_at });
        }

        if !db.finish_job(job_id, worker_id, JobStatus::Dead, Some(error), ctx.now)? {
            return Err(lost());
        }
        event(EventKind::JobDead, job.protocol_run_id)
            .step(job.step_run_id)
            .job(job_id)
            .message(format!("job dead after attempt {}: {error}", job.attempt))
            .meta(json!({
                "error": error,
                "retryable": retryable,
                "attempt": job.attempt,
                "max_attempts": job.max_attempts,
            }))
            .record(db, ctx)?;
        tracing::warn!(job_id, attempt = job.attempt, retryable, error, "job dead");
        Ok(FailOutcome::Dead)
    }

    /// Treat every expired lease as a retryable failure of its holder.
    pub fn reclaim_expired(&self, db: &StoreDb, ctx: &OpContext) -> Result<Vec<Reclaimed>> {
        let mut reclaimed = Vec::new();
        for job in db.list_expired_leases(ctx.now)? {
            let holder = job.lease_owner.clone().unwrap_or_default();
            let error = format!("lease expired while held by {holder}");
            let outcome = db.atomically(|db| self.fail(db, ctx, job.id, None, &error, true))?;
            reclaimed.push(Reclaimed { job, outcome });
        }
        Ok(reclaimed)
    }

    /// Cancel a protocol's queued jobs; leased ones may finish.
    pub fn cancel_for_protocol(&self, db: &StoreDb, ctx: &OpContext, protocol_run_id: i64) -> Result<usize> {
        let cancelled = db.cancel_queued_jobs(protocol_run_id, ctx.now)?;
        if cancelled > 0 {
            event(EventKind::JobCancelled, protocol_run_id)
                .message(format!("{cancelled} queued job(s) cancelled"))
                .meta(json!({ "count": cancelled }))
                .record(db, ctx)?;
        }
        Ok(cancelled)
    }

    /// Job counts per status.
    pub fn stats(&self, db: &StoreDb) -> Result<Vec<(JobStatus, u64)>> {
        Ok(db.job_stats()?)
    }
}
