use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::{ExecutionRequest, ExecutionResult, ExecutionStatus, Executor};
use crate::config::ConveyorConfig;
use crate::errors::{ExecutorError, OrchestratorError, Result};
use crate::events::{EventKind, OpContext, event};
use crate::feedback::Failure;
use crate::machine::{ProtocolStateMachine, QaRun, StepOutcome};
use crate::queue::{FailOutcome, QueueSettings};
use crate::store::{DbHandle, Job, JobAction, NewArtifact, StoreDb};

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Directory executors run in.
    pub working_dir: PathBuf,
    /// Idle wait between empty claims.
    pub poll_interval: Duration,
    /// How often the pool reclaims expired leases.
    pub sweep_interval: Duration,
    /// Lease renewal period while an executor runs.
    pub heartbeat_interval: Duration,
}

impl DispatchSettings {
    pub fn from_config(config: &ConveyorConfig) -> Self {
        let lease = QueueSettings::from(&config.toml.queue).lease;
        Self {
            working_dir: config.project_dir.clone(),
            poll_interval: Duration::from_millis(config.toml.worker.poll_interval_ms),
            sweep_interval: Duration::from_secs(config.toml.worker.sweep_interval_secs.max(1)),
            heartbeat_interval: (lease / 3).max(Duration::from_secs(1)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retrying { attempt: u32 },
    Dead,
    /// The run moved on while the job was leased; its result was dropped.
    Ignored,
    /// Another party reclaimed the lease before the result was recorded.
    LeaseLost,
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: i64,
    pub step_run_id: i64,
    pub protocol_run_id: i64,
    pub action: JobAction,
    pub outcome: JobOutcome,
}

impl JobReport {
    fn new(job: &Job, outcome: JobOutcome) -> Self {
        Self {
            job_id: job.id,
            step_run_id: job.step_run_id,
            protocol_run_id: job.protocol_run_id,
            action: job.action,
            outcome,
        }
    }
}

/// Claims jobs and drives them through executors and the state machine.
///
/// Each worker runs one job at a time. The database work for a result
/// (artifacts, queue bookkeeping, state transition) commits as one unit; a
/// worker that lost its lease in the meantime records nothing.
#[derive(Clone)]
pub struct WorkerDispatch {
    db: DbHandle,
    machine: Arc<ProtocolStateMachine>,
    settings: DispatchSettings,
}

impl WorkerDispatch {
    pub fn new(db: DbHandle, machine: Arc<ProtocolStateMachine>, settings: DispatchSettings) -> Self {
        Self {
            db,
            machine,
            settings,
        }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Claim and process one job. `None` when nothing is claimable.
    pub async fn run_once(&self, worker_id: &str) -> Result<Option<JobReport>> {
        let machine = self.machine.clone();
        let worker = worker_id.to_string();
        let claimed = self
            .db
            .call_op(move |db| machine.queue().claim(db, &OpContext::new(), &worker))
            .await?;
        let Some(job) = claimed else {
            return Ok(None);
        };

        tracing::info!(worker_id, job_id = job.id, action = %job.action, attempt = job.attempt, "processing job");
        let outcome = match job.action {
            JobAction::Execute => self.run_execute(worker_id, &job).await?,
            JobAction::RunQa => self.run_qa(worker_id, &job).await?,
        };
        tracing::info!(worker_id, job_id = job.id, ?outcome, "job processed");
        Ok(Some(JobReport::new(&job, outcome)))
    }

    /// Process jobs until none is claimable.
    pub async fn drain(&self, worker_id: &str) -> Result<Vec<JobReport>> {
        let mut reports = Vec::new();
        while let Some(report) = self.run_once(worker_id).await? {
            reports.push(report);
        }
        Ok(reports)
    }

    async fn run_execute(&self, worker_id: &str, job: &Job) -> Result<JobOutcome> {
        let machine = self.machine.clone();
        let leased = job.clone();
        let working_dir = self.settings.working_dir.clone();
        let prepared = self
            .db
            .call_op(move |db| machine.prepare_execution(db, &leased, &working_dir))
            .await?;

        let Some(prepared) = prepared else {
            return self
                .settle(worker_id, job, |machine, db, ctx, job, worker| {
                    machine.queue().complete(db, ctx, job.id, worker, "result no longer needed")?;
                    machine.record_ignored(db, ctx, job, "step moved on before execution")?;
                    Ok(JobOutcome::Ignored)
                })
                .await;
        };

        let result = match self.machine.registry().executor(prepared.executor.as_deref()) {
            Some(executor) => match self.execute_leased(executor, prepared.request, worker_id, job).await? {
                Some(result) => result,
                None => return Ok(JobOutcome::LeaseLost),
            },
            None => Err(ExecutorError::Unknown(
                prepared
                    .executor
                    .unwrap_or_else(|| self.machine.registry().default_executor().to_string()),
            )),
        };

        self.settle(worker_id, job, move |machine, db, ctx, job, worker| {
            finish_execution(machine, db, ctx, job, worker, result)
        })
        .await
    }

    /// Run the executor under the request timeout while renewing the lease.
    /// `None` means the lease was lost and the execution was abandoned.
    async fn execute_leased(
        &self,
        executor: Arc<dyn Executor>,
        request: ExecutionRequest,
        worker_id: &str,
        job: &Job,
    ) -> Result<Option<std::result::Result<ExecutionResult, ExecutorError>>> {
        let limit = request.timeout;
        let mut run = Box::pin(async move {
            match timeout(limit, executor.execute(request)).await {
                Ok(result) => result,
                Err(_) => Err(ExecutorError::Timeout(limit)),
            }
        });
        let mut heartbeat = tokio::time::interval(self.settings.heartbeat_interval);
        // The first tick completes immediately.
        heartbeat.tick().await;

        loop {
            tokio::select! {
                result = &mut run => return Ok(Some(result)),
                _ = heartbeat.tick() => {
                    let machine = self.machine.clone();
                    let worker = worker_id.to_string();
                    let job_id = job.id;
                    let alive = self
                        .db
                        .call_op(move |db| machine.queue().heartbeat(db, Utc::now(), job_id, &worker))
                        .await?;
                    if !alive {
                        // Dropping `run` kills the executor's child process.
                        tracing::warn!(worker_id, job_id, "lease lost, abandoning execution");
                        return Ok(None);
                    }
                    tracing::debug!(worker_id, job_id, "lease renewed");
                }
            }
        }
    }

    async fn run_qa(&self, worker_id: &str, job: &Job) -> Result<JobOutcome> {
        self.settle(worker_id, job, |machine, db, ctx, job, worker| {
            machine.queue().complete(db, ctx, job.id, worker, "qa evaluated")?;
            Ok(match machine.run_qa_job(db, ctx, job)? {
                QaRun::Ignored(_) => JobOutcome::Ignored,
                QaRun::Verdict(_) | QaRun::BlockedByClarifications(_) => JobOutcome::Completed,
            })
        })
        .await
    }

    /// Record a job's result in one savepoint. A lost lease rolls back and
    /// reports [`JobOutcome::LeaseLost`].
    async fn settle<F>(&self, worker_id: &str, job: &Job, f: F) -> Result<JobOutcome>
    where
        F: FnOnce(&ProtocolStateMachine, &StoreDb, &OpContext, &Job, &str) -> Result<JobOutcome>
            + Send
            + 'static,
    {
        let machine = self.machine.clone();
        let job = job.clone();
        let worker = worker_id.to_string();
        let settled = self
            .db
            .call_op(move |db| {
                let ctx = OpContext::resume(Utc::now(), job.request_id.as_deref());
                db.atomically(|db| f(&machine, db, &ctx, &job, &worker))
            })
            .await;
        match settled {
            Err(OrchestratorError::LeaseLost { job_id, worker_id }) => {
                tracing::warn!(job_id, %worker_id, "lease lost before the result was recorded");
                Ok(JobOutcome::LeaseLost)
            }
            other => other,
        }
    }

    /// Reclaim expired leases. Jobs that spent their last attempt are
    /// reported to the state machine as exhausted transient failures.
    pub async fn sweep(&self) -> Result<Vec<JobReport>> {
        let machine = self.machine.clone();
        self.db
            .call_op(move |db| {
                let ctx = OpContext::new();
                let mut reports = Vec::new();
                for reclaimed in machine.queue().reclaim_expired(db, &ctx)? {
                    let job = reclaimed.job;
                    let outcome = match reclaimed.outcome {
                        FailOutcome::Retrying { attempt, .. } => JobOutcome::Retrying { attempt },
                        FailOutcome::Dead => {
                            let holder = job.lease_owner.as_deref().unwrap_or("unknown worker");
                            let text = OrchestratorError::TransientExecutor(format!(
                                "lease expired while held by {holder}"
                            ))
                            .to_string();
                            machine.advance(db, &ctx, &job, StepOutcome::Failed(Failure::executor(text, true)))?;
                            JobOutcome::Dead
                        }
                    };
                    reports.push(JobReport::new(&job, outcome));
                }
                if !reports.is_empty() {
                    tracing::info!(reclaimed = reports.len(), "expired leases reclaimed");
                }
                Ok(reports)
            })
            .await
    }

    /// Poll for jobs until `shutdown` fires. A job in progress finishes first.
    pub async fn run_loop(&self, worker_id: &str, shutdown: CancellationToken) -> usize {
        let mut processed = 0;
        while !shutdown.is_cancelled() {
            match self.run_once(worker_id).await {
                Ok(Some(_)) => {
                    processed += 1;
                    continue;
                }
                Ok(None) => {}
                Err(e) => tracing::error!(worker_id, error = %e, "worker iteration failed"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }
        tracing::info!(worker_id, processed, "worker stopped");
        processed
    }

    /// Run `workers` workers and a lease sweeper until `shutdown` fires.
    /// Returns the number of jobs processed.
    pub async fn run_pool(&self, workers: usize, shutdown: CancellationToken) -> usize {
        let mut set = JoinSet::new();
        for i in 0..workers.max(1) {
            let dispatch = self.clone();
            let token = shutdown.clone();
            let worker_id = format!("worker-{}-{i}", std::process::id());
            set.spawn(async move { dispatch.run_loop(&worker_id, token).await });
        }

        let sweeper = self.clone();
        let token = shutdown.clone();
        set.spawn(async move {
            let mut ticker = tokio::time::interval(sweeper.settings.sweep_interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = sweeper.sweep().await {
                            tracing::error!(error = %e, "lease sweep failed");
                        }
                    }
                }
            }
            0
        });

        tracing::info!(workers, "worker pool started");
        let mut processed = 0;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(n) => processed += n,
                Err(e) => tracing::error!(error = %e, "worker task panicked"),
            }
        }
        processed
    }
}

/// Persist artifacts, settle the job in the queue, and report the outcome
/// to the state machine.
fn finish_execution(
    machine: &ProtocolStateMachine,
    db: &StoreDb,
    ctx: &OpContext,
    job: &Job,
    worker: &str,
    result: std::result::Result<ExecutionResult, ExecutorError>,
) -> Result<JobOutcome> {
    let queue = machine.queue();
    let result = match result {
        Ok(result) => result,
        Err(e) if e.is_transient() => {
            let error = e.to_string();
            return match queue.fail(db, ctx, job.id, Some(worker), &error, true)? {
                FailOutcome::Retrying { attempt, .. } => Ok(JobOutcome::Retrying { attempt }),
                FailOutcome::Dead => {
                    let text = OrchestratorError::TransientExecutor(error).to_string();
                    machine.advance(db, ctx, job, StepOutcome::Failed(Failure::executor(text, true)))?;
                    Ok(JobOutcome::Dead)
                }
            };
        }
        Err(e) => {
            let error = e.to_string();
            queue.fail(db, ctx, job.id, Some(worker), &error, false)?;
            machine.advance(db, ctx, job, StepOutcome::Failed(Failure::executor(error, false)))?;
            return Ok(JobOutcome::Dead);
        }
    };

    for artifact in &result.artifacts {
        db.insert_artifact(
            &NewArtifact {
                step_run_id: job.step_run_id,
                job_id: Some(job.id),
                kind: &artifact.kind,
                path: &artifact.path,
                content: artifact.content.as_deref(),
            },
            ctx.now,
        )?;
    }
    if !result.artifacts.is_empty() {
        event(EventKind::ArtifactsRecorded, job.protocol_run_id)
            .step(job.step_run_id)
            .job(job.id)
            .message(format!("{} artifact(s) recorded", result.artifacts.len()))
            .meta(json!({
                "paths": result.artifacts.iter().map(|a| a.path.as_str()).collect::<Vec<_>>(),
            }))
            .record(db, ctx)?;
    }

    let summary = result.summary();
    match result.status {
        ExecutionStatus::Completed => {
            queue.complete(db, ctx, job.id, worker, &summary)?;
            machine.advance(db, ctx, job, StepOutcome::Completed { summary })?;
            Ok(JobOutcome::Completed)
        }
        ExecutionStatus::Failed => {
            queue.fail(db, ctx, job.id, Some(worker), &summary, false)?;
            machine.advance(db, ctx, job, StepOutcome::Failed(Failure::executor(summary, false)))?;
            Ok(JobOutcome::Dead)
        }
        ExecutionStatus::Blocked => {
            queue.fail(db, ctx, job.id, Some(worker), &summary, false)?;
            let text = OrchestratorError::StructuralBlock(summary).to_string();
            machine.advance(db, ctx, job, StepOutcome::Failed(Failure::structural(text)))?;
            Ok(JobOutcome::Dead)
        }
    }
}
