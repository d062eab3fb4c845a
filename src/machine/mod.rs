//! Protocol state machine.
//!
//! Owns every status change of protocol runs and step runs. Steps run one
//! at a time in `step_index` order: the machine enqueues a step's `execute`
//! job, the dispatcher reports back through [`ProtocolStateMachine::advance`],
//! work steps go through QA ([`ProtocolStateMachine::apply_verdict`]), and
//! failures are routed by the feedback router and applied with
//! [`ProtocolStateMachine::apply_feedback`].
//!
//! Protocol status writes are compare-and-swap on the stored status; losing
//! the race surfaces as [`OrchestratorError::ConcurrentUpdate`]. Every public
//! operation runs inside one savepoint, so a rejected operation changes
//! nothing.

pub mod planner;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::json;
use sha2::{Digest, Sha256};

pub use planner::{PlanRequest, Planner, StaticPlanner};

use crate::config::ConveyorToml;
use crate::dispatch::ExecutionRequest;
use crate::errors::{OrchestratorError, Result};
use crate::events::{EventKind, OpContext, event};
use crate::feedback::{Failure, FeedbackAction, FeedbackCategory, FeedbackRouter};
use crate::qa::{GateSpec, QaArtifact, QaContext, QaEngine, QaVerdict, QaWeights};
use crate::queue::{JobQueue, QueueSettings};
use crate::registry::Registry;
use crate::store::{
    Clarification, ClarificationStatus, Job, JobAction, NewProtocolRun, Project, ProtocolPlan,
    ProtocolRun, ProtocolStatus, SpecValidation, StepRun, StepStatus, StepType, StoreDb,
};

/// Project used by plans that do not name one.
pub const DEFAULT_PROJECT: &str = "default";

#[derive(Debug, Clone)]
pub struct MachineSettings {
    /// Gate set for plans that do not declare their own.
    pub default_gates: Vec<GateSpec>,
    /// Go straight back to `running` after a re-plan instead of waiting in `planned`.
    pub auto_resume_after_replan: bool,
}

impl MachineSettings {
    pub fn from_config(cfg: &ConveyorToml) -> Self {
        Self {
            default_gates: cfg.qa.default_gates.iter().map(GateSpec::new).collect(),
            auto_resume_after_replan: cfg.feedback.auto_resume_after_replan,
        }
    }
}

/// How an execute job ended, as reported by the dispatcher.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Completed { summary: String },
    Failed(Failure),
}

/// An execute job turned into an executor call.
#[derive(Debug, Clone)]
pub struct PreparedExecution {
    pub request: ExecutionRequest,
    /// Executor id assigned to the step; `None` means the default.
    pub executor: Option<String>,
}

/// Result of processing a `run_qa` job.
#[derive(Debug, Clone)]
pub enum QaRun {
    Verdict(QaVerdict),
    BlockedByClarifications(Vec<i64>),
    Ignored(String),
}

/// Result of an operator QA request.
#[derive(Debug, Clone)]
pub enum QaRequest {
    Enqueued(Job),
    AlreadyQueued(Job),
    BlockedByClarifications(Vec<i64>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery {
    Completed,
    Blocked { step_run_id: i64 },
    Requeued { job_id: i64 },
}

/// SHA-256 of the plan's JSON form.
pub fn spec_hash(plan: &ProtocolPlan) -> Result<String> {
    let canonical = serde_json::to_vec(plan).context("Failed to serialize plan")?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

fn needs_qa(protocol: &ProtocolRun, step: &StepRun) -> bool {
    step.step_type == StepType::Work && !step.skip_qa && !protocol.gates.is_empty()
}

fn in_flight(step: &StepRun) -> bool {
    matches!(step.status, StepStatus::Running | StepStatus::NeedsQa)
}

/// Why a job's result no longer applies, if it doesn't.
fn ignore_reason(protocol: &ProtocolRun, step: &StepRun, job: &Job) -> Option<String> {
    let expected = match job.action {
        JobAction::Execute => StepStatus::Running,
        JobAction::RunQa => StepStatus::NeedsQa,
    };
    if protocol.status.is_terminal() {
        Some(format!("protocol run is {}", protocol.status))
    } else if step.status != expected {
        Some(format!("step is {}", step.status))
    } else {
        None
    }
}

pub struct ProtocolStateMachine {
    registry: Arc<Registry>,
    queue: JobQueue,
    router: FeedbackRouter,
    planner: Arc<dyn Planner>,
    qa: QaEngine,
    settings: MachineSettings,
}

impl ProtocolStateMachine {
    pub fn new(
        registry: Arc<Registry>,
        queue: JobQueue,
        router: FeedbackRouter,
        qa: QaEngine,
        settings: MachineSettings,
    ) -> Self {
        Self {
            registry,
            queue,
            router,
            planner: Arc::new(StaticPlanner),
            qa,
            settings,
        }
    }

    pub fn from_config(cfg: &ConveyorToml, registry: Arc<Registry>) -> anyhow::Result<Self> {
        let qa = QaEngine::new(QaWeights::from(&cfg.qa), registry.checklist(), registry.analyzer());
        Ok(Self::new(
            registry,
            JobQueue::new(QueueSettings::from(&cfg.queue)),
            FeedbackRouter::from_config(cfg)?,
            qa,
            MachineSettings::from_config(cfg),
        ))
    }

    pub fn with_planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = planner;
        self
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn router(&self) -> &FeedbackRouter {
        &self.router
    }

    // ── Loading and bookkeeping ───────────────────────────────────────

    pub fn load_protocol(&self, db: &StoreDb, id: i64) -> Result<ProtocolRun> {
        db.get_protocol_run(id)?
            .ok_or(OrchestratorError::NotFound { entity: "protocol run", id })
    }

    pub fn load_step(&self, db: &StoreDb, id: i64) -> Result<StepRun> {
        db.get_step_run(id)?
            .ok_or(OrchestratorError::NotFound { entity: "step run", id })
    }

    fn step_of(&self, db: &StoreDb, protocol: &ProtocolRun, step_id: i64) -> Result<StepRun> {
        let step = self.load_step(db, step_id)?;
        if step.protocol_run_id != protocol.id {
            return Err(OrchestratorError::NotFound {
                entity: "step run",
                id: step_id,
            });
        }
        Ok(step)
    }

    fn transition(
        &self,
        db: &StoreDb,
        ctx: &OpContext,
        protocol: &mut ProtocolRun,
        to: ProtocolStatus,
        reason: Option<&str>,
        kind: EventKind,
    ) -> Result<()> {
        let from = protocol.status;
        if !db.cas_protocol_status(protocol.id, from, to, reason, ctx.now)? {
            return Err(OrchestratorError::ConcurrentUpdate {
                id: protocol.id,
                expected: from.to_string(),
            });
        }
        protocol.status = to;
        protocol.blocked_reason = reason.map(str::to_string);
        let message = match reason {
            Some(reason) => format!("{from} -> {to}: {reason}"),
            None => format!("{from} -> {to}"),
        };
        event(kind, protocol.id)
            .message(message)
            .meta(json!({ "from": from.as_str(), "to": to.as_str(), "reason": reason }))
            .record(db, ctx)?;
        tracing::info!(protocol_id = protocol.id, from = %from, to = %to, "protocol transition");
        Ok(())
    }

    fn set_step(
        &self,
        db: &StoreDb,
        ctx: &OpContext,
        step: &mut StepRun,
        to: StepStatus,
        summary: Option<&str>,
        kind: EventKind,
    ) -> Result<()> {
        let from = step.status;
        db.update_step_status(step.id, to, summary, ctx.now)?;
        step.status = to;
        if let Some(summary) = summary {
            step.last_result_summary = Some(summary.to_string());
        }
        event(kind, step.protocol_run_id)
            .step(step.id)
            .message(format!("step '{}' {from} -> {to}", step.name))
            .meta(json!({
                "from": from.as_str(),
                "to": to.as_str(),
                "step_index": step.step_index,
            }))
            .record(db, ctx)?;
        tracing::info!(step_id = step.id, step = %step.name, from = %from, to = %to, "step transition");
        Ok(())
    }

    /// Mark a step running and queue its execute job.
    fn dispatch_step(&self, db: &StoreDb, ctx: &OpContext, step: &mut StepRun) -> Result<Job> {
        if step.status != StepStatus::Running {
            self.set_step(db, ctx, step, StepStatus::Running, None, EventKind::StepRunning)?;
        }
        Ok(self.queue.enqueue(db, ctx, step, JobAction::Execute)?.job)
    }

    /// Record that a job's result was dropped.
    pub fn record_ignored(&self, db: &StoreDb, ctx: &OpContext, job: &Job, reason: &str) -> Result<()> {
        event(EventKind::ResultIgnored, job.protocol_run_id)
            .step(job.step_run_id)
            .job(job.id)
            .message(format!("{} result ignored: {reason}", job.action))
            .meta(json!({ "action": job.action.as_str(), "reason": reason }))
            .record(db, ctx)?;
        tracing::info!(job_id = job.id, reason, "job result ignored");
        Ok(())
    }

    /// Queue the next pending step, or complete the run when every step is
    /// settled. Does nothing unless the run is `running` and idle.
    fn advance_protocol(&self, db: &StoreDb, ctx: &OpContext, protocol_id: i64) -> Result<Option<Job>> {
        let mut protocol = self.load_protocol(db, protocol_id)?;
        if protocol.status != ProtocolStatus::Running {
            tracing::debug!(protocol_id, status = %protocol.status, "protocol advance deferred");
            return Ok(None);
        }
        let steps = db.list_step_runs(protocol_id)?;
        if steps.iter().any(in_flight) {
            return Ok(None);
        }
        if steps.iter().all(|s| s.status.is_settled()) {
            self.transition(
                db,
                ctx,
                &mut protocol,
                ProtocolStatus::Completed,
                None,
                EventKind::ProtocolCompleted,
            )?;
            return Ok(None);
        }
        match steps.into_iter().find(|s| !s.status.is_settled()) {
            Some(mut step) if step.status == StepStatus::Pending => {
                Ok(Some(self.dispatch_step(db, ctx, &mut step)?))
            }
            // A failed or blocked step waits for feedback or an operator.
            _ => Ok(None),
        }
    }

    /// Re-queue whatever an idle run was in the middle of, else advance it.
    fn continue_run(&self, db: &StoreDb, ctx: &OpContext, protocol_id: i64) -> Result<Option<Job>> {
        for step in db.list_step_runs(protocol_id)? {
            let action = match step.status {
                StepStatus::Running => JobAction::Execute,
                StepStatus::NeedsQa => JobAction::RunQa,
                _ => continue,
            };
            if db.active_job_for_step(step.id, None)?.is_some() {
                return Ok(None);
            }
            return Ok(Some(self.queue.enqueue(db, ctx, &step, action)?.job));
        }
        self.advance_protocol(db, ctx, protocol_id)
    }

    // ── Lifecycle ─────────────────────────────────────────────────────

    /// Store a plan as a `pending` protocol run with its step runs.
    ///
    /// Plans without steps or with duplicate step names are stored with
    /// spec validation `invalid` and cannot be started.
    pub fn create(&self, db: &StoreDb, ctx: &OpContext, plan: &ProtocolPlan) -> Result<ProtocolRun> {
        let gates = plan
            .gates
            .clone()
            .unwrap_or_else(|| self.settings.default_gates.clone());
        let unknown = self.registry.unknown_gates(&gates);
        if !unknown.is_empty() {
            return Err(OrchestratorError::InvalidPlan(format!(
                "unknown gate(s): {}",
                unknown.join(", ")
            )));
        }
        let problems = plan.problems();
        let validation = if problems.is_empty() {
            SpecValidation::Valid
        } else {
            SpecValidation::Invalid
        };
        let hash = spec_hash(plan)?;

        db.atomically(|db| {
            let project = self.resolve_project(db, ctx, plan)?;
            let id = db.insert_protocol_run(
                &NewProtocolRun {
                    project_id: project.id,
                    name: &plan.name,
                    base_branch: &plan.base_branch,
                    description: &plan.description,
                    policy_pack: plan.policy_pack.as_deref(),
                    spec_hash: Some(hash.as_str()),
                    spec_validation: validation,
                    gates: &gates,
                    checklist: &plan.checklist,
                },
                ctx.now,
            )?;
            for (index, step) in plan.steps.iter().enumerate() {
                db.insert_step_run(id, index as u32, step, ctx.now)?;
            }
            event(EventKind::ProtocolCreated, id)
                .message(format!(
                    "protocol '{}' created with {} step(s)",
                    plan.name,
                    plan.steps.len()
                ))
                .meta(json!({
                    "project": project.name,
                    "steps": plan.steps.len(),
                    "gates": gates.iter().map(|g| g.id.as_str()).collect::<Vec<_>>(),
                    "spec_hash": hash,
                    "spec_validation": validation.as_str(),
                    "problems": problems,
                }))
                .record(db, ctx)?;
            tracing::info!(protocol_id = id, name = %plan.name, spec_validation = %validation, "protocol created");
            self.load_protocol(db, id)
        })
    }

    fn resolve_project(&self, db: &StoreDb, ctx: &OpContext, plan: &ProtocolPlan) -> Result<Project> {
        let name = plan.project.as_deref().unwrap_or(DEFAULT_PROJECT);
        if let Some(project) = db.find_project_by_name(name)? {
            return Ok(project);
        }
        if plan.project.is_some() {
            return Err(OrchestratorError::InvalidPlan(format!("unknown project '{name}'")));
        }
        Ok(db.create_project(name, None, &plan.base_branch, ctx.now)?)
    }

    /// `pending`/`planned` → `running`, queueing the first pending step.
    pub fn start(&self, db: &StoreDb, ctx: &OpContext, id: i64) -> Result<Option<Job>> {
        db.atomically(|db| {
            let mut protocol = self.load_protocol(db, id)?;
            if !matches!(protocol.status, ProtocolStatus::Pending | ProtocolStatus::Planned) {
                return Err(OrchestratorError::invalid_transition(
                    "protocol run",
                    id,
                    protocol.status,
                    "start",
                ));
            }
            if protocol.spec_validation == Some(SpecValidation::Invalid) {
                return Err(OrchestratorError::InvalidPlan(format!(
                    "protocol run {id} has an invalid plan"
                )));
            }
            if protocol.status == ProtocolStatus::Pending {
                self.transition(db, ctx, &mut protocol, ProtocolStatus::Planning, None, EventKind::ProtocolPlanning)?;
                self.transition(db, ctx, &mut protocol, ProtocolStatus::Planned, None, EventKind::ProtocolPlanned)?;
            }
            self.transition(db, ctx, &mut protocol, ProtocolStatus::Running, None, EventKind::ProtocolStarted)?;
            self.advance_protocol(db, ctx, id)
        })
    }

    /// `running`/`planning` → `paused`. Queued jobs stay queued but are not
    /// claimed until the run resumes.
    pub fn pause(&self, db: &StoreDb, ctx: &OpContext, id: i64) -> Result<()> {
        db.atomically(|db| {
            let mut protocol = self.load_protocol(db, id)?;
            if !matches!(protocol.status, ProtocolStatus::Running | ProtocolStatus::Planning) {
                return Err(OrchestratorError::invalid_transition(
                    "protocol run",
                    id,
                    protocol.status,
                    "pause",
                ));
            }
            self.transition(db, ctx, &mut protocol, ProtocolStatus::Paused, None, EventKind::ProtocolPaused)
        })
    }

    /// `paused` → `running`, or `blocked` → `running` once no blocking
    /// clarification is open. A blocked step goes back to `running` with a
    /// fresh execute job.
    pub fn resume(&self, db: &StoreDb, ctx: &OpContext, id: i64) -> Result<Option<Job>> {
        db.atomically(|db| {
            let mut protocol = self.load_protocol(db, id)?;
            match protocol.status {
                ProtocolStatus::Paused => {
                    self.transition(db, ctx, &mut protocol, ProtocolStatus::Running, None, EventKind::ProtocolResumed)?;
                    self.continue_run(db, ctx, id)
                }
                ProtocolStatus::Blocked => {
                    if let Some(open) = db.open_blocking_clarifications(id, None)?.first() {
                        return Err(OrchestratorError::invalid_transition(
                            "protocol run",
                            id,
                            format!("blocked on clarification {}", open.id),
                            "resume",
                        ));
                    }
                    let stalled = self.blocked_step(db, &protocol)?;
                    db.set_blocking_clarification(id, None)?;
                    self.transition(db, ctx, &mut protocol, ProtocolStatus::Running, None, EventKind::ProtocolResumed)?;
                    match stalled {
                        Some(mut step) => Ok(Some(self.dispatch_step(db, ctx, &mut step)?)),
                        None => self.continue_run(db, ctx, id),
                    }
                }
                other => Err(OrchestratorError::invalid_transition("protocol run", id, other, "resume")),
            }
        })
    }

    /// The step a blocked run is waiting on.
    fn blocked_step(&self, db: &StoreDb, protocol: &ProtocolRun) -> Result<Option<StepRun>> {
        if let Some(clarification_id) = protocol.blocking_clarification_id {
            let step_id = db
                .get_clarification(clarification_id)?
                .and_then(|c| c.step_run_id);
            if let Some(step_id) = step_id {
                let step = self.load_step(db, step_id)?;
                if step.status.is_stalled() {
                    return Ok(Some(step));
                }
            }
        }
        Ok(db
            .list_step_runs(protocol.id)?
            .into_iter()
            .find(|s| s.status.is_stalled()))
    }

    /// Any non-terminal status → `cancelled`. Queued jobs and open steps are
    /// cancelled; a leased job may finish but its result is ignored.
    pub fn cancel(&self, db: &StoreDb, ctx: &OpContext, id: i64) -> Result<()> {
        db.atomically(|db| {
            let mut protocol = self.load_protocol(db, id)?;
            if protocol.status.is_terminal() {
                return Err(OrchestratorError::invalid_transition(
                    "protocol run",
                    id,
                    protocol.status,
                    "cancel",
                ));
            }
            self.transition(db, ctx, &mut protocol, ProtocolStatus::Cancelled, None, EventKind::ProtocolCancelled)?;
            self.queue.cancel_for_protocol(db, ctx, id)?;
            let steps = db.cancel_open_steps(id, ctx.now)?;
            db.set_blocking_clarification(id, None)?;
            tracing::info!(protocol_id = id, steps, "protocol cancelled");
            Ok(())
        })
    }

    // ── Results from the dispatcher ───────────────────────────────────

    /// Apply the end of a job. A completed work step moves to `needs_qa`
    /// (or straight to `completed` when QA is off for it); a failure marks
    /// the step `failed` and goes through the feedback router.
    pub fn advance(&self, db: &StoreDb, ctx: &OpContext, job: &Job, outcome: StepOutcome) -> Result<()> {
        db.atomically(|db| {
            let protocol = self.load_protocol(db, job.protocol_run_id)?;
            let mut step = self.load_step(db, job.step_run_id)?;
            if let Some(reason) = ignore_reason(&protocol, &step, job) {
                return self.record_ignored(db, ctx, job, &reason);
            }
            match outcome {
                StepOutcome::Completed { summary } => {
                    if needs_qa(&protocol, &step) {
                        self.set_step(db, ctx, &mut step, StepStatus::NeedsQa, Some(summary.as_str()), EventKind::StepNeedsQa)?;
                        self.queue.enqueue(db, ctx, &step, JobAction::RunQa)?;
                    } else {
                        if step.step_type == StepType::Work {
                            event(EventKind::QaSkipped, protocol.id)
                                .step(step.id)
                                .message(format!("QA skipped for step '{}'", step.name))
                                .meta(json!({ "skip_qa": step.skip_qa, "gates": protocol.gates.len() }))
                                .record(db, ctx)?;
                        }
                        self.set_step(db, ctx, &mut step, StepStatus::Completed, Some(summary.as_str()), EventKind::StepCompleted)?;
                        self.advance_protocol(db, ctx, protocol.id)?;
                    }
                }
                StepOutcome::Failed(failure) => {
                    self.set_step(db, ctx, &mut step, StepStatus::Failed, Some(failure.text.as_str()), EventKind::StepFailed)?;
                    let action = self.router.route_failure(db, ctx, &protocol, &step, &failure)?;
                    self.apply_action(db, ctx, &mut step, &action, &failure.text)?;
                }
            }
            Ok(())
        })
    }

    /// Prepare the executor call for a leased execute job, or `None` when
    /// the job's result would be ignored anyway.
    ///
    /// Answered clarifications for the step are appended to its prompt.
    pub fn prepare_execution(&self, db: &StoreDb, job: &Job, working_dir: &Path) -> Result<Option<PreparedExecution>> {
        let protocol = self.load_protocol(db, job.protocol_run_id)?;
        let step = self.load_step(db, job.step_run_id)?;
        if ignore_reason(&protocol, &step, job).is_some() {
            return Ok(None);
        }
        let mut prompt = step.prompt.clone();
        let answered: Vec<Clarification> = db
            .list_clarifications(Some(protocol.id), false)?
            .into_iter()
            .filter(|c| c.status == ClarificationStatus::Answered)
            .filter(|c| c.step_run_id.is_none() || c.step_run_id == Some(step.id))
            .collect();
        if !answered.is_empty() {
            prompt.push_str("\n\n## Clarifications\n");
            for c in &answered {
                prompt.push_str(&format!(
                    "\nQ: {}\nA: {}\n",
                    c.question,
                    c.answer.as_deref().unwrap_or_default()
                ));
            }
        }
        Ok(Some(PreparedExecution {
            request: ExecutionRequest {
                step_run_id: step.id,
                protocol_run_id: protocol.id,
                step_name: step.name.clone(),
                prompt,
                working_dir: working_dir.to_path_buf(),
                timeout: Duration::from_secs(job.timeout_secs.max(1)),
            },
            executor: step.assigned_executor,
        }))
    }

    // ── QA ────────────────────────────────────────────────────────────

    pub fn qa_context(&self, db: &StoreDb, protocol: &ProtocolRun, step: &StepRun) -> Result<QaContext> {
        Ok(QaContext {
            protocol_run_id: protocol.id,
            step_run_id: step.id,
            step_name: step.name.clone(),
            step_type: step.step_type,
            prompt: step.prompt.clone(),
            summary: step.last_result_summary.clone(),
            artifacts: db.latest_execution_artifacts(step.id)?.iter().map(QaArtifact::from).collect(),
            checklist: protocol.checklist.clone(),
        })
    }

    /// Evaluate a step against its protocol's gate set. Reads only.
    pub fn evaluate_step(&self, db: &StoreDb, step_run_id: i64) -> Result<QaVerdict> {
        let step = self.load_step(db, step_run_id)?;
        let protocol = self.load_protocol(db, step.protocol_run_id)?;
        let ctx = self.qa_context(db, &protocol, &step)?;
        let gates = self.registry.resolve_gates(&protocol.gates);
        Ok(self.qa.evaluate(&ctx, &gates))
    }

    /// Process a leased `run_qa` job: evaluate and apply the verdict, unless
    /// a blocking clarification is open for the step or its run.
    pub fn run_qa_job(&self, db: &StoreDb, ctx: &OpContext, job: &Job) -> Result<QaRun> {
        db.atomically(|db| {
            let mut protocol = self.load_protocol(db, job.protocol_run_id)?;
            let mut step = self.load_step(db, job.step_run_id)?;
            if let Some(reason) = ignore_reason(&protocol, &step, job) {
                self.record_ignored(db, ctx, job, &reason)?;
                return Ok(QaRun::Ignored(reason));
            }
            let open: Vec<i64> = db
                .open_blocking_clarifications(protocol.id, Some(step.id))?
                .iter()
                .map(|c| c.id)
                .collect();
            if let Some(&first) = open.first() {
                event(EventKind::QaBlockedClarifications, protocol.id)
                    .step(step.id)
                    .job(job.id)
                    .message(format!("QA for step '{}' waits on {} clarification(s)", step.name, open.len()))
                    .meta(json!({ "clarifications": open }))
                    .record(db, ctx)?;
                self.set_step(db, ctx, &mut step, StepStatus::Blocked, None, EventKind::StepBlocked)?;
                db.set_blocking_clarification(protocol.id, Some(first))?;
                if protocol.status != ProtocolStatus::Blocked {
                    let reason = format!("QA for step '{}' waits on clarification {first}", step.name);
                    self.transition(db, ctx, &mut protocol, ProtocolStatus::Blocked, Some(reason.as_str()), EventKind::ProtocolBlocked)?;
                }
                return Ok(QaRun::BlockedByClarifications(open));
            }
            let verdict = self.evaluate_step(db, step.id)?;
            self.apply_verdict(db, ctx, step.id, &verdict)?;
            Ok(QaRun::Verdict(verdict))
        })
    }

    /// Pass → step `completed` and the run advances; fail → step `blocked`
    /// and the verdict is routed through feedback.
    pub fn apply_verdict(
        &self,
        db: &StoreDb,
        ctx: &OpContext,
        step_run_id: i64,
        verdict: &QaVerdict,
    ) -> Result<Option<FeedbackAction>> {
        db.atomically(|db| {
            let mut step = self.load_step(db, step_run_id)?;
            let protocol = self.load_protocol(db, step.protocol_run_id)?;
            if protocol.status.is_terminal() || step.status != StepStatus::NeedsQa {
                return Err(OrchestratorError::invalid_transition(
                    "step run",
                    step.id,
                    step.status,
                    "apply a verdict to",
                ));
            }
            db.insert_verdict(step.id, protocol.id, verdict, ctx.now)?;
            event(EventKind::QaVerdict, protocol.id)
                .step(step.id)
                .message(format!(
                    "{} with score {:.2}: {}",
                    if verdict.passed { "passed" } else { "failed" },
                    verdict.score,
                    verdict.reason
                ))
                .meta(json!({
                    "passed": verdict.passed,
                    "score": verdict.score,
                    "reason": verdict.reason,
                    "blocking_issues": verdict.blocking_issues,
                }))
                .record(db, ctx)?;

            if verdict.passed {
                self.set_step(db, ctx, &mut step, StepStatus::Completed, None, EventKind::StepCompleted)?;
                self.advance_protocol(db, ctx, protocol.id)?;
                return Ok(None);
            }
            self.set_step(db, ctx, &mut step, StepStatus::Blocked, Some(verdict.reason.as_str()), EventKind::StepBlocked)?;
            let action = self.router.route(db, ctx, &protocol, &step, verdict)?;
            self.apply_action(db, ctx, &mut step, &action, &verdict.feedback_text())?;
            Ok(Some(action))
        })
    }

    // ── Feedback ──────────────────────────────────────────────────────

    /// Carry out a routed feedback action for a step. `feedback` is the
    /// failure text, handed to the planner on re-plan.
    pub fn apply_feedback(
        &self,
        db: &StoreDb,
        ctx: &OpContext,
        step_run_id: i64,
        action: &FeedbackAction,
        feedback: &str,
    ) -> Result<()> {
        db.atomically(|db| {
            let mut step = self.load_step(db, step_run_id)?;
            self.apply_action(db, ctx, &mut step, action, feedback)
        })
    }

    fn apply_action(
        &self,
        db: &StoreDb,
        ctx: &OpContext,
        step: &mut StepRun,
        action: &FeedbackAction,
        feedback: &str,
    ) -> Result<()> {
        let mut protocol = self.load_protocol(db, step.protocol_run_id)?;
        if protocol.status.is_terminal() {
            return Err(OrchestratorError::invalid_transition(
                "protocol run",
                protocol.id,
                protocol.status,
                format!("apply {} to", action.as_str()),
            ));
        }
        match action {
            FeedbackAction::Clarify { clarification_id } => {
                db.set_blocking_clarification(protocol.id, Some(*clarification_id))?;
                if protocol.status != ProtocolStatus::Blocked {
                    let reason = format!("step '{}' awaits clarification {clarification_id}", step.name);
                    self.transition(db, ctx, &mut protocol, ProtocolStatus::Blocked, Some(reason.as_str()), EventKind::ProtocolBlocked)?;
                }
            }
            FeedbackAction::RePlan => {
                self.replan(db, ctx, &mut protocol, step, FeedbackCategory::RePlan, feedback)?;
            }
            FeedbackAction::ReSpecify => {
                self.replan(db, ctx, &mut protocol, step, FeedbackCategory::ReSpecify, feedback)?;
            }
            FeedbackAction::Retry => {
                let count = db.increment_step_retry(step.id, ctx.now)?;
                step.retry_count = count;
                event(EventKind::StepRetried, protocol.id)
                    .step(step.id)
                    .message(format!("step '{}' retry {count}", step.name))
                    .meta(json!({ "retry_count": count, "trigger": "feedback" }))
                    .record(db, ctx)?;
                self.dispatch_step(db, ctx, step)?;
            }
            FeedbackAction::ManualBlock { reason } => {
                self.queue.cancel_for_protocol(db, ctx, protocol.id)?;
                self.transition(db, ctx, &mut protocol, ProtocolStatus::Failed, Some(reason.as_str()), EventKind::ProtocolFailed)?;
                tracing::warn!(protocol_id = protocol.id, step_id = step.id, reason = %reason, "protocol needs an operator");
            }
        }
        Ok(())
    }

    /// Replace the steps from `step` onward with the planner's output. The
    /// run passes through `planning` and `planned`, and returns to `running`
    /// when auto-resume is on.
    fn replan(
        &self,
        db: &StoreDb,
        ctx: &OpContext,
        protocol: &mut ProtocolRun,
        step: &StepRun,
        category: FeedbackCategory,
        feedback: &str,
    ) -> Result<()> {
        let attempt = db.increment_replan_attempts(protocol.id)?;
        protocol.replan_attempts = attempt;
        db.set_blocking_clarification(protocol.id, None)?;
        self.transition(db, ctx, protocol, ProtocolStatus::Planning, None, EventKind::ProtocolPlanning)?;

        let steps = db.list_step_runs(protocol.id)?;
        let plans = self.planner.plan(&PlanRequest {
            protocol: &*protocol,
            steps: &steps,
            from_index: step.step_index,
            category,
            feedback,
        })?;
        if plans.is_empty() {
            return Err(OrchestratorError::InvalidPlan(
                "planner returned no steps".to_string(),
            ));
        }

        let mut index = step.step_index;
        for plan in &plans {
            match steps.iter().find(|s| s.step_index == index) {
                Some(existing) => db.redefine_step_run(existing.id, plan, ctx.now)?,
                None => {
                    db.insert_step_run(protocol.id, index, plan, ctx.now)?;
                }
            }
            index += 1;
        }
        let mut dropped = 0;
        for surplus in steps
            .iter()
            .filter(|s| s.step_index >= index && !s.status.is_settled())
        {
            db.update_step_status(surplus.id, StepStatus::Cancelled, None, ctx.now)?;
            dropped += 1;
        }

        event(EventKind::ProtocolReplanned, protocol.id)
            .step(step.id)
            .message(format!(
                "{category} from step {}: {} step(s), {dropped} dropped",
                step.step_index,
                plans.len()
            ))
            .meta(json!({
                "category": category.as_str(),
                "attempt": attempt,
                "from_index": step.step_index,
                "steps": plans.len(),
                "dropped": dropped,
            }))
            .record(db, ctx)?;

        self.transition(db, ctx, protocol, ProtocolStatus::Planned, None, EventKind::ProtocolPlanned)?;
        if self.settings.auto_resume_after_replan {
            self.transition(db, ctx, protocol, ProtocolStatus::Running, None, EventKind::ProtocolResumed)?;
            self.advance_protocol(db, ctx, protocol.id)?;
        }
        Ok(())
    }

    // ── Operator extras ───────────────────────────────────────────────

    /// Queue the next step of a running run if nothing is in flight.
    pub fn run_next_step(&self, db: &StoreDb, ctx: &OpContext, id: i64) -> Result<Option<Job>> {
        db.atomically(|db| {
            let protocol = self.load_protocol(db, id)?;
            if protocol.status != ProtocolStatus::Running {
                return Err(OrchestratorError::invalid_transition(
                    "protocol run",
                    id,
                    protocol.status,
                    "run the next step of",
                ));
            }
            self.continue_run(db, ctx, id)
        })
    }

    /// Re-run the most recent failed or blocked step. The retry cap applies
    /// and open blocking clarifications for the step must be answered first.
    pub fn retry_latest(&self, db: &StoreDb, ctx: &OpContext, id: i64) -> Result<Job> {
        db.atomically(|db| {
            let mut protocol = self.load_protocol(db, id)?;
            if !matches!(
                protocol.status,
                ProtocolStatus::Running | ProtocolStatus::Blocked | ProtocolStatus::Paused
            ) {
                return Err(OrchestratorError::invalid_transition(
                    "protocol run",
                    id,
                    protocol.status,
                    "retry the latest step of",
                ));
            }
            let Some(mut step) = db
                .list_step_runs(id)?
                .into_iter()
                .rev()
                .find(|s| s.status.is_stalled())
            else {
                return Err(OrchestratorError::invalid_transition(
                    "protocol run",
                    id,
                    format!("{} with no failed or blocked step", protocol.status),
                    "retry the latest step of",
                ));
            };
            let limit = self.router.limits().max_retries;
            if step.retry_count >= limit {
                return Err(OrchestratorError::LoopLimitExceeded {
                    what: "step retries",
                    limit,
                    count: step.retry_count,
                });
            }
            if let Some(open) = db.open_blocking_clarifications(id, Some(step.id))?.first() {
                return Err(OrchestratorError::invalid_transition(
                    "protocol run",
                    id,
                    format!("blocked on clarification {}", open.id),
                    "retry the latest step of",
                ));
            }

            let count = db.increment_step_retry(step.id, ctx.now)?;
            step.retry_count = count;
            event(EventKind::StepRetried, id)
                .step(step.id)
                .message(format!("step '{}' retry {count}", step.name))
                .meta(json!({ "retry_count": count, "trigger": "operator" }))
                .record(db, ctx)?;
            if protocol.status == ProtocolStatus::Blocked {
                db.set_blocking_clarification(id, None)?;
                self.transition(db, ctx, &mut protocol, ProtocolStatus::Running, None, EventKind::ProtocolResumed)?;
            }
            self.dispatch_step(db, ctx, &mut step)
        })
    }

    /// Manual QA for a step in `needs_qa` or `blocked` (default: the latest
    /// such step). A no-op when a QA job is already queued or leased.
    pub fn request_qa(
        &self,
        db: &StoreDb,
        ctx: &OpContext,
        id: i64,
        step_id: Option<i64>,
    ) -> Result<QaRequest> {
        db.atomically(|db| {
            let mut protocol = self.load_protocol(db, id)?;
            if !matches!(
                protocol.status,
                ProtocolStatus::Running | ProtocolStatus::Paused | ProtocolStatus::Blocked
            ) {
                return Err(OrchestratorError::invalid_transition(
                    "protocol run",
                    id,
                    protocol.status,
                    "run QA for",
                ));
            }
            let mut step = self.qa_candidate(db, &protocol, step_id)?;
            if let Some(job) = db.active_job_for_step(step.id, Some(JobAction::RunQa))? {
                tracing::info!(step_id = step.id, job_id = job.id, "QA already queued");
                return Ok(QaRequest::AlreadyQueued(job));
            }
            let open: Vec<i64> = db
                .open_blocking_clarifications(id, Some(step.id))?
                .iter()
                .map(|c| c.id)
                .collect();
            if !open.is_empty() {
                event(EventKind::QaBlockedClarifications, id)
                    .step(step.id)
                    .message(format!("QA for step '{}' waits on {} clarification(s)", step.name, open.len()))
                    .meta(json!({ "clarifications": open }))
                    .record(db, ctx)?;
                return Ok(QaRequest::BlockedByClarifications(open));
            }
            if step.status != StepStatus::NeedsQa {
                self.set_step(db, ctx, &mut step, StepStatus::NeedsQa, None, EventKind::StepNeedsQa)?;
            }
            if protocol.status == ProtocolStatus::Blocked {
                db.set_blocking_clarification(id, None)?;
                self.transition(db, ctx, &mut protocol, ProtocolStatus::Running, None, EventKind::ProtocolResumed)?;
            }
            Ok(QaRequest::Enqueued(self.queue.enqueue(db, ctx, &step, JobAction::RunQa)?.job))
        })
    }

    fn qa_candidate(&self, db: &StoreDb, protocol: &ProtocolRun, step_id: Option<i64>) -> Result<StepRun> {
        let reviewable = |s: &StepRun| matches!(s.status, StepStatus::NeedsQa | StepStatus::Blocked);
        let step = match step_id {
            Some(step_id) => self.step_of(db, protocol, step_id)?,
            None => db
                .list_step_runs(protocol.id)?
                .into_iter()
                .rev()
                .find(|s| reviewable(s))
                .ok_or_else(|| {
                    OrchestratorError::invalid_transition(
                        "protocol run",
                        protocol.id,
                        format!("{} with no step awaiting review", protocol.status),
                        "review a step of",
                    )
                })?,
        };
        if !reviewable(&step) {
            return Err(OrchestratorError::invalid_transition(
                "step run",
                step.id,
                step.status,
                "review",
            ));
        }
        Ok(step)
    }

    /// Operator override: a `needs_qa` or `blocked` step is marked
    /// `completed` and the run moves on.
    pub fn approve(
        &self,
        db: &StoreDb,
        ctx: &OpContext,
        id: i64,
        step_id: Option<i64>,
    ) -> Result<StepRun> {
        db.atomically(|db| {
            let mut protocol = self.load_protocol(db, id)?;
            if protocol.status.is_terminal() {
                return Err(OrchestratorError::invalid_transition(
                    "protocol run",
                    id,
                    protocol.status,
                    "approve a step of",
                ));
            }
            let mut step = self.qa_candidate(db, &protocol, step_id)?;
            self.set_step(db, ctx, &mut step, StepStatus::Completed, None, EventKind::StepApproved)?;
            if protocol.status == ProtocolStatus::Blocked && db.open_blocking_clarifications(id, None)?.is_empty() {
                db.set_blocking_clarification(id, None)?;
                self.transition(db, ctx, &mut protocol, ProtocolStatus::Running, None, EventKind::ProtocolResumed)?;
            }
            self.advance_protocol(db, ctx, id)?;
            Ok(step)
        })
    }

    /// Record a pull-request request for a completed run. The git side is
    /// handled by whatever consumes `pr_requested` events.
    pub fn open_pr(&self, db: &StoreDb, ctx: &OpContext, id: i64) -> Result<()> {
        db.atomically(|db| {
            let protocol = self.load_protocol(db, id)?;
            if protocol.status != ProtocolStatus::Completed {
                return Err(OrchestratorError::invalid_transition(
                    "protocol run",
                    id,
                    protocol.status,
                    "open a pull request for",
                ));
            }
            let project = db.get_project(protocol.project_id)?;
            event(EventKind::PrRequested, id)
                .message(format!("pull request requested for '{}'", protocol.name))
                .meta(json!({
                    "base_branch": protocol.base_branch,
                    "git_url": project.and_then(|p| p.git_url),
                    "spec_hash": protocol.spec_hash,
                }))
                .record(db, ctx)?;
            Ok(())
        })
    }

    /// Look at up to `limit` running runs with nothing in flight and move
    /// each along: complete it, block it on its stalled step, or re-queue
    /// the step it was in the middle of.
    pub fn recover_stuck(&self, db: &StoreDb, ctx: &OpContext, limit: usize) -> Result<Vec<(i64, Recovery)>> {
        let mut recovered = Vec::new();
        for protocol in db
            .list_protocol_runs(Some(ProtocolStatus::Running))?
            .into_iter()
            .take(limit)
        {
            if let Some(recovery) = db.atomically(|db| self.recover_one(db, ctx, protocol.id))? {
                recovered.push((protocol.id, recovery));
            }
        }
        Ok(recovered)
    }

    fn recover_one(&self, db: &StoreDb, ctx: &OpContext, id: i64) -> Result<Option<Recovery>> {
        let mut protocol = self.load_protocol(db, id)?;
        if protocol.status != ProtocolStatus::Running {
            return Ok(None);
        }
        let steps = db.list_step_runs(id)?;
        for step in steps.iter().filter(|s| in_flight(s)) {
            if db.active_job_for_step(step.id, None)?.is_some() {
                return Ok(None);
            }
        }

        let recovery = if steps.iter().all(|s| s.status.is_settled()) {
            self.transition(db, ctx, &mut protocol, ProtocolStatus::Completed, None, EventKind::ProtocolCompleted)?;
            Recovery::Completed
        } else if let Some(stalled) = steps.iter().find(|s| s.status.is_stalled()) {
            let reason = format!("step '{}' is {} with nothing in flight", stalled.name, stalled.status);
            self.transition(db, ctx, &mut protocol, ProtocolStatus::Blocked, Some(reason.as_str()), EventKind::ProtocolBlocked)?;
            Recovery::Blocked {
                step_run_id: stalled.id,
            }
        } else {
            match self.continue_run(db, ctx, id)? {
                Some(job) => Recovery::Requeued { job_id: job.id },
                None => return Ok(None),
            }
        };

        event(EventKind::ProtocolRecovered, id)
            .message(format!("recovered: {recovery:?}"))
            .meta(json!({ "recovery": format!("{recovery:?}") }))
            .record(db, ctx)?;
        tracing::warn!(protocol_id = id, ?recovery, "recovered stuck protocol");
        Ok(Some(recovery))
    }

    // ── Clarifications ────────────────────────────────────────────────

    /// Record an answer. The run stays blocked until someone resumes it.
    pub fn answer_clarification(
        &self,
        db: &StoreDb,
        ctx: &OpContext,
        clarification_id: i64,
        answer: &str,
        answered_by: Option<&str>,
    ) -> Result<Clarification> {
        db.atomically(|db| {
            let clarification = db
                .get_clarification(clarification_id)?
                .ok_or(OrchestratorError::NotFound {
                    entity: "clarification",
                    id: clarification_id,
                })?;
            if clarification.status != ClarificationStatus::Open
                || !db.answer_clarification(clarification_id, answer, answered_by, ctx.now)?
            {
                return Err(OrchestratorError::invalid_transition(
                    "clarification",
                    clarification_id,
                    clarification.status,
                    "answer",
                ));
            }
            if let Some(protocol_id) = clarification.protocol_run_id {
                let mut builder = event(EventKind::ClarificationAnswered, protocol_id)
                    .message(format!("clarification {clarification_id} answered"))
                    .meta(json!({
                        "clarification_id": clarification_id,
                        "key": clarification.key,
                        "answered_by": answered_by,
                    }));
                if let Some(step_id) = clarification.step_run_id {
                    builder = builder.step(step_id);
                }
                builder.record(db, ctx)?;
            }
            tracing::info!(clarification_id, "clarification answered");
            db.get_clarification(clarification_id)?
                .ok_or(OrchestratorError::NotFound {
                    entity: "clarification",
                    id: clarification_id,
                })
        })
    }
}
