//! Whole-run behaviour through the library: workers, the state machine and
//! the operator API wired together over an in-memory store.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use conveyor::api::{Action, OperatorApi};
use conveyor::config::ConveyorToml;
use conveyor::dispatch::{
    Artifact, DispatchSettings, ExecutionRequest, ExecutionResult, Executor, JobOutcome, WorkerDispatch,
};
use conveyor::errors::ExecutorError;
use conveyor::events::OpContext;
use conveyor::machine::ProtocolStateMachine;
use conveyor::qa::{Finding, Gate, GateResult, GateSpec, QaContext, Severity};
use conveyor::registry::Registry;
use conveyor::store::{
    DbHandle, JobAction, JobStatus, ProtocolPlan, ProtocolStatus, StepPlan, StepStatus, StepType, StoreDb,
};

type Scripted = Result<ExecutionResult, ExecutorError>;

struct ScriptedExecutor {
    script: Mutex<VecDeque<Scripted>>,
}

impl ScriptedExecutor {
    fn new(script: Vec<Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
        })
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    fn id(&self) -> &str {
        "scripted"
    }

    async fn execute(&self, _request: ExecutionRequest) -> Result<ExecutionResult, ExecutorError> {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ExecutionResult::completed("ok")))
    }
}

/// Holds every execution until released.
struct HeldExecutor {
    started: Notify,
    release: Notify,
}

#[async_trait]
impl Executor for HeldExecutor {
    fn id(&self) -> &str {
        "held"
    }

    async fn execute(&self, _request: ExecutionRequest) -> Result<ExecutionResult, ExecutorError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(ExecutionResult::completed("finished after cancel"))
    }
}

/// Fails with one error finding while `failing` is set.
struct ToggleGate {
    failing: Arc<AtomicBool>,
}

impl Gate for ToggleGate {
    fn id(&self) -> &str {
        "constitution"
    }

    fn evaluate(&self, _ctx: &QaContext) -> GateResult {
        let findings = if self.failing.load(Ordering::SeqCst) {
            vec![Finding::new(Severity::Error, "article-3", "library-first rule violated")]
        } else {
            vec![]
        };
        GateResult::from_findings("constitution", findings)
    }
}

struct Rig {
    db: DbHandle,
    machine: Arc<ProtocolStateMachine>,
    dispatch: WorkerDispatch,
    api: OperatorApi,
    gate_fails: Arc<AtomicBool>,
}

impl Rig {
    fn new(executor: Arc<dyn Executor>, cfg: ConveyorToml) -> anyhow::Result<Self> {
        let mut registry = Registry::new(executor.id().to_string());
        registry.register_executor(executor);
        Self::with_registry(registry, cfg)
    }

    /// Built-in pattern gates from configuration plus `executor` as default.
    fn with_builtin_gates(executor: Arc<dyn Executor>, mut cfg: ConveyorToml) -> anyhow::Result<Self> {
        cfg.executor.default = executor.id().to_string();
        let mut registry = Registry::from_config(&cfg)?;
        registry.register_executor(executor);
        Self::with_registry(registry, cfg)
    }

    fn with_registry(mut registry: Registry, cfg: ConveyorToml) -> anyhow::Result<Self> {
        let gate_fails = Arc::new(AtomicBool::new(false));
        registry.register_gate(Arc::new(ToggleGate {
            failing: gate_fails.clone(),
        }));
        let machine = Arc::new(ProtocolStateMachine::from_config(&cfg, Arc::new(registry))?);
        let db = DbHandle::new(StoreDb::new_in_memory()?);
        let dispatch = WorkerDispatch::new(
            db.clone(),
            machine.clone(),
            DispatchSettings {
                working_dir: std::env::temp_dir(),
                poll_interval: Duration::from_millis(10),
                sweep_interval: Duration::from_millis(10),
                heartbeat_interval: Duration::from_secs(60),
            },
        );
        let api = OperatorApi::new(db.clone(), machine.clone());
        Ok(Self {
            db,
            machine,
            dispatch,
            api,
            gate_fails,
        })
    }

    fn create(&self, steps: &[&str], blocking_gate: bool) -> anyhow::Result<i64> {
        let gate = GateSpec {
            id: "constitution".into(),
            blocking: Some(blocking_gate),
        };
        self.create_with_gates(steps, vec![gate])
    }

    fn create_with_gates(&self, steps: &[&str], gates: Vec<GateSpec>) -> anyhow::Result<i64> {
        let plan = ProtocolPlan {
            name: "checkout-flow".into(),
            project: None,
            base_branch: "main".into(),
            description: String::new(),
            policy_pack: None,
            gates: Some(gates),
            checklist: vec![],
            steps: steps
                .iter()
                .map(|name| StepPlan {
                    name: name.to_string(),
                    step_type: StepType::Work,
                    prompt: format!("implement {name}"),
                    executor: None,
                    skip_qa: false,
                })
                .collect(),
        };
        let db = self.db.lock_sync()?;
        Ok(self.machine.create(&db, &OpContext::new(), &plan)?.id)
    }

    fn protocol_status(&self, id: i64) -> anyhow::Result<ProtocolStatus> {
        let db = self.db.lock_sync()?;
        Ok(self.machine.load_protocol(&db, id)?.status)
    }

    fn step_statuses(&self, id: i64) -> anyhow::Result<Vec<StepStatus>> {
        let db = self.db.lock_sync()?;
        Ok(db.list_step_runs(id)?.into_iter().map(|s| s.status).collect())
    }
}

fn fast_retries() -> ConveyorToml {
    let mut cfg = ConveyorToml::default();
    cfg.queue.backoff_base_secs = 0;
    cfg.queue.max_attempts = 3;
    cfg
}

#[tokio::test]
async fn test_two_passing_steps_complete_the_run() -> anyhow::Result<()> {
    let rig = Rig::new(ScriptedExecutor::new(vec![]), fast_retries())?;
    let id = rig.create(&["cart", "payment"], false)?;

    let started = rig.api.perform(id, Action::Start, None).await;
    assert!(started.success, "{}", started.message);

    let reports = rig.dispatch.drain("w1").await?;
    let actions: Vec<JobAction> = reports.iter().map(|r| r.action).collect();
    assert_eq!(
        actions,
        vec![JobAction::Execute, JobAction::RunQa, JobAction::Execute, JobAction::RunQa]
    );
    assert!(reports.iter().all(|r| r.outcome == JobOutcome::Completed));

    assert_eq!(rig.protocol_status(id)?, ProtocolStatus::Completed);
    assert_eq!(rig.step_statuses(id)?, vec![StepStatus::Completed, StepStatus::Completed]);
    let db = rig.db.lock_sync()?;
    let verdicts = db.list_verdicts(db.list_step_runs(id)?[0].id)?;
    assert_eq!(verdicts.len(), 1);
    assert!(verdicts[0].verdict.passed);
    Ok(())
}

#[tokio::test]
async fn test_blocking_gate_failure_waits_for_an_answer() -> anyhow::Result<()> {
    let rig = Rig::new(ScriptedExecutor::new(vec![]), fast_retries())?;
    let id = rig.create(&["cart"], true)?;
    rig.gate_fails.store(true, Ordering::SeqCst);

    rig.api.perform(id, Action::Start, None).await;
    rig.dispatch.drain("w1").await?;

    assert_eq!(rig.protocol_status(id)?, ProtocolStatus::Blocked);
    assert_eq!(rig.step_statuses(id)?, vec![StepStatus::Blocked]);
    let clarification = {
        let db = rig.db.lock_sync()?;
        let open = db.list_clarifications(Some(id), true)?;
        assert_eq!(open.len(), 1);
        assert!(open[0].blocking);
        open[0].clone()
    };

    let early = rig.api.perform(id, Action::Resume, None).await;
    assert!(!early.success);
    assert_eq!(early.status, Some(ProtocolStatus::Blocked));

    let answered = rig
        .api
        .answer(clarification.id, "wrap it in a library module".into(), Some("lead".into()), false)
        .await;
    assert!(answered.success, "{}", answered.message);
    assert_eq!(answered.status, Some(ProtocolStatus::Blocked));

    let resumed = rig.api.perform(id, Action::Resume, None).await;
    assert!(resumed.success, "{}", resumed.message);
    assert_eq!(resumed.status, Some(ProtocolStatus::Running));
    assert_eq!(rig.step_statuses(id)?, vec![StepStatus::Running]);
    {
        let db = rig.db.lock_sync()?;
        let queued: Vec<_> = db
            .list_jobs(id)?
            .into_iter()
            .filter(|j| j.status == JobStatus::Queued)
            .collect();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].action, JobAction::Execute);
        assert_eq!(resumed.job_id, Some(queued[0].id));
    }

    rig.gate_fails.store(false, Ordering::SeqCst);
    rig.dispatch.drain("w1").await?;
    assert_eq!(rig.protocol_status(id)?, ProtocolStatus::Completed);
    Ok(())
}

fn source_file(content: &str) -> Scripted {
    Ok(ExecutionResult::completed("wrote source").with_artifact(Artifact {
        kind: "file".into(),
        path: "stdout.log".into(),
        content: Some(content.into()),
    }))
}

#[tokio::test]
async fn test_fixed_output_passes_after_secret_was_flagged() -> anyhow::Result<()> {
    let executor = ScriptedExecutor::new(vec![
        source_file(r#"let password = "hunter2hunter2";"#),
        source_file("let password = read_env();"),
    ]);
    let rig = Rig::with_builtin_gates(executor, fast_retries())?;
    let id = rig.create_with_gates(&["auth"], vec![GateSpec::blocking("secrets")])?;
    rig.api.perform(id, Action::Start, None).await;
    rig.dispatch.drain("w1").await?;
    assert_eq!(rig.protocol_status(id)?, ProtocolStatus::Blocked);

    let clarification_id = {
        let db = rig.db.lock_sync()?;
        db.list_clarifications(Some(id), true)?[0].id
    };
    let answered = rig
        .api
        .answer(clarification_id, "read it from the environment".into(), None, true)
        .await;
    assert!(answered.success, "{}", answered.message);
    assert_eq!(answered.status, Some(ProtocolStatus::Running));

    rig.dispatch.drain("w1").await?;
    assert_eq!(rig.protocol_status(id)?, ProtocolStatus::Completed);

    let db = rig.db.lock_sync()?;
    let step_id = db.list_step_runs(id)?[0].id;
    let verdicts = db.list_verdicts(step_id)?;
    assert_eq!(verdicts.len(), 2);
    assert!(!verdicts[0].verdict.passed);
    assert!(verdicts[1].verdict.passed);
    assert_eq!(db.list_artifacts(step_id)?.len(), 2);
    let latest = db.latest_execution_artifacts(step_id)?;
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].content.as_deref(), Some("let password = read_env();"));
    Ok(())
}

#[tokio::test]
async fn test_repeated_timeouts_exhaust_the_job() -> anyhow::Result<()> {
    let timeouts = (0..3)
        .map(|_| Err(ExecutorError::Timeout(Duration::from_secs(30))))
        .collect();
    let rig = Rig::new(ScriptedExecutor::new(timeouts), fast_retries())?;
    let id = rig.create(&["cart"], false)?;
    rig.api.perform(id, Action::Start, None).await;

    let reports = rig.dispatch.drain("w1").await?;
    assert_eq!(reports.last().map(|r| r.outcome), Some(JobOutcome::Dead));
    assert_eq!(reports.len(), 3);

    let db = rig.db.lock_sync()?;
    let jobs = db.list_jobs(id)?;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Dead);
    assert_eq!(jobs[0].attempt, 3);
    assert_eq!(db.list_step_runs(id)?[0].status, StepStatus::Failed);

    let routed = db
        .list_events(id, None)?
        .into_iter()
        .find(|e| e.kind == "feedback_routed")
        .expect("feedback was routed");
    assert_eq!(routed.metadata["origin"], "executor");
    assert_eq!(routed.metadata["category"], "retry");
    assert_eq!(routed.metadata["action"], "manual_block");
    assert_eq!(
        rig.machine.load_protocol(&db, id)?.status,
        ProtocolStatus::Failed
    );
    Ok(())
}

#[tokio::test]
async fn test_cancel_during_execution_ignores_the_late_result() -> anyhow::Result<()> {
    let executor = Arc::new(HeldExecutor {
        started: Notify::new(),
        release: Notify::new(),
    });
    let rig = Rig::new(executor.clone(), fast_retries())?;
    let id = rig.create(&["cart"], false)?;
    rig.api.perform(id, Action::Start, None).await;

    let dispatch = rig.dispatch.clone();
    let worker = tokio::spawn(async move { dispatch.run_once("w1").await });
    executor.started.notified().await;

    let cancelled = rig.api.perform(id, Action::Cancel, None).await;
    assert!(cancelled.success, "{}", cancelled.message);
    assert_eq!(cancelled.status, Some(ProtocolStatus::Cancelled));

    executor.release.notify_one();
    let report = worker.await??.expect("a job was claimed");
    assert_eq!(report.action, JobAction::Execute);

    assert_eq!(rig.protocol_status(id)?, ProtocolStatus::Cancelled);
    assert_ne!(rig.step_statuses(id)?, vec![StepStatus::Completed]);
    let db = rig.db.lock_sync()?;
    assert!(db.list_events(id, None)?.iter().any(|e| e.kind == "result_ignored"));
    assert!(
        db.list_jobs(id)?
            .iter()
            .all(|j| j.action == JobAction::Execute),
        "no QA job is queued for a cancelled run"
    );
    Ok(())
}
