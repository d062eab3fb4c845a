use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::models::*;
use crate::errors::OrchestratorError;
use crate::qa::{GateSpec, QaVerdict};

/// Async-safe handle to the orchestration database.
///
/// Wraps `StoreDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<StoreDb>>,
}

impl DbHandle {
    pub fn new(db: StoreDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&StoreDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// [`call`](Self::call) for operations that fail with a typed
    /// [`OrchestratorError`].
    pub async fn call_op<F, R>(&self, f: F) -> crate::errors::Result<R>
    where
        F: FnOnce(&StoreDb) -> crate::errors::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| OrchestratorError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For startup, the CLI and
    /// tests; never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, StoreDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct StoreDb {
    conn: Connection,
}

/// What `upsert_clarification` did with an existing `(scope_key, key)` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Created,
    Refreshed,
    Reopened,
}

pub struct NewProtocolRun<'a> {
    pub project_id: i64,
    pub name: &'a str,
    pub base_branch: &'a str,
    pub description: &'a str,
    pub policy_pack: Option<&'a str>,
    pub spec_hash: Option<&'a str>,
    pub spec_validation: SpecValidation,
    pub gates: &'a [GateSpec],
    pub checklist: &'a [String],
}

pub struct NewJob<'a> {
    pub step_run_id: i64,
    pub protocol_run_id: i64,
    pub action: JobAction,
    pub max_attempts: u32,
    pub timeout_secs: u64,
    pub request_id: Option<&'a str>,
}

pub struct NewEvent<'a> {
    pub protocol_run_id: i64,
    pub step_run_id: Option<i64>,
    pub job_id: Option<i64>,
    pub kind: &'a str,
    pub message: &'a str,
    pub metadata: &'a serde_json::Value,
    pub request_id: Option<&'a str>,
}

pub struct NewArtifact<'a> {
    pub step_run_id: i64,
    pub job_id: Option<i64>,
    pub kind: &'a str,
    pub path: &'a str,
    pub content: Option<&'a str>,
}

const PROTOCOL_COLUMNS: &str = "id, project_id, name, status, base_branch, description, policy_pack, spec_hash, spec_validation, gates, checklist, blocked_reason, blocking_clarification_id, replan_attempts, created_at, updated_at";
const STEP_COLUMNS: &str = "id, protocol_run_id, step_index, name, step_type, status, prompt, retry_count, clarification_loops, last_result_summary, assigned_executor, skip_qa, created_at, updated_at";
const JOB_COLUMNS: &str = "id, step_run_id, protocol_run_id, action, status, attempt, max_attempts, timeout_secs, enqueued_at, available_at, lease_owner, lease_expires_at, last_error, request_id, finished_at";
const CLARIFICATION_COLUMNS: &str = "id, scope, scope_key, key, protocol_run_id, step_run_id, question, options, recommended, blocking, status, answer, answered_by, answered_at, created_at, updated_at";

fn protocol_row(row: &Row<'_>) -> rusqlite::Result<ProtocolRunRow> {
    Ok(ProtocolRunRow {
        id: row.get(0)?,
        project_id: row.get(1)?,
        name: row.get(2)?,
        status: row.get(3)?,
        base_branch: row.get(4)?,
        description: row.get(5)?,
        policy_pack: row.get(6)?,
        spec_hash: row.get(7)?,
        spec_validation: row.get(8)?,
        gates: row.get(9)?,
        checklist: row.get(10)?,
        blocked_reason: row.get(11)?,
        blocking_clarification_id: row.get(12)?,
        replan_attempts: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

fn step_row(row: &Row<'_>) -> rusqlite::Result<StepRunRow> {
    Ok(StepRunRow {
        id: row.get(0)?,
        protocol_run_id: row.get(1)?,
        step_index: row.get(2)?,
        name: row.get(3)?,
        step_type: row.get(4)?,
        status: row.get(5)?,
        prompt: row.get(6)?,
        retry_count: row.get(7)?,
        clarification_loops: row.get(8)?,
        last_result_summary: row.get(9)?,
        assigned_executor: row.get(10)?,
        skip_qa: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn job_row(row: &Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        step_run_id: row.get(1)?,
        protocol_run_id: row.get(2)?,
        action: row.get(3)?,
        status: row.get(4)?,
        attempt: row.get(5)?,
        max_attempts: row.get(6)?,
        timeout_secs: row.get(7)?,
        enqueued_at: row.get(8)?,
        available_at: row.get(9)?,
        lease_owner: row.get(10)?,
        lease_expires_at: row.get(11)?,
        last_error: row.get(12)?,
        request_id: row.get(13)?,
        finished_at: row.get(14)?,
    })
}

fn clarification_row(row: &Row<'_>) -> rusqlite::Result<ClarificationRow> {
    Ok(ClarificationRow {
        id: row.get(0)?,
        scope: row.get(1)?,
        scope_key: row.get(2)?,
        key: row.get(3)?,
        protocol_run_id: row.get(4)?,
        step_run_id: row.get(5)?,
        question: row.get(6)?,
        options: row.get(7)?,
        recommended: row.get(8)?,
        blocking: row.get(9)?,
        status: row.get(10)?,
        answer: row.get(11)?,
        answered_by: row.get(12)?,
        answered_at: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

impl StoreDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS projects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE,
                    git_url TEXT,
                    base_branch TEXT NOT NULL DEFAULT 'main',
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS protocol_runs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL REFERENCES projects(id),
                    name TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    base_branch TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    policy_pack TEXT,
                    spec_hash TEXT,
                    spec_validation TEXT,
                    gates TEXT NOT NULL DEFAULT '[]',
                    checklist TEXT NOT NULL DEFAULT '[]',
                    blocked_reason TEXT,
                    blocking_clarification_id INTEGER,
                    replan_attempts INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS step_runs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    protocol_run_id INTEGER NOT NULL REFERENCES protocol_runs(id),
                    step_index INTEGER NOT NULL,
                    name TEXT NOT NULL,
                    step_type TEXT NOT NULL DEFAULT 'work',
                    status TEXT NOT NULL DEFAULT 'pending',
                    prompt TEXT NOT NULL DEFAULT '',
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    clarification_loops INTEGER NOT NULL DEFAULT 0,
                    last_result_summary TEXT,
                    assigned_executor TEXT,
                    skip_qa INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE(protocol_run_id, step_index)
                );

                CREATE TABLE IF NOT EXISTS jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    step_run_id INTEGER NOT NULL REFERENCES step_runs(id),
                    protocol_run_id INTEGER NOT NULL REFERENCES protocol_runs(id),
                    action TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'queued',
                    attempt INTEGER NOT NULL DEFAULT 1,
                    max_attempts INTEGER NOT NULL,
                    timeout_secs INTEGER NOT NULL,
                    enqueued_at TEXT NOT NULL,
                    available_at TEXT NOT NULL,
                    lease_owner TEXT,
                    lease_expires_at TEXT,
                    last_error TEXT,
                    request_id TEXT,
                    finished_at TEXT
                );

                CREATE TABLE IF NOT EXISTS events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    protocol_run_id INTEGER NOT NULL REFERENCES protocol_runs(id),
                    step_run_id INTEGER REFERENCES step_runs(id),
                    job_id INTEGER REFERENCES jobs(id),
                    kind TEXT NOT NULL,
                    message TEXT NOT NULL DEFAULT '',
                    metadata TEXT NOT NULL DEFAULT '{}',
                    request_id TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS clarifications (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    scope TEXT NOT NULL,
                    scope_key TEXT NOT NULL,
                    key TEXT NOT NULL,
                    protocol_run_id INTEGER REFERENCES protocol_runs(id),
                    step_run_id INTEGER REFERENCES step_runs(id),
                    question TEXT NOT NULL,
                    options TEXT NOT NULL DEFAULT '[]',
                    recommended TEXT,
                    blocking INTEGER NOT NULL DEFAULT 0,
                    status TEXT NOT NULL DEFAULT 'open',
                    answer TEXT,
                    answered_by TEXT,
                    answered_at TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE(scope_key, key)
                );

                CREATE TABLE IF NOT EXISTS qa_verdicts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    step_run_id INTEGER NOT NULL REFERENCES step_runs(id),
                    protocol_run_id INTEGER NOT NULL REFERENCES protocol_runs(id),
                    passed INTEGER NOT NULL,
                    score REAL NOT NULL,
                    verdict TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS step_artifacts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    step_run_id INTEGER NOT NULL REFERENCES step_runs(id),
                    job_id INTEGER REFERENCES jobs(id),
                    kind TEXT NOT NULL,
                    path TEXT NOT NULL,
                    content TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_protocol_runs_status ON protocol_runs(status);
                CREATE INDEX IF NOT EXISTS idx_step_runs_protocol ON step_runs(protocol_run_id, step_index);
                CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(status, available_at);
                CREATE INDEX IF NOT EXISTS idx_jobs_step ON jobs(step_run_id, status);
                CREATE INDEX IF NOT EXISTS idx_events_protocol ON events(protocol_run_id, id);
                CREATE INDEX IF NOT EXISTS idx_clarifications_protocol ON clarifications(protocol_run_id, status);
                CREATE INDEX IF NOT EXISTS idx_verdicts_step ON qa_verdicts(step_run_id);
                CREATE INDEX IF NOT EXISTS idx_artifacts_step ON step_artifacts(step_run_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    /// Run `f` inside a savepoint: every write commits together or not at all.
    ///
    /// Savepoints nest, so an operation may call another atomic operation.
    pub fn atomically<R, E>(&self, f: impl FnOnce(&Self) -> std::result::Result<R, E>) -> std::result::Result<R, E>
    where
        E: From<anyhow::Error>,
    {
        self.conn
            .execute_batch("SAVEPOINT conveyor_op")
            .context("Failed to open savepoint")?;
        match f(self) {
            Ok(value) => {
                self.conn
                    .execute_batch("RELEASE conveyor_op")
                    .context("Failed to release savepoint")?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self
                    .conn
                    .execute_batch("ROLLBACK TO conveyor_op; RELEASE conveyor_op")
                {
                    tracing::error!(error = %rollback, "savepoint rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Like [`atomically`](Self::atomically), but outside a transaction the
    /// write lock is taken up front. Writers racing on the same file then
    /// wait on the busy timeout instead of failing to upgrade a read lock.
    pub fn write_atomically<R, E>(&self, f: impl FnOnce(&Self) -> std::result::Result<R, E>) -> std::result::Result<R, E>
    where
        E: From<anyhow::Error>,
    {
        if !self.conn.is_autocommit() {
            return self.atomically(f);
        }
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .context("Failed to begin write transaction")?;
        let result = f(self).and_then(|value| {
            self.conn.execute_batch("COMMIT").context("Failed to commit")?;
            Ok(value)
        });
        if result.is_err() && !self.conn.is_autocommit() {
            if let Err(rollback) = self.conn.execute_batch("ROLLBACK") {
                tracing::error!(error = %rollback, "transaction rollback failed");
            }
        }
        result
    }

    // ── Projects ──────────────────────────────────────────────────────

    pub fn create_project(
        &self,
        name: &str,
        git_url: Option<&str>,
        base_branch: &str,
        now: DateTime<Utc>,
    ) -> Result<Project> {
        self.conn
            .execute(
                "INSERT INTO projects (name, git_url, base_branch, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![name, git_url, base_branch, ts(now)],
            )
            .context("Failed to insert project")?;
        let id = self.conn.last_insert_rowid();
        self.get_project(id)?.context("Project not found after insert")
    }

    pub fn get_project(&self, id: i64) -> Result<Option<Project>> {
        self.conn
            .query_row(
                "SELECT id, name, git_url, base_branch, created_at FROM projects WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Project {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        git_url: row.get(2)?,
                        base_branch: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()
            .context("Failed to query project")
    }

    pub fn find_project_by_name(&self, name: &str) -> Result<Option<Project>> {
        let id: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM projects WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to look up project by name")?;
        match id {
            Some(id) => self.get_project(id),
            None => Ok(None),
        }
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, git_url, base_branch, created_at FROM projects ORDER BY id")
            .context("Failed to prepare list_projects")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Project {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    git_url: row.get(2)?,
                    base_branch: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })
            .context("Failed to query projects")?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row.context("Failed to read project row")?);
        }
        Ok(projects)
    }

    // ── Protocol runs ─────────────────────────────────────────────────

    pub fn insert_protocol_run(&self, new: &NewProtocolRun<'_>, now: DateTime<Utc>) -> Result<i64> {
        let gates = serde_json::to_string(new.gates).context("Failed to serialize gates")?;
        let checklist =
            serde_json::to_string(new.checklist).context("Failed to serialize checklist")?;
        self.conn
            .execute(
                "INSERT INTO protocol_runs (project_id, name, status, base_branch, description, policy_pack, spec_hash, spec_validation, gates, checklist, created_at, updated_at)
                 VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                params![
                    new.project_id,
                    new.name,
                    new.base_branch,
                    new.description,
                    new.policy_pack,
                    new.spec_hash,
                    new.spec_validation.as_str(),
                    gates,
                    checklist,
                    ts(now),
                ],
            )
            .context("Failed to insert protocol run")?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_protocol_run(&self, id: i64) -> Result<Option<ProtocolRun>> {
        let sql = format!("SELECT {PROTOCOL_COLUMNS} FROM protocol_runs WHERE id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![id], protocol_row)
            .optional()
            .context("Failed to query protocol run")?;
        row.map(ProtocolRunRow::into_protocol_run).transpose()
    }

    pub fn list_protocol_runs(&self, status: Option<ProtocolStatus>) -> Result<Vec<ProtocolRun>> {
        let sql = format!(
            "SELECT {PROTOCOL_COLUMNS} FROM protocol_runs WHERE (?1 IS NULL OR status = ?1) ORDER BY id"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_protocol_runs")?;
        let rows = stmt
            .query_map(params![status.map(|s| s.as_str())], protocol_row)
            .context("Failed to query protocol runs")?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.context("Failed to read protocol run row")?.into_protocol_run()?);
        }
        Ok(runs)
    }

    /// Compare-and-swap on the status column. Returns false when another
    /// writer moved the run first.
    pub fn cas_protocol_status(
        &self,
        id: i64,
        expected: ProtocolStatus,
        next: ProtocolStatus,
        blocked_reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE protocol_runs SET status = ?1, blocked_reason = ?2, updated_at = ?3
                 WHERE id = ?4 AND status = ?5",
                params![next.as_str(), blocked_reason, ts(now), id, expected.as_str()],
            )
            .context("Failed to update protocol run status")?;
        Ok(changed == 1)
    }

    pub fn set_blocking_clarification(&self, id: i64, clarification_id: Option<i64>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE protocol_runs SET blocking_clarification_id = ?1 WHERE id = ?2",
                params![clarification_id, id],
            )
            .context("Failed to set blocking clarification")?;
        Ok(())
    }

    pub fn increment_replan_attempts(&self, id: i64) -> Result<u32> {
        self.conn
            .query_row(
                "UPDATE protocol_runs SET replan_attempts = replan_attempts + 1 WHERE id = ?1 RETURNING replan_attempts",
                params![id],
                |row| row.get(0),
            )
            .context("Failed to increment replan attempts")
    }

    pub fn set_spec_validation(&self, id: i64, status: SpecValidation) -> Result<()> {
        self.conn
            .execute(
                "UPDATE protocol_runs SET spec_validation = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to set spec validation status")?;
        Ok(())
    }

    // ── Step runs ─────────────────────────────────────────────────────

    pub fn insert_step_run(
        &self,
        protocol_run_id: i64,
        step_index: u32,
        plan: &StepPlan,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO step_runs (protocol_run_id, step_index, name, step_type, status, prompt, assigned_executor, skip_qa, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?7, ?8, ?8)",
                params![
                    protocol_run_id,
                    step_index,
                    plan.name,
                    plan.step_type.as_str(),
                    plan.prompt,
                    plan.executor,
                    plan.skip_qa,
                    ts(now),
                ],
            )
            .context("Failed to insert step run")?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_step_run(&self, id: i64) -> Result<Option<StepRun>> {
        let sql = format!("SELECT {STEP_COLUMNS} FROM step_runs WHERE id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![id], step_row)
            .optional()
            .context("Failed to query step run")?;
        row.map(StepRunRow::into_step_run).transpose()
    }

    pub fn list_step_runs(&self, protocol_run_id: i64) -> Result<Vec<StepRun>> {
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM step_runs WHERE protocol_run_id = ?1 ORDER BY step_index"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_step_runs")?;
        let rows = stmt
            .query_map(params![protocol_run_id], step_row)
            .context("Failed to query step runs")?;
        let mut steps = Vec::new();
        for row in rows {
            steps.push(row.context("Failed to read step run row")?.into_step_run()?);
        }
        Ok(steps)
    }

    pub fn update_step_status(
        &self,
        id: i64,
        status: StepStatus,
        summary: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE step_runs SET status = ?1, last_result_summary = COALESCE(?2, last_result_summary), updated_at = ?3
                 WHERE id = ?4",
                params![status.as_str(), summary, ts(now), id],
            )
            .context("Failed to update step run status")?;
        Ok(())
    }

    pub fn increment_step_retry(&self, id: i64, now: DateTime<Utc>) -> Result<u32> {
        self.conn
            .query_row(
                "UPDATE step_runs SET retry_count = retry_count + 1, updated_at = ?1 WHERE id = ?2 RETURNING retry_count",
                params![ts(now), id],
                |row| row.get(0),
            )
            .context("Failed to increment step retry count")
    }

    pub fn increment_clarification_loops(&self, id: i64) -> Result<u32> {
        self.conn
            .query_row(
                "UPDATE step_runs SET clarification_loops = clarification_loops + 1 WHERE id = ?1 RETURNING clarification_loops",
                params![id],
                |row| row.get(0),
            )
            .context("Failed to increment clarification loops")
    }

    /// Rewrite a step's definition in place and return it to `pending`.
    pub fn redefine_step_run(&self, id: i64, plan: &StepPlan, now: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE step_runs SET name = ?1, step_type = ?2, prompt = ?3, assigned_executor = ?4, skip_qa = ?5,
                        status = 'pending', retry_count = 0, last_result_summary = NULL, updated_at = ?6
                 WHERE id = ?7",
                params![
                    plan.name,
                    plan.step_type.as_str(),
                    plan.prompt,
                    plan.executor,
                    plan.skip_qa,
                    ts(now),
                    id,
                ],
            )
            .context("Failed to redefine step run")?;
        Ok(())
    }

    /// Cancel every step of a protocol that has not reached a final state.
    pub fn cancel_open_steps(&self, protocol_run_id: i64, now: DateTime<Utc>) -> Result<usize> {
        self.conn
            .execute(
                "UPDATE step_runs SET status = 'cancelled', updated_at = ?1
                 WHERE protocol_run_id = ?2 AND status IN ('pending', 'running', 'needs_qa', 'blocked')",
                params![ts(now), protocol_run_id],
            )
            .context("Failed to cancel open step runs")
    }

    // ── Jobs ──────────────────────────────────────────────────────────

    pub fn insert_job(&self, new: &NewJob<'_>, now: DateTime<Utc>) -> Result<Job> {
        self.conn
            .execute(
                "INSERT INTO jobs (step_run_id, protocol_run_id, action, status, attempt, max_attempts, timeout_secs, enqueued_at, available_at, request_id)
                 VALUES (?1, ?2, ?3, 'queued', 1, ?4, ?5, ?6, ?6, ?7)",
                params![
                    new.step_run_id,
                    new.protocol_run_id,
                    new.action.as_str(),
                    new.max_attempts,
                    new.timeout_secs as i64,
                    ts(now),
                    new.request_id,
                ],
            )
            .context("Failed to insert job")?;
        let id = self.conn.last_insert_rowid();
        self.get_job(id)?.context("Job not found after insert")
    }

    pub fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![id], job_row)
            .optional()
            .context("Failed to query job")?;
        row.map(JobRow::into_job).transpose()
    }

    fn query_jobs(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<Job>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare job query")?;
        let rows = stmt.query_map(args, job_row).context("Failed to query jobs")?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row.context("Failed to read job row")?.into_job()?);
        }
        Ok(jobs)
    }

    /// The queued or leased job for a step, if any.
    pub fn active_job_for_step(&self, step_run_id: i64, action: Option<JobAction>) -> Result<Option<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE step_run_id = ?1 AND status IN ('queued', 'leased') AND (?2 IS NULL OR action = ?2)
             ORDER BY id LIMIT 1"
        );
        Ok(self
            .query_jobs(&sql, params![step_run_id, action.map(|a| a.as_str())])?
            .into_iter()
            .next())
    }

    pub fn list_jobs(&self, protocol_run_id: i64) -> Result<Vec<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE protocol_run_id = ?1 ORDER BY id");
        self.query_jobs(&sql, params![protocol_run_id])
    }

    /// Lease the oldest available job whose protocol run is `running`.
    ///
    /// The conditional update makes the claim exclusive even when several
    /// processes share the database file.
    pub fn claim_next_job(
        &self,
        worker_id: &str,
        lease_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        self.write_atomically(|db| {
            let candidate: Option<i64> = db
                .conn
                .query_row(
                    "SELECT j.id FROM jobs j
                     JOIN protocol_runs p ON p.id = j.protocol_run_id
                     WHERE j.status = 'queued' AND j.available_at <= ?1 AND p.status = 'running'
                     ORDER BY j.available_at, j.id LIMIT 1",
                    params![ts(now)],
                    |row| row.get(0),
                )
                .optional()
                .context("Failed to select claimable job")?;
            let Some(job_id) = candidate else {
                return Ok(None);
            };
            let changed = db
                .conn
                .execute(
                    "UPDATE jobs SET status = 'leased', lease_owner = ?1, lease_expires_at = ?2
                     WHERE id = ?3 AND status = 'queued'",
                    params![worker_id, ts(lease_expires_at), job_id],
                )
                .context("Failed to lease job")?;
            if changed == 0 {
                return Ok(None);
            }
            db.get_job(job_id)
        })
    }

    /// Extend a live lease held by `worker_id`.
    pub fn extend_lease(
        &self,
        job_id: i64,
        worker_id: &str,
        lease_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET lease_expires_at = ?1
                 WHERE id = ?2 AND status = 'leased' AND lease_owner = ?3 AND lease_expires_at > ?4",
                params![ts(lease_expires_at), job_id, worker_id, ts(now)],
            )
            .context("Failed to extend lease")?;
        Ok(changed == 1)
    }

    /// Move a leased job to a final status. With `owner` set, only a live
    /// lease held by that worker qualifies.
    pub fn finish_job(
        &self,
        job_id: i64,
        owner: Option<&str>,
        status: JobStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET status = ?1, last_error = COALESCE(?2, last_error), finished_at = ?3
                 WHERE id = ?4 AND status = 'leased'
                   AND (?5 IS NULL OR (lease_owner = ?5 AND lease_expires_at > ?3))",
                params![status.as_str(), error, ts(now), job_id, owner],
            )
            .context("Failed to finish job")?;
        Ok(changed == 1)
    }

    /// Put a leased job back in the queue for its next attempt.
    pub fn requeue_job(
        &self,
        job_id: i64,
        owner: Option<&str>,
        attempt: u32,
        available_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET status = 'queued', attempt = ?1, available_at = ?2, last_error = ?3,
                        lease_owner = NULL, lease_expires_at = NULL
                 WHERE id = ?4 AND status = 'leased'
                   AND (?5 IS NULL OR (lease_owner = ?5 AND lease_expires_at > ?6))",
                params![attempt, ts(available_at), error, job_id, owner, ts(now)],
            )
            .context("Failed to requeue job")?;
        Ok(changed == 1)
    }

    pub fn list_expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'leased' AND lease_expires_at <= ?1 ORDER BY id"
        );
        self.query_jobs(&sql, params![ts(now)])
    }

    /// Cancel queued jobs of a protocol. Leased jobs run to completion.
    pub fn cancel_queued_jobs(&self, protocol_run_id: i64, now: DateTime<Utc>) -> Result<usize> {
        self.conn
            .execute(
                "UPDATE jobs SET status = 'cancelled', finished_at = ?1
                 WHERE protocol_run_id = ?2 AND status = 'queued'",
                params![ts(now), protocol_run_id],
            )
            .context("Failed to cancel queued jobs")
    }

    /// Job counts per status, for operator views.
    pub fn job_stats(&self) -> Result<Vec<(JobStatus, u64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status ORDER BY status")
            .context("Failed to prepare job_stats")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .context("Failed to query job stats")?;
        let mut stats = Vec::new();
        for row in rows {
            let (status, count) = row.context("Failed to read job stats row")?;
            let status = status.parse::<JobStatus>().map_err(|e| anyhow::anyhow!(e))?;
            stats.push((status, count.max(0) as u64));
        }
        Ok(stats)
    }

    // ── Events ────────────────────────────────────────────────────────

    pub fn insert_event(&self, new: &NewEvent<'_>, now: DateTime<Utc>) -> Result<i64> {
        let metadata = serde_json::to_string(new.metadata).context("Failed to serialize event metadata")?;
        self.conn
            .execute(
                "INSERT INTO events (protocol_run_id, step_run_id, job_id, kind, message, metadata, request_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    new.protocol_run_id,
                    new.step_run_id,
                    new.job_id,
                    new.kind,
                    new.message,
                    metadata,
                    new.request_id,
                    ts(now),
                ],
            )
            .context("Failed to insert event")?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Events of a protocol run in insertion order; `limit` keeps the newest.
    pub fn list_events(&self, protocol_run_id: i64, limit: Option<usize>) -> Result<Vec<Event>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, protocol_run_id, step_run_id, job_id, kind, message, metadata, request_id, created_at
                 FROM (SELECT * FROM events WHERE protocol_run_id = ?1 ORDER BY id DESC LIMIT ?2)
                 ORDER BY id",
            )
            .context("Failed to prepare list_events")?;
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let rows = stmt
            .query_map(params![protocol_run_id, limit], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, String>(8)?,
                ))
            })
            .context("Failed to query events")?;
        let mut events = Vec::new();
        for row in rows {
            let (id, protocol_run_id, step_run_id, job_id, kind, message, metadata, request_id, created_at) =
                row.context("Failed to read event row")?;
            events.push(Event {
                id,
                protocol_run_id,
                step_run_id,
                job_id,
                kind,
                message,
                metadata: serde_json::from_str(&metadata).context("Invalid event metadata")?,
                request_id,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(events)
    }

    // ── Clarifications ────────────────────────────────────────────────

    /// Insert, or refresh the row already holding `(scope_key, key)`.
    /// An answered row is reopened; an open one keeps its id and status.
    pub fn upsert_clarification(
        &self,
        new: &NewClarification,
        now: DateTime<Utc>,
    ) -> Result<(Clarification, Upsert)> {
        let options = serde_json::to_string(&new.options).context("Failed to serialize options")?;
        let recommended = new
            .recommended
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize recommendation")?;
        let existing: Option<(i64, String)> = self
            .conn
            .query_row(
                "SELECT id, status FROM clarifications WHERE scope_key = ?1 AND key = ?2",
                params![new.scope_key, new.key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to look up clarification")?;

        let (id, outcome) = match existing {
            None => {
                self.conn
                    .execute(
                        "INSERT INTO clarifications (scope, scope_key, key, protocol_run_id, step_run_id, question, options, recommended, blocking, status, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'open', ?10, ?10)",
                        params![
                            new.scope.as_str(),
                            new.scope_key,
                            new.key,
                            new.protocol_run_id,
                            new.step_run_id,
                            new.question,
                            options,
                            recommended,
                            new.blocking,
                            ts(now),
                        ],
                    )
                    .context("Failed to insert clarification")?;
                (self.conn.last_insert_rowid(), Upsert::Created)
            }
            Some((id, status)) => {
                let reopen = status != ClarificationStatus::Open.as_str();
                self.conn
                    .execute(
                        "UPDATE clarifications SET question = ?1, options = ?2, recommended = ?3, blocking = ?4,
                                status = 'open', answer = NULL, answered_by = NULL, answered_at = NULL, updated_at = ?5
                         WHERE id = ?6",
                        params![new.question, options, recommended, new.blocking, ts(now), id],
                    )
                    .context("Failed to refresh clarification")?;
                (id, if reopen { Upsert::Reopened } else { Upsert::Refreshed })
            }
        };
        let clarification = self
            .get_clarification(id)?
            .context("Clarification not found after upsert")?;
        Ok((clarification, outcome))
    }

    pub fn get_clarification(&self, id: i64) -> Result<Option<Clarification>> {
        let sql = format!("SELECT {CLARIFICATION_COLUMNS} FROM clarifications WHERE id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![id], clarification_row)
            .optional()
            .context("Failed to query clarification")?;
        row.map(ClarificationRow::into_clarification).transpose()
    }

    pub fn list_clarifications(
        &self,
        protocol_run_id: Option<i64>,
        open_only: bool,
    ) -> Result<Vec<Clarification>> {
        let sql = format!(
            "SELECT {CLARIFICATION_COLUMNS} FROM clarifications
             WHERE (?1 IS NULL OR protocol_run_id = ?1) AND (?2 = 0 OR status = 'open')
             ORDER BY id"
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_clarifications")?;
        let rows = stmt
            .query_map(params![protocol_run_id, open_only], clarification_row)
            .context("Failed to query clarifications")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("Failed to read clarification row")?.into_clarification()?);
        }
        Ok(out)
    }

    /// Open blocking clarifications for a protocol, optionally narrowed to
    /// one step plus the protocol-wide ones.
    pub fn open_blocking_clarifications(
        &self,
        protocol_run_id: i64,
        step_run_id: Option<i64>,
    ) -> Result<Vec<Clarification>> {
        Ok(self
            .list_clarifications(Some(protocol_run_id), true)?
            .into_iter()
            .filter(|c| c.blocking)
            .filter(|c| match step_run_id {
                Some(step) => c.step_run_id.is_none() || c.step_run_id == Some(step),
                None => true,
            })
            .collect())
    }

    /// Record an answer. Returns false if the clarification was not open.
    pub fn answer_clarification(
        &self,
        id: i64,
        answer: &str,
        answered_by: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE clarifications SET status = 'answered', answer = ?1, answered_by = ?2, answered_at = ?3, updated_at = ?3
                 WHERE id = ?4 AND status = 'open'",
                params![answer, answered_by, ts(now), id],
            )
            .context("Failed to answer clarification")?;
        Ok(changed == 1)
    }

    // ── QA verdicts ───────────────────────────────────────────────────

    pub fn insert_verdict(
        &self,
        step_run_id: i64,
        protocol_run_id: i64,
        verdict: &QaVerdict,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let body = serde_json::to_string(verdict).context("Failed to serialize verdict")?;
        self.conn
            .execute(
                "INSERT INTO qa_verdicts (step_run_id, protocol_run_id, passed, score, verdict, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![step_run_id, protocol_run_id, verdict.passed, verdict.score, body, ts(now)],
            )
            .context("Failed to insert verdict")?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn list_verdicts(&self, step_run_id: i64) -> Result<Vec<StoredVerdict>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, step_run_id, protocol_run_id, verdict, created_at FROM qa_verdicts
                 WHERE step_run_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_verdicts")?;
        let rows = stmt
            .query_map(params![step_run_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .context("Failed to query verdicts")?;
        let mut verdicts = Vec::new();
        for row in rows {
            let (id, step_run_id, protocol_run_id, body, created_at) =
                row.context("Failed to read verdict row")?;
            verdicts.push(StoredVerdict {
                id,
                step_run_id,
                protocol_run_id,
                verdict: serde_json::from_str(&body).context("Invalid verdict JSON")?,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(verdicts)
    }

    // ── Artifacts ─────────────────────────────────────────────────────

    pub fn insert_artifact(&self, new: &NewArtifact<'_>, now: DateTime<Utc>) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO step_artifacts (step_run_id, job_id, kind, path, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![new.step_run_id, new.job_id, new.kind, new.path, new.content, ts(now)],
            )
            .context("Failed to insert artifact")?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn list_artifacts(&self, step_run_id: i64) -> Result<Vec<StepArtifact>> {
        self.query_artifacts(
            "SELECT id, step_run_id, job_id, kind, path, content, created_at FROM step_artifacts
             WHERE step_run_id = ?1 ORDER BY id",
            step_run_id,
        )
    }

    /// Artifacts written by the step's most recent completed `execute` job.
    /// Output from earlier attempts is left out.
    pub fn latest_execution_artifacts(&self, step_run_id: i64) -> Result<Vec<StepArtifact>> {
        self.query_artifacts(
            "SELECT id, step_run_id, job_id, kind, path, content, created_at FROM step_artifacts
             WHERE step_run_id = ?1
               AND job_id = (SELECT MAX(id) FROM jobs
                             WHERE step_run_id = ?1 AND action = 'execute' AND status = 'completed')
             ORDER BY id",
            step_run_id,
        )
    }

    fn query_artifacts(&self, sql: &str, step_run_id: i64) -> Result<Vec<StepArtifact>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare artifact query")?;
        let rows = stmt
            .query_map(params![step_run_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .context("Failed to query artifacts")?;
        let mut artifacts = Vec::new();
        for row in rows {
            let (id, step_run_id, job_id, kind, path, content, created_at) =
                row.context("Failed to read artifact row")?;
            artifacts.push(StepArtifact {
                id,
                step_run_id,
                job_id,
                kind,
                path,
                content,
                created_at: parse_ts(&created_at)?,
            });
        }
        Ok(artifacts)
    }
}
