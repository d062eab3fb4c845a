use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::qa::{GateSpec, QaVerdict};

/// Declares a snake_case string enum with `as_str`, `Display` and `FromStr`.
macro_rules! str_enum {
    ($(#[$meta:meta])* $name:ident, $label:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(format!("Invalid {}: {}", $label, s)),
                }
            }
        }
    };
}

str_enum!(
    /// Lifecycle of a protocol run.
    ProtocolStatus, "protocol status" {
        Pending => "pending",
        Planning => "planning",
        Planned => "planned",
        Running => "running",
        Paused => "paused",
        Blocked => "blocked",
        Failed => "failed",
        Cancelled => "cancelled",
        Completed => "completed",
    }
);

impl ProtocolStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled | Self::Completed)
    }
}

str_enum!(
    /// Lifecycle of a step run.
    StepStatus, "step status" {
        Pending => "pending",
        Running => "running",
        NeedsQa => "needs_qa",
        Completed => "completed",
        Failed => "failed",
        Blocked => "blocked",
        Cancelled => "cancelled",
    }
);

impl StepStatus {
    /// Done for the purpose of protocol completion.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Stuck until feedback, retry or an operator moves it.
    pub fn is_stalled(&self) -> bool {
        matches!(self, Self::Failed | Self::Blocked)
    }
}

str_enum!(StepType, "step type" {
    Setup => "setup",
    Work => "work",
    Qa => "qa",
});

str_enum!(JobAction, "job action" {
    Execute => "execute",
    RunQa => "run_qa",
});

str_enum!(JobStatus, "job status" {
    Queued => "queued",
    Leased => "leased",
    Completed => "completed",
    Dead => "dead",
    Cancelled => "cancelled",
});

impl JobStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Leased)
    }
}

str_enum!(ClarificationScope, "clarification scope" {
    Project => "project",
    Protocol => "protocol",
    Step => "step",
});

str_enum!(ClarificationStatus, "clarification status" {
    Open => "open",
    Answered => "answered",
    Skipped => "skipped",
});

str_enum!(SpecValidation, "spec validation status" {
    Valid => "valid",
    Invalid => "invalid",
    Pending => "pending",
});

/// Fixed-width RFC 3339 so stored timestamps compare lexicographically in SQL.
pub fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid timestamp: {raw}"))?
        .with_timezone(&Utc))
}

fn parse_ts_opt(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

fn parse_enum<T: FromStr<Err = String>>(raw: &str) -> Result<T> {
    raw.parse::<T>().map_err(|e| anyhow::anyhow!(e))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub git_url: Option<String>,
    pub base_branch: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolRun {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub status: ProtocolStatus,
    pub base_branch: String,
    pub description: String,
    pub policy_pack: Option<String>,
    pub spec_hash: Option<String>,
    pub spec_validation: Option<SpecValidation>,
    pub gates: Vec<GateSpec>,
    pub checklist: Vec<String>,
    pub blocked_reason: Option<String>,
    pub blocking_clarification_id: Option<i64>,
    pub replan_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub(crate) struct ProtocolRunRow {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub status: String,
    pub base_branch: String,
    pub description: String,
    pub policy_pack: Option<String>,
    pub spec_hash: Option<String>,
    pub spec_validation: Option<String>,
    pub gates: String,
    pub checklist: String,
    pub blocked_reason: Option<String>,
    pub blocking_clarification_id: Option<i64>,
    pub replan_attempts: u32,
    pub created_at: String,
    pub updated_at: String,
}

impl ProtocolRunRow {
    pub fn into_protocol_run(self) -> Result<ProtocolRun> {
        Ok(ProtocolRun {
            id: self.id,
            project_id: self.project_id,
            name: self.name,
            status: parse_enum(&self.status)?,
            base_branch: self.base_branch,
            description: self.description,
            policy_pack: self.policy_pack,
            spec_hash: self.spec_hash,
            spec_validation: self
                .spec_validation
                .as_deref()
                .map(parse_enum::<SpecValidation>)
                .transpose()?,
            gates: serde_json::from_str(&self.gates).context("Invalid gates JSON")?,
            checklist: serde_json::from_str(&self.checklist).context("Invalid checklist JSON")?,
            blocked_reason: self.blocked_reason,
            blocking_clarification_id: self.blocking_clarification_id,
            replan_attempts: self.replan_attempts,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRun {
    pub id: i64,
    pub protocol_run_id: i64,
    pub step_index: u32,
    pub name: String,
    pub step_type: StepType,
    pub status: StepStatus,
    pub prompt: String,
    pub retry_count: u32,
    pub clarification_loops: u32,
    pub last_result_summary: Option<String>,
    pub assigned_executor: Option<String>,
    pub skip_qa: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub(crate) struct StepRunRow {
    pub id: i64,
    pub protocol_run_id: i64,
    pub step_index: u32,
    pub name: String,
    pub step_type: String,
    pub status: String,
    pub prompt: String,
    pub retry_count: u32,
    pub clarification_loops: u32,
    pub last_result_summary: Option<String>,
    pub assigned_executor: Option<String>,
    pub skip_qa: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl StepRunRow {
    pub fn into_step_run(self) -> Result<StepRun> {
        Ok(StepRun {
            id: self.id,
            protocol_run_id: self.protocol_run_id,
            step_index: self.step_index,
            name: self.name,
            step_type: parse_enum(&self.step_type)?,
            status: parse_enum(&self.status)?,
            prompt: self.prompt,
            retry_count: self.retry_count,
            clarification_loops: self.clarification_loops,
            last_result_summary: self.last_result_summary,
            assigned_executor: self.assigned_executor,
            skip_qa: self.skip_qa,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub step_run_id: i64,
    pub protocol_run_id: i64,
    pub action: JobAction,
    pub status: JobStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    pub timeout_secs: u64,
    pub enqueued_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub request_id: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A lease is valid only for its owner and only until it expires.
    pub fn holds_lease(&self, worker_id: &str, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Leased
            && self.lease_owner.as_deref() == Some(worker_id)
            && self.lease_expires_at.is_some_and(|exp| exp > now)
    }
}

pub(crate) struct JobRow {
    pub id: i64,
    pub step_run_id: i64,
    pub protocol_run_id: i64,
    pub action: String,
    pub status: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub timeout_secs: i64,
    pub enqueued_at: String,
    pub available_at: String,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<String>,
    pub last_error: Option<String>,
    pub request_id: Option<String>,
    pub finished_at: Option<String>,
}

impl JobRow {
    pub fn into_job(self) -> Result<Job> {
        Ok(Job {
            id: self.id,
            step_run_id: self.step_run_id,
            protocol_run_id: self.protocol_run_id,
            action: parse_enum(&self.action)?,
            status: parse_enum(&self.status)?,
            attempt: self.attempt,
            max_attempts: self.max_attempts,
            timeout_secs: self.timeout_secs.max(0) as u64,
            enqueued_at: parse_ts(&self.enqueued_at)?,
            available_at: parse_ts(&self.available_at)?,
            lease_owner: self.lease_owner,
            lease_expires_at: parse_ts_opt(self.lease_expires_at)?,
            last_error: self.last_error,
            request_id: self.request_id,
            finished_at: parse_ts_opt(self.finished_at)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub protocol_run_id: i64,
    pub step_run_id: Option<i64>,
    pub job_id: Option<i64>,
    pub kind: String,
    pub message: String,
    pub metadata: serde_json::Value,
    pub request_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub answer: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clarification {
    pub id: i64,
    pub scope: ClarificationScope,
    /// `step:<id>`, `protocol:<id>` or `project:<id>`.
    pub scope_key: String,
    pub key: String,
    pub protocol_run_id: Option<i64>,
    pub step_run_id: Option<i64>,
    pub question: String,
    pub options: Vec<String>,
    pub recommended: Option<Recommendation>,
    pub blocking: bool,
    pub status: ClarificationStatus,
    pub answer: Option<String>,
    pub answered_by: Option<String>,
    pub answered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub(crate) struct ClarificationRow {
    pub id: i64,
    pub scope: String,
    pub scope_key: String,
    pub key: String,
    pub protocol_run_id: Option<i64>,
    pub step_run_id: Option<i64>,
    pub question: String,
    pub options: String,
    pub recommended: Option<String>,
    pub blocking: bool,
    pub status: String,
    pub answer: Option<String>,
    pub answered_by: Option<String>,
    pub answered_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl ClarificationRow {
    pub fn into_clarification(self) -> Result<Clarification> {
        Ok(Clarification {
            id: self.id,
            scope: parse_enum(&self.scope)?,
            scope_key: self.scope_key,
            key: self.key,
            protocol_run_id: self.protocol_run_id,
            step_run_id: self.step_run_id,
            question: self.question,
            options: serde_json::from_str(&self.options).context("Invalid options JSON")?,
            recommended: self
                .recommended
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("Invalid recommendation JSON")?,
            blocking: self.blocking,
            status: parse_enum(&self.status)?,
            answer: self.answer,
            answered_by: self.answered_by,
            answered_at: parse_ts_opt(self.answered_at)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

/// Fields for raising (or refreshing) a clarification.
#[derive(Debug, Clone)]
pub struct NewClarification {
    pub scope: ClarificationScope,
    pub scope_key: String,
    pub key: String,
    pub protocol_run_id: Option<i64>,
    pub step_run_id: Option<i64>,
    pub question: String,
    pub options: Vec<String>,
    pub recommended: Option<Recommendation>,
    pub blocking: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepArtifact {
    pub id: i64,
    pub step_run_id: i64,
    pub job_id: Option<i64>,
    pub kind: String,
    pub path: String,
    pub content: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredVerdict {
    pub id: i64,
    pub step_run_id: i64,
    pub protocol_run_id: i64,
    pub verdict: QaVerdict,
    pub created_at: DateTime<Utc>,
}

/// Input document for `create`: one protocol and its ordered steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolPlan {
    pub name: String,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub policy_pack: Option<String>,
    /// `None` means the configured default gates; an empty list skips QA.
    #[serde(default)]
    pub gates: Option<Vec<GateSpec>>,
    #[serde(default)]
    pub checklist: Vec<String>,
    pub steps: Vec<StepPlan>,
}

pub fn default_base_branch() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepPlan {
    pub name: String,
    #[serde(default = "default_step_type")]
    pub step_type: StepType,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub executor: Option<String>,
    #[serde(default)]
    pub skip_qa: bool,
}

fn default_step_type() -> StepType {
    StepType::Work
}

impl ProtocolPlan {
    /// Parse a plan document; `.json` files are JSON, everything else TOML.
    pub fn from_str_with_ext(content: &str, ext: Option<&str>) -> Result<Self> {
        match ext {
            Some("json") => serde_json::from_str(content).context("Failed to parse JSON plan"),
            _ => toml::from_str(content).context("Failed to parse TOML plan"),
        }
    }

    /// Problems that make the plan unstartable.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.steps.is_empty() {
            problems.push("plan has no steps".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.as_str()) {
                problems.push(format!("duplicate step name '{}'", step.name));
            }
        }
        problems
    }
}

impl StepRun {
    /// Definition this step was created from, for re-planning.
    pub fn to_plan(&self) -> StepPlan {
        StepPlan {
            name: self.name.clone(),
            step_type: self.step_type,
            prompt: self.prompt.clone(),
            executor: self.assigned_executor.clone(),
            skip_qa: self.skip_qa,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for s in ["pending", "planning", "planned", "running", "paused", "blocked", "failed", "cancelled", "completed"] {
            let status: ProtocolStatus = s.parse().unwrap();
            assert_eq!(status.as_str(), s);
        }
        assert_eq!(StepStatus::NeedsQa.to_string(), "needs_qa");
        assert_eq!("run_qa".parse::<JobAction>().unwrap(), JobAction::RunQa);
    }

    #[test]
    fn invalid_status_reports_label() {
        let err = "sleeping".parse::<JobStatus>().unwrap_err();
        assert_eq!(err, "Invalid job status: sleeping");
    }

    #[test]
    fn terminal_statuses() {
        assert!(ProtocolStatus::Cancelled.is_terminal());
        assert!(!ProtocolStatus::Blocked.is_terminal());
        assert!(StepStatus::Cancelled.is_settled());
        assert!(StepStatus::Blocked.is_stalled());
    }

    #[test]
    fn timestamps_are_fixed_width() {
        let a = parse_ts("2026-01-02T03:04:05Z").unwrap();
        let b = a + chrono::Duration::milliseconds(1500);
        assert_eq!(ts(a), "2026-01-02T03:04:05.000Z");
        assert!(ts(a) < ts(b));
        assert_eq!(parse_ts(&ts(b)).unwrap(), b);
    }

    #[test]
    fn lease_is_held_only_by_owner_before_expiry() {
        let now = parse_ts("2026-01-01T00:00:00Z").unwrap();
        let job = Job {
            id: 1,
            step_run_id: 1,
            protocol_run_id: 1,
            action: JobAction::Execute,
            status: JobStatus::Leased,
            attempt: 1,
            max_attempts: 3,
            timeout_secs: 10,
            enqueued_at: now,
            available_at: now,
            lease_owner: Some("w1".into()),
            lease_expires_at: Some(now + chrono::Duration::seconds(30)),
            last_error: None,
            request_id: None,
            finished_at: None,
        };
        assert!(job.holds_lease("w1", now));
        assert!(!job.holds_lease("w2", now));
        assert!(!job.holds_lease("w1", now + chrono::Duration::seconds(30)));
    }

    #[test]
    fn toml_plan_defaults() {
        let plan = ProtocolPlan::from_str_with_ext(
            r#"
            name = "auth"
            [[steps]]
            name = "setup"
            step_type = "setup"
            [[steps]]
            name = "implement"
            prompt = "Add login"
            "#,
            Some("toml"),
        )
        .unwrap();
        assert_eq!(plan.base_branch, "main");
        assert!(plan.gates.is_none());
        assert_eq!(plan.steps[1].step_type, StepType::Work);
        assert!(plan.problems().is_empty());
    }

    #[test]
    fn plan_problems_flag_duplicates_and_empty() {
        let mut plan = ProtocolPlan {
            name: "p".into(),
            project: None,
            base_branch: "main".into(),
            description: String::new(),
            policy_pack: None,
            gates: None,
            checklist: vec![],
            steps: vec![],
        };
        assert_eq!(plan.problems(), vec!["plan has no steps".to_string()]);
        let step = StepPlan {
            name: "a".into(),
            step_type: StepType::Work,
            prompt: String::new(),
            executor: None,
            skip_qa: false,
        };
        plan.steps = vec![step.clone(), step];
        assert_eq!(plan.problems(), vec!["duplicate step name 'a'".to_string()]);
    }
}
