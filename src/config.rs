//! Configuration for the orchestration core, read from `.conveyor/conveyor.toml`.
//!
//! Layering is file → environment → CLI. Every field has a default, so an
//! empty or missing file yields a working configuration.
//!
//! # Configuration File Format
//!
//! ```toml
//! [storage]
//! db_path = ".conveyor/conveyor.db"
//!
//! [queue]
//! max_attempts = 3
//! backoff_base_secs = 2
//! backoff_cap_secs = 300
//! lease_secs = 600
//! job_timeout_secs = 1800
//!
//! [worker]
//! workers = 2
//! poll_interval_ms = 500
//!
//! [executor]
//! command = "claude -p"
//!
//! [qa]
//! passing_threshold = 0.7
//! default_gates = ["secrets"]
//!
//! [[qa.pattern_gates]]
//! id = "no-debug-prints"
//! blocking = false
//! rules = [{ pattern = "dbg!\\(", severity = "warning", code = "debug-print", message = "Leftover dbg!" }]
//!
//! [feedback]
//! max_clarification_loops = 3
//! max_replan_attempts = 2
//! rules = [{ pattern = "(?i)flaky", category = "retry" }]
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::feedback::FeedbackCategory;
use crate::qa::Severity;
use crate::queue::MAX_QUEUE_SECS;

pub const CONFIG_DIR: &str = ".conveyor";
pub const CONFIG_FILE: &str = "conveyor.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConveyorToml {
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub qa: QaSection,
    #[serde(default)]
    pub feedback: FeedbackSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("conveyor.db")
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Job queue retry and lease discipline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSection {
    /// Attempts per job; also the retry cap for a step run.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_secs() -> u64 {
    2
}

fn default_backoff_cap_secs() -> u64 {
    300
}

fn default_lease_secs() -> u64 {
    600
}

fn default_job_timeout_secs() -> u64 {
    1800
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_cap_secs: default_backoff_cap_secs(),
            lease_secs: default_lease_secs(),
            job_timeout_secs: default_job_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSection {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_workers() -> usize {
    2
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_sweep_interval_secs() -> u64 {
    30
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSection {
    /// Executor used by steps that do not name one.
    #[serde(default = "default_executor_id")]
    pub default: String,
    /// Shell command run by the `shell` executor; the prompt arrives on stdin.
    pub command: Option<String>,
}

fn default_executor_id() -> String {
    "shell".to_string()
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            default: default_executor_id(),
            command: None,
        }
    }
}

/// Verdict weights, threshold, gate and checklist definitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaSection {
    #[serde(default = "default_passing_threshold")]
    pub passing_threshold: f64,
    #[serde(default = "default_gate_weight")]
    pub gate_weight: f64,
    #[serde(default = "default_checklist_weight")]
    pub checklist_weight: f64,
    #[serde(default = "default_code_analysis_weight")]
    pub code_analysis_weight: f64,
    /// Gates applied to plans that do not declare their own gate set.
    #[serde(default = "default_gates")]
    pub default_gates: Vec<String>,
    #[serde(default)]
    pub pattern_gates: Vec<PatternGateDef>,
    #[serde(default)]
    pub checklist: Vec<ChecklistItemDef>,
}

fn default_passing_threshold() -> f64 {
    0.7
}

fn default_gate_weight() -> f64 {
    0.4
}

fn default_checklist_weight() -> f64 {
    0.35
}

fn default_code_analysis_weight() -> f64 {
    0.25
}

fn default_gates() -> Vec<String> {
    vec!["secrets".to_string(), "library-first".to_string()]
}

impl Default for QaSection {
    fn default() -> Self {
        Self {
            passing_threshold: default_passing_threshold(),
            gate_weight: default_gate_weight(),
            checklist_weight: default_checklist_weight(),
            code_analysis_weight: default_code_analysis_weight(),
            default_gates: default_gates(),
            pattern_gates: Vec::new(),
            checklist: Vec::new(),
        }
    }
}

/// A regex-driven gate declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternGateDef {
    pub id: String,
    #[serde(default)]
    pub blocking: bool,
    #[serde(default)]
    pub rules: Vec<PatternRuleDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternRuleDef {
    pub pattern: String,
    #[serde(default = "default_rule_severity")]
    pub severity: Severity,
    pub code: String,
    pub message: String,
    /// When true the rule fires if the pattern is absent rather than present.
    #[serde(default)]
    pub required: bool,
}

fn default_rule_severity() -> Severity {
    Severity::Warning
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecklistItemDef {
    pub id: String,
    pub description: String,
    pub pattern: String,
    #[serde(default = "default_item_required")]
    pub required: bool,
}

fn default_item_required() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackSection {
    /// Clarifications a single step run may raise before it is manually blocked.
    #[serde(default = "default_max_clarification_loops")]
    pub max_clarification_loops: u32,
    /// Re-plan/re-specify rounds a protocol run may take before it is manually blocked.
    #[serde(default = "default_max_replan_attempts")]
    pub max_replan_attempts: u32,
    #[serde(default = "default_auto_resume_after_replan")]
    pub auto_resume_after_replan: bool,
    /// Ordered classification rules; empty means the built-in table.
    #[serde(default)]
    pub rules: Vec<FeedbackRuleDef>,
}

fn default_max_clarification_loops() -> u32 {
    3
}

fn default_max_replan_attempts() -> u32 {
    2
}

fn default_auto_resume_after_replan() -> bool {
    true
}

impl Default for FeedbackSection {
    fn default() -> Self {
        Self {
            max_clarification_loops: default_max_clarification_loops(),
            max_replan_attempts: default_max_replan_attempts(),
            auto_resume_after_replan: default_auto_resume_after_replan(),
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRuleDef {
    pub pattern: String,
    pub category: FeedbackCategory,
}

impl ConveyorToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse conveyor.toml")
    }

    /// Load from `<dir>/conveyor.toml`, or defaults when the file is missing.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize conveyor.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `CONVEYOR_*` environment overrides on top of the file values.
    pub fn apply_env(&mut self) {
        if let Ok(db) = std::env::var("CONVEYOR_DB") {
            self.storage.db_path = PathBuf::from(db);
        }
        if let Ok(cmd) = std::env::var("CONVEYOR_EXECUTOR_CMD") {
            self.executor.command = Some(cmd);
        }
        if let Some(attempts) = std::env::var("CONVEYOR_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
        {
            self.queue.max_attempts = attempts;
        }
    }

    /// Shell command for the `shell` executor (file → env → default).
    pub fn executor_command(&self) -> String {
        self.executor
            .command
            .clone()
            .or_else(|| std::env::var("CONVEYOR_EXECUTOR_CMD").ok())
            .unwrap_or_else(|| "claude -p".to_string())
    }

    /// Validate the configuration and return every problem found.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.queue.max_attempts == 0 {
            problems.push("queue.max_attempts must be at least 1".to_string());
        }
        if self.queue.lease_secs == 0 {
            problems.push("queue.lease_secs must be at least 1".to_string());
        }
        for (key, secs) in [
            ("queue.lease_secs", self.queue.lease_secs),
            ("queue.job_timeout_secs", self.queue.job_timeout_secs),
            ("queue.backoff_cap_secs", self.queue.backoff_cap_secs),
        ] {
            if secs > MAX_QUEUE_SECS {
                problems.push(format!("{key} {secs} exceeds the limit of {MAX_QUEUE_SECS}"));
            }
        }

        let qa = &self.qa;
        if !(0.0..=1.0).contains(&qa.passing_threshold) {
            problems.push(format!(
                "qa.passing_threshold {} is outside [0, 1]",
                qa.passing_threshold
            ));
        }
        let weight_sum = qa.gate_weight + qa.checklist_weight + qa.code_analysis_weight;
        if (weight_sum - 1.0).abs() > 1e-6 {
            problems.push(format!("qa weights sum to {weight_sum}, expected 1.0"));
        }
        for gate in &qa.pattern_gates {
            for rule in &gate.rules {
                if let Err(e) = Regex::new(&rule.pattern) {
                    problems.push(format!(
                        "Invalid pattern '{}' in gate '{}': {}",
                        rule.pattern, gate.id, e
                    ));
                }
            }
        }
        for item in &qa.checklist {
            if let Err(e) = Regex::new(&item.pattern) {
                problems.push(format!(
                    "Invalid pattern '{}' in checklist item '{}': {}",
                    item.pattern, item.id, e
                ));
            }
        }
        for rule in &self.feedback.rules {
            if let Err(e) = Regex::new(&rule.pattern) {
                problems.push(format!("Invalid feedback pattern '{}': {}", rule.pattern, e));
            }
        }

        problems
    }

    /// Fail with every validation problem joined into one error.
    pub fn ensure_valid(&self) -> Result<()> {
        let problems = self.validate();
        if problems.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("Invalid configuration:\n  - {}", problems.join("\n  - "))
        }
    }
}

/// Resolved configuration for one project directory.
#[derive(Debug, Clone)]
pub struct ConveyorConfig {
    pub project_dir: PathBuf,
    pub config_dir: PathBuf,
    pub toml: ConveyorToml,
}

impl ConveyorConfig {
    /// Load `.conveyor/conveyor.toml` under `project_dir`, then `.env`, then env overrides.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let config_dir = project_dir.join(CONFIG_DIR);
        let mut toml = ConveyorToml::load_or_default(&config_dir)?;
        let _ = dotenvy::from_path(project_dir.join(".env"));
        toml.apply_env();
        toml.ensure_valid()?;

        Ok(Self {
            project_dir,
            config_dir,
            toml,
        })
    }

    /// Absolute path of the SQLite database.
    pub fn db_path(&self) -> PathBuf {
        if self.toml.storage.db_path.is_absolute() {
            self.toml.storage.db_path.clone()
        } else {
            self.project_dir.join(&self.toml.storage.db_path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_file_yields_defaults() {
        let cfg = ConveyorToml::parse("").unwrap();
        assert_eq!(cfg.queue.max_attempts, 3);
        assert_eq!(cfg.queue.backoff_cap_secs, 300);
        assert_eq!(cfg.qa.passing_threshold, 0.7);
        assert_eq!(cfg.qa.gate_weight, 0.4);
        assert_eq!(cfg.qa.checklist_weight, 0.35);
        assert_eq!(cfg.qa.code_analysis_weight, 0.25);
        assert_eq!(cfg.feedback.max_clarification_loops, 3);
        assert_eq!(cfg.feedback.max_replan_attempts, 2);
        assert!(cfg.feedback.auto_resume_after_replan);
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn test_parse_sections() {
        let cfg = ConveyorToml::parse(
            r#"
            [queue]
            max_attempts = 5
            backoff_base_secs = 1

            [[qa.pattern_gates]]
            id = "no-dbg"
            blocking = true
            rules = [{ pattern = "dbg!", severity = "error", code = "dbg", message = "dbg left in" }]

            [[qa.checklist]]
            id = "summary"
            description = "has a summary"
            pattern = "(?i)summary"

            [feedback]
            max_replan_attempts = 1
            rules = [{ pattern = "(?i)flaky", category = "retry" }]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.queue.max_attempts, 5);
        assert_eq!(cfg.queue.lease_secs, 600);
        assert_eq!(cfg.qa.pattern_gates[0].rules[0].severity, Severity::Error);
        assert!(cfg.qa.checklist[0].required);
        assert_eq!(cfg.feedback.rules[0].category, FeedbackCategory::Retry);
        assert_eq!(cfg.feedback.max_replan_attempts, 1);
    }

    #[test]
    fn test_validate_rejects_bad_weights_and_regex() {
        let mut cfg = ConveyorToml::default();
        cfg.qa.gate_weight = 0.9;
        cfg.queue.max_attempts = 0;
        cfg.feedback.rules.push(FeedbackRuleDef {
            pattern: "(".into(),
            category: FeedbackCategory::Clarify,
        });
        let problems = cfg.validate();
        assert_eq!(problems.len(), 3, "{problems:?}");
        assert!(cfg.ensure_valid().is_err());
    }

    #[test]
    fn test_validate_flags_oversized_lease() {
        let mut cfg = ConveyorToml::default();
        cfg.queue.lease_secs = u64::MAX;
        let problems = cfg.validate();
        assert_eq!(problems.len(), 1, "{problems:?}");
        assert!(problems[0].contains("queue.lease_secs"));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = TempDir::new().unwrap();
        let cfg = ConveyorToml::load_or_default(dir.path()).unwrap();
        assert_eq!(cfg.executor.default, "shell");
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut cfg = ConveyorToml::default();
        cfg.worker.workers = 7;
        cfg.save(&path).unwrap();
        let loaded = ConveyorToml::load(&path).unwrap();
        assert_eq!(loaded.worker.workers, 7);
    }

    #[test]
    fn test_relative_db_path_resolves_under_project() {
        let dir = TempDir::new().unwrap();
        let cfg = ConveyorConfig {
            project_dir: dir.path().to_path_buf(),
            config_dir: dir.path().join(CONFIG_DIR),
            toml: ConveyorToml::default(),
        };
        assert_eq!(cfg.db_path(), dir.path().join(".conveyor/conveyor.db"));
    }
}
