//! Gates, executors and the QA collaborators, keyed by id.
//!
//! One `Registry` is built at process start and shared by reference; nothing
//! here is global.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;

use crate::config::ConveyorToml;
use crate::dispatch::Executor;
use crate::executor::ShellExecutor;
use crate::qa::{
    ChecklistValidator, CodeAnalyzer, Finding, FindingsAnalyzer, Gate, GateResult, GateSpec,
    PatternChecklist, PatternGate, QaContext, ResolvedGate, Severity, builtin_gate_defs,
};

pub struct Registry {
    gates: BTreeMap<String, Arc<dyn Gate>>,
    executors: BTreeMap<String, Arc<dyn Executor>>,
    default_executor: String,
    checklist: Arc<dyn ChecklistValidator>,
    analyzer: Arc<dyn CodeAnalyzer>,
}

impl Registry {
    /// An empty registry whose default executor id is `default_executor`.
    pub fn new(default_executor: impl Into<String>) -> Self {
        Self {
            gates: BTreeMap::new(),
            executors: BTreeMap::new(),
            default_executor: default_executor.into(),
            checklist: Arc::new(PatternChecklist::default()),
            analyzer: Arc::new(FindingsAnalyzer),
        }
    }

    /// Built-in gates, configured pattern gates (overriding built-ins with
    /// the same id), the shell executor and the configured checklist.
    pub fn from_config(cfg: &ConveyorToml) -> Result<Self> {
        let mut registry = Self::new(cfg.executor.default.clone());
        for def in builtin_gate_defs().iter().chain(&cfg.qa.pattern_gates) {
            registry.register_gate(Arc::new(PatternGate::from_def(def)?));
        }
        registry.register_executor(Arc::new(ShellExecutor::new("shell", cfg.executor_command())));
        registry.checklist = Arc::new(PatternChecklist::from_defs(&cfg.qa.checklist)?);
        Ok(registry)
    }

    pub fn register_gate(&mut self, gate: Arc<dyn Gate>) -> &mut Self {
        self.gates.insert(gate.id().to_string(), gate);
        self
    }

    pub fn register_executor(&mut self, executor: Arc<dyn Executor>) -> &mut Self {
        self.executors.insert(executor.id().to_string(), executor);
        self
    }

    pub fn with_checklist(mut self, checklist: Arc<dyn ChecklistValidator>) -> Self {
        self.checklist = checklist;
        self
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn CodeAnalyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn gate(&self, id: &str) -> Option<Arc<dyn Gate>> {
        self.gates.get(id).cloned()
    }

    pub fn gate_ids(&self) -> impl Iterator<Item = &str> {
        self.gates.keys().map(String::as_str)
    }

    /// The named executor, or the default one when `id` is `None`.
    pub fn executor(&self, id: Option<&str>) -> Option<Arc<dyn Executor>> {
        self.executors
            .get(id.unwrap_or(&self.default_executor))
            .cloned()
    }

    pub fn default_executor(&self) -> &str {
        &self.default_executor
    }

    pub fn checklist(&self) -> Arc<dyn ChecklistValidator> {
        self.checklist.clone()
    }

    pub fn analyzer(&self) -> Arc<dyn CodeAnalyzer> {
        self.analyzer.clone()
    }

    /// Gate ids in `specs` that nothing is registered under.
    pub fn unknown_gates<'a>(&self, specs: &'a [GateSpec]) -> Vec<&'a str> {
        specs
            .iter()
            .filter(|s| !self.gates.contains_key(&s.id))
            .map(|s| s.id.as_str())
            .collect()
    }

    /// Resolve a protocol's gate set in order. A gate that went missing
    /// since the protocol was created resolves to one that always fails.
    pub fn resolve_gates(&self, specs: &[GateSpec]) -> Vec<ResolvedGate> {
        specs
            .iter()
            .map(|spec| {
                let gate = self
                    .gate(&spec.id)
                    .unwrap_or_else(|| Arc::new(MissingGate { id: spec.id.clone() }));
                ResolvedGate {
                    blocking: spec.blocking.unwrap_or_else(|| gate.blocking()),
                    gate,
                }
            })
            .collect()
    }
}

struct MissingGate {
    id: String,
}

impl Gate for MissingGate {
    fn id(&self) -> &str {
        &self.id
    }

    fn evaluate(&self, _ctx: &QaContext) -> GateResult {
        GateResult::from_findings(
            &self.id,
            vec![Finding::new(
                Severity::Error,
                "unknown-gate",
                format!("No gate registered under '{}'", self.id),
            )],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qa::GateStatus;
    use crate::store::StepType;

    fn ctx() -> QaContext {
        QaContext {
            protocol_run_id: 1,
            step_run_id: 1,
            step_name: "s".into(),
            step_type: StepType::Work,
            prompt: String::new(),
            summary: None,
            artifacts: vec![],
            checklist: vec![],
        }
    }

    #[test]
    fn from_config_registers_builtins_and_shell() -> Result<()> {
        let registry = Registry::from_config(&ConveyorToml::default())?;
        let ids: Vec<&str> = registry.gate_ids().collect();
        assert!(ids.contains(&"secrets"));
        assert!(ids.contains(&"library-first"));
        assert_eq!(registry.executor(None).unwrap().id(), "shell");
        assert!(registry.executor(Some("gpu")).is_none());
        Ok(())
    }

    #[test]
    fn protocol_spec_overrides_gate_blocking_default() -> Result<()> {
        let registry = Registry::from_config(&ConveyorToml::default())?;
        let resolved = registry.resolve_gates(&[
            GateSpec::new("secrets"),
            GateSpec {
                id: "library-first".into(),
                blocking: Some(true),
            },
        ]);
        assert!(resolved[0].blocking);
        assert!(resolved[1].blocking);
        Ok(())
    }

    #[test]
    fn missing_gate_resolves_to_failure() {
        let registry = Registry::new("shell");
        let specs = [GateSpec::new("nope")];
        assert_eq!(registry.unknown_gates(&specs), vec!["nope"]);
        let resolved = registry.resolve_gates(&specs);
        assert_eq!(resolved[0].gate.evaluate(&ctx()).status, GateStatus::Failed);
    }
}
