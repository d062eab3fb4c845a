//! Verdict computation.
//!
//! [`compute_verdict`] is a pure function of its inputs: identical gate
//! results, checklist result and code-analysis score always yield an
//! identical [`QaVerdict`]. [`QaEngine`] gathers those inputs by running the
//! configured gates, the checklist validator and the code analyzer.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::checklist::{ChecklistResult, ChecklistValidator};
use super::findings::{GateResult, GateStatus, Severity};
use super::gate::{Gate, QaContext};
use crate::config::QaSection;

pub const CONSTITUTIONAL_GATE_FAILED: &str = "constitutional gate failed";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QaWeights {
    pub gate: f64,
    pub checklist: f64,
    pub code_analysis: f64,
    pub passing_threshold: f64,
}

impl Default for QaWeights {
    fn default() -> Self {
        Self {
            gate: 0.4,
            checklist: 0.35,
            code_analysis: 0.25,
            passing_threshold: 0.7,
        }
    }
}

impl From<&QaSection> for QaWeights {
    fn from(qa: &QaSection) -> Self {
        Self {
            gate: qa.gate_weight,
            checklist: qa.checklist_weight,
            code_analysis: qa.code_analysis_weight,
            passing_threshold: qa.passing_threshold,
        }
    }
}

/// One gate's result together with its effective blocking flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateOutcome {
    #[serde(flatten)]
    pub result: GateResult,
    pub blocking: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaVerdict {
    pub passed: bool,
    pub reason: String,
    pub score: f64,
    pub blocking_issues: Vec<String>,
    pub gates: Vec<GateOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checklist: Option<ChecklistResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_analysis_score: Option<f64>,
}

impl QaVerdict {
    /// Reason, blocking issues and every actionable finding, one per line.
    /// This is the text the feedback router classifies.
    pub fn feedback_text(&self) -> String {
        let mut lines = vec![self.reason.clone()];
        lines.extend(self.blocking_issues.iter().cloned());
        for gate in &self.gates {
            for finding in &gate.result.findings {
                if finding.severity != Severity::Info {
                    lines.push(format!("[{}] {}", gate.result.gate_id, finding.describe()));
                }
            }
        }
        lines.join("\n")
    }
}

/// Mean of non-skipped gate scores (passed 1, warning 0.5, failed 0);
/// 1.0 when every gate was skipped or none ran.
pub fn gate_score(gates: &[GateOutcome]) -> f64 {
    let scores: Vec<f64> = gates.iter().filter_map(|g| g.result.status.score()).collect();
    if scores.is_empty() {
        1.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    }
}

/// The short-circuit verdict if any blocking gate failed.
pub fn blocking_failure(gates: &[GateOutcome]) -> Option<QaVerdict> {
    let failed: Vec<&GateOutcome> = gates
        .iter()
        .filter(|g| g.blocking && g.result.status == GateStatus::Failed)
        .collect();
    if failed.is_empty() {
        return None;
    }
    let mut issues = Vec::new();
    for gate in failed {
        let errors: Vec<_> = gate
            .result
            .findings
            .iter()
            .filter(|f| f.severity == Severity::Error)
            .collect();
        if errors.is_empty() {
            issues.push(format!("{}: failed", gate.result.gate_id));
        }
        for finding in errors {
            issues.push(format!("{}: {}", gate.result.gate_id, finding.describe()));
        }
    }
    Some(QaVerdict {
        passed: false,
        reason: CONSTITUTIONAL_GATE_FAILED.to_string(),
        score: 0.0,
        blocking_issues: issues,
        gates: gates.to_vec(),
        checklist: None,
        code_analysis_score: None,
    })
}

pub fn compute_verdict(
    gates: &[GateOutcome],
    checklist: &ChecklistResult,
    code_analysis_score: f64,
    weights: &QaWeights,
) -> QaVerdict {
    if let Some(verdict) = blocking_failure(gates) {
        return verdict;
    }

    let failed_required: Vec<String> = checklist
        .failed_required()
        .map(|item| format!("checklist: {}", item.description))
        .collect();
    if !failed_required.is_empty() {
        return QaVerdict {
            passed: false,
            reason: format!(
                "checklist failed: {} of {} items passed",
                checklist.passed_count(),
                checklist.total()
            ),
            score: checklist.score(),
            blocking_issues: failed_required,
            gates: gates.to_vec(),
            checklist: Some(checklist.clone()),
            code_analysis_score: Some(code_analysis_score),
        };
    }

    let code = code_analysis_score.clamp(0.0, 1.0);
    let score = (weights.gate * gate_score(gates)
        + weights.checklist * checklist.score()
        + weights.code_analysis * code)
        .clamp(0.0, 1.0);
    let passed = score >= weights.passing_threshold;
    let (reason, blocking_issues) = if passed {
        (
            format!(
                "score {score:.2} meets threshold {:.2}",
                weights.passing_threshold
            ),
            Vec::new(),
        )
    } else {
        let issues = gates
            .iter()
            .filter(|g| matches!(g.result.status, GateStatus::Failed | GateStatus::Warning))
            .flat_map(|g| {
                g.result
                    .findings
                    .iter()
                    .filter(|f| f.severity != Severity::Info)
                    .map(move |f| format!("{}: {}", g.result.gate_id, f.describe()))
            })
            .collect();
        (
            format!(
                "score {score:.2} below threshold {:.2}",
                weights.passing_threshold
            ),
            issues,
        )
    };

    QaVerdict {
        passed,
        reason,
        score,
        blocking_issues,
        gates: gates.to_vec(),
        checklist: Some(checklist.clone()),
        code_analysis_score: Some(code),
    }
}

/// Static-analysis signal in [0, 1].
pub trait CodeAnalyzer: Send + Sync {
    fn analyze(&self, ctx: &QaContext, gates: &[GateOutcome]) -> f64;
}

/// Scores from the gates' own findings: each error costs 0.2, each
/// warning 0.05, floored at zero.
pub struct FindingsAnalyzer;

impl CodeAnalyzer for FindingsAnalyzer {
    fn analyze(&self, _ctx: &QaContext, gates: &[GateOutcome]) -> f64 {
        let penalty: f64 = gates
            .iter()
            .flat_map(|g| g.result.findings.iter())
            .map(|f| match f.severity {
                Severity::Error => 0.2,
                Severity::Warning => 0.05,
                Severity::Info => 0.0,
            })
            .sum();
        (1.0 - penalty).max(0.0)
    }
}

/// A gate resolved from the registry, with the protocol's blocking choice applied.
#[derive(Clone)]
pub struct ResolvedGate {
    pub gate: Arc<dyn Gate>,
    pub blocking: bool,
}

pub struct QaEngine {
    weights: QaWeights,
    checklist: Arc<dyn ChecklistValidator>,
    analyzer: Arc<dyn CodeAnalyzer>,
}

impl QaEngine {
    pub fn new(
        weights: QaWeights,
        checklist: Arc<dyn ChecklistValidator>,
        analyzer: Arc<dyn CodeAnalyzer>,
    ) -> Self {
        Self {
            weights,
            checklist,
            analyzer,
        }
    }

    pub fn weights(&self) -> &QaWeights {
        &self.weights
    }

    /// Run every gate, short-circuit on a blocking failure, otherwise fold
    /// in the checklist and code analysis.
    pub fn evaluate(&self, ctx: &QaContext, gates: &[ResolvedGate]) -> QaVerdict {
        let outcomes: Vec<GateOutcome> = gates
            .iter()
            .map(|g| GateOutcome {
                result: g.gate.evaluate(ctx),
                blocking: g.blocking,
            })
            .collect();
        if let Some(verdict) = blocking_failure(&outcomes) {
            return verdict;
        }
        let checklist = self.checklist.validate(ctx);
        let code = self.analyzer.analyze(ctx, &outcomes);
        compute_verdict(&outcomes, &checklist, code, &self.weights)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qa::{ChecklistItemResult, Finding, QaArtifact};
    use crate::store::StepType;

    fn outcome(id: &str, status: GateStatus, blocking: bool) -> GateOutcome {
        let findings = match status {
            GateStatus::Failed => vec![Finding::new(Severity::Error, "bad", format!("{id} broke"))],
            GateStatus::Warning => vec![Finding::new(Severity::Warning, "meh", format!("{id} iffy"))],
            _ => vec![],
        };
        GateOutcome {
            result: GateResult {
                gate_id: id.to_string(),
                status,
                findings,
            },
            blocking,
        }
    }

    fn checklist(results: &[(bool, bool)]) -> ChecklistResult {
        ChecklistResult {
            items: results
                .iter()
                .enumerate()
                .map(|(i, (required, passed))| ChecklistItemResult {
                    id: format!("item-{i}"),
                    description: format!("item {i}"),
                    required: *required,
                    passed: *passed,
                })
                .collect(),
        }
    }

    #[test]
    fn blocking_gate_failure_short_circuits() {
        let gates = vec![
            outcome("style", GateStatus::Passed, false),
            outcome("secrets", GateStatus::Failed, true),
        ];
        let verdict = compute_verdict(&gates, &checklist(&[(true, true)]), 1.0, &QaWeights::default());
        assert!(!verdict.passed);
        assert_eq!(verdict.score, 0.0);
        assert_eq!(verdict.reason, CONSTITUTIONAL_GATE_FAILED);
        assert_eq!(verdict.blocking_issues, vec!["secrets: secrets broke".to_string()]);
        assert!(verdict.checklist.is_none());
    }

    #[test]
    fn non_blocking_failure_only_lowers_score() {
        let gates = vec![
            outcome("a", GateStatus::Passed, false),
            outcome("b", GateStatus::Failed, false),
        ];
        let verdict = compute_verdict(&gates, &checklist(&[]), 1.0, &QaWeights::default());
        // 0.4 * 0.5 + 0.35 * 1.0 + 0.25 * 1.0
        assert!((verdict.score - 0.8).abs() < 1e-9);
        assert!(verdict.passed);
    }

    #[test]
    fn required_checklist_failure_scores_ratio() {
        let gates = vec![outcome("a", GateStatus::Passed, true)];
        let verdict = compute_verdict(
            &gates,
            &checklist(&[(true, false), (false, true), (false, true), (true, true)]),
            1.0,
            &QaWeights::default(),
        );
        assert!(!verdict.passed);
        assert_eq!(verdict.score, 0.75);
        assert!(verdict.reason.starts_with("checklist failed"));
        assert_eq!(verdict.blocking_issues, vec!["checklist: item 0".to_string()]);
    }

    #[test]
    fn weighted_score_below_threshold_fails() {
        let gates = vec![
            outcome("a", GateStatus::Warning, false),
            outcome("b", GateStatus::Failed, false),
        ];
        let verdict = compute_verdict(&gates, &checklist(&[(false, false)]), 0.5, &QaWeights::default());
        // 0.4 * 0.25 + 0.35 * 0.0 + 0.25 * 0.5
        assert!((verdict.score - 0.225).abs() < 1e-9);
        assert!(!verdict.passed);
        assert_eq!(verdict.blocking_issues.len(), 2);
    }

    #[test]
    fn threshold_is_inclusive() {
        let weights = QaWeights {
            gate: 1.0,
            checklist: 0.0,
            code_analysis: 0.0,
            passing_threshold: 0.5,
        };
        let gates = vec![outcome("a", GateStatus::Warning, false)];
        let verdict = compute_verdict(&gates, &checklist(&[]), 1.0, &weights);
        assert_eq!(verdict.score, 0.5);
        assert!(verdict.passed);
    }

    #[test]
    fn skipped_gates_do_not_count() {
        let gates = vec![
            outcome("a", GateStatus::Skipped, false),
            outcome("b", GateStatus::Warning, false),
        ];
        assert_eq!(gate_score(&gates), 0.5);
        assert_eq!(gate_score(&[outcome("a", GateStatus::Skipped, true)]), 1.0);
    }

    #[test]
    fn identical_inputs_give_identical_verdicts() {
        let gates = vec![
            outcome("a", GateStatus::Warning, false),
            outcome("b", GateStatus::Passed, true),
        ];
        let list = checklist(&[(false, true), (false, false), (true, true)]);
        let first = compute_verdict(&gates, &list, 0.9, &QaWeights::default());
        for _ in 0..10 {
            let again = compute_verdict(&gates, &list, 0.9, &QaWeights::default());
            assert_eq!(again, first);
            assert_eq!(again.score.to_bits(), first.score.to_bits());
        }
    }

    struct Fixed(GateResult, bool);

    impl Gate for Fixed {
        fn id(&self) -> &str {
            &self.0.gate_id
        }
        fn blocking(&self) -> bool {
            self.1
        }
        fn evaluate(&self, _ctx: &QaContext) -> GateResult {
            self.0.clone()
        }
    }

    struct PanickingChecklist;

    impl ChecklistValidator for PanickingChecklist {
        fn validate(&self, _ctx: &QaContext) -> ChecklistResult {
            panic!("checklist must not run after a blocking failure");
        }
    }

    fn ctx() -> QaContext {
        QaContext {
            protocol_run_id: 1,
            step_run_id: 1,
            step_name: "s".into(),
            step_type: StepType::Work,
            prompt: String::new(),
            summary: None,
            artifacts: vec![QaArtifact {
                kind: "output".into(),
                path: "stdout".into(),
                content: Some("ok".into()),
            }],
            checklist: vec![],
        }
    }

    #[test]
    fn engine_skips_checklist_after_blocking_failure() {
        let engine = QaEngine::new(
            QaWeights::default(),
            Arc::new(PanickingChecklist),
            Arc::new(FindingsAnalyzer),
        );
        let gate = ResolvedGate {
            gate: Arc::new(Fixed(outcome("secrets", GateStatus::Failed, true).result, true)),
            blocking: true,
        };
        let verdict = engine.evaluate(&ctx(), &[gate]);
        assert_eq!(verdict.reason, CONSTITUTIONAL_GATE_FAILED);
    }

    #[test]
    fn findings_analyzer_penalises_errors_and_warnings() {
        let gates = vec![
            outcome("a", GateStatus::Failed, false),
            outcome("b", GateStatus::Warning, false),
        ];
        let score = FindingsAnalyzer.analyze(&ctx(), &gates);
        assert!((score - 0.75).abs() < 1e-9);
    }

    #[test]
    fn feedback_text_lists_findings() {
        let gates = vec![outcome("secrets", GateStatus::Failed, true)];
        let verdict = blocking_failure(&gates).unwrap();
        let text = verdict.feedback_text();
        assert!(text.starts_with(CONSTITUTIONAL_GATE_FAILED));
        assert!(text.contains("[secrets] secrets broke"));
    }
}
