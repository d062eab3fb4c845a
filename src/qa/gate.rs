//! The gate capability and the regex-driven gates built on it.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::findings::{Finding, GateResult, Severity};
use crate::config::{PatternGateDef, PatternRuleDef};
use crate::store::{StepArtifact, StepType};

/// A gate as configured on a protocol run. `blocking: None` defers to the gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateSpec {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocking: Option<bool>,
}

impl GateSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            blocking: None,
        }
    }

    pub fn blocking(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            blocking: Some(true),
        }
    }
}

/// One artifact as a gate sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct QaArtifact {
    pub kind: String,
    pub path: String,
    pub content: Option<String>,
}

impl From<&StepArtifact> for QaArtifact {
    fn from(a: &StepArtifact) -> Self {
        Self {
            kind: a.kind.clone(),
            path: a.path.clone(),
            content: a.content.clone(),
        }
    }
}

/// Everything a QA run may look at for one step run.
#[derive(Debug, Clone)]
pub struct QaContext {
    pub protocol_run_id: i64,
    pub step_run_id: i64,
    pub step_name: String,
    pub step_type: StepType,
    pub prompt: String,
    pub summary: Option<String>,
    pub artifacts: Vec<QaArtifact>,
    /// Checklist item ids selected by the protocol; empty selects all.
    pub checklist: Vec<String>,
}

impl QaContext {
    /// Artifacts that carry text, as `(path, content)`.
    pub fn texts(&self) -> impl Iterator<Item = (&str, &str)> {
        self.artifacts
            .iter()
            .filter_map(|a| a.content.as_deref().map(|c| (a.path.as_str(), c)))
    }
}

/// A pluggable quality check. Pattern-based and model-backed gates alike
/// implement this one operation.
pub trait Gate: Send + Sync {
    fn id(&self) -> &str;

    /// Default blocking flag when the protocol's gate spec leaves it unset.
    fn blocking(&self) -> bool {
        false
    }

    fn evaluate(&self, ctx: &QaContext) -> GateResult;
}

struct PatternRule {
    regex: Regex,
    severity: Severity,
    code: String,
    message: String,
    required: bool,
}

/// Scans artifact text line by line against an ordered rule table.
///
/// A plain rule reports each matching line. A `required` rule reports once
/// when no artifact matches at all.
pub struct PatternGate {
    id: String,
    blocking: bool,
    rules: Vec<PatternRule>,
}

impl PatternGate {
    pub fn from_def(def: &PatternGateDef) -> Result<Self> {
        let mut rules = Vec::with_capacity(def.rules.len());
        for rule in &def.rules {
            rules.push(PatternRule {
                regex: Regex::new(&rule.pattern).with_context(|| {
                    format!("Invalid pattern '{}' in gate '{}'", rule.pattern, def.id)
                })?,
                severity: rule.severity,
                code: rule.code.clone(),
                message: rule.message.clone(),
                required: rule.required,
            });
        }
        Ok(Self {
            id: def.id.clone(),
            blocking: def.blocking,
            rules,
        })
    }
}

impl Gate for PatternGate {
    fn id(&self) -> &str {
        &self.id
    }

    fn blocking(&self) -> bool {
        self.blocking
    }

    fn evaluate(&self, ctx: &QaContext) -> GateResult {
        if ctx.texts().next().is_none() {
            return GateResult::skipped(&self.id, "no artifact text to scan");
        }
        let mut findings = Vec::new();
        for rule in &self.rules {
            if rule.required {
                if !ctx.texts().any(|(_, text)| rule.regex.is_match(text)) {
                    findings.push(Finding::new(rule.severity, &rule.code, &rule.message));
                }
                continue;
            }
            for (path, text) in ctx.texts() {
                for (idx, line) in text.lines().enumerate() {
                    if rule.regex.is_match(line) {
                        findings.push(
                            Finding::new(rule.severity, &rule.code, &rule.message)
                                .with_path(path)
                                .with_line(idx as u32 + 1),
                        );
                    }
                }
            }
        }
        GateResult::from_findings(&self.id, findings)
    }
}

fn rule(pattern: &str, severity: Severity, code: &str, message: &str) -> PatternRuleDef {
    PatternRuleDef {
        pattern: pattern.to_string(),
        severity,
        code: code.to_string(),
        message: message.to_string(),
        required: false,
    }
}

/// Built-in gate definitions, registered before configured ones.
pub fn builtin_gate_defs() -> Vec<PatternGateDef> {
    vec![
        PatternGateDef {
            id: "secrets".to_string(),
            blocking: true,
            rules: vec![
                rule(
                    r"AKIA[0-9A-Z]{16}",
                    Severity::Error,
                    "aws-access-key",
                    "AWS access key id committed",
                ),
                rule(
                    r"-----BEGIN (RSA |EC |OPENSSH |DSA )?PRIVATE KEY-----",
                    Severity::Error,
                    "private-key",
                    "Private key material committed",
                ),
                rule(
                    r#"(?i)\b(api[_-]?key|secret|password|passwd|token)\b\s*[:=]\s*["'][^"'\s]{8,}["']"#,
                    Severity::Error,
                    "hardcoded-secret",
                    "Hardcoded credential",
                ),
            ],
        },
        PatternGateDef {
            id: "library-first".to_string(),
            blocking: false,
            rules: vec![
                rule(
                    r"(?i)\b(hand[- ]?rolled|home[- ]?grown)\b",
                    Severity::Warning,
                    "reinvented-library",
                    "Hand-rolled implementation where an established library exists",
                ),
                rule(
                    r"(?i)\bcustom (json|yaml|toml|http|date|regex|csv) (parser|client|library)\b",
                    Severity::Warning,
                    "reinvented-library",
                    "Custom replacement for a standard library",
                ),
            ],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qa::GateStatus;

    fn ctx(texts: &[(&str, &str)]) -> QaContext {
        QaContext {
            protocol_run_id: 1,
            step_run_id: 1,
            step_name: "impl".into(),
            step_type: StepType::Work,
            prompt: String::new(),
            summary: None,
            artifacts: texts
                .iter()
                .map(|(path, content)| QaArtifact {
                    kind: "file".into(),
                    path: path.to_string(),
                    content: Some(content.to_string()),
                })
                .collect(),
            checklist: vec![],
        }
    }

    fn secrets() -> PatternGate {
        let defs = builtin_gate_defs();
        PatternGate::from_def(&defs[0]).unwrap()
    }

    #[test]
    fn secrets_gate_flags_credentials_with_location() {
        let gate = secrets();
        assert!(gate.blocking());
        let result = gate.evaluate(&ctx(&[(
            "src/config.rs",
            "fn main() {}\nlet password = \"hunter2hunter2\";\n",
        )]));
        assert_eq!(result.status, GateStatus::Failed);
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.findings[0].code, "hardcoded-secret");
        assert_eq!(result.findings[0].line, Some(2));
        assert_eq!(result.findings[0].path.as_deref(), Some("src/config.rs"));
    }

    #[test]
    fn clean_text_passes() {
        let result = secrets().evaluate(&ctx(&[("a.rs", "let password = read_env();")]));
        assert_eq!(result.status, GateStatus::Passed);
    }

    #[test]
    fn no_text_is_skipped() {
        let result = secrets().evaluate(&ctx(&[]));
        assert_eq!(result.status, GateStatus::Skipped);
    }

    #[test]
    fn library_first_warns() {
        let defs = builtin_gate_defs();
        let gate = PatternGate::from_def(&defs[1]).unwrap();
        assert!(!gate.blocking());
        let result = gate.evaluate(&ctx(&[("notes.md", "Wrote a custom JSON parser for speed")]));
        assert_eq!(result.status, GateStatus::Warning);
    }

    #[test]
    fn required_rule_reports_absence_once() {
        let def = PatternGateDef {
            id: "has-tests".into(),
            blocking: false,
            rules: vec![PatternRuleDef {
                pattern: r"#\[test\]".into(),
                severity: Severity::Error,
                code: "missing-tests".into(),
                message: "No tests added".into(),
                required: true,
            }],
        };
        let gate = PatternGate::from_def(&def).unwrap();
        let missing = gate.evaluate(&ctx(&[("a.rs", "fn a() {}"), ("b.rs", "fn b() {}")]));
        assert_eq!(missing.status, GateStatus::Failed);
        assert_eq!(missing.findings.len(), 1);
        let present = gate.evaluate(&ctx(&[("a.rs", "#[test]\nfn t() {}")]));
        assert_eq!(present.status, GateStatus::Passed);
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let def = PatternGateDef {
            id: "broken".into(),
            blocking: false,
            rules: vec![rule("(", Severity::Error, "x", "x")],
        };
        assert!(PatternGate::from_def(&def).is_err());
    }
}
