//! Checklist validation: a per-item pass/fail over a step's output.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::gate::QaContext;
use crate::config::ChecklistItemDef;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecklistItemResult {
    pub id: String,
    pub description: String,
    pub required: bool,
    pub passed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChecklistResult {
    pub items: Vec<ChecklistItemResult>,
}

impl ChecklistResult {
    pub fn passed_count(&self) -> usize {
        self.items.iter().filter(|i| i.passed).count()
    }

    pub fn total(&self) -> usize {
        self.items.len()
    }

    /// Fraction of items that passed; an empty checklist scores 1.0.
    pub fn score(&self) -> f64 {
        if self.items.is_empty() {
            1.0
        } else {
            self.passed_count() as f64 / self.total() as f64
        }
    }

    pub fn failed_required(&self) -> impl Iterator<Item = &ChecklistItemResult> {
        self.items.iter().filter(|i| i.required && !i.passed)
    }
}

/// Injected checklist capability. A model-backed validator implements the
/// same trait as the regex one below.
pub trait ChecklistValidator: Send + Sync {
    fn validate(&self, ctx: &QaContext) -> ChecklistResult;
}

struct ChecklistItem {
    id: String,
    description: String,
    pattern: Regex,
    required: bool,
}

/// An item passes when its pattern matches the step summary or any artifact.
#[derive(Default)]
pub struct PatternChecklist {
    items: Vec<ChecklistItem>,
}

impl PatternChecklist {
    pub fn from_defs(defs: &[ChecklistItemDef]) -> Result<Self> {
        let mut items = Vec::with_capacity(defs.len());
        for def in defs {
            items.push(ChecklistItem {
                id: def.id.clone(),
                description: def.description.clone(),
                pattern: Regex::new(&def.pattern)
                    .with_context(|| format!("Invalid pattern in checklist item '{}'", def.id))?,
                required: def.required,
            });
        }
        Ok(Self { items })
    }
}

impl ChecklistValidator for PatternChecklist {
    fn validate(&self, ctx: &QaContext) -> ChecklistResult {
        let items = self
            .items
            .iter()
            .filter(|item| ctx.checklist.is_empty() || ctx.checklist.contains(&item.id))
            .map(|item| {
                let in_summary = ctx
                    .summary
                    .as_deref()
                    .is_some_and(|s| item.pattern.is_match(s));
                let passed = in_summary || ctx.texts().any(|(_, t)| item.pattern.is_match(t));
                ChecklistItemResult {
                    id: item.id.clone(),
                    description: item.description.clone(),
                    required: item.required,
                    passed,
                }
            })
            .collect();
        ChecklistResult { items }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qa::QaArtifact;
    use crate::store::StepType;

    fn defs() -> Vec<ChecklistItemDef> {
        vec![
            ChecklistItemDef {
                id: "summary".into(),
                description: "Step reports a summary".into(),
                pattern: r"(?i)summary:".into(),
                required: true,
            },
            ChecklistItemDef {
                id: "tests".into(),
                description: "Tests mentioned".into(),
                pattern: r"(?i)\btests?\b".into(),
                required: false,
            },
        ]
    }

    fn ctx(summary: Option<&str>, text: &str, checklist: Vec<String>) -> QaContext {
        QaContext {
            protocol_run_id: 1,
            step_run_id: 2,
            step_name: "s".into(),
            step_type: StepType::Work,
            prompt: String::new(),
            summary: summary.map(String::from),
            artifacts: vec![QaArtifact {
                kind: "output".into(),
                path: "stdout".into(),
                content: Some(text.into()),
            }],
            checklist,
        }
    }

    #[test]
    fn items_match_summary_or_artifacts() {
        let checklist = PatternChecklist::from_defs(&defs()).unwrap();
        let result = checklist.validate(&ctx(Some("Summary: done"), "added tests", vec![]));
        assert_eq!(result.passed_count(), 2);
        assert_eq!(result.score(), 1.0);
        assert_eq!(result.failed_required().count(), 0);
    }

    #[test]
    fn required_failure_is_reported() {
        let checklist = PatternChecklist::from_defs(&defs()).unwrap();
        let result = checklist.validate(&ctx(None, "added tests", vec![]));
        assert_eq!(result.score(), 0.5);
        let failed: Vec<_> = result.failed_required().map(|i| i.id.as_str()).collect();
        assert_eq!(failed, vec!["summary"]);
    }

    #[test]
    fn protocol_selection_filters_items() {
        let checklist = PatternChecklist::from_defs(&defs()).unwrap();
        let result = checklist.validate(&ctx(None, "nothing", vec!["tests".into()]));
        assert_eq!(result.total(), 1);
        assert_eq!(result.items[0].id, "tests");
    }

    #[test]
    fn empty_checklist_scores_one() {
        assert_eq!(ChecklistResult::default().score(), 1.0);
    }
}
