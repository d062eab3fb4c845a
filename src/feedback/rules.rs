//! Ordered classification rules: the first pattern that matches picks the category.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::FeedbackRuleDef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackCategory {
    Clarify,
    RePlan,
    ReSpecify,
    Retry,
}

impl FeedbackCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clarify => "clarify",
            Self::RePlan => "re_plan",
            Self::ReSpecify => "re_specify",
            Self::Retry => "retry",
        }
    }
}

impl std::fmt::Display for FeedbackCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub category: FeedbackCategory,
    /// Pattern that matched; `None` when nothing did and the default applied.
    pub matched: Option<String>,
}

pub struct FeedbackRules {
    rules: Vec<(Regex, FeedbackCategory)>,
}

impl FeedbackRules {
    pub fn from_defs(defs: &[FeedbackRuleDef]) -> Result<Self> {
        let mut rules = Vec::with_capacity(defs.len());
        for def in defs {
            let regex = Regex::new(&def.pattern)
                .with_context(|| format!("Invalid feedback pattern '{}'", def.pattern))?;
            rules.push((regex, def.category));
        }
        Ok(Self { rules })
    }

    /// Configured rules, or the built-in table when none are configured.
    pub fn from_config(defs: &[FeedbackRuleDef]) -> Result<Self> {
        if defs.is_empty() {
            Self::from_defs(&default_rule_defs())
        } else {
            Self::from_defs(defs)
        }
    }

    /// Unmatched text falls back to `clarify` so no failure is dropped.
    pub fn classify(&self, text: &str) -> Classification {
        for (regex, category) in &self.rules {
            if regex.is_match(text) {
                return Classification {
                    category: *category,
                    matched: Some(regex.as_str().to_string()),
                };
            }
        }
        Classification {
            category: FeedbackCategory::Clarify,
            matched: None,
        }
    }
}

pub fn default_rule_defs() -> Vec<FeedbackRuleDef> {
    let def = |pattern: &str, category| FeedbackRuleDef {
        pattern: pattern.to_string(),
        category,
    };
    vec![
        def(
            r"(?i)\b(ambiguous|unclear|clarif\w*|question|missing requirements?|constitutional gate failed|cannot proceed)\b",
            FeedbackCategory::Clarify,
        ),
        def(
            r"(?i)\b(re-?plan|plan is (invalid|wrong)|step order|dependency|dependencies|out of scope)\b",
            FeedbackCategory::RePlan,
        ),
        def(
            r"(?i)\b(spec(ification)? (conflict|gap|mismatch)|requirements? conflict|acceptance criteria)\b",
            FeedbackCategory::ReSpecify,
        ),
        def(
            r"(?i)\b(timed out|timeout|flaky|transient|connection (reset|refused)|rate limit(ed)?|lint|formatting|tests? failed|checklist failed|below threshold|exit code)\b",
            FeedbackCategory::Retry,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> FeedbackRules {
        FeedbackRules::from_config(&[]).unwrap()
    }

    #[test]
    fn default_table_classifies_each_category() {
        let r = rules();
        assert_eq!(r.classify("Requirement is ambiguous").category, FeedbackCategory::Clarify);
        assert_eq!(r.classify("wrong step order").category, FeedbackCategory::RePlan);
        assert_eq!(
            r.classify("acceptance criteria not met").category,
            FeedbackCategory::ReSpecify
        );
        assert_eq!(r.classify("Executor timed out after 5s").category, FeedbackCategory::Retry);
    }

    #[test]
    fn default_table_needs_whole_phrases() {
        let r = rules();
        let cases = [
            ("needs a replan", FeedbackCategory::RePlan),
            ("spec mismatch in section 2", FeedbackCategory::ReSpecify),
            ("3 tests failed", FeedbackCategory::Retry),
            ("formatting drift", FeedbackCategory::Retry),
            ("QA score 0.52 below threshold 0.70", FeedbackCategory::Retry),
        ];
        for (text, expected) in cases {
            assert_eq!(r.classify(text).category, expected, "{text}");
        }
        for bare in ["update the plan", "see spec", "add a test", "format"] {
            let c = r.classify(bare);
            assert_eq!(c.category, FeedbackCategory::Clarify, "{bare}");
            assert!(c.matched.is_none(), "{bare}");
        }
    }

    #[test]
    fn earlier_rule_wins() {
        // Matches both clarify and retry; clarify comes first.
        let c = rules().classify("constitutional gate failed\nlint errors");
        assert_eq!(c.category, FeedbackCategory::Clarify);
        assert!(c.matched.is_some());
    }

    #[test]
    fn unmatched_defaults_to_clarify() {
        let c = rules().classify("something odd happened");
        assert_eq!(c.category, FeedbackCategory::Clarify);
        assert!(c.matched.is_none());
    }

    #[test]
    fn configured_rules_replace_defaults() {
        let r = FeedbackRules::from_config(&[FeedbackRuleDef {
            pattern: "(?i)ambiguous".into(),
            category: FeedbackCategory::Retry,
        }])
        .unwrap();
        assert_eq!(r.classify("ambiguous").category, FeedbackCategory::Retry);
        assert_eq!(r.classify("step order").category, FeedbackCategory::Clarify);
    }

    #[test]
    fn category_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&FeedbackCategory::RePlan).unwrap(), "\"re_plan\"");
        assert_eq!(FeedbackCategory::ReSpecify.to_string(), "re_specify");
    }
}
