//! Feedback router: turns a failure into the next action for a step run.
//!
//! Classification runs the failure text through an ordered rule table
//! ([`rules`]). Loop limits then override the classification: a step that
//! has raised too many clarifications, a protocol that has re-planned too
//! often, or a step out of retries is forced to `manual_block`.

pub mod rules;

use anyhow::Result;
use serde_json::json;

pub use rules::{Classification, FeedbackCategory, FeedbackRules};

use crate::config::ConveyorToml;
use crate::events::{EventKind, OpContext, event};
use crate::qa::QaVerdict;
use crate::store::{
    ClarificationScope, ClarificationStatus, NewClarification, ProtocolRun, Recommendation,
    StepRun, StoreDb, Upsert,
};

/// What the state machine should do with a failed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedbackAction {
    /// Block until the referenced clarification is answered.
    Clarify { clarification_id: i64 },
    RePlan,
    ReSpecify,
    Retry,
    /// Fail the protocol run; only an operator can move it on.
    ManualBlock { reason: String },
}

impl FeedbackAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clarify { .. } => "clarify",
            Self::RePlan => "re_plan",
            Self::ReSpecify => "re_specify",
            Self::Retry => "retry",
            Self::ManualBlock { .. } => "manual_block",
        }
    }
}

/// Where a failure came from.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOrigin {
    Verdict,
    /// `exhausted` is set once the job spent every attempt on transient errors.
    Executor { exhausted: bool },
    StructuralBlock,
}

#[derive(Debug, Clone)]
pub struct Failure {
    pub origin: FailureOrigin,
    pub text: String,
}

impl Failure {
    pub fn from_verdict(verdict: &QaVerdict) -> Self {
        Self {
            origin: FailureOrigin::Verdict,
            text: verdict.feedback_text(),
        }
    }

    pub fn executor(error: impl Into<String>, exhausted: bool) -> Self {
        Self {
            origin: FailureOrigin::Executor { exhausted },
            text: error.into(),
        }
    }

    pub fn structural(reason: impl Into<String>) -> Self {
        Self {
            origin: FailureOrigin::StructuralBlock,
            text: reason.into(),
        }
    }

    fn origin_str(&self) -> &'static str {
        match self.origin {
            FailureOrigin::Verdict => "qa_verdict",
            FailureOrigin::Executor { .. } => "executor",
            FailureOrigin::StructuralBlock => "structural_block",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackLimits {
    pub max_clarification_loops: u32,
    pub max_replan_attempts: u32,
    pub max_retries: u32,
}

/// Idempotency key for the clarification raised by a step's failures.
pub fn clarification_key(step_run_id: i64) -> String {
    format!("qa_feedback_{step_run_id}")
}

pub struct FeedbackRouter {
    rules: FeedbackRules,
    limits: FeedbackLimits,
}

impl FeedbackRouter {
    pub fn new(rules: FeedbackRules, limits: FeedbackLimits) -> Self {
        Self { rules, limits }
    }

    pub fn from_config(cfg: &ConveyorToml) -> Result<Self> {
        Ok(Self::new(
            FeedbackRules::from_config(&cfg.feedback.rules)?,
            FeedbackLimits {
                max_clarification_loops: cfg.feedback.max_clarification_loops,
                max_replan_attempts: cfg.feedback.max_replan_attempts,
                max_retries: cfg.queue.max_attempts,
            },
        ))
    }

    pub fn limits(&self) -> &FeedbackLimits {
        &self.limits
    }

    pub fn classify(&self, failure: &Failure) -> Classification {
        self.rules.classify(&failure.text)
    }

    /// Route a failing verdict for a step.
    pub fn route(
        &self,
        db: &StoreDb,
        ctx: &OpContext,
        protocol: &ProtocolRun,
        step: &StepRun,
        verdict: &QaVerdict,
    ) -> Result<FeedbackAction> {
        self.route_failure(db, ctx, protocol, step, &Failure::from_verdict(verdict))
    }

    /// Classify, apply loop limits, raise or refresh the clarification, and
    /// record a `feedback_routed` event.
    pub fn route_failure(
        &self,
        db: &StoreDb,
        ctx: &OpContext,
        protocol: &ProtocolRun,
        step: &StepRun,
        failure: &Failure,
    ) -> Result<FeedbackAction> {
        let classification = self.classify(failure);
        let action = match classification.category {
            FeedbackCategory::Clarify => self.clarify(db, ctx, protocol, step, failure)?,
            FeedbackCategory::RePlan | FeedbackCategory::ReSpecify => {
                if protocol.replan_attempts >= self.limits.max_replan_attempts {
                    FeedbackAction::ManualBlock {
                        reason: format!(
                            "re-plan limit reached ({} of {})",
                            protocol.replan_attempts, self.limits.max_replan_attempts
                        ),
                    }
                } else if classification.category == FeedbackCategory::RePlan {
                    FeedbackAction::RePlan
                } else {
                    FeedbackAction::ReSpecify
                }
            }
            FeedbackCategory::Retry => {
                if let FailureOrigin::Executor { exhausted: true } = failure.origin {
                    FeedbackAction::ManualBlock {
                        reason: format!("executor retries exhausted: {}", failure.text),
                    }
                } else if step.retry_count >= self.limits.max_retries {
                    FeedbackAction::ManualBlock {
                        reason: format!(
                            "retry limit reached ({} of {})",
                            step.retry_count, self.limits.max_retries
                        ),
                    }
                } else {
                    FeedbackAction::Retry
                }
            }
        };

        tracing::info!(
            protocol_id = protocol.id,
            step_id = step.id,
            category = %classification.category,
            action = action.as_str(),
            "feedback routed"
        );
        event(EventKind::FeedbackRouted, protocol.id)
            .step(step.id)
            .message(format!(
                "{} classified as {}, action {}",
                failure.origin_str(),
                classification.category,
                action.as_str()
            ))
            .meta(json!({
                "origin": failure.origin_str(),
                "category": classification.category.as_str(),
                "action": action.as_str(),
                "matched_rule": classification.matched,
                "attempt": step.retry_count + 1,
                "clarification_loops": step.clarification_loops,
                "replan_attempts": protocol.replan_attempts,
            }))
            .record(db, ctx)?;
        Ok(action)
    }

    fn clarify(
        &self,
        db: &StoreDb,
        ctx: &OpContext,
        protocol: &ProtocolRun,
        step: &StepRun,
        failure: &Failure,
    ) -> Result<FeedbackAction> {
        let key = clarification_key(step.id);
        let scope_key = format!("step:{}", step.id);
        let already_open = db
            .list_clarifications(Some(protocol.id), true)?
            .into_iter()
            .any(|c| c.key == key && c.scope_key == scope_key);

        if !already_open && step.clarification_loops >= self.limits.max_clarification_loops {
            return Ok(FeedbackAction::ManualBlock {
                reason: format!(
                    "clarification limit reached ({} of {})",
                    step.clarification_loops, self.limits.max_clarification_loops
                ),
            });
        }

        let new = NewClarification {
            scope: ClarificationScope::Step,
            scope_key,
            key,
            protocol_run_id: Some(protocol.id),
            step_run_id: Some(step.id),
            question: format!(
                "Step '{}' cannot pass as is:\n{}\nHow should it proceed?",
                step.name, failure.text
            ),
            options: vec![
                "Provide the missing details and retry".to_string(),
                "Accept the current output".to_string(),
                "Re-plan the remaining steps".to_string(),
            ],
            recommended: Some(Recommendation {
                answer: "Provide the missing details and retry".to_string(),
                reason: "The failure names details the step could not infer".to_string(),
            }),
            blocking: true,
        };
        let (clarification, outcome) = db.upsert_clarification(&new, ctx.now)?;
        if outcome != Upsert::Refreshed {
            db.increment_clarification_loops(step.id)?;
            event(EventKind::ClarificationRaised, protocol.id)
                .step(step.id)
                .message(format!("clarification {} raised", clarification.id))
                .meta(json!({
                    "clarification_id": clarification.id,
                    "key": clarification.key,
                    "blocking": clarification.blocking,
                    "reopened": outcome == Upsert::Reopened,
                }))
                .record(db, ctx)?;
        }
        debug_assert_eq!(clarification.status, ClarificationStatus::Open);
        Ok(FeedbackAction::Clarify {
            clarification_id: clarification.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qa::{GateOutcome, GateResult, GateStatus, QaVerdict};
    use crate::store::{NewProtocolRun, SpecValidation, StepPlan, StepType};

    fn setup() -> Result<(StoreDb, OpContext, i64, i64)> {
        let db = StoreDb::new_in_memory()?;
        let ctx = OpContext::new();
        let project = db.create_project("p", None, "main", ctx.now)?;
        let protocol = db.insert_protocol_run(
            &NewProtocolRun {
                project_id: project.id,
                name: "run",
                base_branch: "main",
                description: "",
                policy_pack: None,
                spec_hash: None,
                spec_validation: SpecValidation::Valid,
                gates: &[],
                checklist: &[],
            },
            ctx.now,
        )?;
        let step = db.insert_step_run(
            protocol,
            0,
            &StepPlan {
                name: "impl".into(),
                step_type: StepType::Work,
                prompt: String::new(),
                executor: None,
                skip_qa: false,
            },
            ctx.now,
        )?;
        Ok((db, ctx, protocol, step))
    }

    fn router(max_loops: u32, max_replans: u32, max_retries: u32) -> FeedbackRouter {
        FeedbackRouter::new(
            FeedbackRules::from_config(&[]).unwrap(),
            FeedbackLimits {
                max_clarification_loops: max_loops,
                max_replan_attempts: max_replans,
                max_retries,
            },
        )
    }

    fn failing_verdict(reason: &str) -> QaVerdict {
        QaVerdict {
            passed: false,
            reason: reason.to_string(),
            score: 0.0,
            blocking_issues: vec![],
            gates: vec![GateOutcome {
                result: GateResult {
                    gate_id: "g".into(),
                    status: GateStatus::Failed,
                    findings: vec![],
                },
                blocking: true,
            }],
            checklist: None,
            code_analysis_score: None,
        }
    }

    #[test]
    fn clarify_is_idempotent_per_step() -> Result<()> {
        let (db, ctx, protocol_id, step_id) = setup()?;
        let r = router(3, 2, 3);
        let verdict = failing_verdict("constitutional gate failed");

        let protocol = db.get_protocol_run(protocol_id)?.unwrap();
        let step = db.get_step_run(step_id)?.unwrap();
        let first = r.route(&db, &ctx, &protocol, &step, &verdict)?;
        let step = db.get_step_run(step_id)?.unwrap();
        let second = r.route(&db, &ctx, &protocol, &step, &verdict)?;

        assert_eq!(first, second);
        let open = db.list_clarifications(Some(protocol_id), true)?;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].key, format!("qa_feedback_{step_id}"));
        assert!(open[0].blocking);
        assert_eq!(db.get_step_run(step_id)?.unwrap().clarification_loops, 1);
        Ok(())
    }

    #[test]
    fn clarification_limit_forces_manual_block() -> Result<()> {
        let (db, ctx, protocol_id, step_id) = setup()?;
        let r = router(1, 2, 3);
        let verdict = failing_verdict("unclear requirement");
        let protocol = db.get_protocol_run(protocol_id)?.unwrap();

        let step = db.get_step_run(step_id)?.unwrap();
        let FeedbackAction::Clarify { clarification_id } =
            r.route(&db, &ctx, &protocol, &step, &verdict)?
        else {
            panic!("expected clarify");
        };
        db.answer_clarification(clarification_id, "use REST", None, ctx.now)?;

        let step = db.get_step_run(step_id)?.unwrap();
        let action = r.route(&db, &ctx, &protocol, &step, &verdict)?;
        assert!(matches!(action, FeedbackAction::ManualBlock { .. }));
        Ok(())
    }

    #[test]
    fn replan_limit_forces_manual_block() -> Result<()> {
        let (db, ctx, protocol_id, step_id) = setup()?;
        let r = router(3, 1, 3);
        let verdict = failing_verdict("dependency missing from step order");
        let step = db.get_step_run(step_id)?.unwrap();

        let protocol = db.get_protocol_run(protocol_id)?.unwrap();
        assert_eq!(r.route(&db, &ctx, &protocol, &step, &verdict)?, FeedbackAction::RePlan);

        db.increment_replan_attempts(protocol_id)?;
        let protocol = db.get_protocol_run(protocol_id)?.unwrap();
        let action = r.route(&db, &ctx, &protocol, &step, &verdict)?;
        assert!(matches!(action, FeedbackAction::ManualBlock { .. }));
        Ok(())
    }

    #[test]
    fn retry_respects_step_retry_cap() -> Result<()> {
        let (db, ctx, protocol_id, step_id) = setup()?;
        let r = router(3, 2, 1);
        let protocol = db.get_protocol_run(protocol_id)?.unwrap();
        let failure = Failure::executor("connection reset by peer", false);

        let step = db.get_step_run(step_id)?.unwrap();
        assert_eq!(r.route_failure(&db, &ctx, &protocol, &step, &failure)?, FeedbackAction::Retry);

        db.increment_step_retry(step_id, ctx.now)?;
        let step = db.get_step_run(step_id)?.unwrap();
        let action = r.route_failure(&db, &ctx, &protocol, &step, &failure)?;
        assert!(matches!(action, FeedbackAction::ManualBlock { .. }));
        Ok(())
    }

    #[test]
    fn exhausted_transient_failure_is_not_retried() -> Result<()> {
        let (db, ctx, protocol_id, step_id) = setup()?;
        let r = router(3, 2, 3);
        let protocol = db.get_protocol_run(protocol_id)?.unwrap();
        let step = db.get_step_run(step_id)?.unwrap();
        let failure = Failure::executor("Executor timed out after 1s", true);

        assert_eq!(r.classify(&failure).category, FeedbackCategory::Retry);
        let action = r.route_failure(&db, &ctx, &protocol, &step, &failure)?;
        let FeedbackAction::ManualBlock { reason } = action else {
            panic!("expected manual block");
        };
        assert!(reason.contains("timed out"));
        Ok(())
    }

    #[test]
    fn routing_records_event() -> Result<()> {
        let (db, ctx, protocol_id, step_id) = setup()?;
        let r = router(3, 2, 3);
        let protocol = db.get_protocol_run(protocol_id)?.unwrap();
        let step = db.get_step_run(step_id)?.unwrap();
        r.route(&db, &ctx, &protocol, &step, &failing_verdict("lint errors"))?;

        let events = db.list_events(protocol_id, None)?;
        let routed = events.iter().find(|e| e.kind == "feedback_routed").unwrap();
        assert_eq!(routed.metadata["category"], "retry");
        assert_eq!(routed.metadata["action"], "retry");
        assert_eq!(routed.step_run_id, Some(step_id));
        Ok(())
    }
}
