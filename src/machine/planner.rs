use anyhow::Result;

use crate::feedback::FeedbackCategory;
use crate::store::{ProtocolRun, StepPlan, StepRun};

/// Input to a re-plan: the run, all of its steps, and the failure that
/// triggered it.
pub struct PlanRequest<'a> {
    pub protocol: &'a ProtocolRun,
    pub steps: &'a [StepRun],
    /// Steps at or after this index are replaced.
    pub from_index: u32,
    pub category: FeedbackCategory,
    pub feedback: &'a str,
}

impl PlanRequest<'_> {
    pub fn remaining(&self) -> impl Iterator<Item = &StepRun> {
        self.steps.iter().filter(move |s| s.step_index >= self.from_index)
    }
}

/// Produces replacement step definitions for `re_plan` and `re_specify`.
pub trait Planner: Send + Sync {
    fn plan(&self, request: &PlanRequest<'_>) -> Result<Vec<StepPlan>>;
}

/// Keeps the remaining steps and hands the failure to the step being redone.
pub struct StaticPlanner;

impl Planner for StaticPlanner {
    fn plan(&self, request: &PlanRequest<'_>) -> Result<Vec<StepPlan>> {
        let heading = match request.category {
            FeedbackCategory::ReSpecify => "Specification feedback",
            _ => "Plan feedback",
        };
        Ok(request
            .remaining()
            .map(|step| {
                let mut plan = step.to_plan();
                if step.step_index == request.from_index && !request.feedback.trim().is_empty() {
                    plan.prompt = format!(
                        "{}\n\n## {heading}\n{}",
                        plan.prompt.trim_end(),
                        request.feedback.trim()
                    );
                }
                plan
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ProtocolStatus, StepStatus, StepType};
    use chrono::Utc;

    fn protocol() -> ProtocolRun {
        ProtocolRun {
            id: 1,
            project_id: 1,
            name: "run".into(),
            status: ProtocolStatus::Planning,
            base_branch: "main".into(),
            description: String::new(),
            policy_pack: None,
            spec_hash: None,
            spec_validation: None,
            gates: vec![],
            checklist: vec![],
            blocked_reason: None,
            blocking_clarification_id: None,
            replan_attempts: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn step(index: u32, name: &str) -> StepRun {
        StepRun {
            id: index as i64 + 1,
            protocol_run_id: 1,
            step_index: index,
            name: name.into(),
            step_type: StepType::Work,
            status: StepStatus::Pending,
            prompt: format!("do {name}"),
            retry_count: 0,
            clarification_loops: 0,
            last_result_summary: None,
            assigned_executor: None,
            skip_qa: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn static_planner_keeps_remaining_steps_and_annotates_first() -> Result<()> {
        let protocol = protocol();
        let steps = vec![step(0, "setup"), step(1, "build"), step(2, "docs")];
        let plans = StaticPlanner.plan(&PlanRequest {
            protocol: &protocol,
            steps: &steps,
            from_index: 1,
            category: FeedbackCategory::RePlan,
            feedback: "wrong step order",
        })?;
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].name, "build");
        assert!(plans[0].prompt.ends_with("## Plan feedback\nwrong step order"));
        assert_eq!(plans[1].prompt, "do docs");
        Ok(())
    }

    #[test]
    fn respecify_uses_its_own_heading() -> Result<()> {
        let protocol = protocol();
        let steps = vec![step(0, "build")];
        let plans = StaticPlanner.plan(&PlanRequest {
            protocol: &protocol,
            steps: &steps,
            from_index: 0,
            category: FeedbackCategory::ReSpecify,
            feedback: "acceptance criteria unclear",
        })?;
        assert!(plans[0].prompt.contains("## Specification feedback"));
        Ok(())
    }
}
