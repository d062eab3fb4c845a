//! Protocol runs: creation, operator actions, clarifications and inspection.

use std::path::Path;

use anyhow::{Context, Result};
use console::style;
use serde_json::json;

use conveyor::api::{Action, ActionOutcome, OperatorApi};
use conveyor::events::OpContext;
use conveyor::store::{ProtocolPlan, ProtocolStatus, StepStatus};

use super::{Workspace, print_json};

pub async fn cmd_create(project_dir: &Path, plan_path: &Path, start: bool, json: bool) -> Result<()> {
    let content = std::fs::read_to_string(plan_path)
        .with_context(|| format!("Failed to read plan: {}", plan_path.display()))?;
    let plan = ProtocolPlan::from_str_with_ext(&content, plan_path.extension().and_then(|e| e.to_str()))?;

    let ws = Workspace::open(project_dir)?;
    let machine = ws.machine.clone();
    let run = ws
        .db
        .call_op(move |db| machine.create(db, &OpContext::new(), &plan))
        .await?;

    let started = if start {
        let api = OperatorApi::new(ws.db.clone(), ws.machine.clone());
        Some(api.perform(run.id, Action::Start, None).await)
    } else {
        None
    };

    if json {
        return print_json(&json!({ "protocol_run": run, "start": started }));
    }
    println!(
        "Created protocol run {} ({}) with status {}",
        style(run.id).bold(),
        run.name,
        run.status
    );
    if let Some(outcome) = &started {
        print_outcome(outcome);
        if !outcome.success {
            anyhow::bail!("start failed");
        }
    }
    Ok(())
}

pub fn cmd_list(project_dir: &Path, status: Option<&str>, json: bool) -> Result<()> {
    let status = status
        .map(|s| s.parse::<ProtocolStatus>())
        .transpose()
        .map_err(anyhow::Error::msg)?;
    let ws = Workspace::open(project_dir)?;
    let runs = ws.db.lock_sync()?.list_protocol_runs(status)?;
    if json {
        return print_json(&runs);
    }
    if runs.is_empty() {
        println!("No protocol runs.");
    }
    for run in runs {
        println!(
            "{:>4}  {:<28} {:<10} {}",
            run.id,
            run.name,
            status_style(run.status),
            run.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

pub async fn cmd_action(
    project_dir: &Path,
    protocol: i64,
    action: Action,
    step: Option<i64>,
    json: bool,
) -> Result<()> {
    let ws = Workspace::open(project_dir)?;
    let api = OperatorApi::new(ws.db.clone(), ws.machine.clone());
    let outcome = api.perform(protocol, action, step).await;
    if json {
        print_json(&outcome)?;
    } else {
        print_outcome(&outcome);
    }
    if !outcome.success {
        anyhow::bail!("{} failed", outcome.action);
    }
    Ok(())
}

pub async fn cmd_answer(
    project_dir: &Path,
    clarification: i64,
    answer: String,
    by: Option<String>,
    resume: bool,
    json: bool,
) -> Result<()> {
    let ws = Workspace::open(project_dir)?;
    let api = OperatorApi::new(ws.db.clone(), ws.machine.clone());
    let outcome = api.answer(clarification, answer, by, resume).await;
    if json {
        print_json(&outcome)?;
    } else {
        let mark = if outcome.success {
            style("✓").green()
        } else {
            style("✗").red()
        };
        println!("{} {}", mark, outcome.message);
        if let Some(status) = outcome.status {
            println!("  protocol status: {}", status_style(status));
        }
    }
    if !outcome.success {
        anyhow::bail!("answer failed");
    }
    Ok(())
}

pub fn cmd_status(project_dir: &Path, protocol: i64, json: bool) -> Result<()> {
    let ws = Workspace::open(project_dir)?;
    let db = ws.db.lock_sync()?;
    let run = db
        .get_protocol_run(protocol)?
        .with_context(|| format!("Protocol run {protocol} not found"))?;
    let steps = db.list_step_runs(protocol)?;
    let jobs = db.list_jobs(protocol)?;
    if json {
        return print_json(&json!({ "protocol_run": run, "steps": steps, "jobs": jobs }));
    }

    println!(
        "{} {} [{}]",
        style(format!("Protocol {}", run.id)).bold().cyan(),
        run.name,
        status_style(run.status)
    );
    if let Some(reason) = &run.blocked_reason {
        println!("  blocked: {}", style(reason).yellow());
    }
    if let Some(hash) = &run.spec_hash {
        println!("  spec: {}", style(&hash[..hash.len().min(12)]).dim());
    }
    println!();
    for step in &steps {
        let status = match step.status {
            StepStatus::Completed => style(step.status.as_str()).green(),
            StepStatus::Failed | StepStatus::Blocked => style(step.status.as_str()).red(),
            StepStatus::Running | StepStatus::NeedsQa => style(step.status.as_str()).yellow(),
            _ => style(step.status.as_str()).dim(),
        };
        println!(
            "  {:>2}. {:<24} {:<10} retries {}",
            step.step_index, step.name, status, step.retry_count
        );
        if let Some(summary) = &step.last_result_summary {
            println!("      {}", style(summary).dim());
        }
    }
    let open: Vec<_> = jobs.iter().filter(|j| j.status.is_active()).collect();
    if !open.is_empty() {
        println!();
        for job in open {
            println!(
                "  job {} {} {} (attempt {}/{})",
                job.id, job.action, job.status, job.attempt, job.max_attempts
            );
        }
    }
    Ok(())
}

pub fn cmd_events(project_dir: &Path, protocol: i64, limit: Option<usize>, json: bool) -> Result<()> {
    let ws = Workspace::open(project_dir)?;
    let events = ws.db.lock_sync()?.list_events(protocol, limit)?;
    if json {
        return print_json(&events);
    }
    for event in events {
        println!(
            "{}  {:<24} {}",
            style(event.created_at.format("%H:%M:%S%.3f")).dim(),
            event.kind,
            event.message
        );
    }
    Ok(())
}

pub fn cmd_clarifications(project_dir: &Path, protocol: Option<i64>, open: bool, json: bool) -> Result<()> {
    let ws = Workspace::open(project_dir)?;
    let clarifications = ws.db.lock_sync()?.list_clarifications(protocol, open)?;
    if json {
        return print_json(&clarifications);
    }
    if clarifications.is_empty() {
        println!("No clarifications.");
    }
    for c in clarifications {
        let marker = if c.blocking {
            style("blocking").red()
        } else {
            style("advisory").dim()
        };
        println!("{:>4}  [{}] {} {}", c.id, c.status, marker, c.key);
        println!("      Q: {}", c.question);
        if let Some(answer) = &c.answer {
            println!("      A: {}", answer);
        }
    }
    Ok(())
}

fn print_outcome(outcome: &ActionOutcome) {
    let mark = if outcome.success {
        style("✓").green()
    } else {
        style("✗").red()
    };
    let status = outcome
        .status
        .map(|s| status_style(s).to_string())
        .unwrap_or_else(|| "-".to_string());
    println!("{} {}: {} [{}]", mark, outcome.action, outcome.message, status);
}

fn status_style(status: ProtocolStatus) -> console::StyledObject<&'static str> {
    let text = status.as_str();
    match status {
        ProtocolStatus::Completed => style(text).green(),
        ProtocolStatus::Failed | ProtocolStatus::Cancelled => style(text).red(),
        ProtocolStatus::Blocked | ProtocolStatus::Paused => style(text).yellow(),
        _ => style(text).cyan(),
    }
}
