//! Queue processing: `worker`, `sweep`, `recover` and `queue`.

use std::path::Path;

use anyhow::Result;
use console::style;
use tokio_util::sync::CancellationToken;

use conveyor::dispatch::{DispatchSettings, JobReport, WorkerDispatch};
use conveyor::events::OpContext;
use conveyor::machine::Recovery;

use super::{Workspace, print_json};

fn dispatcher(ws: &Workspace) -> WorkerDispatch {
    WorkerDispatch::new(
        ws.db.clone(),
        ws.machine.clone(),
        DispatchSettings::from_config(&ws.config),
    )
}

fn print_report(report: &JobReport) {
    println!(
        "  job {:>4} {:<8} step {:>4} protocol {:>4} -> {:?}",
        report.job_id, report.action, report.step_run_id, report.protocol_run_id, report.outcome
    );
}

pub async fn cmd_worker(project_dir: &Path, workers: Option<usize>, once: bool) -> Result<()> {
    let ws = Workspace::open(project_dir)?;
    let dispatch = dispatcher(&ws);

    if once {
        let swept = dispatch.sweep().await?;
        let worker_id = format!("cli-{}", std::process::id());
        let reports = dispatch.drain(&worker_id).await?;
        for report in swept.iter().chain(&reports) {
            print_report(report);
        }
        println!("Processed {} job(s).", reports.len());
        return Ok(());
    }

    let workers = workers.unwrap_or(ws.config.toml.worker.workers).max(1);
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, finishing in-flight jobs");
            signal.cancel();
        }
    });

    println!(
        "{} {} worker(s); Ctrl-C to stop",
        style("Starting").bold().cyan(),
        workers
    );
    let processed = dispatch.run_pool(workers, shutdown).await;
    println!("Processed {} job(s).", processed);
    Ok(())
}

pub async fn cmd_sweep(project_dir: &Path) -> Result<()> {
    let ws = Workspace::open(project_dir)?;
    let reports = dispatcher(&ws).sweep().await?;
    if reports.is_empty() {
        println!("No expired leases.");
    }
    for report in &reports {
        print_report(report);
    }
    Ok(())
}

pub fn cmd_recover(project_dir: &Path, limit: usize) -> Result<()> {
    let ws = Workspace::open(project_dir)?;
    let db = ws.db.lock_sync()?;
    let recovered = ws.machine.recover_stuck(&db, &OpContext::new(), limit)?;
    if recovered.is_empty() {
        println!("Nothing to recover.");
    }
    for (protocol_id, recovery) in recovered {
        let detail = match recovery {
            Recovery::Completed => "completed".to_string(),
            Recovery::Blocked { step_run_id } => format!("blocked on step {step_run_id}"),
            Recovery::Requeued { job_id } => format!("requeued as job {job_id}"),
        };
        println!("  protocol {:>4}: {}", protocol_id, detail);
    }
    Ok(())
}

pub fn cmd_queue(project_dir: &Path, json: bool) -> Result<()> {
    let ws = Workspace::open(project_dir)?;
    let stats = ws.machine.queue().stats(&*ws.db.lock_sync()?)?;
    if json {
        let map: serde_json::Map<String, serde_json::Value> = stats
            .iter()
            .map(|(status, count)| (status.to_string(), (*count).into()))
            .collect();
        return print_json(&map);
    }
    if stats.is_empty() {
        println!("Queue is empty.");
    }
    for (status, count) in stats {
        println!("  {:<10} {}", status, count);
    }
    Ok(())
}
