//! Terminal rendering of service envelopes

use anyhow::Result;
use serde::Serialize;

use tokio::sync::mpsc;

use stratum_core::plan::TaskStatus;
use stratum_core::planner::PlanEvent;
use stratum_core::service::{PlanListItem, PlanStatusView, PlanView};
use stratum_core::Envelope;

/// Print an envelope as JSON or through `render`. Returns whether it was ok.
pub fn emit<T: Serialize>(json: bool, envelope: &Envelope<T>, render: impl FnOnce(&T)) -> Result<bool> {
    if json {
        println!("{}", serde_json::to_string_pretty(envelope)?);
        return Ok(envelope.ok);
    }

    match (&envelope.data, &envelope.error) {
        (Some(data), None) => render(data),
        (_, Some(error)) => {
            eprintln!("Error [{}]: {}", error.category, error.message);
            if let Some(suggestion) = &error.suggestion {
                eprintln!("  hint: {}", suggestion);
            }
        }
        (None, None) => {}
    }
    Ok(envelope.ok)
}

fn marker(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "[ ]",
        TaskStatus::InProgress => "[~]",
        TaskStatus::Completed => "[x]",
        TaskStatus::Failed => "[!]",
        TaskStatus::Skipped => "[-]",
        TaskStatus::Cancelled => "[/]",
    }
}

pub fn print_plan(plan: &PlanView) {
    println!("{}  ({})", plan.title, plan.id);
    println!(
        "status: {}   progress: {:.0}% ({}/{})   risk: {:?}   estimate: {} min   confidence: {:.2}",
        plan.status,
        plan.progress.percentage,
        plan.progress.completed,
        plan.progress.total,
        plan.risk_level,
        plan.estimated_duration,
        plan.confidence
    );
    for note in &plan.adaptations {
        println!("note: {}", note);
    }
    println!();

    for task in &plan.tasks {
        let deps = if task.dependencies.is_empty() {
            String::new()
        } else {
            format!("  <- {}", task.dependencies.join(", "))
        };
        println!(
            "{} {} {} ({:?}, {} min){}",
            marker(task.status),
            task.id,
            task.title,
            task.task_type,
            task.estimated_duration,
            deps
        );
        if let Some(error) = &task.error {
            println!("      {}", error.message);
            println!("      hint: {}", error.suggestion);
        }
        if task.retries_attempted > 0 {
            println!("      retries: {}", task.retries_attempted);
        }
    }

    if let Some(metrics) = &plan.metrics {
        println!();
        println!(
            "last run: {} ms, {} tool calls, {} cache hits, {} retries",
            metrics.duration_ms, metrics.tool_calls, metrics.cache_hits, metrics.retries
        );
    }
}

pub fn print_status(status: &PlanStatusView) {
    println!(
        "{}: {} ({:.0}%, {}/{} tasks, {} failed)",
        status.id,
        status.status,
        status.progress.percentage,
        status.progress.completed,
        status.progress.total,
        status.progress.failed
    );
    if !status.running_tasks.is_empty() {
        println!("running: {}", status.running_tasks.join(", "));
    }
    if !status.failed_tasks.is_empty() {
        println!("failed: {}", status.failed_tasks.join(", "));
    }
}

pub fn print_list(plans: &[PlanListItem]) {
    if plans.is_empty() {
        println!("No plans");
        return;
    }
    for plan in plans {
        println!(
            "{}  {:<10} {:>4.0}%  {}  {}",
            plan.id,
            plan.status.as_str(),
            plan.progress.percentage,
            plan.created.format("%Y-%m-%d %H:%M"),
            plan.title
        );
    }
}

/// Print task progress while a plan runs. Events are drained silently when
/// `show` is false so the planner never blocks on a full channel.
pub async fn print_progress(mut events: mpsc::Receiver<PlanEvent>, show: bool) {
    while let Some(event) = events.recv().await {
        if !show {
            continue;
        }
        match event {
            PlanEvent::PlanStarted { total_tasks, .. } => {
                eprintln!("running {} tasks", total_tasks);
            }
            PlanEvent::TaskStarted { task_id, .. } => {
                eprintln!("{} {}", marker(TaskStatus::InProgress), task_id);
            }
            PlanEvent::TaskFinished {
                task_id, status, ..
            } => {
                eprintln!("{} {}", marker(status), task_id);
            }
            PlanEvent::ProgressUpdated { progress, .. } => {
                eprintln!(
                    "    {:.0}% ({}/{})",
                    progress.percentage, progress.completed, progress.total
                );
            }
            PlanEvent::PlanFinished { .. } => {}
        }
    }
}
