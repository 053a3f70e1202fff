//! Plan execution
//!
//! One execution per plan at a time (enforced by the state manager lease).
//! Tasks already completed or failed by an earlier run are left alone;
//! tasks an interrupted run left behind start over.

use chrono::Utc;
use futures::future::join_all;
use std::collections::BTreeSet;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{FailurePolicy, PlanEvent, TaskPlanner};
use crate::error::{ErrorCategory, Result, StratumError};
use crate::orchestrator::{BatchSummary, CallStatus, ToolResult};
use crate::plan::{
    PlanMetrics, PlanResults, PlanStatePatch, PlanStatus, Task, TaskError, TaskOutcome,
    TaskPatch, TaskPlan, TaskStatus,
};
use crate::tools::ToolContext;

/// What one task run contributed to the plan metrics.
struct TaskRun {
    status: TaskStatus,
    summary: BatchSummary,
}

impl TaskRun {
    fn cancelled() -> Self {
        Self {
            status: TaskStatus::Cancelled,
            summary: BatchSummary::default(),
        }
    }
}

fn error_category(err: &StratumError) -> ErrorCategory {
    match err {
        StratumError::ToolExecution { category, .. } => *category,
        StratumError::NotFound { .. } => ErrorCategory::NotFound,
        StratumError::Timeout(_) => ErrorCategory::Timeout,
        StratumError::Cancelled => ErrorCategory::Cancelled,
        StratumError::Validation(_) | StratumError::CyclicDependency { .. } => {
            ErrorCategory::Validation
        }
        StratumError::PlanBusy(_) | StratumError::Storage(_) => ErrorCategory::Unknown,
    }
}

fn task_error(category: ErrorCategory, message: impl Into<String>) -> TaskError {
    TaskError {
        message: message.into(),
        category,
        suggestion: category.suggestion().to_string(),
    }
}

/// First real failure in a batch; skipped calls only echo it.
fn first_failure(results: &[ToolResult]) -> TaskError {
    results
        .iter()
        .filter(|r| !r.success && r.status != CallStatus::Skipped)
        .find_map(|r| r.error.as_ref())
        .map(|e| TaskError {
            message: e.message.clone(),
            category: e.category,
            suggestion: e.suggestion.clone(),
        })
        .unwrap_or_else(|| task_error(ErrorCategory::Unknown, "One or more tool calls failed"))
}

fn elapsed_ms(task: &Task) -> u64 {
    match (task.started, task.completed) {
        (Some(started), Some(completed)) => (completed - started).num_milliseconds().max(0) as u64,
        _ => 0,
    }
}

impl TaskPlanner {
    /// Execute (or resume) a plan and return its final state.
    ///
    /// Fails with `PlanBusy` if the plan is already executing, `NotFound` for
    /// an unknown id, and `Validation` for a plan that already finished.
    pub async fn execute_plan(&self, plan_id: &str) -> Result<TaskPlan> {
        let _lease = self.state.acquire_lease(plan_id)?;

        let plan = self
            .state
            .reload_plan(plan_id)
            .await?
            .ok_or_else(|| StratumError::not_found("plan", plan_id))?;
        if plan.status.is_finished() {
            return Err(StratumError::Validation(format!(
                "plan {} is already {}",
                plan_id, plan.status
            )));
        }

        let cancel = CancellationToken::new();
        self.running.insert(plan_id.to_string(), cancel.clone());
        let outcome = self.run_plan(plan_id, &cancel).await;
        self.running.remove(plan_id);

        if let Err(e) = &outcome {
            warn!(plan_id = %plan_id, error = %e, "Plan execution aborted");
        }
        outcome
    }

    async fn run_plan(&self, plan_id: &str, cancel: &CancellationToken) -> Result<TaskPlan> {
        let run_start = Instant::now();

        let plan = self.state.reset_interrupted_tasks(plan_id).await?;
        let levels = plan.graph()?.execution_levels()?;
        let plan = self
            .state
            .update_plan_state(
                plan_id,
                PlanStatePatch {
                    status: Some(PlanStatus::Executing),
                    started: Some(plan.started.unwrap_or_else(Utc::now)),
                    completed: None,
                },
            )
            .await?;

        info!(
            plan_id = %plan_id,
            tasks = plan.tasks.len(),
            levels = levels.len(),
            policy = ?self.config.failure_policy,
            "Executing plan"
        );
        self.emit(PlanEvent::PlanStarted {
            plan_id: plan_id.to_string(),
            total_tasks: plan.tasks.len(),
        });

        let root = plan
            .context
            .project_root
            .canonicalize()
            .unwrap_or_else(|_| plan.context.project_root.clone());
        let ctx = ToolContext::new(root.clone())
            .with_sandbox(root)
            .with_cancel(cancel.child_token());
        let semaphore = Semaphore::new(self.config.max_parallel_tasks.max(1));

        let mut metrics = PlanMetrics::default();
        let mut halted = false;

        for (level_idx, level) in levels.iter().enumerate() {
            // Storage is re-read so a cancel issued from another process is seen
            let current = self
                .state
                .reload_plan(plan_id)
                .await?
                .ok_or_else(|| StratumError::not_found("plan", plan_id))?;
            if current.status == PlanStatus::Cancelled {
                cancel.cancel();
            }
            if cancel.is_cancelled() {
                info!(plan_id = %plan_id, level = level_idx, "Plan cancelled, stopping dispatch");
                break;
            }

            let mut runnable: Vec<&Task> = Vec::with_capacity(level.len());
            for task_id in level {
                let Some(task) = current.task(task_id) else {
                    continue;
                };
                if task.status.is_terminal() {
                    continue;
                }
                if halted {
                    self.skip_task(plan_id, task_id, "Skipped: plan halted after a failure".to_string())
                        .await?;
                    continue;
                }
                let unmet = task.dependencies.iter().find(|dep| {
                    current.task(dep).map(|t| t.status) != Some(TaskStatus::Completed)
                });
                match unmet {
                    Some(dep) => {
                        self.skip_task(
                            plan_id,
                            task_id,
                            format!("Skipped: dependency '{}' did not complete", dep),
                        )
                        .await?;
                    }
                    None => runnable.push(task),
                }
            }

            debug!(plan_id = %plan_id, level = level_idx, runnable = runnable.len(), "Dispatching level");

            let runs = runnable.iter().map(|task| {
                let semaphore = &semaphore;
                let ctx = &ctx;
                async move {
                    let Ok(_permit) = semaphore.acquire().await else {
                        return Ok(TaskRun::cancelled());
                    };
                    if ctx.cancel.is_cancelled() {
                        return Ok(TaskRun::cancelled());
                    }
                    self.run_task(plan_id, task, ctx).await
                }
            });

            for run in join_all(runs).await {
                let run = run?;
                metrics.tool_calls += run.summary.total;
                metrics.cache_hits += run.summary.cache_hits;
                metrics.retries += run.summary.retries;
                if run.status == TaskStatus::Failed
                    && self.config.failure_policy == FailurePolicy::FailFast
                {
                    halted = true;
                }
            }
        }

        let stored = self
            .state
            .reload_plan(plan_id)
            .await?
            .ok_or_else(|| StratumError::not_found("plan", plan_id))?;
        if stored.status == PlanStatus::Cancelled {
            cancel.cancel();
        }
        if cancel.is_cancelled() {
            self.cancel_remaining(plan_id).await?;
        }

        let plan = self
            .state
            .reload_plan(plan_id)
            .await?
            .ok_or_else(|| StratumError::not_found("plan", plan_id))?;
        let status = self.settle(&plan, cancel.is_cancelled());
        let plan = self
            .state
            .update_plan_state(
                plan_id,
                PlanStatePatch {
                    status: Some(status),
                    started: None,
                    completed: Some(Utc::now()),
                },
            )
            .await?;

        metrics.duration_ms = run_start.elapsed().as_millis() as u64;
        metrics.tasks_completed = plan.progress.completed;
        metrics.tasks_failed = plan.progress.failed;
        metrics.tasks_skipped = plan
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Skipped)
            .count();

        let results = self.results_for(&plan, metrics);
        self.state.save_plan_results(&results).await?;

        info!(
            plan_id = %plan_id,
            status = %status,
            completed = metrics.tasks_completed,
            failed = metrics.tasks_failed,
            skipped = metrics.tasks_skipped,
            duration_ms = metrics.duration_ms,
            "Plan finished"
        );
        self.emit(PlanEvent::PlanFinished {
            plan_id: plan_id.to_string(),
            status,
        });
        Ok(plan)
    }

    /// Run one task's tool calls and record the outcome.
    async fn run_task(&self, plan_id: &str, task: &Task, ctx: &ToolContext) -> Result<TaskRun> {
        self.state
            .update_task_state(
                plan_id,
                &task.id,
                TaskPatch {
                    status: Some(TaskStatus::InProgress),
                    started: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        self.emit(PlanEvent::TaskStarted {
            plan_id: plan_id.to_string(),
            task_id: task.id.clone(),
        });
        debug!(plan_id = %plan_id, task_id = %task.id, calls = task.tool_calls.len(), "Running task");

        let (patch, summary) = match self.executor.run_calls(&task.tool_calls, ctx).await {
            Ok(results) => {
                let summary = BatchSummary::from_results(&results);
                let output = serde_json::to_value(&results)?;
                let patch = if summary.all_succeeded() {
                    TaskPatch {
                        status: Some(TaskStatus::Completed),
                        completed: Some(Utc::now()),
                        result: Some(output),
                        retries_attempted: Some(summary.retries),
                        ..Default::default()
                    }
                } else if summary.cancelled > 0 && ctx.cancel.is_cancelled() {
                    TaskPatch {
                        status: Some(TaskStatus::Cancelled),
                        result: Some(output),
                        error: Some(task_error(ErrorCategory::Cancelled, "Cancelled during execution")),
                        retries_attempted: Some(summary.retries),
                        ..Default::default()
                    }
                } else {
                    TaskPatch {
                        status: Some(TaskStatus::Failed),
                        completed: Some(Utc::now()),
                        result: Some(output),
                        error: Some(first_failure(&results)),
                        retries_attempted: Some(summary.retries),
                        ..Default::default()
                    }
                };
                (patch, summary)
            }
            Err(e) => {
                warn!(plan_id = %plan_id, task_id = %task.id, error = %e, "Task batch rejected");
                let patch = TaskPatch {
                    status: Some(TaskStatus::Failed),
                    completed: Some(Utc::now()),
                    error: Some(task_error(error_category(&e), e.to_string())),
                    ..Default::default()
                };
                (patch, BatchSummary::default())
            }
        };

        let status = patch.status.unwrap_or(TaskStatus::Failed);
        let plan = self.state.update_task_state(plan_id, &task.id, patch).await?;

        info!(
            plan_id = %plan_id,
            task_id = %task.id,
            status = %status,
            retries = summary.retries,
            cache_hits = summary.cache_hits,
            "Task finished"
        );
        self.emit(PlanEvent::TaskFinished {
            plan_id: plan_id.to_string(),
            task_id: task.id.clone(),
            status,
        });
        self.emit(PlanEvent::ProgressUpdated {
            plan_id: plan_id.to_string(),
            progress: plan.progress,
        });

        Ok(TaskRun { status, summary })
    }

    async fn skip_task(&self, plan_id: &str, task_id: &str, reason: String) -> Result<()> {
        debug!(plan_id = %plan_id, task_id = %task_id, %reason, "Skipping task");
        self.state
            .update_task_state(
                plan_id,
                task_id,
                TaskPatch {
                    status: Some(TaskStatus::Skipped),
                    error: Some(task_error(ErrorCategory::Unknown, reason)),
                    ..Default::default()
                },
            )
            .await?;
        self.emit(PlanEvent::TaskFinished {
            plan_id: plan_id.to_string(),
            task_id: task_id.to_string(),
            status: TaskStatus::Skipped,
        });
        Ok(())
    }

    /// Mark tasks that never got to run as cancelled.
    async fn cancel_remaining(&self, plan_id: &str) -> Result<()> {
        let plan = self
            .state
            .reload_plan(plan_id)
            .await?
            .ok_or_else(|| StratumError::not_found("plan", plan_id))?;
        for task in plan
            .tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::InProgress))
        {
            self.state
                .update_task_state(plan_id, &task.id, TaskPatch::status(TaskStatus::Cancelled))
                .await?;
        }
        Ok(())
    }

    /// Final plan status from task outcomes and the failure policy.
    fn settle(&self, plan: &TaskPlan, cancelled: bool) -> PlanStatus {
        if cancelled {
            return PlanStatus::Cancelled;
        }
        let clean = plan
            .tasks
            .iter()
            .all(|t| t.status == TaskStatus::Completed);
        if clean || self.config.failure_policy == FailurePolicy::TolerateFailures {
            PlanStatus::Completed
        } else {
            PlanStatus::Failed
        }
    }

    fn results_for(&self, plan: &TaskPlan, metrics: PlanMetrics) -> PlanResults {
        let files_involved: BTreeSet<&String> = plan
            .tasks
            .iter()
            .flat_map(|t| t.files_involved.iter())
            .collect();

        PlanResults {
            plan_id: plan.id.clone(),
            status: plan.status,
            task_outcomes: plan
                .tasks
                .iter()
                .map(|t| TaskOutcome {
                    task_id: t.id.clone(),
                    title: t.title.clone(),
                    status: t.status,
                    error: t.error.as_ref().map(|e| e.message.clone()),
                    retries_attempted: t.retries_attempted,
                    duration_ms: elapsed_ms(t),
                })
                .collect(),
            files_involved: files_involved.into_iter().cloned().collect(),
            metrics,
            recorded_at: Utc::now(),
        }
    }
}
