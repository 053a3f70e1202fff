//! Task planner
//!
//! Turns a request into a persisted [`TaskPlan`] and drives its execution.
//! Decomposition goes through the model decomposer when one is configured
//! and falls back to the heuristic decomposer otherwise. Execution walks the
//! task graph level by level, running each task's tool calls through a
//! [`TaskExecutor`] and recording every transition with the
//! [`PlanStateManager`].

pub mod assess;
pub mod decompose;
mod execution;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, StratumError};
use crate::orchestrator::{ToolCall, ToolOrchestrator, ToolResult};
use crate::plan::{
    PlanMetadata, PlanProgress, PlanResults, PlanStatePatch, PlanStateManager, PlanStatus,
    PlanningContext, Task, TaskPatch, TaskPlan, TaskStatus,
};
use crate::tools::ToolContext;

pub use assess::DraftSource;
pub use decompose::{
    CompletionClient, CompletionMessage, CompletionRequest, CompletionResponse, Decomposer,
    HeuristicDecomposer, ModelDecomposer, Role, TaskDraft,
};

/// What happens to the rest of a plan when a task fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Skip every task that has not started yet
    FailFast,
    /// Skip only the failed task's dependents; the plan ends failed
    #[default]
    ContinueIndependent,
    /// Like `ContinueIndependent`, but the plan ends completed
    TolerateFailures,
}

#[derive(Debug, Clone)]
pub struct PlannerConfig {
    pub failure_policy: FailurePolicy,
    /// Tasks of one dependency level running at once
    pub max_parallel_tasks: usize,
    /// Consult the model decomposer when one is attached
    pub use_model: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            max_parallel_tasks: 2,
            use_model: true,
        }
    }
}

/// Progress notifications for plan execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlanEvent {
    PlanStarted {
        plan_id: String,
        total_tasks: usize,
    },
    TaskStarted {
        plan_id: String,
        task_id: String,
    },
    TaskFinished {
        plan_id: String,
        task_id: String,
        status: TaskStatus,
    },
    ProgressUpdated {
        plan_id: String,
        progress: PlanProgress,
    },
    PlanFinished {
        plan_id: String,
        status: PlanStatus,
    },
}

/// Runs the tool calls of one task.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn available_tools(&self) -> Vec<String>;

    async fn run_calls(&self, calls: &[ToolCall], ctx: &ToolContext) -> Result<Vec<ToolResult>>;
}

#[async_trait]
impl TaskExecutor for ToolOrchestrator {
    async fn available_tools(&self) -> Vec<String> {
        self.registry().names().await
    }

    async fn run_calls(&self, calls: &[ToolCall], ctx: &ToolContext) -> Result<Vec<ToolResult>> {
        self.execute_tools(calls, ctx).await
    }
}

pub struct TaskPlanner {
    executor: Arc<dyn TaskExecutor>,
    state: Arc<PlanStateManager>,
    model: Option<Arc<dyn Decomposer>>,
    heuristic: HeuristicDecomposer,
    config: PlannerConfig,
    /// Cancellation handles of executions running in this process
    running: DashMap<String, CancellationToken>,
    events: Option<mpsc::Sender<PlanEvent>>,
}

impl TaskPlanner {
    pub fn new(
        executor: Arc<dyn TaskExecutor>,
        state: Arc<PlanStateManager>,
        config: PlannerConfig,
    ) -> Self {
        Self {
            executor,
            state,
            model: None,
            heuristic: HeuristicDecomposer,
            config,
            running: DashMap::new(),
            events: None,
        }
    }

    /// Attach a model-backed decomposer.
    pub fn with_decomposer(mut self, decomposer: Arc<dyn Decomposer>) -> Self {
        self.model = Some(decomposer);
        self
    }

    pub fn with_events(mut self, events: mpsc::Sender<PlanEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    pub fn state(&self) -> &Arc<PlanStateManager> {
        &self.state
    }

    fn emit(&self, event: PlanEvent) {
        let Some(tx) = &self.events else {
            return;
        };
        if let Err(mpsc::error::TrySendError::Full(event)) = tx.try_send(event) {
            debug!(?event, "Event channel full, dropping plan event");
        }
    }

    /// Decompose `request` into a validated plan and persist it.
    pub async fn create_plan(&self, request: &str, mut ctx: PlanningContext) -> Result<TaskPlan> {
        let request = request.trim();
        if request.is_empty() {
            return Err(StratumError::Validation("request must not be empty".to_string()));
        }
        ctx.project_root = ctx
            .project_root
            .canonicalize()
            .ok()
            .filter(|root| root.is_dir())
            .ok_or_else(|| {
                StratumError::Validation(format!(
                    "project root {} is not a directory",
                    ctx.project_root.display()
                ))
            })?;

        let tools = self.executor.available_tools().await;
        let mut adaptations = Vec::new();

        let model = self.model.as_ref().filter(|_| self.config.use_model);
        let plan = match model {
            Some(model) => {
                let attempt = model.decompose(request, &ctx, &tools).await.and_then(|drafts| {
                    assemble_plan(request, &ctx, drafts, DraftSource::Model, &tools, Vec::new())
                });
                match attempt {
                    Ok(plan) => plan,
                    Err(e) => {
                        warn!(decomposer = model.name(), error = %e, "Model decomposition failed, using heuristic");
                        adaptations.push(format!(
                            "Model decomposition failed ({}); used heuristic decomposition",
                            e
                        ));
                        self.heuristic_plan(request, &ctx, &tools, adaptations).await?
                    }
                }
            }
            None => self.heuristic_plan(request, &ctx, &tools, adaptations).await?,
        };

        self.state.save_plan(&plan).await?;
        info!(
            plan_id = %plan.id,
            tasks = plan.tasks.len(),
            estimated_minutes = plan.estimated_duration,
            risk = ?plan.risk_level,
            "Created plan"
        );
        Ok(plan)
    }

    async fn heuristic_plan(
        &self,
        request: &str,
        ctx: &PlanningContext,
        tools: &[String],
        adaptations: Vec<String>,
    ) -> Result<TaskPlan> {
        let drafts = self.heuristic.decompose(request, ctx, tools).await?;
        assemble_plan(request, ctx, drafts, DraftSource::Heuristic, tools, adaptations)
    }

    /// Current stored state of a plan.
    pub async fn get_plan(&self, plan_id: &str) -> Result<Option<TaskPlan>> {
        self.state.reload_plan(plan_id).await
    }

    pub async fn get_plan_results(&self, plan_id: &str) -> Result<Option<PlanResults>> {
        self.state.get_plan_results(plan_id).await
    }

    /// Plans that are neither completed nor failed.
    pub async fn get_active_plans(&self) -> Result<Vec<TaskPlan>> {
        self.state.list_active_plans().await
    }

    pub fn is_running(&self, plan_id: &str) -> bool {
        self.running.contains_key(plan_id)
    }

    /// Stop a plan. A running execution is signalled and winds down at its
    /// next checkpoint; a plan that is not running has its unfinished tasks
    /// marked cancelled directly.
    pub async fn cancel_plan(&self, plan_id: &str) -> Result<TaskPlan> {
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

        let signalled = self
            .running
            .get(plan_id)
            .map(|token| token.cancel())
            .is_some();

        if !signalled {
            for task in plan
                .tasks
                .iter()
                .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::InProgress))
            {
                self.state
                    .update_task_state(plan_id, &task.id, TaskPatch::status(TaskStatus::Cancelled))
                    .await?;
            }
        }

        let plan = self
            .state
            .update_plan_state(
                plan_id,
                PlanStatePatch {
                    status: Some(PlanStatus::Cancelled),
                    started: None,
                    completed: Some(Utc::now()),
                },
            )
            .await?;
        info!(plan_id = %plan_id, signalled, "Cancelled plan");
        Ok(plan)
    }
}

/// Turn drafts into a validated plan: ids checked, estimates scaled, the
/// graph verified acyclic, and the plan assessed.
fn assemble_plan(
    request: &str,
    ctx: &PlanningContext,
    drafts: Vec<TaskDraft>,
    source: DraftSource,
    available_tools: &[String],
    adaptations: Vec<String>,
) -> Result<TaskPlan> {
    if drafts.is_empty() {
        return Err(StratumError::Validation("decomposition produced no tasks".to_string()));
    }

    let mut seen = HashSet::new();
    let mut tasks = Vec::with_capacity(drafts.len());
    for draft in drafts {
        let key = draft.key.trim().to_string();
        if key.is_empty() {
            return Err(StratumError::Validation("task key must not be empty".to_string()));
        }
        if !seen.insert(key.clone()) {
            return Err(StratumError::Validation(format!("duplicate task key '{}'", key)));
        }

        let mut call_ids = HashSet::new();
        for call in &draft.tool_calls {
            if !call_ids.insert(call.id.as_str()) {
                return Err(StratumError::Validation(format!(
                    "task '{}' has duplicate tool call id '{}'",
                    key, call.id
                )));
            }
            if !available_tools.is_empty() && !available_tools.contains(&call.tool_name) {
                return Err(StratumError::Validation(format!(
                    "task '{}' calls unknown tool '{}'",
                    key, call.tool_name
                )));
            }
        }

        let mut tools_required = draft.tools_required;
        for call in &draft.tool_calls {
            if !tools_required.contains(&call.tool_name) {
                tools_required.push(call.tool_name.clone());
            }
        }

        let base = draft
            .estimated_duration
            .unwrap_or_else(|| decompose::base_estimate(draft.task_type));

        let mut task = Task::new(key, draft.title, draft.task_type);
        task.description = draft.description;
        task.priority = draft.priority;
        task.dependencies = draft.dependencies;
        task.estimated_duration = assess::scaled_estimate(base, ctx);
        task.tools_required = tools_required;
        task.files_involved = draft.files_involved;
        task.acceptance_criteria = draft.acceptance_criteria;
        task.tool_calls = draft.tool_calls;
        tasks.push(task);
    }

    let complexity = assess::complexity(&tasks, ctx);
    let risk_level = assess::risk_level(&tasks, complexity, ctx);
    let confidence = assess::confidence(source, complexity, risk_level, ctx);

    let mut plan = TaskPlan {
        id: uuid::Uuid::new_v4().to_string(),
        title: decompose::summarize(request),
        description: request.to_string(),
        request: request.to_string(),
        estimated_duration: tasks.iter().map(|t| t.estimated_duration).sum(),
        tasks,
        dependencies: Default::default(),
        status: PlanStatus::Planning,
        progress: PlanProgress::default(),
        created: Utc::now(),
        started: None,
        completed: None,
        metadata: PlanMetadata {
            complexity,
            confidence,
            adaptations,
        },
        risk_level,
        context: ctx.clone(),
    };
    plan.rebuild_dependencies();
    plan.graph()?;
    plan.refresh_progress();
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::TaskType;
    use crate::storage::Database;
    use serde_json::json;
    use tempfile::TempDir;

    struct NoTools;

    #[async_trait]
    impl TaskExecutor for NoTools {
        async fn available_tools(&self) -> Vec<String> {
            vec!["read".into(), "list".into(), "write".into(), "bash".into()]
        }

        async fn run_calls(&self, _calls: &[ToolCall], _ctx: &ToolContext) -> Result<Vec<ToolResult>> {
            Ok(Vec::new())
        }
    }

    struct FixedDecomposer(Result<Vec<TaskDraft>, String>);

    #[async_trait]
    impl Decomposer for FixedDecomposer {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn decompose(
            &self,
            _request: &str,
            _ctx: &PlanningContext,
            _tools: &[String],
        ) -> Result<Vec<TaskDraft>> {
            self.0.clone().map_err(StratumError::Validation)
        }
    }

    fn planner() -> TaskPlanner {
        let db = Arc::new(Database::open_in_memory().unwrap());
        TaskPlanner::new(
            Arc::new(NoTools),
            Arc::new(PlanStateManager::new(db)),
            PlannerConfig::default(),
        )
    }

    fn draft(key: &str, deps: &[&str]) -> TaskDraft {
        let mut draft = TaskDraft::new(key, key, TaskType::Implementation);
        draft.dependencies = deps.iter().map(|s| s.to_string()).collect();
        draft
    }

    #[tokio::test]
    async fn rejects_empty_request() {
        let err = planner()
            .create_plan("   ", PlanningContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.category(), "validation");
    }

    #[tokio::test]
    async fn heuristic_plan_is_persisted() {
        let temp = TempDir::new().unwrap();
        let planner = planner();
        let plan = planner
            .create_plan("Add a health check endpoint", PlanningContext::new(temp.path()))
            .await
            .unwrap();

        assert_eq!(plan.status, PlanStatus::Planning);
        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.dependencies["main"], vec!["analyze"]);
        assert_eq!(
            plan.estimated_duration,
            plan.tasks.iter().map(|t| t.estimated_duration).sum::<u32>()
        );
        assert!(plan.metadata.adaptations.is_empty());

        let stored = planner.get_plan(&plan.id).await.unwrap().unwrap();
        assert_eq!(stored.title, plan.title);
        assert_eq!(stored.tasks.len(), 2);
        assert_eq!(stored.tasks[1].tool_calls, plan.tasks[1].tool_calls);
    }

    #[tokio::test]
    async fn model_plan_is_used_when_valid() {
        let temp = TempDir::new().unwrap();
        let mut second = draft("b", &["a"]);
        second.estimated_duration = Some(12);
        let planner = planner().with_decomposer(Arc::new(FixedDecomposer(Ok(vec![
            draft("a", &[]),
            second,
        ]))));

        let plan = planner
            .create_plan("anything", PlanningContext::new(temp.path()))
            .await
            .unwrap();
        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.task("b").unwrap().estimated_duration, 12);
        assert!(plan.metadata.confidence >= 0.8);
    }

    #[tokio::test]
    async fn cyclic_model_plan_falls_back() {
        let temp = TempDir::new().unwrap();
        let planner = planner().with_decomposer(Arc::new(FixedDecomposer(Ok(vec![
            draft("a", &["b"]),
            draft("b", &["a"]),
        ]))));

        let plan = planner
            .create_plan("anything", PlanningContext::new(temp.path()))
            .await
            .unwrap();
        assert!(plan.task("analyze").is_some());
        assert_eq!(plan.metadata.adaptations.len(), 1);
        assert!(plan.metadata.adaptations[0].contains("cyclic dependency"));
    }

    #[tokio::test]
    async fn model_disabled_by_config() {
        let temp = TempDir::new().unwrap();
        let mut planner = planner().with_decomposer(Arc::new(FixedDecomposer(Err("boom".into()))));
        planner.config.use_model = false;

        let plan = planner
            .create_plan("anything", PlanningContext::new(temp.path()))
            .await
            .unwrap();
        assert!(plan.metadata.adaptations.is_empty());
    }

    #[test]
    fn unknown_tools_are_rejected() {
        let mut bad = draft("a", &[]);
        bad.tool_calls.push(ToolCall::new("c1", "teleport", json!({})));
        let err = assemble_plan(
            "x",
            &PlanningContext::default(),
            vec![bad],
            DraftSource::Model,
            &["read".to_string()],
            Vec::new(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("teleport"));
    }

    #[test]
    fn dangling_dependency_is_rejected() {
        let err = assemble_plan(
            "x",
            &PlanningContext::default(),
            vec![draft("a", &["ghost"])],
            DraftSource::Model,
            &[],
            Vec::new(),
        )
        .unwrap_err();
        assert_eq!(err.category(), "validation");
    }

    #[tokio::test]
    async fn cancel_idle_plan() {
        let temp = TempDir::new().unwrap();
        let planner = planner();
        let plan = planner
            .create_plan("Write docs for the API", PlanningContext::new(temp.path()))
            .await
            .unwrap();

        let cancelled = planner.cancel_plan(&plan.id).await.unwrap();
        assert_eq!(cancelled.status, PlanStatus::Cancelled);
        assert!(cancelled.completed.is_some());
        assert!(cancelled
            .tasks
            .iter()
            .all(|t| t.status == TaskStatus::Cancelled));

        assert!(matches!(
            planner.cancel_plan("missing").await,
            Err(StratumError::NotFound { .. })
        ));
    }

    #[test]
    fn failure_policy_serde() {
        let policy: FailurePolicy = serde_json::from_value(json!("tolerate_failures")).unwrap();
        assert_eq!(policy, FailurePolicy::TolerateFailures);
        assert_eq!(FailurePolicy::default(), FailurePolicy::ContinueIndependent);
    }
}
