//! Planning service
//!
//! The operation surface the command layer talks to. Every call returns an
//! [`Envelope`] so callers never see a raw error type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::cache::ResultCache;
use crate::config::StratumConfig;
use crate::error::{Result, StratumError};
use crate::orchestrator::ToolOrchestrator;
use crate::plan::{
    Complexity, PlanMetrics, PlanProgress, PlanStateManager, PlanStatus, PlanningContext,
    RiskLevel, TaskError, TaskPlan, TaskPriority, TaskStatus, TaskType,
};
use crate::planner::{PlanEvent, TaskPlanner};
use crate::retry::RetryStrategy;
use crate::storage::{Database, SharedDatabase};
use crate::tools::{register_builtin_tools, ToolRegistry};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeError {
    pub message: String,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl From<&StratumError> for EnvelopeError {
    fn from(err: &StratumError) -> Self {
        Self {
            message: err.to_string(),
            category: err.category().to_string(),
            suggestion: err.suggestion(),
        }
    }
}

/// Success/error wrapper returned by every service operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EnvelopeError>,
}

impl<T> Envelope<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(err: &StratumError) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(err.into()),
        }
    }

    pub fn into_result(self) -> std::result::Result<T, EnvelopeError> {
        match (self.data, self.error) {
            (Some(data), None) => Ok(data),
            (_, Some(error)) => Err(error),
            (None, None) => Err(EnvelopeError {
                message: "empty response".to_string(),
                category: "unknown".to_string(),
                suggestion: None,
            }),
        }
    }
}

impl<T> From<Result<T>> for Envelope<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(data) => Self::success(data),
            Err(err) => {
                tracing::debug!(category = err.category(), error = %err, "Service operation failed");
                Self::failure(&err)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub dependencies: Vec<String>,
    pub estimated_duration: u32,
    pub tool_calls: usize,
    pub retries_attempted: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

/// Plan summary for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanView {
    pub id: String,
    pub title: String,
    pub request: String,
    pub status: PlanStatus,
    pub progress: PlanProgress,
    pub risk_level: RiskLevel,
    pub complexity: Complexity,
    pub confidence: f64,
    /// Minutes
    pub estimated_duration: u32,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,
    pub adaptations: Vec<String>,
    pub tasks: Vec<TaskView>,
    /// Present once the plan has been executed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<PlanMetrics>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStatusView {
    pub id: String,
    pub status: PlanStatus,
    pub progress: PlanProgress,
    pub running_tasks: Vec<String>,
    pub failed_tasks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanListItem {
    pub id: String,
    pub title: String,
    pub status: PlanStatus,
    pub progress: PlanProgress,
    pub created: DateTime<Utc>,
}

fn task_ids_with(plan: &TaskPlan, status: TaskStatus) -> Vec<String> {
    plan.tasks
        .iter()
        .filter(|t| t.status == status)
        .map(|t| t.id.clone())
        .collect()
}

impl PlanView {
    fn new(plan: TaskPlan, metrics: Option<PlanMetrics>) -> Self {
        let tasks = plan
            .tasks
            .iter()
            .map(|t| TaskView {
                id: t.id.clone(),
                title: t.title.clone(),
                task_type: t.task_type,
                priority: t.priority,
                status: t.status,
                dependencies: t.dependencies.clone(),
                estimated_duration: t.estimated_duration,
                tool_calls: t.tool_calls.len(),
                retries_attempted: t.retries_attempted,
                error: t.error.clone(),
            })
            .collect();

        Self {
            id: plan.id,
            title: plan.title,
            request: plan.request,
            status: plan.status,
            progress: plan.progress,
            risk_level: plan.risk_level,
            complexity: plan.metadata.complexity,
            confidence: plan.metadata.confidence,
            estimated_duration: plan.estimated_duration,
            created: plan.created,
            started: plan.started,
            completed: plan.completed,
            adaptations: plan.metadata.adaptations,
            tasks,
            metrics,
        }
    }
}

impl From<&TaskPlan> for PlanStatusView {
    fn from(plan: &TaskPlan) -> Self {
        Self {
            id: plan.id.clone(),
            status: plan.status,
            progress: plan.progress,
            running_tasks: task_ids_with(plan, TaskStatus::InProgress),
            failed_tasks: task_ids_with(plan, TaskStatus::Failed),
        }
    }
}

impl From<&TaskPlan> for PlanListItem {
    fn from(plan: &TaskPlan) -> Self {
        Self {
            id: plan.id.clone(),
            title: plan.title.clone(),
            status: plan.status,
            progress: plan.progress,
            created: plan.created,
        }
    }
}

/// The wired-up component graph, built once per process from config.
pub struct StratumServices {
    pub registry: Arc<ToolRegistry>,
    pub cache: Arc<ResultCache>,
    pub orchestrator: Arc<ToolOrchestrator>,
    pub state: Arc<PlanStateManager>,
    pub planner: Arc<TaskPlanner>,
}

impl StratumServices {
    /// Open the configured database and wire every component. Plan events
    /// go to `events` when given; see [`StratumConfig::event_channel`].
    pub async fn from_config(
        config: &StratumConfig,
        events: Option<tokio::sync::mpsc::Sender<PlanEvent>>,
    ) -> Result<Self> {
        let db = Arc::new(Database::new(&config.database_path())?);
        Self::with_database(config, db, events).await
    }

    /// Wire every component over an existing database. Plan events go to
    /// `events` when given.
    pub async fn with_database(
        config: &StratumConfig,
        db: SharedDatabase,
        events: Option<tokio::sync::mpsc::Sender<PlanEvent>>,
    ) -> Result<Self> {
        let orchestrator_config = config.orchestrator_config();

        let registry = Arc::new(ToolRegistry::new().with_default_timeout(orchestrator_config.tool_timeout));
        register_builtin_tools(&registry).await;
        registry.initialize_all().await?;

        let cache = Arc::new(ResultCache::new(config.cache_config()));
        let orchestrator = Arc::new(ToolOrchestrator::new(
            Arc::clone(&registry),
            Arc::clone(&cache),
            RetryStrategy::new(config.retry_config()),
            orchestrator_config,
        ));
        let state = Arc::new(PlanStateManager::new(db));

        let mut planner = TaskPlanner::new(
            orchestrator.clone(),
            Arc::clone(&state),
            config.planner_config(),
        );
        if let Some(events) = events {
            planner = planner.with_events(events);
        }

        tracing::debug!(tools = ?registry.names().await, "Services ready");
        Ok(Self {
            registry,
            cache,
            orchestrator,
            state,
            planner: Arc::new(planner),
        })
    }

    pub fn planning(&self) -> PlanningService {
        PlanningService::new(Arc::clone(&self.planner))
    }

    pub async fn shutdown(&self) {
        self.registry.dispose_all().await;
    }
}

/// Operations exposed to the command layer.
#[derive(Clone)]
pub struct PlanningService {
    planner: Arc<TaskPlanner>,
}

impl PlanningService {
    pub fn new(planner: Arc<TaskPlanner>) -> Self {
        Self { planner }
    }

    async fn require(&self, plan_id: &str) -> Result<TaskPlan> {
        self.planner
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| StratumError::not_found("plan", plan_id))
    }

    /// Create a plan and return its id.
    pub async fn create(&self, request: &str, ctx: PlanningContext) -> Envelope<String> {
        self.planner
            .create_plan(request, ctx)
            .await
            .map(|plan| plan.id)
            .into()
    }

    /// Execute a plan to completion and return its final status.
    pub async fn execute(&self, plan_id: &str) -> Envelope<PlanStatus> {
        self.planner
            .execute_plan(plan_id)
            .await
            .map(|plan| plan.status)
            .into()
    }

    pub async fn view(&self, plan_id: &str) -> Envelope<PlanView> {
        let result = async {
            let plan = self.require(plan_id).await?;
            let metrics = self
                .planner
                .get_plan_results(plan_id)
                .await?
                .map(|r| r.metrics);
            Ok::<_, StratumError>(PlanView::new(plan, metrics))
        }
        .await;
        result.into()
    }

    pub async fn status(&self, plan_id: &str) -> Envelope<PlanStatusView> {
        self.require(plan_id)
            .await
            .map(|plan| PlanStatusView::from(&plan))
            .into()
    }

    /// All plans, or only unfinished ones when `active_only`.
    pub async fn list(&self, active_only: bool) -> Envelope<Vec<PlanListItem>> {
        let plans = if active_only {
            self.planner.get_active_plans().await
        } else {
            self.planner.state().list_plans().await
        };
        plans
            .map(|plans| plans.iter().map(PlanListItem::from).collect())
            .into()
    }

    /// Continue an unfinished plan.
    pub async fn resume(&self, plan_id: &str) -> Envelope<PlanStatus> {
        let result = async {
            let resumable = self.planner.state().resume_plan(plan_id).await?;
            if resumable.is_none() {
                let plan = self.require(plan_id).await?;
                return Err(StratumError::Validation(format!(
                    "plan {} is already {} and cannot be resumed",
                    plan_id, plan.status
                )));
            }
            self.planner
                .execute_plan(plan_id)
                .await
                .map(|plan| plan.status)
        }
        .await;
        result.into()
    }

    pub async fn cancel(&self, plan_id: &str) -> Envelope<PlanStatus> {
        self.planner
            .cancel_plan(plan_id)
            .await
            .map(|plan| plan.status)
            .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn service() -> (StratumServices, TempDir) {
        let temp = TempDir::new().unwrap();
        let db = Arc::new(Database::new(&temp.path().join("plans.db")).unwrap());
        let services = StratumServices::with_database(&StratumConfig::default(), db, None)
            .await
            .unwrap();
        (services, temp)
    }

    #[tokio::test]
    async fn create_execute_view() {
        let (services, temp) = service().await;
        let project = temp.path().join("project");
        std::fs::create_dir(&project).unwrap();
        std::fs::write(project.join("notes.md"), "# notes").unwrap();
        let planning = services.planning();

        let id = planning
            .create("Document notes.md", PlanningContext::new(&project))
            .await
            .into_result()
            .unwrap();

        let status = planning.execute(&id).await;
        assert!(status.ok, "{:?}", status.error);
        assert_eq!(status.data, Some(PlanStatus::Completed));

        let view = planning.view(&id).await.into_result().unwrap();
        assert_eq!(view.progress.percentage, 100.0);
        assert!(view.metrics.is_some());
        assert!(view.tasks.iter().all(|t| t.status == TaskStatus::Completed));

        let status = planning.status(&id).await.into_result().unwrap();
        assert!(status.running_tasks.is_empty());
    }

    #[tokio::test]
    async fn plan_events_flow_through_configured_channel() {
        let temp = TempDir::new().unwrap();
        let mut config = StratumConfig::default();
        config.orchestrator.event_buffer = 64;
        let (tx, mut rx) = config.event_channel();
        let db = Arc::new(Database::new(&temp.path().join("plans.db")).unwrap());
        let services = StratumServices::with_database(&config, db, Some(tx))
            .await
            .unwrap();
        let planning = services.planning();

        let id = planning
            .create("Explain the layout", PlanningContext::new(temp.path()))
            .await
            .into_result()
            .unwrap();
        planning.execute(&id).await.into_result().unwrap();
        drop(planning);
        drop(services);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert!(matches!(events.first(), Some(PlanEvent::PlanStarted { .. })));
        assert_eq!(
            events.last(),
            Some(&PlanEvent::PlanFinished {
                plan_id: id,
                status: PlanStatus::Completed
            })
        );
    }

    #[tokio::test]
    async fn unknown_plan_is_an_error_envelope() {
        let (services, _temp) = service().await;
        let envelope = services.planning().view("nope").await;

        assert!(!envelope.ok);
        let error = envelope.error.unwrap();
        assert_eq!(error.category, "not_found");
        assert!(error.suggestion.is_some());

        let json = serde_json::to_value(services.planning().status("nope").await).unwrap();
        assert_eq!(json["ok"], false);
        assert!(json.get("data").is_none());
    }

    #[tokio::test]
    async fn finished_plan_cannot_resume() {
        let (services, temp) = service().await;
        let planning = services.planning();
        let id = planning
            .create("Review the code", PlanningContext::new(temp.path()))
            .await
            .into_result()
            .unwrap();
        planning.execute(&id).await.into_result().unwrap();

        let error = planning.resume(&id).await.into_result().unwrap_err();
        assert_eq!(error.category, "validation");
        assert!(planning.list(true).await.into_result().unwrap().is_empty());
        assert_eq!(planning.list(false).await.into_result().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_plan_resumes() {
        let (services, temp) = service().await;
        let planning = services.planning();
        let id = planning
            .create("Configure logging", PlanningContext::new(temp.path()))
            .await
            .into_result()
            .unwrap();

        assert_eq!(
            planning.cancel(&id).await.into_result().unwrap(),
            PlanStatus::Cancelled
        );
        assert_eq!(
            planning.resume(&id).await.into_result().unwrap(),
            PlanStatus::Completed
        );
    }
}
