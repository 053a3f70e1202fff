//! Plan and task data model
//!
//! A `TaskPlan` owns its `Task`s. The plan-level `dependencies` map is a
//! projection of `tasks[*].dependencies` and is rebuilt through
//! [`TaskPlan::rebuild_dependencies`] whenever the task list changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{ErrorCategory, Result, StratumError};
use crate::graph::DependencyGraph;
use crate::orchestrator::ToolCall;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Analysis,
    Implementation,
    Testing,
    Review,
    Documentation,
    Refactoring,
    Configuration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Critical,
}

/// Task lifecycle: `pending -> in_progress -> {completed | failed}`.
/// `skipped` and `cancelled` are set by the executor for tasks that never
/// finished; only `completed` and `failed` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plan lifecycle: `planning -> executing -> {completed | failed | cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Planning,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl PlanStatus {
    /// Completed and failed plans are never resumed.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "planning" => Ok(Self::Planning),
            "executing" => Ok(Self::Executing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown plan status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    #[default]
    Moderate,
    Complex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeClass {
    Small,
    #[default]
    Medium,
    Large,
}

impl SizeClass {
    /// Multiplier applied to base task estimates.
    pub fn effort_factor(self) -> f64 {
        match self {
            Self::Small => 0.75,
            Self::Medium => 1.0,
            Self::Large => 1.6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperienceLevel {
    Beginner,
    #[default]
    Intermediate,
    Expert,
}

impl ExperienceLevel {
    pub fn effort_factor(self) -> f64 {
        match self {
            Self::Beginner => 1.5,
            Self::Intermediate => 1.0,
            Self::Expert => 0.8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityBar {
    Prototype,
    #[default]
    Standard,
    Production,
}

/// Inputs that shape decomposition and estimates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanningContext {
    pub project_root: PathBuf,
    #[serde(default)]
    pub project_size: SizeClass,
    #[serde(default)]
    pub experience: ExperienceLevel,
    #[serde(default)]
    pub quality: QualityBar,
    /// Shell command run by the verification task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_command: Option<String>,
}

impl PlanningContext {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            project_size: SizeClass::default(),
            experience: ExperienceLevel::default(),
            quality: QualityBar::default(),
            verify_command: None,
        }
    }
}

impl Default for PlanningContext {
    fn default() -> Self {
        Self::new(".")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub message: String,
    pub category: ErrorCategory,
    pub suggestion: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Minutes
    pub estimated_duration: u32,
    #[serde(default)]
    pub tools_required: Vec<String>,
    #[serde(default)]
    pub files_involved: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Concrete calls run through the orchestrator for this task
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<TaskError>,
    #[serde(default)]
    pub retries_attempted: u32,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            task_type,
            priority: TaskPriority::Medium,
            status: TaskStatus::Pending,
            dependencies: Vec::new(),
            estimated_duration: 0,
            tools_required: Vec::new(),
            files_involved: Vec::new(),
            acceptance_criteria: Vec::new(),
            tool_calls: Vec::new(),
            created: Utc::now(),
            started: None,
            completed: None,
            result: None,
            error: None,
            retries_attempted: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PlanProgress {
    pub completed: usize,
    #[serde(default)]
    pub failed: usize,
    pub total: usize,
    pub percentage: f64,
}

impl PlanProgress {
    pub fn new(completed: usize, failed: usize, total: usize) -> Self {
        let percentage = if total == 0 {
            0.0
        } else {
            100.0 * completed as f64 / total as f64
        };
        Self {
            completed,
            failed,
            total,
            percentage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlanMetadata {
    pub complexity: Complexity,
    /// In `[0, 1]`
    pub confidence: f64,
    /// Notes about how the plan deviated from the straightforward path
    #[serde(default)]
    pub adaptations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPlan {
    pub id: String,
    pub title: String,
    pub description: String,
    pub request: String,
    pub tasks: Vec<Task>,
    /// Projection of `tasks[*].dependencies`
    #[serde(default)]
    pub dependencies: BTreeMap<String, Vec<String>>,
    /// Minutes
    pub estimated_duration: u32,
    pub status: PlanStatus,
    pub progress: PlanProgress,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: PlanMetadata,
    pub risk_level: RiskLevel,
    pub context: PlanningContext,
}

impl TaskPlan {
    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    pub fn rebuild_dependencies(&mut self) {
        self.dependencies = self
            .tasks
            .iter()
            .map(|t| (t.id.clone(), t.dependencies.clone()))
            .collect();
    }

    /// Recount progress from task statuses.
    pub fn refresh_progress(&mut self) {
        let completed = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();
        let failed = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .count();
        self.progress = PlanProgress::new(completed, failed, self.tasks.len());
    }

    /// Task dependency graph. Fails on duplicate ids, dangling dependencies,
    /// or cycles.
    pub fn graph(&self) -> Result<DependencyGraph> {
        let mut graph = DependencyGraph::new();
        for task in &self.tasks {
            graph.add_node(&task.id, &task.title, task.dependencies.clone())?;
        }
        graph.recompute_dependents();

        if let Some((task_id, missing)) = graph.missing_dependencies().into_iter().next() {
            return Err(StratumError::Validation(format!(
                "task '{}' depends on unknown task '{}'",
                task_id, missing
            )));
        }
        graph.topological_sort()?;
        Ok(graph)
    }
}

/// Partial update of plan-level state.
#[derive(Debug, Clone, Default)]
pub struct PlanStatePatch {
    pub status: Option<PlanStatus>,
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
}

impl PlanStatePatch {
    pub fn status(status: PlanStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Partial update of one task.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub started: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<TaskError>,
    pub retries_attempted: Option<u32>,
    pub dependencies: Option<Vec<String>>,
}

impl TaskPatch {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Partial update of plan definition fields.
#[derive(Debug, Clone, Default)]
pub struct PlanPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub tasks: Option<Vec<Task>>,
    pub metadata: Option<PlanMetadata>,
    pub risk_level: Option<RiskLevel>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub title: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retries_attempted: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PlanMetrics {
    pub duration_ms: u64,
    pub tool_calls: usize,
    pub cache_hits: usize,
    pub retries: u32,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub tasks_skipped: usize,
}

/// Outcome record kept separately from the plan definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResults {
    pub plan_id: String,
    pub status: PlanStatus,
    pub task_outcomes: Vec<TaskOutcome>,
    pub files_involved: Vec<String>,
    pub metrics: PlanMetrics,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_with(tasks: Vec<Task>) -> TaskPlan {
        let mut plan = TaskPlan {
            id: "p".into(),
            title: "t".into(),
            description: String::new(),
            request: String::new(),
            tasks,
            dependencies: BTreeMap::new(),
            estimated_duration: 0,
            status: PlanStatus::Planning,
            progress: PlanProgress::default(),
            created: Utc::now(),
            started: None,
            completed: None,
            metadata: PlanMetadata::default(),
            risk_level: RiskLevel::Low,
            context: PlanningContext::default(),
        };
        plan.rebuild_dependencies();
        plan.refresh_progress();
        plan
    }

    #[test]
    fn progress_percentage() {
        assert_eq!(PlanProgress::new(0, 0, 0).percentage, 0.0);
        assert_eq!(PlanProgress::new(1, 0, 4).percentage, 25.0);
        assert_eq!(PlanProgress::new(3, 0, 3).percentage, 100.0);
    }

    #[test]
    fn dependencies_projection_follows_tasks() {
        let mut b = Task::new("b", "B", TaskType::Implementation);
        b.dependencies = vec!["a".into()];
        let mut plan = plan_with(vec![Task::new("a", "A", TaskType::Analysis), b]);

        assert_eq!(plan.dependencies["b"], vec!["a".to_string()]);
        plan.tasks.pop();
        plan.rebuild_dependencies();
        assert!(!plan.dependencies.contains_key("b"));
    }

    #[test]
    fn graph_rejects_dangling_and_cyclic_tasks() {
        let mut a = Task::new("a", "A", TaskType::Analysis);
        a.dependencies = vec!["ghost".into()];
        assert!(matches!(
            plan_with(vec![a]).graph(),
            Err(StratumError::Validation(_))
        ));

        let mut a = Task::new("a", "A", TaskType::Analysis);
        a.dependencies = vec!["b".into()];
        let mut b = Task::new("b", "B", TaskType::Analysis);
        b.dependencies = vec!["a".into()];
        assert!(matches!(
            plan_with(vec![a, b]).graph(),
            Err(StratumError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            PlanStatus::Planning,
            PlanStatus::Executing,
            PlanStatus::Completed,
            PlanStatus::Failed,
            PlanStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<PlanStatus>().unwrap(), status);
        }
        assert!(PlanStatus::Completed.is_finished());
        assert!(!PlanStatus::Cancelled.is_finished());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Skipped.is_terminal());
    }

    #[test]
    fn task_type_serializes_as_type() {
        let value = serde_json::to_value(Task::new("a", "A", TaskType::Testing)).unwrap();
        assert_eq!(value["type"], "testing");
        assert_eq!(value["status"], "pending");
    }
}
