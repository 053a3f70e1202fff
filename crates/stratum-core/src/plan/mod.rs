//! Plan data model and durable plan state

pub mod manager;
pub mod model;

pub use manager::{PlanLease, PlanStateManager};
pub use model::{
    Complexity, ExperienceLevel, PlanMetadata, PlanMetrics, PlanPatch, PlanProgress, PlanResults,
    PlanStatePatch, PlanStatus, PlanningContext, QualityBar, RiskLevel, SizeClass, Task, TaskError,
    TaskOutcome, TaskPatch, TaskPlan, TaskPriority, TaskStatus, TaskType,
};
