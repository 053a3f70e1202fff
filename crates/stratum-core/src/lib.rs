//! Stratum Core
//!
//! Task planning and tool orchestration for a coding assistant:
//! - Dependency-aware batch execution of tool calls with caching and retries
//! - Request decomposition into persisted, resumable task plans
//! - SQLite-backed plan state with single-writer leases

pub mod cache;
pub mod config;
pub mod error;
pub mod graph;
pub mod orchestrator;
pub mod paths;
pub mod plan;
pub mod planner;
pub mod retry;
pub mod service;
pub mod storage;
pub mod tools;

pub use cache::{CacheConfig, ResultCache};
pub use config::StratumConfig;
pub use error::{ErrorCategory, Result, StratumError};
pub use graph::DependencyGraph;
pub use orchestrator::{OrchestratorConfig, ToolCall, ToolOrchestrator, ToolResult};
pub use plan::{PlanStateManager, PlanStatus, PlanningContext, TaskPlan, TaskStatus};
pub use planner::{FailurePolicy, PlannerConfig, TaskPlanner};
pub use retry::{RetryConfig, RetryStrategy};
pub use service::{Envelope, PlanningService, StratumServices};
pub use tools::{Tool, ToolContext, ToolRegistry};
