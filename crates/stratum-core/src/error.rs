//! Error taxonomy for planning and orchestration
//!
//! `StratumError` is what library operations return. Tool failures are
//! classified into an `ErrorCategory` which drives both retry decisions and
//! the remediation hint shown to the user.

use serde::{Deserialize, Serialize};
use std::fmt;

pub type Result<T, E = StratumError> = std::result::Result<T, E>;

/// Broad failure category for a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    NotFound,
    Permission,
    Timeout,
    Network,
    Validation,
    Cancelled,
    Unknown,
}

impl ErrorCategory {
    /// Classify a free-form failure message.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if lower.contains("invalid parameters")
            || lower.contains("missing field")
            || lower.contains("unknown field")
            || lower.contains("invalid type")
        {
            Self::Validation
        } else if lower.contains("timed out") || lower.contains("timeout") {
            Self::Timeout
        } else if lower.contains("cancelled") || lower.contains("canceled") {
            Self::Cancelled
        } else if lower.contains("permission")
            || lower.contains("access denied")
            || lower.contains("denied")
            || lower.contains("outside workspace")
        {
            Self::Permission
        } else if lower.contains("not found")
            || lower.contains("no such file")
            || lower.contains("unknown tool")
        {
            Self::NotFound
        } else if lower.contains("connection")
            || lower.contains("network")
            || lower.contains("dns")
            || lower.contains("unreachable")
        {
            Self::Network
        } else {
            Self::Unknown
        }
    }

    /// Remediation hint shown next to a failure.
    pub fn suggestion(self) -> &'static str {
        match self {
            Self::NotFound => "Check that the file, path, or tool name exists",
            Self::Permission => "Check file permissions and that the path is inside the project",
            Self::Timeout => "The operation took too long; retry or raise the tool timeout",
            Self::Network => "Check network connectivity and retry",
            Self::Validation => "Check the parameters passed to the tool",
            Self::Cancelled => "The operation was cancelled; resume the plan to continue",
            Self::Unknown => "Inspect the error output and adjust the request",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Permission => "permission",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Validation => "validation",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }

    /// Whether a failure of this category can succeed on another attempt.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Timeout | Self::Network | Self::Unknown)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by stratum operations.
#[derive(Debug, thiserror::Error)]
pub enum StratumError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("cyclic dependency: {}", .path.join(" -> "))]
    CyclicDependency { path: Vec<String> },

    #[error("tool execution failed ({category}): {message}")]
    ToolExecution {
        category: ErrorCategory,
        message: String,
        suggestion: String,
    },

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("operation cancelled")]
    Cancelled,

    #[error("plan {0} is already being executed")]
    PlanBusy(String),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl StratumError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn tool(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self::ToolExecution {
            category,
            message: message.into(),
            suggestion: category.suggestion().to_string(),
        }
    }

    /// Category used in user-facing envelopes.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound { .. } => "not_found",
            Self::CyclicDependency { .. } => "cyclic_dependency",
            Self::ToolExecution { category, .. } => category.as_str(),
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::PlanBusy(_) => "plan_busy",
            Self::Storage(_) => "storage",
        }
    }

    /// Remediation hint for user-facing output, when one applies.
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::ToolExecution { suggestion, .. } => Some(suggestion.clone()),
            Self::CyclicDependency { .. } => {
                Some("Remove one of the dependencies forming the cycle".to_string())
            }
            Self::NotFound { kind, .. } => Some(format!("List available {kind}s and check the id")),
            Self::Timeout(_) => Some(ErrorCategory::Timeout.suggestion().to_string()),
            Self::PlanBusy(_) => {
                Some("Wait for the running execution to finish, or cancel it".to_string())
            }
            Self::Cancelled => Some(ErrorCategory::Cancelled.suggestion().to_string()),
            Self::Validation(_) | Self::Storage(_) => None,
        }
    }
}

impl From<rusqlite::Error> for StratumError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.into())
    }
}

impl From<serde_json::Error> for StratumError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(err.into())
    }
}
