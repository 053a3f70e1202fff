//! Tool registry for managing available tools
//!
//! Resolves a tool name to an implementation and runs it with parameter
//! validation, a per-call timeout, and cancellation.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::ErrorCategory;
use crate::retry::IsRetryable;

/// Default tool execution timeout (2 minutes)
const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// Failure reported by a tool.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ToolError {
    pub category: ErrorCategory,
    pub message: String,
}

impl ToolError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }

    /// Create an error, deriving the category from the message
    pub fn classified(message: impl std::fmt::Display) -> Self {
        let message = message.to_string();
        Self {
            category: ErrorCategory::classify(&message),
            message,
        }
    }

    pub fn invalid_parameters(message: impl std::fmt::Display) -> Self {
        Self::new(ErrorCategory::Validation, message.to_string())
    }

    pub fn suggestion(&self) -> &'static str {
        self.category.suggestion()
    }
}

impl IsRetryable for ToolError {
    fn is_retryable(&self) -> bool {
        self.category.is_transient()
    }
}

pub type ToolOutput = Result<Value, ToolError>;

/// Parse tool parameters, returning a validation error on failure
pub fn parse_params<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, ToolError> {
    serde_json::from_value(params)
        .map_err(|e| ToolError::invalid_parameters(format!("Invalid parameters: {}", e)))
}

/// Context for tool execution
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub working_dir: PathBuf,
    /// If set, all file operations must stay within this directory.
    pub sandbox_root: Option<PathBuf>,
    /// Optional per-call timeout override
    pub timeout: Option<Duration>,
    /// Fired when the surrounding batch or plan is cancelled
    pub cancel: CancellationToken,
}

impl Default for ToolContext {
    fn default() -> Self {
        Self {
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            sandbox_root: None,
            timeout: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl ToolContext {
    pub fn new(working_dir: PathBuf) -> Self {
        Self {
            working_dir,
            ..Default::default()
        }
    }

    /// Set sandbox root for path isolation.
    pub fn with_sandbox(mut self, sandbox_root: PathBuf) -> Self {
        self.sandbox_root = Some(sandbox_root);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Resolve a path relative to working directory (absolute paths pass through)
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let p = PathBuf::from(path);
        if p.is_absolute() {
            p
        } else {
            self.working_dir.join(p)
        }
    }

    /// Resolve an existing path with sandbox enforcement.
    ///
    /// Returns an error if the path escapes the sandbox via symlinks or `..`.
    pub fn sandboxed_resolve(&self, path: &str) -> Result<PathBuf, ToolError> {
        let resolved = self.resolve_path(path);

        let Some(ref sandbox) = self.sandbox_root else {
            return Ok(resolved);
        };

        let canonical = resolved.canonicalize().map_err(|e| {
            ToolError::new(
                ErrorCategory::NotFound,
                format!("Path not found '{}': {}", path, e),
            )
        })?;

        if !canonical.starts_with(sandbox) {
            return Err(ToolError::new(
                ErrorCategory::Permission,
                format!("Access denied: path '{}' is outside workspace", path),
            ));
        }

        Ok(canonical)
    }

    /// Resolve a path that may not exist yet (for write operations) with sandbox enforcement.
    pub fn sandboxed_resolve_new_path(&self, path: &str) -> Result<PathBuf, ToolError> {
        let resolved = self.resolve_path(path);

        let Some(ref sandbox) = self.sandbox_root else {
            return Ok(resolved);
        };

        if resolved
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(ToolError::new(
                ErrorCategory::Permission,
                "Access denied: path traversal (..) not allowed",
            ));
        }

        // Nearest existing ancestor decides containment
        let mut check = resolved.clone();
        while !check.exists() {
            if !check.pop() {
                break;
            }
        }

        let base = if check.as_os_str().is_empty() {
            sandbox.clone()
        } else {
            check.canonicalize().map_err(ToolError::classified)?
        };

        if !base.starts_with(sandbox) {
            return Err(ToolError::new(
                ErrorCategory::Permission,
                "Access denied: path is outside workspace",
            ));
        }

        Ok(resolved)
    }
}

/// Trait for tool implementations
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (id)
    fn name(&self) -> &str;

    /// Tool description for the language model
    fn description(&self) -> &str;

    /// JSON schema for parameters
    fn parameters_schema(&self) -> Value;

    /// Safe to run again after a failure (idempotent, no partial side effects)
    fn retryable(&self) -> bool {
        false
    }

    /// Results depend only on parameters and may be memoized
    fn cacheable(&self) -> bool {
        false
    }

    /// Check parameters before execution. The default checks that the
    /// parameters are an object carrying every `required` schema field.
    fn validate_params(&self, params: &Value) -> Result<(), String> {
        let Some(object) = params.as_object() else {
            return Err("parameters must be a JSON object".to_string());
        };

        let schema = self.parameters_schema();
        let required = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|fields| fields.iter().filter_map(Value::as_str).collect::<Vec<_>>())
            .unwrap_or_default();

        match required.iter().find(|field| !object.contains_key(**field)) {
            Some(missing) => Err(format!("missing field `{}`", missing)),
            None => Ok(()),
        }
    }

    async fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn dispose(&self) {}

    /// Execute the tool
    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolOutput;
}

/// Registry for managing tools
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
    /// Default timeout for tool execution
    default_timeout: Duration,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Arc::new(RwLock::new(HashMap::new())),
            default_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Register a tool
    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        let mut tools = self.tools.write().await;
        if tools.insert(name.clone(), tool).is_some() {
            tracing::debug!("Replaced tool: {}", name);
        }
    }

    /// Get a tool by name
    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let tools = self.tools.read().await;
        tools.get(name).cloned()
    }

    /// Registered tool names, sorted
    pub async fn names(&self) -> Vec<String> {
        let tools = self.tools.read().await;
        let mut names: Vec<String> = tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run every tool's `initialize` hook.
    pub async fn initialize_all(&self) -> anyhow::Result<()> {
        let tools: Vec<Arc<dyn Tool>> = self.tools.read().await.values().cloned().collect();
        for tool in tools {
            tool.initialize().await.map_err(|e| {
                anyhow::anyhow!("Failed to initialize tool '{}': {}", tool.name(), e)
            })?;
        }
        Ok(())
    }

    /// Run every tool's `dispose` hook.
    pub async fn dispose_all(&self) {
        let tools: Vec<Arc<dyn Tool>> = self.tools.read().await.values().cloned().collect();
        for tool in tools {
            tool.dispose().await;
        }
    }

    /// Execute a tool by name with validation, timeout, and cancellation
    pub async fn execute(&self, name: &str, params: Value, ctx: &ToolContext) -> ToolOutput {
        let Some(tool) = self.get(name).await else {
            return Err(ToolError::new(
                ErrorCategory::NotFound,
                format!("Unknown tool: {}", name),
            ));
        };

        tool.validate_params(&params)
            .map_err(|e| ToolError::invalid_parameters(format!("Invalid parameters: {}", e)))?;

        let timeout = ctx.timeout.unwrap_or(self.default_timeout);

        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(ToolError::new(
                ErrorCategory::Cancelled,
                format!("Tool '{}' cancelled", name),
            )),
            result = tokio::time::timeout(timeout, tool.execute(params, ctx)) => match result {
                Ok(output) => output,
                Err(_) => {
                    tracing::warn!(
                        tool = name,
                        timeout_secs = timeout.as_secs(),
                        "Tool execution timed out"
                    );
                    Err(ToolError::new(
                        ErrorCategory::Timeout,
                        format!("Tool '{}' timed out after {} seconds", name, timeout.as_secs()),
                    ))
                }
            }
        }
    }
}

/// Best-effort display path relative to `base`.
pub fn display_relative(path: &Path, base: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .to_string_lossy()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo parameters back"
        }

        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            })
        }

        async fn execute(&self, params: Value, _ctx: &ToolContext) -> ToolOutput {
            Ok(params)
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "Sleeps"
        }

        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }

        async fn execute(&self, _params: Value, _ctx: &ToolContext) -> ToolOutput {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        }
    }

    fn test_context() -> ToolContext {
        ToolContext::new(PathBuf::from("/tmp"))
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let registry = ToolRegistry::new();
        let err = registry
            .execute("nonexistent_tool", json!({}), &test_context())
            .await
            .unwrap_err();
        assert_eq!(err.category, ErrorCategory::NotFound);
    }

    #[tokio::test]
    async fn executes_registered_tool() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).await;

        let output = registry
            .execute("echo", json!({"text": "hi"}), &test_context())
            .await
            .unwrap();
        assert_eq!(output["text"], "hi");
        assert_eq!(registry.names().await, vec!["echo"]);
    }

    #[tokio::test]
    async fn missing_required_field_fails_validation() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).await;

        let err = registry
            .execute("echo", json!({}), &test_context())
            .await
            .unwrap_err();
        assert_eq!(err.category, ErrorCategory::Validation);
        assert!(err.message.contains("text"));
    }

    #[tokio::test]
    async fn timeout_is_reported() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(SlowTool)).await;

        let ctx = test_context().with_timeout(Duration::from_millis(20));
        let err = registry.execute("slow", json!({}), &ctx).await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Timeout);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn cancellation_stops_execution() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(SlowTool)).await;

        let ctx = test_context();
        ctx.cancel.cancel();
        let err = registry.execute("slow", json!({}), &ctx).await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Cancelled);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn parse_params_reports_invalid_parameters() {
        #[derive(serde::Deserialize, Debug)]
        struct Params {
            #[serde(rename = "name")]
            _name: String,
        }

        let err = parse_params::<Params>(json!({"name": 123})).unwrap_err();
        assert_eq!(err.category, ErrorCategory::Validation);
        assert!(err.message.contains("Invalid parameters"));
    }

    #[test]
    fn sandboxed_resolve_new_path_rejects_traversal() {
        let ctx = ToolContext {
            working_dir: PathBuf::from("/sandbox/project"),
            sandbox_root: Some(PathBuf::from("/sandbox")),
            ..Default::default()
        };

        let err = ctx
            .sandboxed_resolve_new_path("../../../etc/passwd")
            .unwrap_err();
        assert_eq!(err.category, ErrorCategory::Permission);
    }

    #[test]
    fn sandboxed_resolve_new_path_without_sandbox_passes_through() {
        let ctx = ToolContext::new(PathBuf::from("/home/user"));
        assert!(ctx.sandboxed_resolve_new_path("../other/file.txt").is_ok());
    }
}
