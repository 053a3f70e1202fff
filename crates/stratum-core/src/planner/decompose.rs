//! Request decomposition
//!
//! A [`Decomposer`] turns a natural-language request into task drafts. The
//! model-backed decomposer asks a [`CompletionClient`] for JSON; the
//! heuristic decomposer works from request keywords and never fails.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::{ErrorCategory, Result, StratumError};
use crate::orchestrator::ToolCall;
use crate::plan::{PlanningContext, QualityBar, TaskPriority, TaskType};

static FILE_MENTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|[\s`'(])((?:[\w.-]+/)*[\w-]+\.[A-Za-z0-9]{1,8})\b").expect("valid regex")
});

static JSON_FENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)```").expect("valid regex"));

/// A task as proposed by a decomposer, before ids, timestamps, and
/// estimates are finalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDraft {
    /// Draft-local key referenced by `dependencies`
    pub key: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(default = "default_priority")]
    pub priority: TaskPriority,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Base estimate in minutes before context scaling
    #[serde(default, alias = "estimated_minutes")]
    pub estimated_duration: Option<u32>,
    #[serde(default, alias = "tools")]
    pub tools_required: Vec<String>,
    #[serde(default, alias = "files")]
    pub files_involved: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

fn default_priority() -> TaskPriority {
    TaskPriority::Medium
}

impl TaskDraft {
    pub fn new(key: impl Into<String>, title: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            key: key.into(),
            title: title.into(),
            description: String::new(),
            task_type,
            priority: TaskPriority::Medium,
            dependencies: Vec::new(),
            estimated_duration: None,
            tools_required: Vec::new(),
            files_involved: Vec::new(),
            acceptance_criteria: Vec::new(),
            tool_calls: Vec::new(),
        }
    }
}

/// Base estimate in minutes for a task type
pub fn base_estimate(task_type: TaskType) -> u32 {
    match task_type {
        TaskType::Analysis => 10,
        TaskType::Implementation => 30,
        TaskType::Testing => 15,
        TaskType::Review => 15,
        TaskType::Documentation => 20,
        TaskType::Refactoring => 40,
        TaskType::Configuration => 15,
    }
}

#[async_trait]
pub trait Decomposer: Send + Sync {
    fn name(&self) -> &str;

    async fn decompose(
        &self,
        request: &str,
        ctx: &PlanningContext,
        available_tools: &[String],
    ) -> Result<Vec<TaskDraft>>;
}

// ============================================================================
// Language-model collaborator
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<CompletionMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompletionResponse {
    Text(String),
    ToolCalls(Vec<ToolCall>),
}

/// Completion endpoint of a language model provider.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> anyhow::Result<CompletionResponse>;
}

/// Asks the model for a JSON task list.
pub struct ModelDecomposer {
    client: Arc<dyn CompletionClient>,
    temperature: f32,
    max_tokens: u32,
}

impl ModelDecomposer {
    pub fn new(client: Arc<dyn CompletionClient>) -> Self {
        Self {
            client,
            temperature: 0.2,
            max_tokens: 4096,
        }
    }

    fn build_request(
        &self,
        request: &str,
        ctx: &PlanningContext,
        available_tools: &[String],
    ) -> CompletionRequest {
        let system = format!(
            "You break software engineering requests into a small set of dependent tasks.\n\
             Respond with JSON only: {{\"tasks\": [{{\"key\", \"title\", \"description\", \"type\", \
             \"priority\", \"dependencies\", \"estimated_minutes\", \"tools\", \"files\", \
             \"acceptance_criteria\", \"tool_calls\"}}]}}.\n\
             type is one of analysis, implementation, testing, review, documentation, refactoring, configuration.\n\
             priority is one of low, medium, high, critical.\n\
             tool_calls entries are {{\"id\", \"tool_name\", \"parameters\", \"depends_on\"}} using only these tools: {}.",
            available_tools.join(", ")
        );
        let user = format!(
            "Project root: {}\nProject size: {:?}\nExperience: {:?}\nQuality bar: {:?}\n{}\nRequest: {}",
            ctx.project_root.display(),
            ctx.project_size,
            ctx.experience,
            ctx.quality,
            ctx.verify_command
                .as_deref()
                .map(|c| format!("Verify command: {}", c))
                .unwrap_or_default(),
            request
        );

        CompletionRequest {
            messages: vec![
                CompletionMessage {
                    role: Role::System,
                    content: system,
                },
                CompletionMessage {
                    role: Role::User,
                    content: user,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

#[async_trait]
impl Decomposer for ModelDecomposer {
    fn name(&self) -> &str {
        "model"
    }

    async fn decompose(
        &self,
        request: &str,
        ctx: &PlanningContext,
        available_tools: &[String],
    ) -> Result<Vec<TaskDraft>> {
        let completion = self
            .client
            .complete(self.build_request(request, ctx, available_tools))
            .await
            .map_err(|e| {
                let message = format!("{:#}", e);
                StratumError::tool(ErrorCategory::classify(&message), message)
            })?;

        match completion {
            CompletionResponse::Text(text) => parse_drafts(&text),
            CompletionResponse::ToolCalls(calls) if calls.is_empty() => Err(
                StratumError::Validation("model suggested no tool calls".to_string()),
            ),
            CompletionResponse::ToolCalls(calls) => {
                let mut draft = TaskDraft::new("task-1", summarize(request), TaskType::Implementation);
                draft.description = request.to_string();
                draft.tools_required = unique_tools(&calls);
                draft.tool_calls = calls;
                Ok(vec![draft])
            }
        }
    }
}

/// Parse the model's answer: a `{"tasks": [...]}` object or a bare array,
/// optionally inside a fenced code block.
pub fn parse_drafts(text: &str) -> Result<Vec<TaskDraft>> {
    let body = JSON_FENCE_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(text)
        .trim();

    let value: Value = serde_json::from_str(body)
        .map_err(|e| StratumError::Validation(format!("model output is not JSON: {}", e)))?;

    let tasks = match value {
        Value::Object(mut map) => map.remove("tasks").ok_or_else(|| {
            StratumError::Validation("model output has no \"tasks\" field".to_string())
        })?,
        array @ Value::Array(_) => array,
        _ => {
            return Err(StratumError::Validation(
                "model output must be an object or array".to_string(),
            ))
        }
    };

    let drafts: Vec<TaskDraft> = serde_json::from_value(tasks)
        .map_err(|e| StratumError::Validation(format!("model tasks are malformed: {}", e)))?;
    if drafts.is_empty() {
        return Err(StratumError::Validation("model proposed no tasks".to_string()));
    }
    Ok(drafts)
}

fn unique_tools(calls: &[ToolCall]) -> Vec<String> {
    let mut tools: Vec<String> = calls.iter().map(|c| c.tool_name.clone()).collect();
    tools.sort();
    tools.dedup();
    tools
}

/// First line of the request, shortened for a title.
pub fn summarize(request: &str) -> String {
    const MAX_TITLE: usize = 60;
    let line = request.lines().next().unwrap_or_default().trim();
    if line.chars().count() <= MAX_TITLE {
        return line.to_string();
    }
    let mut title: String = line.chars().take(MAX_TITLE - 3).collect();
    title.push_str("...");
    title
}

// ============================================================================
// Heuristic decomposition
// ============================================================================

/// Keyword-driven decomposition: analyze, do the work, verify, review.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicDecomposer;

impl HeuristicDecomposer {
    fn classify(request: &str) -> TaskType {
        let lower = request.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));

        if has(&["refactor", "clean up", "cleanup", "restructure", "rename"]) {
            TaskType::Refactoring
        } else if has(&["fix", "bug", "crash", "error", "broken"]) {
            TaskType::Implementation
        } else if has(&["test", "coverage"]) {
            TaskType::Testing
        } else if has(&["document", "docs", "readme", "comment"]) {
            TaskType::Documentation
        } else if has(&["config", "setup", "set up", "install", "ci "]) {
            TaskType::Configuration
        } else if has(&["review", "audit", "inspect"]) {
            TaskType::Review
        } else {
            TaskType::Implementation
        }
    }

    /// File paths mentioned in the request that exist under the project root.
    fn mentioned_files(request: &str, ctx: &PlanningContext) -> Vec<String> {
        let mut files: Vec<String> = Vec::new();
        for mention in FILE_MENTION_RE.captures_iter(request).filter_map(|c| c.get(1)) {
            let path = mention.as_str();
            if !files.iter().any(|f| f == path) && ctx.project_root.join(path).is_file() {
                files.push(path.to_string());
            }
        }
        files
    }

    pub fn drafts(&self, request: &str, ctx: &PlanningContext) -> Vec<TaskDraft> {
        let main_type = Self::classify(request);
        let files = Self::mentioned_files(request, ctx);
        let root = ctx.project_root.display().to_string();

        let mut analysis = TaskDraft::new("analyze", "Analyze project structure", TaskType::Analysis);
        analysis.description = format!("Survey the project and the files relevant to: {}", request);
        analysis.priority = TaskPriority::High;
        analysis.tools_required = vec!["list".to_string()];
        analysis.files_involved = files.clone();
        analysis.acceptance_criteria = vec!["Relevant files and modules identified".to_string()];
        analysis.tool_calls.push(ToolCall::new(
            "list-root",
            "list",
            json!({"path": root, "depth": 2}),
        ));
        for (i, file) in files.iter().enumerate() {
            analysis.tool_calls.push(ToolCall::new(
                format!("read-{}", i + 1),
                "read",
                json!({"file_path": file}),
            ));
        }
        if !files.is_empty() {
            analysis.tools_required.push("read".to_string());
        }

        let mut main = TaskDraft::new("main", summarize(request), main_type);
        main.description = request.to_string();
        main.priority = TaskPriority::High;
        main.dependencies = vec![analysis.key.clone()];
        main.tools_required = vec!["read".to_string(), "write".to_string()];
        main.files_involved = files;
        main.acceptance_criteria = vec![format!("Request satisfied: {}", summarize(request))];

        let mut drafts = vec![analysis, main];

        if let Some(command) = &ctx.verify_command {
            let mut verify = TaskDraft::new("verify", "Verify changes", TaskType::Testing);
            verify.description = format!("Run `{}` and confirm it passes", command);
            verify.priority = TaskPriority::High;
            verify.dependencies = vec!["main".to_string()];
            verify.tools_required = vec!["bash".to_string()];
            verify.acceptance_criteria = vec![format!("`{}` exits successfully", command)];
            verify.tool_calls.push(ToolCall::new(
                "verify-command",
                "bash",
                json!({"command": command}),
            ));
            drafts.push(verify);
        }

        if ctx.quality == QualityBar::Production {
            let last = drafts
                .last()
                .map(|d| d.key.clone())
                .unwrap_or_else(|| "main".to_string());
            let mut review = TaskDraft::new("review", "Review changes", TaskType::Review);
            review.description = "Check the change against the acceptance criteria and project conventions".to_string();
            review.priority = TaskPriority::Medium;
            review.dependencies = vec![last];
            review.tools_required = vec!["read".to_string()];
            review.acceptance_criteria = vec!["No open review findings".to_string()];
            drafts.push(review);
        }

        drafts
    }
}

#[async_trait]
impl Decomposer for HeuristicDecomposer {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn decompose(
        &self,
        request: &str,
        ctx: &PlanningContext,
        _available_tools: &[String],
    ) -> Result<Vec<TaskDraft>> {
        Ok(self.drafts(request, ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct ScriptedClient(anyhow::Result<CompletionResponse>);

    #[async_trait]
    impl CompletionClient for ScriptedClient {
        async fn complete(&self, request: CompletionRequest) -> anyhow::Result<CompletionResponse> {
            assert_eq!(request.messages.len(), 2);
            match &self.0 {
                Ok(response) => Ok(response.clone()),
                Err(e) => Err(anyhow::anyhow!("{}", e)),
            }
        }
    }

    #[test]
    fn parses_fenced_object() {
        let text = r#"Here is the plan:
```json
{"tasks": [
  {"key": "a", "title": "Look around", "type": "analysis"},
  {"key": "b", "title": "Change it", "type": "implementation", "dependencies": ["a"],
   "estimated_minutes": 25, "tools": ["write"]}
]}
```"#;
        let drafts = parse_drafts(text).unwrap();
        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[1].dependencies, vec!["a"]);
        assert_eq!(drafts[1].estimated_duration, Some(25));
        assert_eq!(drafts[1].tools_required, vec!["write"]);
        assert_eq!(drafts[0].priority, TaskPriority::Medium);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_drafts("I cannot help with that").is_err());
        assert!(parse_drafts("{\"tasks\": []}").is_err());
        assert!(parse_drafts("{\"steps\": []}").is_err());
    }

    #[tokio::test]
    async fn model_tool_calls_become_one_task() {
        let client = ScriptedClient(Ok(CompletionResponse::ToolCalls(vec![
            ToolCall::new("c1", "read", json!({"file_path": "a.rs"})),
            ToolCall::new("c2", "read", json!({"file_path": "b.rs"})),
        ])));
        let drafts = ModelDecomposer::new(Arc::new(client))
            .decompose("inspect a.rs and b.rs", &PlanningContext::default(), &[])
            .await
            .unwrap();

        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].tool_calls.len(), 2);
        assert_eq!(drafts[0].tools_required, vec!["read"]);
    }

    #[tokio::test]
    async fn model_failure_is_an_error() {
        let client = ScriptedClient(Err(anyhow::anyhow!("connection refused")));
        let err = ModelDecomposer::new(Arc::new(client))
            .decompose("anything", &PlanningContext::default(), &[])
            .await
            .unwrap_err();
        assert_eq!(err.category(), "network");
    }

    #[test]
    fn heuristic_classifies_request() {
        let temp = TempDir::new().unwrap();
        let ctx = PlanningContext::new(temp.path());
        let drafts = HeuristicDecomposer.drafts("Fix the crash on empty input", &ctx);

        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[0].task_type, TaskType::Analysis);
        assert_eq!(drafts[1].task_type, TaskType::Implementation);
        assert_eq!(drafts[1].title, "Fix the crash on empty input");
        assert_eq!(drafts[1].dependencies, vec!["analyze"]);
    }

    #[test]
    fn heuristic_reads_mentioned_files_and_adds_verification() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join("src")).unwrap();
        std::fs::write(temp.path().join("src/main.rs"), "fn main() {}").unwrap();

        let mut ctx = PlanningContext::new(temp.path());
        ctx.verify_command = Some("cargo test".to_string());
        ctx.quality = QualityBar::Production;

        let drafts =
            HeuristicDecomposer.drafts("Refactor src/main.rs and ghost.rs for clarity", &ctx);
        let keys: Vec<&str> = drafts.iter().map(|d| d.key.as_str()).collect();
        assert_eq!(keys, vec!["analyze", "main", "verify", "review"]);

        let analysis = &drafts[0];
        assert_eq!(analysis.files_involved, vec!["src/main.rs"]);
        assert!(analysis.tool_calls.iter().any(|c| c.tool_name == "read"));
        assert_eq!(drafts[1].task_type, TaskType::Refactoring);
        assert_eq!(drafts[2].tool_calls[0].parameters["command"], "cargo test");
        assert_eq!(drafts[3].dependencies, vec!["verify"]);
    }

    #[test]
    fn summarize_truncates_long_requests() {
        let long = "x".repeat(200);
        assert_eq!(summarize(&long).chars().count(), 60);
        assert_eq!(summarize("short\nsecond line"), "short");
    }
}
