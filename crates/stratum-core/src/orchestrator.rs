//! Tool orchestrator
//!
//! Executes a batch of interdependent tool calls. Calls are grouped into
//! dependency levels; each level runs concurrently under a semaphore and the
//! next level starts only after every call in the current one has finished.
//! Each call goes through cache lookup, then (retry-wrapped when the tool
//! allows it) execution, then cache store.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use crate::cache::ResultCache;
use crate::error::{ErrorCategory, Result, StratumError};
use crate::graph::DependencyGraph;
use crate::retry::{Retried, RetryContext, RetryFailure, RetryStrategy};
use crate::tools::{ToolContext, ToolError, ToolRegistry};

/// Configuration for the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum calls running at once within a level
    pub max_concurrency: usize,
    /// Applied when the caller's context carries no timeout
    pub tool_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            tool_timeout: Duration::from_secs(120),
        }
    }
}

fn empty_params() -> Value {
    Value::Object(Default::default())
}

/// One unit of work inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub tool_name: String,
    #[serde(default = "empty_params")]
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, tool_name: impl Into<String>, parameters: Value) -> Self {
        Self {
            id: id.into(),
            tool_name: tool_name.into(),
            parameters,
            depends_on: Vec::new(),
        }
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Succeeded,
    Failed,
    /// A dependency failed, so the call never ran
    Skipped,
    /// Cancellation arrived before or during the call
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallError {
    pub category: ErrorCategory,
    pub message: String,
    pub suggestion: String,
}

impl CallError {
    fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            suggestion: category.suggestion().to_string(),
        }
    }
}

impl From<ToolError> for CallError {
    fn from(err: ToolError) -> Self {
        Self::new(err.category, err.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMetadata {
    /// Wall-clock execution time in fractional milliseconds; zero for cache hits
    pub duration_ms: f64,
    pub cached: bool,
    pub timestamp: DateTime<Utc>,
    pub retries_attempted: u32,
}

impl ResultMetadata {
    fn now(duration_ms: f64, cached: bool, retries_attempted: u32) -> Self {
        Self {
            duration_ms,
            cached,
            timestamp: Utc::now(),
            retries_attempted,
        }
    }
}

/// Outcome of one call. Exactly one per submitted call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub tool_name: String,
    pub success: bool,
    pub status: CallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CallError>,
    pub metadata: ResultMetadata,
}

impl ToolResult {
    fn succeeded(call: &ToolCall, output: Value, metadata: ResultMetadata) -> Self {
        Self {
            call_id: call.id.clone(),
            tool_name: call.tool_name.clone(),
            success: true,
            status: CallStatus::Succeeded,
            output: Some(output),
            error: None,
            metadata,
        }
    }

    fn unsuccessful(
        call: &ToolCall,
        status: CallStatus,
        error: CallError,
        metadata: ResultMetadata,
    ) -> Self {
        Self {
            call_id: call.id.clone(),
            tool_name: call.tool_name.clone(),
            success: false,
            status,
            output: None,
            error: Some(error),
            metadata,
        }
    }

    fn skipped(call: &ToolCall, failed_dependency: &str) -> Self {
        Self::unsuccessful(
            call,
            CallStatus::Skipped,
            CallError {
                category: ErrorCategory::Unknown,
                message: format!("Skipped: dependency '{}' did not succeed", failed_dependency),
                suggestion: "Fix the failed dependency and run again".to_string(),
            },
            ResultMetadata::now(0.0, false, 0),
        )
    }

    fn cancelled(call: &ToolCall) -> Self {
        Self::unsuccessful(
            call,
            CallStatus::Cancelled,
            CallError::new(ErrorCategory::Cancelled, "Cancelled before execution"),
            ResultMetadata::now(0.0, false, 0),
        )
    }
}

/// Progress notifications for a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    LevelStarted {
        level: usize,
        call_ids: Vec<String>,
    },
    CallStarted {
        call_id: String,
        tool_name: String,
    },
    CallFinished {
        call_id: String,
        status: CallStatus,
        cached: bool,
        duration_ms: f64,
    },
    LevelFinished {
        level: usize,
    },
}

/// Counts over a batch of results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub cache_hits: usize,
    pub retries: u32,
}

impl BatchSummary {
    pub fn from_results(results: &[ToolResult]) -> Self {
        let mut summary = Self {
            total: results.len(),
            ..Default::default()
        };
        for result in results {
            match result.status {
                CallStatus::Succeeded => summary.succeeded += 1,
                CallStatus::Failed => summary.failed += 1,
                CallStatus::Skipped => summary.skipped += 1,
                CallStatus::Cancelled => summary.cancelled += 1,
            }
            if result.metadata.cached {
                summary.cache_hits += 1;
            }
            summary.retries += result.metadata.retries_attempted;
        }
        summary
    }

    pub fn all_succeeded(&self) -> bool {
        self.succeeded == self.total
    }
}

pub struct ToolOrchestrator {
    registry: Arc<ToolRegistry>,
    cache: Arc<ResultCache>,
    retry: RetryStrategy,
    config: OrchestratorConfig,
    events: Option<mpsc::Sender<OrchestratorEvent>>,
}

impl ToolOrchestrator {
    pub fn new(
        registry: Arc<ToolRegistry>,
        cache: Arc<ResultCache>,
        retry: RetryStrategy,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            cache,
            retry,
            config,
            events: None,
        }
    }

    /// Publish progress events to a caller-owned bounded channel.
    pub fn with_events(mut self, events: mpsc::Sender<OrchestratorEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn retry_strategy(&self) -> &RetryStrategy {
        &self.retry
    }

    fn emit(&self, event: OrchestratorEvent) {
        let Some(tx) = &self.events else {
            return;
        };
        if let Err(mpsc::error::TrySendError::Full(event)) = tx.try_send(event) {
            debug!(?event, "Event channel full, dropping orchestrator event");
        }
    }

    /// Run a batch. Results come back in input order, one per call.
    ///
    /// Fails before executing anything when call ids are duplicated, a
    /// dependency names an unknown call, or the dependencies form a cycle.
    pub async fn execute_tools(
        &self,
        calls: &[ToolCall],
        ctx: &ToolContext,
    ) -> Result<Vec<ToolResult>> {
        let graph = build_graph(calls)?;
        let levels = graph.execution_levels()?;

        let position: HashMap<&str, usize> = calls
            .iter()
            .enumerate()
            .map(|(i, call)| (call.id.as_str(), i))
            .collect();
        let mut results: Vec<Option<ToolResult>> = vec![None; calls.len()];
        // call id -> the unsuccessful call that blocks it
        let mut blocked: HashMap<String, String> = HashMap::new();
        let semaphore = Semaphore::new(self.config.max_concurrency.max(1));
        let batch_start = Instant::now();

        info!(
            calls = calls.len(),
            levels = levels.len(),
            max_concurrency = self.config.max_concurrency,
            "Executing tool batch"
        );

        for (level_idx, level) in levels.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                info!(level = level_idx, "Batch cancelled, not dispatching further levels");
                break;
            }

            let mut runnable: Vec<&ToolCall> = Vec::with_capacity(level.len());
            for id in level {
                let call = &calls[position[id.as_str()]];
                match blocked.get(id) {
                    Some(cause) => {
                        debug!(call_id = %id, blocked_by = %cause, "Skipping call");
                        let result = ToolResult::skipped(call, cause);
                        self.emit(OrchestratorEvent::CallFinished {
                            call_id: id.clone(),
                            status: result.status,
                            cached: false,
                            duration_ms: 0.0,
                        });
                        results[position[id.as_str()]] = Some(result);
                    }
                    None => runnable.push(call),
                }
            }

            self.emit(OrchestratorEvent::LevelStarted {
                level: level_idx,
                call_ids: runnable.iter().map(|c| c.id.clone()).collect(),
            });

            let futures = runnable.iter().map(|call| {
                let semaphore = &semaphore;
                async move {
                    let Ok(_permit) = semaphore.acquire().await else {
                        return ToolResult::cancelled(call);
                    };
                    if ctx.cancel.is_cancelled() {
                        return ToolResult::cancelled(call);
                    }
                    self.run_call(call, ctx).await
                }
            });

            for result in join_all(futures).await {
                self.emit(OrchestratorEvent::CallFinished {
                    call_id: result.call_id.clone(),
                    status: result.status,
                    cached: result.metadata.cached,
                    duration_ms: result.metadata.duration_ms,
                });

                if result.status != CallStatus::Succeeded {
                    for dependent in graph.transitive_dependents(&result.call_id) {
                        blocked
                            .entry(dependent)
                            .or_insert_with(|| result.call_id.clone());
                    }
                }
                let idx = position[result.call_id.as_str()];
                results[idx] = Some(result);
            }

            self.emit(OrchestratorEvent::LevelFinished { level: level_idx });
        }

        let results: Vec<ToolResult> = results
            .into_iter()
            .zip(calls)
            .map(|(result, call)| result.unwrap_or_else(|| ToolResult::cancelled(call)))
            .collect();

        let summary = BatchSummary::from_results(&results);
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            cancelled = summary.cancelled,
            cache_hits = summary.cache_hits,
            elapsed_ms = batch_start.elapsed().as_millis() as u64,
            "Tool batch finished"
        );

        Ok(results)
    }

    async fn run_call(&self, call: &ToolCall, ctx: &ToolContext) -> ToolResult {
        self.emit(OrchestratorEvent::CallStarted {
            call_id: call.id.clone(),
            tool_name: call.tool_name.clone(),
        });

        let Some(tool) = self.registry.get(&call.tool_name).await else {
            return ToolResult::unsuccessful(
                call,
                CallStatus::Failed,
                CallError::new(
                    ErrorCategory::NotFound,
                    format!("Unknown tool: {}", call.tool_name),
                ),
                ResultMetadata::now(0.0, false, 0),
            );
        };

        let cache_key = (tool.cacheable() && self.cache.is_enabled())
            .then(|| ResultCache::key(&call.tool_name, &call.parameters));

        if let Some(value) = cache_key.as_deref().and_then(|key| self.cache.get(key)) {
            debug!(call_id = %call.id, tool = %call.tool_name, "Serving call from cache");
            return ToolResult::succeeded(call, value, ResultMetadata::now(0.0, true, 0));
        }

        let mut call_ctx = ctx.clone();
        call_ctx.timeout.get_or_insert(self.config.tool_timeout);
        let call_ctx = &call_ctx;

        let started = Instant::now();
        let outcome: std::result::Result<Retried<Value>, RetryFailure<ToolError>> =
            if tool.retryable() {
                let retry_ctx = RetryContext::new(&call.id).with_cancel(&ctx.cancel);
                self.retry
                    .execute_with_retry(retry_ctx, |attempt| {
                        let params = call.parameters.clone();
                        async move {
                            debug!(call_id = %call.id, tool = %call.tool_name, attempt, "Executing call");
                            self.registry.execute(&call.tool_name, params, call_ctx).await
                        }
                    })
                    .await
            } else {
                self.registry
                    .execute(&call.tool_name, call.parameters.clone(), call_ctx)
                    .await
                    .map(|value| Retried { value, retries: 0 })
                    .map_err(|error| RetryFailure {
                        error,
                        attempts: 1,
                        cancelled: false,
                    })
            };
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok(Retried { value, retries }) => {
                if let Some(key) = cache_key {
                    self.cache.set(key, value.clone(), None);
                }
                ToolResult::succeeded(call, value, ResultMetadata::now(duration_ms, false, retries))
            }
            Err(failure) => {
                let retries = failure.retries();
                // a tool-reported cancellation is a failure unless the batch token fired
                let status = if failure.cancelled
                    || (failure.error.category == ErrorCategory::Cancelled
                        && ctx.cancel.is_cancelled())
                {
                    CallStatus::Cancelled
                } else {
                    CallStatus::Failed
                };
                warn!(
                    call_id = %call.id,
                    tool = %call.tool_name,
                    category = %failure.error.category,
                    retries,
                    error = %failure.error,
                    "Tool call failed"
                );
                ToolResult::unsuccessful(
                    call,
                    status,
                    failure.error.into(),
                    ResultMetadata::now(duration_ms, false, retries),
                )
            }
        }
    }
}

/// Build the call graph, rejecting duplicate ids and dangling dependencies.
fn build_graph(calls: &[ToolCall]) -> Result<DependencyGraph> {
    let mut graph = DependencyGraph::new();
    for call in calls {
        graph.add_node(&call.id, &call.tool_name, call.depends_on.clone())?;
    }
    graph.recompute_dependents();

    if let Some((call_id, missing)) = graph.missing_dependencies().into_iter().next() {
        return Err(StratumError::Validation(format!(
            "call '{}' depends on unknown call '{}'",
            call_id, missing
        )));
    }

    // surfaces the cycle path before anything runs
    graph.topological_sort()?;
    Ok(graph)
}
