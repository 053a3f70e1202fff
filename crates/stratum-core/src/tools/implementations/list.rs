//! List directory tool - Breadth-first directory listing with depth/limit

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::PathBuf;
use tokio::fs;

use crate::error::ErrorCategory;
use crate::tools::registry::{
    display_relative, parse_params, Tool, ToolContext, ToolError, ToolOutput,
};

const DEFAULT_DEPTH: usize = 2;
const DEFAULT_LIMIT: usize = 200;
const MAX_LIMIT: usize = 10_000;

pub struct ListTool;

#[derive(Deserialize)]
struct Params {
    path: String,
    #[serde(default)]
    depth: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

#[async_trait]
impl Tool for ListTool {
    fn name(&self) -> &str {
        "list"
    }

    fn description(&self) -> &str {
        "List directory contents recursively, directories first. Use depth to control recursion (default 2) and limit to cap entries (default 200)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The directory path to list"
                },
                "depth": {
                    "type": "number",
                    "description": "Maximum recursion depth (default: 2)"
                },
                "limit": {
                    "type": "number",
                    "description": "Maximum number of entries to return (default: 200)"
                }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    fn retryable(&self) -> bool {
        true
    }

    fn cacheable(&self) -> bool {
        true
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolOutput {
        let params: Params = parse_params(params)?;

        let max_depth = params.depth.unwrap_or(DEFAULT_DEPTH);
        let limit = params.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);

        let root = ctx.sandboxed_resolve(&params.path)?;
        if !root.exists() {
            return Err(ToolError::new(
                ErrorCategory::NotFound,
                format!("Directory not found: {}", params.path),
            ));
        }
        if !root.is_dir() {
            return Err(ToolError::new(
                ErrorCategory::Validation,
                format!("Path is not a directory: {}", root.display()),
            ));
        }

        let mut entries: Vec<(String, bool)> = Vec::new();
        let mut queue: VecDeque<(PathBuf, usize)> = VecDeque::new();
        queue.push_back((root.clone(), 0));

        while let Some((dir, depth)) = queue.pop_front() {
            if entries.len() >= limit {
                break;
            }
            if ctx.cancel.is_cancelled() {
                return Err(ToolError::new(ErrorCategory::Cancelled, "Listing cancelled"));
            }

            let Ok(mut dir_entries) = fs::read_dir(&dir).await else {
                continue;
            };

            let mut children: Vec<(String, PathBuf, bool)> = Vec::new();
            while let Ok(Some(entry)) = dir_entries.next_entry().await {
                let name = entry.file_name().to_string_lossy().to_string();
                // Skip hidden files/dirs
                if name.starts_with('.') {
                    continue;
                }
                let is_dir = entry
                    .file_type()
                    .await
                    .map(|ft| ft.is_dir())
                    .unwrap_or(false);
                children.push((name, entry.path(), is_dir));
            }

            // Directories first, then case-insensitive name
            children.sort_by(|a, b| {
                b.2.cmp(&a.2)
                    .then_with(|| a.0.to_lowercase().cmp(&b.0.to_lowercase()))
            });

            for (_, entry_path, is_dir) in children {
                if entries.len() >= limit {
                    break;
                }
                let relative = display_relative(&entry_path, &root);
                entries.push((
                    if is_dir {
                        format!("{}/", relative)
                    } else {
                        relative
                    },
                    is_dir,
                ));

                if is_dir && depth < max_depth {
                    queue.push_back((entry_path, depth + 1));
                }
            }
        }

        let total = entries.len();
        let dir_count = entries.iter().filter(|(_, is_dir)| *is_dir).count();
        let listing: Vec<&str> = entries.iter().map(|(p, _)| p.as_str()).collect();

        Ok(json!({
            "output": listing.join("\n"),
            "total_entries": total,
            "directories": dir_count,
            "files": total - dir_count,
            "truncated": total >= limit
        }))
    }
}
