//! Read tool - Read file contents

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::fs;

use crate::error::ErrorCategory;
use crate::tools::registry::{parse_params, Tool, ToolContext, ToolError, ToolOutput};

const DEFAULT_LIMIT: usize = 2000;

pub struct ReadTool;

#[derive(Deserialize)]
struct Params {
    file_path: String,
    #[serde(default)]
    offset: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

fn human_size(size: usize) -> String {
    match size {
        0..1024 => format!("{} bytes", size),
        1024..1_048_576 => format!("{:.1} KB", size as f64 / 1024.0),
        _ => format!("{:.1} MB", size as f64 / 1_048_576.0),
    }
}

#[async_trait]
impl Tool for ReadTool {
    fn name(&self) -> &str {
        "read"
    }

    fn description(&self) -> &str {
        "Read file contents. Supports line offset/limit for large files. Detects binary files."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path to the file, absolute or relative to the working directory"
                },
                "offset": {
                    "type": "number",
                    "description": "The line number to start reading from (1-indexed)"
                },
                "limit": {
                    "type": "number",
                    "description": "The number of lines to read"
                }
            },
            "required": ["file_path"],
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

        let path = ctx.sandboxed_resolve(&params.file_path).map_err(|e| {
            if ctx.resolve_path(&params.file_path).exists() {
                e
            } else {
                ToolError::new(
                    ErrorCategory::NotFound,
                    format!("File not found: {}", params.file_path),
                )
            }
        })?;

        if !path.exists() {
            return Err(ToolError::new(
                ErrorCategory::NotFound,
                format!("File not found: {}", params.file_path),
            ));
        }
        if !path.is_file() {
            return Err(ToolError::new(
                ErrorCategory::Validation,
                format!("Path is not a file: {}", path.display()),
            ));
        }

        let content = fs::read(&path)
            .await
            .map_err(|e| ToolError::classified(format!("Failed to read file: {}", e)))?;

        // Binary check on the first 8 KB
        let check_len = content.len().min(8192);
        if content[..check_len].contains(&0) {
            return Ok(json!({
                "content": format!("Binary file: {} ({})", path.display(), human_size(content.len())),
                "total_lines": 0,
                "lines_returned": 0,
                "binary": true
            }));
        }

        let content = String::from_utf8(content).map_err(|e| {
            ToolError::new(
                ErrorCategory::Validation,
                format!("File is not valid UTF-8: {}", e),
            )
        })?;

        let lines: Vec<&str> = content.lines().collect();
        let total_lines = lines.len();

        let start = params.offset.unwrap_or(1).saturating_sub(1);
        let limit = params.limit.unwrap_or(DEFAULT_LIMIT);
        let end = (start + limit).min(total_lines);

        if total_lines == 0 {
            return Ok(json!({
                "content": "",
                "total_lines": 0,
                "lines_returned": 0,
                "start_line": 1
            }));
        }

        if start >= total_lines {
            return Err(ToolError::new(
                ErrorCategory::Validation,
                format!(
                    "Start line {} is beyond file length ({})",
                    start + 1,
                    total_lines
                ),
            ));
        }

        Ok(json!({
            "content": lines[start..end].join("\n"),
            "total_lines": total_lines,
            "lines_returned": end - start,
            "start_line": start + 1
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn reads_line_window() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.txt"), "one\ntwo\nthree\nfour").unwrap();
        let ctx = ToolContext::new(temp.path().to_path_buf());

        let out = ReadTool
            .execute(json!({"file_path": "a.txt", "offset": 2, "limit": 2}), &ctx)
            .await
            .unwrap();
        assert_eq!(out["content"], "two\nthree");
        assert_eq!(out["total_lines"], 4);
        assert_eq!(out["start_line"], 2);
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let temp = TempDir::new().unwrap();
        let ctx = ToolContext::new(temp.path().to_path_buf());

        let err = ReadTool
            .execute(json!({"file_path": "nope.txt"}), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.category, ErrorCategory::NotFound);
    }

    #[tokio::test]
    async fn binary_files_are_summarized() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("blob.bin"), [0u8, 1, 2, 3]).unwrap();
        let ctx = ToolContext::new(temp.path().to_path_buf());

        let out = ReadTool
            .execute(json!({"file_path": "blob.bin"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out["binary"], true);
        assert!(out["content"].as_str().unwrap().contains("4 bytes"));
    }
}
