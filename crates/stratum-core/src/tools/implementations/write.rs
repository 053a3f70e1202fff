//! Write tool - Create or overwrite files

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::fs;
use tracing::debug;

use crate::tools::registry::{parse_params, Tool, ToolContext, ToolError, ToolOutput};

pub struct WriteTool;

#[derive(Deserialize)]
struct Params {
    file_path: String,
    content: String,
}

#[async_trait]
impl Tool for WriteTool {
    fn name(&self) -> &str {
        "write"
    }

    fn description(&self) -> &str {
        "Create or overwrite files. Creates parent directories if needed."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path to the file, absolute or relative to the working directory"
                },
                "content": {
                    "type": "string",
                    "description": "The content to write to the file"
                }
            },
            "required": ["file_path", "content"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolOutput {
        let params: Params = parse_params(params)?;

        // Sandbox check happens before any directory is created
        let path = ctx.sandboxed_resolve_new_path(&params.file_path)?;
        debug!(path = ?path, working_dir = ?ctx.working_dir, "Write tool resolved path");

        if let Some(parent) = path.parent().filter(|p| !p.exists()) {
            fs::create_dir_all(parent).await.map_err(|e| {
                ToolError::classified(format!("Failed to create directory: {}", e))
            })?;
        }

        fs::write(&path, &params.content)
            .await
            .map_err(|e| ToolError::classified(format!("Failed to write file: {}", e)))?;

        Ok(json!({
            "message": format!("Successfully wrote {} lines", params.content.lines().count()),
            "bytes_written": params.content.len(),
            "file_path": path.display().to_string()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use tempfile::TempDir;

    #[tokio::test]
    async fn creates_parent_directories() {
        let temp = TempDir::new().unwrap();
        let ctx = ToolContext::new(temp.path().to_path_buf());

        let out = WriteTool
            .execute(
                json!({"file_path": "nested/dir/out.txt", "content": "a\nb\n"}),
                &ctx,
            )
            .await
            .unwrap();

        assert_eq!(out["bytes_written"], 4);
        let written = std::fs::read_to_string(temp.path().join("nested/dir/out.txt")).unwrap();
        assert_eq!(written, "a\nb\n");
    }

    #[tokio::test]
    async fn sandbox_blocks_escape() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().canonicalize().unwrap();
        let ctx = ToolContext::new(root.clone()).with_sandbox(root);

        let err = WriteTool
            .execute(json!({"file_path": "../escape.txt", "content": "x"}), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.category, ErrorCategory::Permission);
    }
}
