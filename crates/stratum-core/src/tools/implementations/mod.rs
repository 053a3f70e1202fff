//! Built-in tools
//!
//! - read: Read files (cacheable, retryable)
//! - list: List directory contents (cacheable, retryable)
//! - write: Create/overwrite files
//! - bash: Execute shell commands

pub mod bash;
pub mod list;
pub mod read;
pub mod write;

pub use bash::BashTool;
pub use list::ListTool;
pub use read::ReadTool;
pub use write::WriteTool;

use std::sync::Arc;

use crate::tools::registry::ToolRegistry;

/// Register all built-in tools
pub async fn register_builtin_tools(registry: &ToolRegistry) {
    registry.register(Arc::new(ReadTool)).await;
    registry.register(Arc::new(ListTool)).await;
    registry.register(Arc::new(WriteTool)).await;
    registry.register(Arc::new(BashTool)).await;
}
