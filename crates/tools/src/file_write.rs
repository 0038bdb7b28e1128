//! `file_write` — create or replace a file inside the workspace.

use serde::Deserialize;
use sr_domain::tool::{ToolDefinition, ToolResult};
use sr_domain::ErrorKind;

use crate::context::ToolExecutionContext;
use crate::registry::{SafetyDescriptor, SanitizerKind, ToolHandler};

#[derive(Debug, Clone, Deserialize)]
pub struct FileWriteRequest {
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub create_dirs: bool,
}

pub struct FileWriteHandler;

impl FileWriteHandler {
    pub fn definition() -> ToolDefinition {
        ToolDefinition {
            name: "file_write".into(),
            description: "Write a file inside the workspace, replacing any existing content.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string", "description": "Target path, relative to the workspace root" },
                    "content": { "type": "string", "description": "Full file content" },
                    "create_dirs": { "type": "boolean", "description": "Create missing parent directories" }
                },
                "required": ["path", "content"]
            }),
        }
    }

    pub fn descriptor() -> SafetyDescriptor {
        SafetyDescriptor::builtin(SanitizerKind::FileWrite)
    }
}

#[async_trait::async_trait]
impl ToolHandler for FileWriteHandler {
    async fn execute(&self, arguments: serde_json::Value, ctx: &ToolExecutionContext) -> ToolResult {
        let started = std::time::Instant::now();
        let req: FileWriteRequest = match serde_json::from_value(arguments) {
            Ok(r) => r,
            Err(e) => return ToolResult::failure(ErrorKind::Validation, e.to_string()),
        };

        let target = match ctx.resolve_path(&req.path) {
            Ok(path) => path,
            Err(e) => return ToolResult::failure(e.kind(), e.to_string()),
        };

        if let Some(parent) = target.parent() {
            if !parent.exists() {
                if !req.create_dirs {
                    return ToolResult::failure(
                        ErrorKind::NotFound,
                        format!("parent directory of {:?} does not exist", req.path),
                    );
                }
                if let Err(e) = std::fs::create_dir_all(parent) {
                    return ToolResult::failure(ErrorKind::Io, e.to_string());
                }
            }
        }

        let bytes = req.content.len();
        if let Err(e) = std::fs::write(&target, &req.content) {
            return ToolResult::failure(ErrorKind::Io, e.to_string());
        }

        ToolResult::success(format!("wrote {bytes} bytes to {}", req.path))
            .with_duration(started.elapsed().as_millis() as u64)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
