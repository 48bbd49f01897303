//! Image reads for vision-capable models.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};
use side::{ContentPart, MessageContent, ToolDefinition};
use std::path::Path;

use crate::tools::{AgentTool, ToolContext, ToolError, parts_content};

const MAX_IMAGE_BYTES: u64 = 8 * 1024 * 1024;

pub struct ReadImageTool;

fn media_type_for(path: &str) -> Option<&'static str> {
    match Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => Some("image/png"),
        Some("jpg") | Some("jpeg") => Some("image/jpeg"),
        Some("gif") => Some("image/gif"),
        Some("webp") => Some("image/webp"),
        _ => None,
    }
}

#[async_trait]
impl AgentTool for ReadImageTool {
    fn name(&self) -> &str {
        "read_image"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: "Read an image from the worktree and attach it to the \
                          conversation. Paths are relative to the worktree root."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "filePath": { "type": "string" }
                },
                "required": ["filePath"]
            }),
        }
    }

    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<MessageContent, ToolError> {
        let file_path = args
            .get("filePath")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidRequest("filePath is required".into()))?;

        let path = Path::new(file_path);
        if path.is_absolute() {
            return Err(ToolError::PermissionDenied(
                "absolute paths are not allowed".into(),
            ));
        }
        if path.components().any(|c| c.as_os_str() == "..") {
            return Err(ToolError::PermissionDenied(
                "path traversal is not allowed".into(),
            ));
        }

        let media_type = media_type_for(file_path).ok_or_else(|| {
            ToolError::InvalidRequest(format!("unsupported image type: {file_path}"))
        })?;

        let full = ctx.files.root().join(path);
        let meta = tokio::fs::metadata(&full)
            .await
            .map_err(|e| ToolError::ExecFailure(format!("failed to stat {file_path}: {e}")))?;
        if meta.len() > MAX_IMAGE_BYTES {
            return Err(ToolError::ExecFailure(format!(
                "image too large: {} bytes (limit {})",
                meta.len(),
                MAX_IMAGE_BYTES
            )));
        }

        let bytes = tokio::fs::read(&full)
            .await
            .map_err(|e| ToolError::ExecFailure(format!("failed to read {file_path}: {e}")))?;

        Ok(parts_content(vec![ContentPart::Image {
            media_type: media_type.to_string(),
            data: BASE64.encode(bytes),
        }]))
    }
}
