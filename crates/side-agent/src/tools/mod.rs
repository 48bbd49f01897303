//! Tool dispatch: trait, registry, and the typed tool-call loop's edge.
//!
//! Argument blobs from the model are parsed leniently; anything that still
//! fails becomes an error tool result with a schema hint rather than a
//! loop failure. Parallel tool calls are processed in issue order, one
//! result per call. A per-call-site override map lets a flow replace the
//! default handler for individual tools (the requirements flow does this
//! for `record_dev_requirements`).

pub mod batch;
pub mod code;
pub mod help;
pub mod image;
pub mod plan;
pub mod requirements;

pub use code::{BulkReadFileTool, BulkSearchRepositoryTool, GetSymbolDefinitionsTool};
pub use help::GetHelpOrInputTool;
pub use image::ReadImageTool;
pub use plan::{DevPlan, DevPlanStep, PlanUpdate, RecordDevPlanTool, UpdateDevPlanTool};
pub use requirements::{
    RecordDevRequirementsTool, Requirements, RequirementsUpdate, UpdateDevRequirementsTool,
};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use side::{ContentPart, MessageContent, ToolCall, ToolDefinition, parse_lenient};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::collab::{RepoSearcher, SymbolRetriever, WorkspaceFiles};
use crate::flow::GlobalState;
use crate::interaction::UserLink;

/// Hint included with every unmarshal failure so the model self-corrects.
pub const SCHEMA_HINT: &str =
    "arguments did not match the tool schema; follow the JSON schema exactly \
     and do not embed JSON as a string";

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ToolError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}")]
    ExecFailure(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<crate::collab::CollabError> for ToolError {
    fn from(e: crate::collab::CollabError) -> Self {
        ToolError::ExecFailure(e.to_string())
    }
}

/// What a tool call produced, ready to append as a tool-result message.
#[derive(Debug, Clone)]
pub struct ToolResponse {
    pub tool_call_id: String,
    pub function_name: String,
    pub content: MessageContent,
    pub is_error: bool,
    /// True when the tool involved the user; the loop resets its
    /// auto-iteration counter on contact.
    pub user_contact: bool,
}

impl ToolResponse {
    fn error(call: &ToolCall, message: String) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            function_name: call.name.clone(),
            content: MessageContent::Text(message),
            is_error: true,
            user_contact: false,
        }
    }
}

/// Everything a tool handler may touch during one call.
pub struct ToolContext {
    pub flow_id: String,
    pub state: Arc<GlobalState>,
    pub user: Arc<UserLink>,
    pub files: Arc<dyn WorkspaceFiles>,
    pub symbols: Arc<dyn SymbolRetriever>,
    pub search: Arc<dyn RepoSearcher>,
    pub cancel: CancellationToken,
}

/// One callable tool.
#[async_trait]
pub trait AgentTool: Send + Sync {
    fn name(&self) -> &str;

    /// Wire definition (name, description, JSON schema) for the provider.
    fn definition(&self) -> ToolDefinition;

    /// Whether a successful call counts as user contact.
    fn user_contact(&self) -> bool {
        false
    }

    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<MessageContent, ToolError>;
}

/// Registry mapping tool name to handler.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn AgentTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, tool: Arc<dyn AgentTool>) -> &mut Self {
        self.tools.insert(tool.name().to_string(), tool);
        self
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn AgentTool>> {
        self.tools.get(name).cloned()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }
}

/// Per-call-site handler overrides, consulted before the registry.
pub type ToolOverrides = HashMap<String, Arc<dyn AgentTool>>;

/// Dispatch every call of one assistant turn, in order. Each call yields
/// exactly one response; failures are converted, never propagated.
pub async fn dispatch_tool_calls(
    calls: &[ToolCall],
    registry: &ToolRegistry,
    overrides: &ToolOverrides,
    ctx: &ToolContext,
) -> Vec<ToolResponse> {
    let mut responses = Vec::with_capacity(calls.len());
    for call in calls {
        responses.push(dispatch_one(call, registry, overrides, ctx).await);
    }
    responses
}

async fn dispatch_one(
    call: &ToolCall,
    registry: &ToolRegistry,
    overrides: &ToolOverrides,
    ctx: &ToolContext,
) -> ToolResponse {
    let Some(tool) = overrides
        .get(&call.name)
        .cloned()
        .or_else(|| registry.find(&call.name))
    else {
        return ToolResponse::error(call, format!("unknown tool: {}", call.name));
    };

    let args: Value = match parse_lenient(&call.arguments) {
        Ok(v) => v,
        Err(e) => {
            log::debug!("tool {} arguments unparseable: {}", call.name, e);
            return ToolResponse::error(call, format!("{e}; {SCHEMA_HINT}"));
        }
    };

    match tool.call(args, ctx).await {
        Ok(content) => ToolResponse {
            tool_call_id: call.id.clone(),
            function_name: call.name.clone(),
            content,
            is_error: false,
            user_contact: tool.user_contact(),
        },
        Err(ToolError::InvalidRequest(msg)) => {
            ToolResponse::error(call, format!("invalid request: {msg}; {SCHEMA_HINT}"))
        }
        Err(e) => ToolResponse::error(call, e.to_string()),
    }
}

/// Render a tool response as a history message.
pub fn response_message(response: &ToolResponse) -> side::ChatMessage {
    side::ChatMessage::tool_result(
        response.tool_call_id.clone(),
        response.function_name.clone(),
        response.content.clone(),
    )
    .with_error(response.is_error)
}

/// Convenience for tools that return one text block.
pub(crate) fn text_content(text: impl Into<String>) -> MessageContent {
    MessageContent::Text(text.into())
}

/// Convenience for tools that return rich blocks.
pub(crate) fn parts_content(parts: Vec<ContentPart>) -> MessageContent {
    MessageContent::Parts(parts)
}
