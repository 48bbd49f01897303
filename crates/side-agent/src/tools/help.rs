//! Human help: the one tool that interrupts for user input.

use async_trait::async_trait;
use serde_json::{Value, json};
use side::{MessageContent, ToolDefinition};

use crate::interaction::{RequestForUser, RequestKind};
use crate::tools::{AgentTool, ToolContext, ToolError, text_content};

/// Opens a request toward the user and blocks cooperatively until the
/// response signal arrives. A successful call counts as user contact, so
/// the enclosing loop resets its auto-iteration counter.
pub struct GetHelpOrInputTool {
    subflow: String,
}

impl GetHelpOrInputTool {
    pub fn new(subflow: impl Into<String>) -> Self {
        Self {
            subflow: subflow.into(),
        }
    }
}

#[async_trait]
impl AgentTool for GetHelpOrInputTool {
    fn name(&self) -> &str {
        "get_help_or_input"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: "Ask the user for help or input and wait for their \
                          answer. Use when blocked or when a decision genuinely \
                          needs a human."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "content": {
                        "type": "string",
                        "description": "What to ask the user."
                    }
                },
                "required": ["content"]
            }),
        }
    }

    fn user_contact(&self) -> bool {
        true
    }

    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<MessageContent, ToolError> {
        let content = args
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidRequest("content is required".into()))?;

        let request = RequestForUser {
            origin_flow_id: ctx.flow_id.clone(),
            flow_action_id: None,
            content: content.to_string(),
            subflow: self.subflow.clone(),
            kind: RequestKind::FreeForm,
            params: Default::default(),
        };

        let outcome = ctx
            .user
            .request(request, &ctx.cancel)
            .await
            .map_err(|e| ToolError::ExecFailure(e.to_string()))?;
        Ok(text_content(outcome.content))
    }
}
