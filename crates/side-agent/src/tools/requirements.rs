//! Structured requirements and the record/update tools.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use side::{MessageContent, ToolDefinition};

use crate::flow::GlobalState;
use crate::tools::batch::ListUpdate;
use crate::tools::{AgentTool, ToolContext, ToolError, text_content};

/// GlobalState key under which the requirements object lives.
pub const REQUIREMENTS_KEY: &str = "dev_requirements";

/// The elicited requirements for the task at hand.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Requirements {
    #[serde(default)]
    pub overview: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub finalized: bool,
}

impl Requirements {
    pub fn render(&self) -> String {
        let mut out = String::from("# Requirements\n\n");
        out.push_str(&self.overview);
        out.push_str("\n\n## Acceptance criteria\n");
        for (i, criterion) in self.acceptance_criteria.iter().enumerate() {
            out.push_str(&format!("{}. {}\n", i + 1, criterion));
        }
        if self.finalized {
            out.push_str("\n(finalized)\n");
        }
        out
    }

    pub fn load(state: &GlobalState) -> Option<Self> {
        state
            .value(REQUIREMENTS_KEY)
            .and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn store(&self, state: &GlobalState) {
        if let Ok(value) = serde_json::to_value(self) {
            state.set_value(REQUIREMENTS_KEY, value);
        }
    }
}

/// Incremental batch over the requirements object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequirementsUpdate {
    #[serde(default)]
    pub overview: Option<String>,
    #[serde(flatten)]
    pub criteria: ListUpdate<String>,
    #[serde(default)]
    pub finalized: Option<bool>,
}

impl RequirementsUpdate {
    pub fn apply(&self, requirements: &Requirements) -> Requirements {
        Requirements {
            overview: self
                .overview
                .clone()
                .unwrap_or_else(|| requirements.overview.clone()),
            acceptance_criteria: self.criteria.apply(&requirements.acceptance_criteria),
            finalized: self.finalized.unwrap_or(requirements.finalized),
        }
    }
}

// ── record_dev_requirements ──────────────────────────────────────────────

pub struct RecordDevRequirementsTool;

#[async_trait]
impl AgentTool for RecordDevRequirementsTool {
    fn name(&self) -> &str {
        "record_dev_requirements"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: "Record the full requirements object, replacing any \
                          previous version. Set finalized once the user has \
                          nothing further to add."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "overview": { "type": "string" },
                    "acceptanceCriteria": {
                        "type": "array",
                        "items": { "type": "string" }
                    },
                    "finalized": { "type": "boolean" }
                },
                "required": ["overview", "acceptanceCriteria"]
            }),
        }
    }

    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<MessageContent, ToolError> {
        let requirements: Requirements = serde_json::from_value(args)
            .map_err(|e| ToolError::InvalidRequest(e.to_string()))?;
        requirements.store(&ctx.state);
        Ok(text_content(requirements.render()))
    }
}

// ── update_dev_requirements ──────────────────────────────────────────────

pub struct UpdateDevRequirementsTool;

#[async_trait]
impl AgentTool for UpdateDevRequirementsTool {
    fn name(&self) -> &str {
        "update_dev_requirements"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: "Apply an incremental update to the recorded \
                          requirements: edits replace criteria by index, deletes \
                          remove by index, inserts add at an index."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "overview": { "type": "string" },
                    "edits": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "index": { "type": "integer" },
                                "value": { "type": "string" }
                            },
                            "required": ["index", "value"]
                        }
                    },
                    "deletes": {
                        "type": "array",
                        "items": { "type": "integer" }
                    },
                    "inserts": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "index": { "type": "integer" },
                                "value": { "type": "string" }
                            },
                            "required": ["index", "value"]
                        }
                    },
                    "finalized": { "type": "boolean" }
                }
            }),
        }
    }

    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<MessageContent, ToolError> {
        let update: RequirementsUpdate = serde_json::from_value(args)
            .map_err(|e| ToolError::InvalidRequest(e.to_string()))?;
        let current = Requirements::load(&ctx.state).unwrap_or_default();
        let next = update.apply(&current);
        next.store(&ctx.state);
        Ok(text_content(next.render()))
    }
}
