//! The development plan and its record/update tools.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use side::{MessageContent, ToolDefinition};

use crate::flow::GlobalState;
use crate::tools::batch::ListUpdate;
use crate::tools::{AgentTool, ToolContext, ToolError, text_content};

pub const PLAN_KEY: &str = "dev_plan";

/// One executable step of the plan. Steps are addressed by position; the
/// sequence number a step had when proposed stays stable for its lifetime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevPlanStep {
    pub title: String,
    #[serde(default)]
    pub definition: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevPlan {
    #[serde(default)]
    pub steps: Vec<DevPlanStep>,
    #[serde(default)]
    pub finalized: bool,
}

impl DevPlan {
    pub fn render(&self) -> String {
        let mut out = String::from("# Plan\n");
        for (i, step) in self.steps.iter().enumerate() {
            out.push_str(&format!("\n## Step {}: {}\n{}\n", i + 1, step.title, step.definition));
        }
        if self.finalized {
            out.push_str("\n(finalized)\n");
        }
        out
    }

    pub fn load(state: &GlobalState) -> Option<Self> {
        state
            .value(PLAN_KEY)
            .and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn store(&self, state: &GlobalState) {
        if let Ok(value) = serde_json::to_value(self) {
            state.set_value(PLAN_KEY, value);
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanUpdate {
    #[serde(flatten)]
    pub steps: ListUpdate<DevPlanStep>,
    #[serde(default)]
    pub finalized: Option<bool>,
}

impl PlanUpdate {
    pub fn apply(&self, plan: &DevPlan) -> DevPlan {
        DevPlan {
            steps: self.steps.apply(&plan.steps),
            finalized: self.finalized.unwrap_or(plan.finalized),
        }
    }
}

// ── record_dev_plan ──────────────────────────────────────────────────────

pub struct RecordDevPlanTool;

#[async_trait]
impl AgentTool for RecordDevPlanTool {
    fn name(&self) -> &str {
        "record_dev_plan"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: "Record the full development plan, replacing any \
                          previous version."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "steps": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "title": { "type": "string" },
                                "definition": { "type": "string" }
                            },
                            "required": ["title", "definition"]
                        }
                    },
                    "finalized": { "type": "boolean" }
                },
                "required": ["steps"]
            }),
        }
    }

    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<MessageContent, ToolError> {
        let plan: DevPlan =
            serde_json::from_value(args).map_err(|e| ToolError::InvalidRequest(e.to_string()))?;
        plan.store(&ctx.state);
        Ok(text_content(plan.render()))
    }
}

// ── update_dev_plan ──────────────────────────────────────────────────────

pub struct UpdateDevPlanTool;

#[async_trait]
impl AgentTool for UpdateDevPlanTool {
    fn name(&self) -> &str {
        "update_dev_plan"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: "Apply an incremental update to the recorded plan: \
                          edits replace steps by index, deletes remove by index, \
                          inserts add at an index."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "edits": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "index": { "type": "integer" },
                                "value": {
                                    "type": "object",
                                    "properties": {
                                        "title": { "type": "string" },
                                        "definition": { "type": "string" }
                                    },
                                    "required": ["title"]
                                }
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
                                "value": {
                                    "type": "object",
                                    "properties": {
                                        "title": { "type": "string" },
                                        "definition": { "type": "string" }
                                    },
                                    "required": ["title"]
                                }
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
        let update: PlanUpdate =
            serde_json::from_value(args).map_err(|e| ToolError::InvalidRequest(e.to_string()))?;
        let current = DevPlan::load(&ctx.state).unwrap_or_default();
        let next = update.apply(&current);
        next.store(&ctx.state);
        Ok(text_content(next.render()))
    }
}
