//! Code-context tools: symbol retrieval, repository search, file reads.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use side::{MessageContent, ToolDefinition};

use crate::collab::{SearchRequest, SymbolRequest};
use crate::tools::{AgentTool, ToolContext, ToolError, text_content};

/// Past this size a search result collapses to a file-list summary.
const SEARCH_REFUSE_THRESHOLD: usize = 16_000;

/// Default line window for file reads when none is given.
const READ_WINDOW_LINES: usize = 400;

// ── get_symbol_definitions ───────────────────────────────────────────────

pub struct GetSymbolDefinitionsTool;

#[derive(Debug, Deserialize)]
struct SymbolArgs {
    #[serde(default)]
    requests: Vec<SymbolRequest>,
}

#[async_trait]
impl AgentTool for GetSymbolDefinitionsTool {
    fn name(&self) -> &str {
        "get_symbol_definitions"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: "Retrieve full definitions for the named symbols, related \
                          symbols included. Omit symbolNames to fetch a whole file."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "requests": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "filePath": { "type": "string" },
                                "symbolNames": {
                                    "type": "array",
                                    "items": { "type": "string" }
                                }
                            },
                            "required": ["filePath"]
                        }
                    }
                },
                "required": ["requests"]
            }),
        }
    }

    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<MessageContent, ToolError> {
        let args: SymbolArgs = serde_json::from_value(args)
            .map_err(|e| ToolError::InvalidRequest(e.to_string()))?;

        // Zero requests in a well-formed call is the fresh-project case:
        // nothing to retrieve, and the caller treats it as completion.
        if args.requests.is_empty() {
            return Ok(text_content(""));
        }

        let retrievals = ctx.symbols.retrieve(&args.requests).await?;
        let mut out = String::new();
        for retrieval in retrievals {
            if let Some(failure) = retrieval.failure {
                out.push_str(&format!(
                    "# {}: retrieval failed: {}\n",
                    retrieval.file_path, failure
                ));
            } else {
                out.push_str(&retrieval.definitions);
            }
        }
        Ok(text_content(out))
    }
}

// ── bulk_search_repository ───────────────────────────────────────────────

pub struct BulkSearchRepositoryTool {
    refuse_threshold: usize,
}

impl Default for BulkSearchRepositoryTool {
    fn default() -> Self {
        Self {
            refuse_threshold: SEARCH_REFUSE_THRESHOLD,
        }
    }
}

impl BulkSearchRepositoryTool {
    pub fn with_refuse_threshold(threshold: usize) -> Self {
        Self {
            refuse_threshold: threshold,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchArgs {
    #[serde(default)]
    searches: Vec<SearchRequest>,
}

#[async_trait]
impl AgentTool for BulkSearchRepositoryTool {
    fn name(&self) -> &str {
        "bulk_search_repository"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: "Fan out one or more searches across the repository and \
                          return the matches. Oversized results come back as a \
                          file list; narrow the terms and retry."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "searches": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "term": { "type": "string" },
                                "pathGlob": { "type": "string" }
                            },
                            "required": ["term"]
                        }
                    }
                },
                "required": ["searches"]
            }),
        }
    }

    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<MessageContent, ToolError> {
        let args: SearchArgs = serde_json::from_value(args)
            .map_err(|e| ToolError::InvalidRequest(e.to_string()))?;
        if args.searches.is_empty() {
            return Err(ToolError::InvalidRequest(
                "at least one search is required".into(),
            ));
        }

        let results = ctx.search.bulk_search(&args.searches).await?;
        if results.rendered.chars().count() > self.refuse_threshold {
            let mut summary = format!(
                "Search output was too large ({} chars). Matched files:\n",
                results.rendered.chars().count()
            );
            for file in &results.files {
                summary.push_str(file);
                summary.push('\n');
            }
            summary.push_str("Narrow the search terms or add a pathGlob and retry.");
            return Ok(text_content(summary));
        }
        Ok(text_content(results.rendered))
    }
}

// ── bulk_read_file ───────────────────────────────────────────────────────

pub struct BulkReadFileTool;

#[derive(Debug, Deserialize)]
struct ReadArgs {
    #[serde(default)]
    files: Vec<ReadRequest>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadRequest {
    file_path: String,
    #[serde(default)]
    start_line: Option<usize>,
    #[serde(default)]
    end_line: Option<usize>,
}

#[async_trait]
impl AgentTool for BulkReadFileTool {
    fn name(&self) -> &str {
        "bulk_read_file"
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: "Read one or more files, optionally clipped to a line \
                          window (1-based, inclusive)."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "files": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "filePath": { "type": "string" },
                                "startLine": { "type": "integer", "minimum": 1 },
                                "endLine": { "type": "integer", "minimum": 1 }
                            },
                            "required": ["filePath"]
                        }
                    }
                },
                "required": ["files"]
            }),
        }
    }

    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<MessageContent, ToolError> {
        let args: ReadArgs = serde_json::from_value(args)
            .map_err(|e| ToolError::InvalidRequest(e.to_string()))?;
        if args.files.is_empty() {
            return Err(ToolError::InvalidRequest(
                "at least one file is required".into(),
            ));
        }

        let mut out = String::new();
        for request in &args.files {
            match ctx.files.read_to_string(&request.file_path).await {
                Ok(contents) => {
                    let lines: Vec<&str> = contents.lines().collect();
                    let start = request.start_line.unwrap_or(1).max(1);
                    let end = request
                        .end_line
                        .unwrap_or(start + READ_WINDOW_LINES - 1)
                        .min(lines.len());
                    if start > lines.len() {
                        out.push_str(&format!(
                            "=== {} (empty window: file has {} lines) ===\n",
                            request.file_path,
                            lines.len()
                        ));
                        continue;
                    }
                    out.push_str(&format!(
                        "=== {} (lines {}-{} of {}) ===\n",
                        request.file_path,
                        start,
                        end,
                        lines.len()
                    ));
                    for line in &lines[start - 1..end] {
                        out.push_str(line);
                        out.push('\n');
                    }
                }
                Err(e) => {
                    out.push_str(&format!("=== {} ===\nread failed: {e}\n", request.file_path));
                }
            }
        }
        Ok(text_content(out))
    }
}
