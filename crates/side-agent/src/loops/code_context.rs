//! Code-context gathering: a specialized loop around symbol retrieval.
//!
//! Two phases share one mechanism. The determine phase casts a wide net
//! (larger budget, longest chunks dropped first when over budget, so
//! breadth survives). The refine phase runs only when determine came back
//! oversized: the model re-ranks what was gathered and the loop keeps the
//! most relevant under a tighter budget, dropping shortest-first.

use side::{ChatMessage, ContextTag, ToolDefinition};

use crate::error::AgentError;
use crate::flow::gates;
use crate::history::ChatHistory;
use crate::loops::llm_loop::{LoopHarness, LoopOptions, LoopState};
use crate::tools::{AgentTool, BulkSearchRepositoryTool, GetSymbolDefinitionsTool};

/// Sentinel appended to shrunk context so the model treats what it sees as
/// incomplete.
pub const SIGNATURES_EDIT_HINT: &str =
    "Note: some retrieved definitions were dropped to fit the context budget. \
     Re-request specific symbols before editing code you cannot see in full.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextPhase {
    Determine,
    Refine,
}

#[derive(Debug, Clone)]
pub struct CodeContextOutcome {
    pub context: String,
    pub shrunk: bool,
}

pub struct CodeContextLoop {
    pub harness: LoopHarness,
    /// Determine-phase character budget.
    pub determine_budget: usize,
    /// Refine-phase character budget.
    pub refine_budget: usize,
    /// Refine runs only when determine output exceeds this.
    pub refine_threshold: usize,
    /// History soft limit for both phases.
    pub soft_limit_chars: usize,
    pub max_attempts: u32,
}

impl CodeContextLoop {
    pub fn new(harness: LoopHarness) -> Self {
        Self {
            harness,
            determine_budget: 48_000,
            refine_budget: 16_000,
            refine_threshold: 16_000,
            soft_limit_chars: 160_000,
            max_attempts: 17,
        }
    }

    /// Run determine, then refine when warranted; returns the final
    /// context string (hint sentinel included when shrinking occurred).
    pub async fn gather(&self, history: &mut ChatHistory) -> Result<String, AgentError> {
        let determine = self.run_phase(history, ContextPhase::Determine).await?;
        if determine.context.chars().count() <= self.refine_threshold {
            return Ok(render(determine));
        }

        history
            .append(ChatMessage::user(format!(
                "The gathered context is too broad. Re-request only the \
                 definitions needed for this task, most relevant first.\n\n{}",
                determine.context
            )))
            .map_err(|e| AgentError::NonRecoverable(e.to_string()))?;
        let refined = self.run_phase(history, ContextPhase::Refine).await?;
        Ok(render(refined))
    }

    async fn run_phase(
        &self,
        history: &mut ChatHistory,
        phase: ContextPhase,
    ) -> Result<CodeContextOutcome, AgentError> {
        let budget = match phase {
            ContextPhase::Determine => self.determine_budget,
            ContextPhase::Refine => self.refine_budget,
        };
        // One gated branch extends the working budget by the hint's length
        // once shrinking occurred; the other does not. Both are legitimate
        // recorded behaviors and replay accordingly.
        let hint_budget_gate = self.harness.flow.gates.enabled(gates::REFINE_HINT_BUDGET);

        let subflow = match phase {
            ContextPhase::Determine => "code_context.determine",
            ContextPhase::Refine => "code_context.refine",
        };
        let mut options = LoopOptions::new(subflow, self.soft_limit_chars)
            .with_max_attempts(self.max_attempts);
        options.definitions_for = Some(phase_definitions);

        let mut chunks: Vec<String> = Vec::new();
        let mut shrunk_any = false;
        let mut current_max = budget;

        let outcome = self
            .harness
            .run(history, options, |assistant, responses, state| {
                // No tool calls: the model is done gathering.
                if assistant.tool_calls.is_empty() {
                    return Some(());
                }

                // A well-formed symbol call with zero requests is the
                // fresh-project signal: terminate with whatever we have
                // (possibly nothing).
                let empty_request = assistant.tool_calls.iter().any(|call| {
                    call.name == "get_symbol_definitions"
                        && side::parse_lenient::<serde_json::Value>(&call.arguments)
                            .ok()
                            .and_then(|v| {
                                v.get("requests").map(|r| {
                                    r.as_array().map(|a| a.is_empty()).unwrap_or(false)
                                })
                            })
                            .unwrap_or(false)
                });
                if empty_request {
                    return Some(());
                }

                for response in responses {
                    if response.function_name != "get_symbol_definitions" {
                        continue;
                    }
                    if response.is_error {
                        // The diagnostic already sits in history; the model
                        // sees it next turn and continues.
                        continue;
                    }
                    let text = response.content.as_text();
                    let len = text.chars().count();
                    if len > current_max {
                        state.overflow_chars += len - current_max;
                        state.pending_feedback.push(ChatMessage::user(format!(
                            "That retrieval returned {len} chars against a budget \
                             of {current_max}. Narrow the request: fewer files, \
                             specific symbolNames."
                        )));
                        continue;
                    }
                    if !text.is_empty() {
                        chunks.push(text);
                    }
                }

                if shrink_to_budget(&mut chunks, current_max, phase) {
                    shrunk_any = true;
                    if phase == ContextPhase::Refine && hint_budget_gate {
                        current_max = budget + SIGNATURES_EDIT_HINT.chars().count();
                    }
                }
                None
            })
            .await;

        match outcome {
            Ok(()) => Ok(CodeContextOutcome {
                context: chunks.join("\n"),
                shrunk: shrunk_any,
            }),
            Err(e) => Err(e),
        }
    }
}

fn render(outcome: CodeContextOutcome) -> String {
    if outcome.shrunk && !outcome.context.is_empty() {
        format!("{}\n\n{}", outcome.context, SIGNATURES_EDIT_HINT)
    } else {
        outcome.context
    }
}

/// Forced tool set per iteration: symbol retrieval on every turn, search
/// added on every third turn to diversify evidence.
fn phase_definitions(state: &LoopState) -> Vec<ToolDefinition> {
    let mut definitions = vec![GetSymbolDefinitionsTool.definition()];
    if state.iteration % 3 == 2 {
        definitions.push(BulkSearchRepositoryTool::default().definition());
    }
    definitions
}

/// Drop whole chunks until the total fits. Determine drops the longest
/// first (breadth over depth); refine drops the shortest first, trusting
/// the model's relevance ordering of the bigger items.
fn shrink_to_budget(chunks: &mut Vec<String>, budget: usize, phase: ContextPhase) -> bool {
    let total = |chunks: &Vec<String>| chunks.iter().map(|s| s.chars().count()).sum::<usize>();
    let mut shrunk = false;
    while !chunks.is_empty() && total(chunks) > budget {
        let idx = match phase {
            ContextPhase::Determine => {
                let mut idx = 0;
                for (i, c) in chunks.iter().enumerate() {
                    if c.chars().count() > chunks[idx].chars().count() {
                        idx = i;
                    }
                }
                idx
            }
            ContextPhase::Refine => {
                let mut idx = 0;
                for (i, c) in chunks.iter().enumerate() {
                    if c.chars().count() < chunks[idx].chars().count() {
                        idx = i;
                    }
                }
                idx
            }
        };
        chunks.remove(idx);
        shrunk = true;
    }
    shrunk
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::LocalWorkspaceFiles;
    use crate::test_support::{StubSearcher, StubSymbolRetriever, test_flow};
    use crate::tools::{ToolOverrides, ToolRegistry};
    use side::{MockProvider, ToolCall};
    use std::sync::Arc;

    fn context_loop(provider: MockProvider, definition_size: usize) -> CodeContextLoop {
        let flow = test_flow("flow-ctx");
        let mut registry = ToolRegistry::new();
        registry.add(Arc::new(GetSymbolDefinitionsTool));
        registry.add(Arc::new(BulkSearchRepositoryTool::default()));
        let harness = LoopHarness {
            flow: flow.ctx.clone(),
            provider: Arc::new(provider),
            registry,
            overrides: ToolOverrides::new(),
            files: Arc::new(LocalWorkspaceFiles::new(std::env::temp_dir())),
            symbols: Arc::new(StubSymbolRetriever {
                definition_size,
                fail_paths: vec![],
            }),
            search: Arc::new(StubSearcher::default()),
        };
        CodeContextLoop::new(harness)
    }

    fn seeded() -> ChatHistory {
        let mut history = ChatHistory::new("ws-ctx", true);
        history
            .append(
                ChatMessage::system("gather context").with_tag(ContextTag::InitialInstructions),
            )
            .unwrap();
        history.append(ChatMessage::user("task: add caching")).unwrap();
        history
    }

    fn symbol_call(id: &str, path: &str, symbols: &[&str]) -> ToolCall {
        let names: Vec<String> = symbols.iter().map(|s| s.to_string()).collect();
        ToolCall::new(
            id,
            "get_symbol_definitions",
            serde_json::json!({"requests": [{"filePath": path, "symbolNames": names}]}).to_string(),
        )
    }

    #[tokio::test]
    async fn collects_definitions_until_model_stops() {
        let provider = MockProvider::new();
        provider.push_message(
            ChatMessage::assistant("").with_tool_calls(vec![symbol_call(
                "c1",
                "src/cache.rs",
                &["Cache"],
            )]),
        );
        provider.push_message(ChatMessage::assistant("enough context"));
        let ctx_loop = context_loop(provider, 64);
        let mut history = seeded();

        let context = ctx_loop.gather(&mut history).await.unwrap();
        assert!(context.contains("src/cache.rs:Cache"));
        assert!(!context.contains(SIGNATURES_EDIT_HINT));
    }

    #[tokio::test]
    async fn fresh_project_terminates_with_empty_context() {
        let provider = MockProvider::new();
        provider.push_message(ChatMessage::assistant("").with_tool_calls(vec![ToolCall::new(
            "c1",
            "get_symbol_definitions",
            r#"{"requests": []}"#,
        )]));
        let ctx_loop = context_loop(provider, 64);
        let mut history = seeded();

        let context = ctx_loop.gather(&mut history).await.unwrap();
        assert!(context.is_empty());
    }

    #[tokio::test]
    async fn oversize_retrieval_gets_a_narrowing_directive() {
        let provider = MockProvider::new();
        provider.push_message(
            ChatMessage::assistant("").with_tool_calls(vec![symbol_call(
                "c1",
                "src/huge.rs",
                &["Everything"],
            )]),
        );
        provider.push_message(ChatMessage::assistant("stopping"));
        let mut ctx_loop = context_loop(provider, 64);
        // Any retrieval is oversize against a one-char budget.
        ctx_loop.determine_budget = 1;
        ctx_loop.refine_threshold = 100_000;
        let mut history = seeded();

        let context = ctx_loop.gather(&mut history).await.unwrap();
        assert!(context.is_empty());
        assert!(
            history
                .items()
                .iter()
                .any(|m| m.content.as_text().contains("Narrow the request"))
        );
    }

    #[tokio::test]
    async fn determine_shrinks_longest_first_and_flags_it() {
        let provider = MockProvider::new();
        provider.push_message(ChatMessage::assistant("").with_tool_calls(vec![
            symbol_call("c1", "src/small.rs", &["a"]),
            symbol_call("c2", "src/large.rs", &["b", "c", "d", "e", "f", "g"]),
        ]));
        provider.push_message(ChatMessage::assistant("done"));
        let mut ctx_loop = context_loop(provider, 64);
        // Both fit alone; together they are over budget.
        ctx_loop.determine_budget = 500;
        ctx_loop.refine_threshold = 100_000;
        let mut history = seeded();

        let context = ctx_loop.gather(&mut history).await.unwrap();
        // The longer chunk (six symbols) was dropped, the short one kept.
        assert!(context.contains("src/small.rs"));
        assert!(!context.contains("src/large.rs"));
        assert!(context.contains(SIGNATURES_EDIT_HINT));
    }

    #[tokio::test]
    async fn refine_runs_only_past_the_threshold() {
        let provider = MockProvider::new();
        // Determine gathers two large chunks, then stops.
        provider.push_message(ChatMessage::assistant("").with_tool_calls(vec![
            symbol_call("c1", "src/a.rs", &["A"]),
            symbol_call("c2", "src/b.rs", &["B"]),
        ]));
        provider.push_message(ChatMessage::assistant("determine done"));
        // Refine re-requests just one.
        provider.push_message(
            ChatMessage::assistant("").with_tool_calls(vec![symbol_call("c3", "src/a.rs", &["A"])]),
        );
        provider.push_message(ChatMessage::assistant("refine done"));

        let mut ctx_loop = context_loop(provider, 400);
        ctx_loop.determine_budget = 2_000;
        ctx_loop.refine_threshold = 100; // force refine
        ctx_loop.refine_budget = 600;
        let mut history = seeded();

        let context = ctx_loop.gather(&mut history).await.unwrap();
        assert!(context.contains("src/a.rs"));
        assert!(!context.contains("src/b.rs:"));
        // The re-ranking prompt landed in history between phases.
        assert!(
            history
                .items()
                .iter()
                .any(|m| m.content.as_text().contains("too broad"))
        );
    }

    #[test]
    fn forced_definitions_add_search_every_third_turn() {
        let mut state = LoopState::default();
        for iteration in 0..6 {
            state.iteration = iteration;
            let defs = phase_definitions(&state);
            let has_search = defs.iter().any(|d| d.name == "bulk_search_repository");
            assert_eq!(has_search, iteration % 3 == 2, "iteration {iteration}");
            assert!(defs.iter().any(|d| d.name == "get_symbol_definitions"));
        }
    }

    #[test]
    fn shrink_orders_differ_by_phase() {
        let mut chunks = vec!["aaaa".to_string(), "bb".to_string(), "cccccc".to_string()];
        let shrunk = shrink_to_budget(&mut chunks, 5, ContextPhase::Determine);
        assert!(shrunk);
        // Longest ("cccccc") went first, then "aaaa".
        assert_eq!(chunks, vec!["bb".to_string()]);

        let mut chunks = vec!["aaaa".to_string(), "bb".to_string(), "cccccc".to_string()];
        let shrunk = shrink_to_budget(&mut chunks, 6, ContextPhase::Refine);
        assert!(shrunk);
        // Shortest went first, leaving the longest most-relevant chunk.
        assert_eq!(chunks, vec!["cccccc".to_string()]);
    }
}
