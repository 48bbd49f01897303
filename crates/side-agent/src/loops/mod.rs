//! Iterative LLM drivers: the generic loop and the code-context
//! specialization built on top of it.

pub mod code_context;
pub mod llm_loop;

pub use code_context::{CodeContextLoop, CodeContextOutcome, ContextPhase};
pub use llm_loop::{LoopHarness, LoopOptions, LoopState};
