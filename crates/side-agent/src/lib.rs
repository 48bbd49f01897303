//! side-agent: the durable orchestration engine behind the side coding
//! agent.
//!
//! Given a natural-language task and a repository, the engine drives
//! requirements elicitation, code-context gathering, planning, and
//! iterative editing with self-review. Reasoning comes from an LLM
//! through [`side::ChatProvider`]; every effect — symbol retrieval,
//! search, file access, checks, persistence — goes through the
//! [`collab`] interfaces, which keeps the control flow deterministic and
//! a recorded flow replayable.
//!
//! The pieces, roughly bottom-up:
//!
//! - [`flow`]: flow context, per-flow [`flow::GlobalState`], version
//!   gates, tracked flow actions.
//! - [`history`]: the append-only chat history and the retention manager.
//! - [`tools`]: the typed tool-call edge and the built-in tool set.
//! - [`loops`]: the generic LLM loop and the code-context specialization.
//! - [`interaction`]: requests toward the user and their responses.
//! - [`dev_run`]: supervised long-running commands.
//! - [`edit`]: edit-block parsing, matching, application, reporting.
//! - [`flows`]: the orchestrated top-level pipeline.

pub mod branch;
pub mod collab;
pub mod config;
pub mod dev_run;
pub mod edit;
pub mod error;
pub mod event_bus;
pub mod events;
pub mod flow;
pub mod flows;
pub mod history;
pub mod interaction;
pub mod loops;
pub mod tools;

#[doc(hidden)]
pub mod test_support;

pub use error::AgentError;
pub use event_bus::EventBus;
pub use events::{CloseReason, FlowEvent, FlowEventKind};
pub use flow::{FlowContext, Gates, GlobalState};
pub use flows::{FlowDeps, FlowSignal, PlanAndExecute, spawn_signal_pump};
pub use history::{ChatHistory, manage};
pub use loops::{CodeContextLoop, LoopHarness, LoopOptions};
