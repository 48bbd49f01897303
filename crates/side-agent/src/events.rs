//! Flow events published to the event bus.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::dev_run::DevRunInstance;
use crate::flow::FlowAction;

/// Which output stream a dev-run chunk came from. The child's stdout and
/// stderr share one output file, so chunks are tagged combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Combined,
}

/// Why a flow finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Completed,
    Failed,
    Canceled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEvent {
    pub seq: u64,
    pub timestamp: i64,
    pub flow_id: String,
    pub kind: FlowEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEventKind {
    DevRunStarted {
        instance: DevRunInstance,
        pid: u32,
        /// Command text clipped to 100 chars for display.
        command_summary: String,
        working_dir: String,
    },
    DevRunOutput {
        dev_run_id: String,
        stream: OutputStream,
        chunk: String,
        /// Per-run sequence; totally ordered within one dev_run_id.
        sequence: u64,
    },
    DevRunEnded {
        dev_run_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_status: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        signal: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Terminates the per-run event sub-stream.
    EndStream {
        dev_run_id: String,
    },
    FlowActionChanged {
        action: FlowAction,
    },
    FlowClosed {
        reason: CloseReason,
    },
}

/// Registered side-channel consumer of flow events.
#[async_trait]
pub trait EventObserver: Send + Sync {
    async fn on_event(&self, event: &FlowEvent) -> anyhow::Result<()>;
}
