//! Dev runs: supervised long-running commands bound to the working tree.
//!
//! A dev run is one configured shell command (`devRun.commands` in the
//! repository config) running as a session leader so it survives a worker
//! restart and can be signalled as a group. At most one live instance per
//! command id; the registry lives in [`GlobalState`](crate::flow::GlobalState).

mod supervisor;

pub use supervisor::{DevRunHandle, DevRunSupervisor, StartOptions};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A live (or recently live) dev-run process.
///
/// `session_id` is the OS session-leader pid; signalling `-session_id`
/// reaches every process in the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevRunInstance {
    pub dev_run_id: String,
    pub command_id: String,
    pub session_id: i32,
    pub output_file_path: String,
}

/// One configured dev-run command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevRunCommandConfig {
    pub start: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_seconds: u64,
}

fn default_stop_timeout() -> u64 {
    10
}

/// Environment handed to every dev-run command.
#[derive(Debug, Clone, Default)]
pub struct DevRunEnv {
    pub workspace_id: String,
    pub flow_id: String,
    pub worktree_dir: String,
    pub source_branch: String,
    pub base_branch: String,
    pub target_branch: String,
}

impl DevRunEnv {
    /// `(key, value)` pairs as exported to the child.
    pub fn vars(&self, dev_run_id: &str) -> Vec<(&'static str, String)> {
        vec![
            ("DEV_RUN_ID", dev_run_id.to_string()),
            ("WORKSPACE_ID", self.workspace_id.clone()),
            ("FLOW_ID", self.flow_id.clone()),
            ("WORKTREE_DIR", self.worktree_dir.clone()),
            ("SOURCE_BRANCH", self.source_branch.clone()),
            ("BASE_BRANCH", self.base_branch.clone()),
            ("TARGET_BRANCH", self.target_branch.clone()),
        ]
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DevRunError {
    #[error("unknown dev-run command: {command_id}")]
    UnknownCommand { command_id: String },

    #[error("dev run exited immediately (status {status:?})")]
    ExitedImmediately { status: Option<i32> },

    #[error("failed to spawn dev run: {0}")]
    Spawn(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
