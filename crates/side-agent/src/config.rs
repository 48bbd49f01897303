//! Repository configuration.
//!
//! Discovered at the repository root as `side.yml`, `side.yaml`,
//! `side.toml`, or `side.json` — first hit wins, extra candidates earn a
//! warning. Edit-code hints fall back to the conventional instruction
//! files other tools leave behind.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dev_run::DevRunCommandConfig;

/// Candidate config files, in priority order.
const CONFIG_CANDIDATES: &[&str] = &["side.yml", "side.yaml", "side.toml", "side.json"];

/// Hint files consulted when the config carries no explicit hints.
const HINT_FALLBACKS: &[&str] = &[
    "AGENTS.md",
    "CLAUDE.md",
    "GEMINI.md",
    ".github/copilot-instructions.md",
    ".clinerules",
    ".cursorrules",
    ".windsurfrules",
    "CONVENTIONS.md",
];

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditCodeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hints: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hints_path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DevRunConfig {
    #[serde(default)]
    pub commands: HashMap<String, DevRunCommandConfig>,
}

/// Per-agent loop tuning, keyed by subflow or agent name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfigEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_commands: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autofix_commands: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_commands: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integration_test_commands: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mission: Option<String>,
    #[serde(default)]
    pub disable_human_in_the_loop: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_planning_iterations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit_code: Option<EditCodeConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_setup: Option<String>,
    #[serde(default)]
    pub dev_run: DevRunConfig,
    #[serde(default)]
    pub agent_config: HashMap<String, AgentConfigEntry>,
}

impl RepoConfig {
    /// Loop tuning for one subflow; missing keys mean defaults.
    pub fn agent_entry(&self, key: &str) -> AgentConfigEntry {
        self.agent_config.get(key).cloned().unwrap_or_default()
    }
}

/// Find and parse the repository config. `Ok(None)` when the repository
/// carries no config file at all.
pub fn discover(repo_root: &Path) -> Result<Option<(RepoConfig, PathBuf)>, ConfigError> {
    let present: Vec<PathBuf> = CONFIG_CANDIDATES
        .iter()
        .map(|name| repo_root.join(name))
        .filter(|p| p.is_file())
        .collect();

    let Some(chosen) = present.first().cloned() else {
        return Ok(None);
    };
    if present.len() > 1 {
        log::warn!(
            "multiple config files found ({}); using {}",
            present
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            chosen.display()
        );
    }

    let raw = std::fs::read_to_string(&chosen).map_err(|e| ConfigError::Read {
        path: chosen.display().to_string(),
        source: e,
    })?;
    let config = parse(&chosen, &raw)?;
    Ok(Some((config, chosen)))
}

fn parse(path: &Path, raw: &str) -> Result<RepoConfig, ConfigError> {
    let parse_err = |reason: String| ConfigError::Parse {
        path: path.display().to_string(),
        reason,
    };
    match path.extension().and_then(|e| e.to_str()) {
        Some("yml") | Some("yaml") => {
            serde_yaml::from_str(raw).map_err(|e| parse_err(e.to_string()))
        }
        Some("toml") => toml::from_str(raw).map_err(|e| parse_err(e.to_string())),
        Some("json") => serde_json::from_str(raw).map_err(|e| parse_err(e.to_string())),
        other => Err(parse_err(format!("unsupported extension: {other:?}"))),
    }
}

/// Resolve edit-code hints: explicit hints, then `hintsPath`, then the
/// conventional fallback files in order.
pub fn edit_hints(config: Option<&RepoConfig>, repo_root: &Path) -> Option<String> {
    if let Some(edit_code) = config.and_then(|c| c.edit_code.as_ref()) {
        if let Some(hints) = &edit_code.hints
            && !hints.is_empty()
        {
            return Some(hints.clone());
        }
        if let Some(hints_path) = &edit_code.hints_path {
            match std::fs::read_to_string(repo_root.join(hints_path)) {
                Ok(contents) => return Some(contents),
                Err(e) => {
                    log::warn!("hintsPath {hints_path} unreadable: {e}");
                }
            }
        }
    }

    for candidate in HINT_FALLBACKS {
        let path = repo_root.join(candidate);
        if let Ok(contents) = std::fs::read_to_string(&path) {
            return Some(contents);
        }
    }
    None
}
