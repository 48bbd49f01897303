//! External collaborator interfaces.
//!
//! Everything non-deterministic or out of scope for the engine — symbol
//! extraction, repository search, file access, persistence, check/test
//! execution — sits behind these traits. The engine's control flow stays
//! deterministic given the same collaborator answers, which is what makes
//! a flow replayable.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::flow::FlowAction;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CollabError {
    /// The collaborator ran and reported a structured failure. Recoverable:
    /// loops feed the diagnostic back to the model.
    #[error("{0}")]
    Failure(String),

    /// The collaborator itself is broken. Fatal for the subflow.
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
}

/// One file's worth of symbol requests for `get_symbol_definitions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolRequest {
    #[serde(rename = "filePath")]
    pub file_path: String,
    /// Empty means "all symbols in the file".
    #[serde(rename = "symbolNames", default)]
    pub symbol_names: Vec<String>,
}

/// Outcome for one symbol request: full definition text with related
/// symbols included, or a per-request diagnostic.
#[derive(Debug, Clone)]
pub struct SymbolRetrieval {
    pub file_path: String,
    pub definitions: String,
    pub failure: Option<String>,
}

#[async_trait]
pub trait SymbolRetriever: Send + Sync {
    async fn retrieve(
        &self,
        requests: &[SymbolRequest],
    ) -> Result<Vec<SymbolRetrieval>, CollabError>;
}

/// One search in a `bulk_search_repository` fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub term: String,
    #[serde(rename = "pathGlob", default)]
    pub path_glob: Option<String>,
}

/// Search results: rendered matches plus the distinct files they touch
/// (the file list is the fallback summary when matches are oversize).
#[derive(Debug, Clone, Default)]
pub struct SearchResults {
    pub rendered: String,
    pub files: Vec<String>,
}

#[async_trait]
pub trait RepoSearcher: Send + Sync {
    async fn bulk_search(&self, searches: &[SearchRequest]) -> Result<SearchResults, CollabError>;
}

/// Workspace file access rooted at the flow's worktree.
#[async_trait]
pub trait WorkspaceFiles: Send + Sync {
    fn root(&self) -> &Path;
    async fn read_to_string(&self, rel_path: &str) -> Result<String, CollabError>;
    async fn write(&self, rel_path: &str, contents: &str) -> Result<(), CollabError>;
    async fn exists(&self, rel_path: &str) -> bool;
}

/// Filesystem-backed workspace access.
pub struct LocalWorkspaceFiles {
    root: PathBuf,
}

impl LocalWorkspaceFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, rel_path: &str) -> Result<PathBuf, CollabError> {
        let path = Path::new(rel_path);
        if path.is_absolute() || path.components().any(|c| c.as_os_str() == "..") {
            return Err(CollabError::Failure(format!(
                "path must be relative to the worktree: {rel_path}"
            )));
        }
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl WorkspaceFiles for LocalWorkspaceFiles {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn read_to_string(&self, rel_path: &str) -> Result<String, CollabError> {
        let path = self.resolve(rel_path)?;
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| CollabError::Failure(format!("failed to read {rel_path}: {e}")))
    }

    async fn write(&self, rel_path: &str, contents: &str) -> Result<(), CollabError> {
        let path = self.resolve(rel_path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CollabError::Failure(format!("failed to create dirs: {e}")))?;
        }
        tokio::fs::write(&path, contents)
            .await
            .map_err(|e| CollabError::Failure(format!("failed to write {rel_path}: {e}")))
    }

    async fn exists(&self, rel_path: &str) -> bool {
        match self.resolve(rel_path) {
            Ok(path) => tokio::fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }
}

/// Persistence for externally observable flow steps. The backing store is
/// not the engine's concern; records are owned by the collaborator.
#[async_trait]
pub trait FlowPersistence: Send + Sync {
    async fn create_flow_action(&self, action: &FlowAction) -> Result<(), CollabError>;
    async fn update_flow_action(&self, action: &FlowAction) -> Result<(), CollabError>;
}

/// Which configured command a check invocation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Check,
    Autofix,
    Test,
    IntegrationTest,
}

/// Structured result of a check/test command; never an OS exit code.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub success: bool,
    pub output: String,
}

#[async_trait]
pub trait CheckRunner: Send + Sync {
    async fn run(&self, kind: CheckKind, command: &str) -> Result<CheckOutcome, CollabError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn local_files_round_trip() {
        let dir = TempDir::new().unwrap();
        let files = LocalWorkspaceFiles::new(dir.path());

        files.write("src/lib.rs", "pub fn f() {}\n").await.unwrap();
        assert!(files.exists("src/lib.rs").await);
        let back = files.read_to_string("src/lib.rs").await.unwrap();
        assert_eq!(back, "pub fn f() {}\n");
        assert!(!files.exists("src/other.rs").await);
    }

    #[tokio::test]
    async fn local_files_reject_escapes() {
        let dir = TempDir::new().unwrap();
        let files = LocalWorkspaceFiles::new(dir.path());
        assert!(files.read_to_string("../etc/passwd").await.is_err());
        assert!(files.write("/abs/path", "x").await.is_err());
        assert!(!files.exists("../..").await);
    }
}
