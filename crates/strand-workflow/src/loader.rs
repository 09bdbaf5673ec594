use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::WorkflowError;
use crate::workflow::Workflow;

/// File name looked up when a loader is pointed at a directory.
pub const DEFAULT_WORKFLOW_FILE: &str = "workflow.json";

/// Provides workflow definitions by path.
#[async_trait]
pub trait WorkflowLoader: Send + Sync {
  /// Load and validate the workflow at `path`.
  async fn load(&self, path: &Path) -> Result<Workflow, WorkflowError>;
}

/// Loads JSON workflow files from the local filesystem.
#[derive(Debug, Clone, Default)]
pub struct FsWorkflowLoader;

impl FsWorkflowLoader {
  pub fn new() -> Self {
    Self
  }

  async fn resolve_path(path: &Path) -> PathBuf {
    match tokio::fs::metadata(path).await {
      Ok(meta) if meta.is_dir() => path.join(DEFAULT_WORKFLOW_FILE),
      _ => path.to_path_buf(),
    }
  }
}

#[async_trait]
impl WorkflowLoader for FsWorkflowLoader {
  async fn load(&self, path: &Path) -> Result<Workflow, WorkflowError> {
    let path = Self::resolve_path(path).await;

    let contents = tokio::fs::read_to_string(&path)
      .await
      .map_err(|source| WorkflowError::Io {
        path: path.clone(),
        source,
      })?;

    let workflow: Workflow =
      serde_json::from_str(&contents).map_err(|source| WorkflowError::Parse {
        path: path.clone(),
        source,
      })?;

    workflow.validate()?;
    Ok(workflow)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const WORKFLOW: &str = r#"{
    "name": "greet",
    "steps": [
      {"name": "hello", "type": "echo", "parameters": {"value": "hi"}, "next": ["bye"]},
      {"name": "bye", "type": "echo"}
    ]
  }"#;

  #[tokio::test]
  async fn test_load_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("greet.json");
    std::fs::write(&path, WORKFLOW).unwrap();

    let workflow = FsWorkflowLoader::new().load(&path).await.unwrap();
    assert_eq!(workflow.name, "greet");
    assert_eq!(workflow.steps.len(), 2);
  }

  #[tokio::test]
  async fn test_load_directory_uses_default_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(DEFAULT_WORKFLOW_FILE), WORKFLOW).unwrap();

    let workflow = FsWorkflowLoader::new().load(dir.path()).await.unwrap();
    assert_eq!(workflow.start_step(), Some("hello"));
  }

  #[tokio::test]
  async fn test_load_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let result = FsWorkflowLoader::new()
      .load(&dir.path().join("nope.json"))
      .await;

    assert!(matches!(result, Err(WorkflowError::Io { .. })));
  }

  #[tokio::test]
  async fn test_load_rejects_invalid_graph() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.json");
    std::fs::write(
      &path,
      r#"{"name": "bad", "steps": [{"name": "a", "type": "echo", "next": ["missing"]}]}"#,
    )
    .unwrap();

    let result = FsWorkflowLoader::new().load(&path).await;
    assert!(matches!(result, Err(WorkflowError::InvalidEdge { .. })));
  }

  #[tokio::test]
  async fn test_load_rejects_malformed_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.json");
    std::fs::write(&path, "{ not json").unwrap();

    let result = FsWorkflowLoader::new().load(&path).await;
    assert!(matches!(result, Err(WorkflowError::Parse { .. })));
  }
}
