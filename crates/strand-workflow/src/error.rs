use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkflowError {
  #[error("workflow '{0}' has no steps")]
  Empty(String),

  #[error("duplicate step name: {0}")]
  DuplicateStep(String),

  #[error("step not found: {0}")]
  StepNotFound(String),

  #[error("edge references unknown step: from={from}, to={to}")]
  InvalidEdge { from: String, to: String },

  #[error("start step '{0}' does not exist")]
  InvalidStart(String),

  /// A cycle would make path ids and replay keys ambiguous.
  #[error("cycle detected in workflow graph at step '{0}'")]
  CycleDetected(String),

  #[error("invalid inputs: {0}")]
  InvalidInputs(String),

  #[error("failed to read workflow file {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse workflow file {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to serialize workflow for hashing: {0}")]
  Serialization(#[from] serde_json::Error),
}
