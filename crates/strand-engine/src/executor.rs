use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use strand_workflow::{Step, Values};
use tokio_util::sync::CancellationToken;

/// What a step executor gets to see about the run it is part of.
#[derive(Debug, Clone)]
pub struct StepContext {
  pub execution_id: String,
  pub path_id: String,
  /// Resolved execution inputs.
  pub inputs: Arc<Values>,
  /// Outputs of the steps completed earlier on this path and its ancestors,
  /// keyed by step name.
  pub outputs: Values,
  /// Fired when the run is cancelled. A step that finishes successfully
  /// within the shutdown grace period is still recorded; one that stops
  /// with an error is treated as interrupted and runs again on resume.
  pub abort: CancellationToken,
}

/// A step that did not complete. Recorded as `step_failed`, as is a panic
/// in the executor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct StepError {
  pub message: String,
}

impl StepError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
    }
  }
}

impl From<String> for StepError {
  fn from(message: String) -> Self {
    Self { message }
  }
}

impl From<&str> for StepError {
  fn from(message: &str) -> Self {
    Self::new(message)
  }
}

/// Runs individual steps. Supplied by the environment; the engine treats
/// steps as opaque.
#[async_trait]
pub trait StepExecutor: Send + Sync {
  async fn execute(&self, step: &Step, ctx: StepContext) -> Result<Value, StepError>;
}
