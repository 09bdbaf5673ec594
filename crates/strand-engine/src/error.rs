//! Engine errors.

use strand_store::StoreError;
use strand_workflow::WorkflowError;

use crate::confirm::DriftReport;

/// Errors that can occur while creating, running or managing executions.
///
/// A failing step is not an error: it is recorded as `step_failed` and
/// reflected in the execution's status.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
  /// No execution with this id exists.
  #[error("execution '{0}' not found")]
  NotFound(String),

  /// The execution already completed; there is nothing to resume.
  #[error("execution '{execution_id}' is already completed and cannot be resumed")]
  CannotResume { execution_id: String },

  /// The execution's recorded state does not allow resuming it.
  #[error("execution '{execution_id}' cannot be resumed: {message}")]
  InvalidResumeState {
    execution_id: String,
    message: String,
  },

  /// The definition on disk changed since the execution started and the
  /// change was not confirmed.
  #[error(
    "workflow definition for execution '{}' changed since it started ({} -> {})",
    .0.execution_id,
    .0.recorded_hash,
    .0.current_hash
  )]
  DefinitionDrift(Box<DriftReport>),

  #[error("invalid inputs: {0}")]
  InvalidInputs(String),

  #[error("invalid execution options: {0}")]
  InvalidOptions(String),

  #[error(transparent)]
  Workflow(WorkflowError),

  #[error("storage error: {0}")]
  Storage(StoreError),

  /// The run was cancelled before it finished. The execution stays
  /// `running` on disk and can be resumed.
  #[error("execution cancelled")]
  Cancelled,

  #[error("path task join error: {0}")]
  Join(String),
}

impl From<StoreError> for EngineError {
  fn from(error: StoreError) -> Self {
    match error {
      StoreError::NotFound(id) => Self::NotFound(id),
      other => Self::Storage(other),
    }
  }
}

impl From<WorkflowError> for EngineError {
  fn from(error: WorkflowError) -> Self {
    match error {
      WorkflowError::InvalidInputs(message) => Self::InvalidInputs(message),
      other => Self::Workflow(other),
    }
  }
}

impl EngineError {
  /// Whether a resume was refused because of the execution's recorded
  /// state. Covers executions that already completed.
  pub fn is_invalid_resume_state(&self) -> bool {
    matches!(
      self,
      Self::CannotResume { .. } | Self::InvalidResumeState { .. }
    )
  }
}
