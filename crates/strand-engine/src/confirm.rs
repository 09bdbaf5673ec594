use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use strand_store::ExecutionSnapshot;
use strand_workflow::WorkflowCompatibility;

/// The definition on disk no longer matches the one an execution recorded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftReport {
  pub execution_id: String,
  pub workflow_path: String,
  pub recorded_hash: String,
  pub current_hash: String,
  /// Present when the recorded definition could be recovered from the log.
  pub compatibility: Option<WorkflowCompatibility>,
}

/// An operation that needs an operator's go-ahead.
#[derive(Debug, Clone)]
pub enum ConfirmationRequest {
  DeleteExecution {
    snapshot: ExecutionSnapshot,
  },
  Cleanup {
    candidates: Vec<ExecutionSnapshot>,
    older_than: DateTime<Utc>,
  },
  ResumeWithDrift(DriftReport),
}

impl ConfirmationRequest {
  /// Short question suitable for a prompt.
  pub fn question(&self) -> String {
    match self {
      Self::DeleteExecution { snapshot } => format!(
        "Delete execution {} ({}, {})?",
        snapshot.id, snapshot.workflow_name, snapshot.status
      ),
      Self::Cleanup { candidates, .. } => {
        format!("Delete {} completed execution(s)?", candidates.len())
      }
      Self::ResumeWithDrift(report) => format!(
        "Workflow {} changed since execution {} started. Resume with the changed workflow?",
        report.workflow_path, report.execution_id
      ),
    }
  }
}

/// Asks for confirmation of destructive or risky operations.
#[async_trait]
pub trait ConfirmationPort: Send + Sync {
  async fn confirm(&self, request: &ConfirmationRequest) -> bool;
}

/// Accepts every request.
#[derive(Debug, Clone, Default)]
pub struct AlwaysConfirm;

#[async_trait]
impl ConfirmationPort for AlwaysConfirm {
  async fn confirm(&self, _request: &ConfirmationRequest) -> bool {
    true
  }
}

/// Declines every request. The behaviour for unattended runs.
#[derive(Debug, Clone, Default)]
pub struct NeverConfirm;

#[async_trait]
impl ConfirmationPort for NeverConfirm {
  async fn confirm(&self, _request: &ConfirmationRequest) -> bool {
    false
  }
}
