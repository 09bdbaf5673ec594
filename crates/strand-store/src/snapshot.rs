use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::Values;

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ExecutionStatus {
  Pending,
  Running,
  Completed,
  Failed,
}

impl ExecutionStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Running => "running",
      Self::Completed => "completed",
      Self::Failed => "failed",
    }
  }

  pub fn is_terminal(&self) -> bool {
    matches!(self, Self::Completed | Self::Failed)
  }

  /// Everything but a completed execution can be resumed. Failed steps are
  /// retried on resume.
  pub fn is_resumable(&self) -> bool {
    !matches!(self, Self::Completed)
  }
}

impl fmt::Display for ExecutionStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ExecutionStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "pending" => Ok(Self::Pending),
      "running" => Ok(Self::Running),
      "completed" => Ok(Self::Completed),
      "failed" => Ok(Self::Failed),
      other => Err(format!(
        "unknown status '{other}' (expected pending, running, completed or failed)"
      )),
    }
  }
}

/// Materialized state of one execution, derived from its event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
  pub id: String,
  pub workflow_name: String,
  pub workflow_path: Option<String>,
  pub workflow_hash: String,
  pub inputs_hash: String,
  pub status: ExecutionStatus,
  pub start_time: Option<DateTime<Utc>>,
  pub end_time: Option<DateTime<Utc>>,
  pub inputs: Values,
  pub outputs: Values,
  pub error: Option<String>,
  pub last_event_seq: i64,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl ExecutionSnapshot {
  /// Snapshot of an execution nothing has been folded into yet.
  pub fn pending(id: impl Into<String>, at: DateTime<Utc>) -> Self {
    Self {
      id: id.into(),
      workflow_name: String::new(),
      workflow_path: None,
      workflow_hash: String::new(),
      inputs_hash: String::new(),
      status: ExecutionStatus::Pending,
      start_time: None,
      end_time: None,
      inputs: Values::new(),
      outputs: Values::new(),
      error: None,
      last_event_seq: 0,
      created_at: at,
      updated_at: at,
    }
  }

  /// Wall-clock time between start and end, when both are known.
  pub fn duration(&self) -> Option<chrono::TimeDelta> {
    Some(self.end_time? - self.start_time?)
  }
}

/// Query parameters for listing executions. Constructed per call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionFilter {
  pub status: Option<ExecutionStatus>,
  pub workflow_name: Option<String>,
  pub limit: Option<u32>,
  pub offset: Option<u32>,
}

impl ExecutionFilter {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn status(mut self, status: ExecutionStatus) -> Self {
    self.status = Some(status);
    self
  }

  pub fn workflow_name(mut self, name: impl Into<String>) -> Self {
    self.workflow_name = Some(name.into());
    self
  }

  pub fn limit(mut self, limit: u32) -> Self {
    self.limit = Some(limit);
    self
  }

  pub fn offset(mut self, offset: u32) -> Self {
    self.offset = Some(offset);
    self
  }
}
