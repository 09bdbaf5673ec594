//! Presentation hooks.
//!
//! The engine reports progress through a [`Formatter`] and never writes to
//! the terminal itself. Every callback has an empty default, so an
//! implementation only overrides what it renders.

use serde_json::Value;
use strand_workflow::{Step, Values, Workflow};
use tokio::sync::mpsc;

use crate::stats::{ExecutionReport, ExecutionStats};

/// Receives progress callbacks from a running execution.
pub trait Formatter: Send + Sync {
  fn workflow_header(&self, _workflow: &Workflow, _inputs: &Values) {}

  /// Called once the execution id is known. `resumed` is true for replays.
  fn execution_id(&self, _execution_id: &str, _resumed: bool) {}

  fn step_started(&self, _path_id: &str, _step: &Step) {}

  /// A step that completed in an earlier run and was skipped on replay.
  fn step_replayed(&self, _path_id: &str, _step: &Step, _output: &Value) {}

  fn step_completed(&self, _path_id: &str, _step: &Step, _output: &Value) {}

  fn step_failed(&self, _path_id: &str, _step: &Step, _error: &str) {}

  fn workflow_complete(&self, _report: &ExecutionReport) {}

  fn workflow_error(&self, _error: &str) {}

  fn execution_stats(&self, _stats: &ExecutionStats) {}
}

/// A formatter that renders nothing.
#[derive(Debug, Clone, Default)]
pub struct NoopFormatter;

impl Formatter for NoopFormatter {}

/// Progress callbacks as values, for consumers that process them elsewhere.
#[derive(Debug, Clone, PartialEq)]
pub enum FormatterEvent {
  ExecutionId { execution_id: String, resumed: bool },
  StepStarted { path_id: String, step: String },
  StepReplayed { path_id: String, step: String },
  StepCompleted { path_id: String, step: String, output: Value },
  StepFailed { path_id: String, step: String, error: String },
  WorkflowComplete { execution_id: String },
  WorkflowError { error: String },
}

/// A formatter that forwards callbacks to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelFormatter {
  sender: mpsc::UnboundedSender<FormatterEvent>,
}

impl ChannelFormatter {
  pub fn new(sender: mpsc::UnboundedSender<FormatterEvent>) -> Self {
    Self { sender }
  }

  fn send(&self, event: FormatterEvent) {
    // Receiver may have been dropped
    let _ = self.sender.send(event);
  }
}

impl Formatter for ChannelFormatter {
  fn execution_id(&self, execution_id: &str, resumed: bool) {
    self.send(FormatterEvent::ExecutionId {
      execution_id: execution_id.to_string(),
      resumed,
    });
  }

  fn step_started(&self, path_id: &str, step: &Step) {
    self.send(FormatterEvent::StepStarted {
      path_id: path_id.to_string(),
      step: step.name.clone(),
    });
  }

  fn step_replayed(&self, path_id: &str, step: &Step, _output: &Value) {
    self.send(FormatterEvent::StepReplayed {
      path_id: path_id.to_string(),
      step: step.name.clone(),
    });
  }

  fn step_completed(&self, path_id: &str, step: &Step, output: &Value) {
    self.send(FormatterEvent::StepCompleted {
      path_id: path_id.to_string(),
      step: step.name.clone(),
      output: output.clone(),
    });
  }

  fn step_failed(&self, path_id: &str, step: &Step, error: &str) {
    self.send(FormatterEvent::StepFailed {
      path_id: path_id.to_string(),
      step: step.name.clone(),
      error: error.to_string(),
    });
  }

  fn workflow_complete(&self, report: &ExecutionReport) {
    self.send(FormatterEvent::WorkflowComplete {
      execution_id: report.execution_id.clone(),
    });
  }

  fn workflow_error(&self, error: &str) {
    self.send(FormatterEvent::WorkflowError {
      error: error.to_string(),
    });
  }
}
