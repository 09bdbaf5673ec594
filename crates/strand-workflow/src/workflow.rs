use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WorkflowError;
use crate::graph::Graph;

/// Named values passed into an execution or produced by its steps.
pub type Values = BTreeMap<String, Value>;

/// What to do with the rest of the execution when one path fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathFailureMode {
  /// Stop scheduling new steps and fail the execution.
  #[default]
  StopAndFail,
  /// Let the other paths finish; the execution completes and lists the
  /// failed paths.
  Continue,
}

/// A declared workflow input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Input {
  pub name: String,
  #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
  pub input_type: Option<String>,
  #[serde(default)]
  pub required: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub default: Option<Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
}

impl Input {
  /// Check a provided value against the declared JSON kind, if any.
  fn accepts(&self, value: &Value) -> bool {
    match self.input_type.as_deref() {
      None | Some("any") => true,
      Some("string") => value.is_string(),
      Some("number") => value.is_number(),
      Some("integer") => value.is_i64() || value.is_u64(),
      Some("boolean") => value.is_boolean(),
      Some("object") => value.is_object(),
      Some("array") => value.is_array(),
      Some(_) => true,
    }
  }
}

/// A single unit of work. The engine treats `step_type` and `parameters` as
/// opaque; they are interpreted by the step executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
  pub name: String,
  #[serde(rename = "type")]
  pub step_type: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(default)]
  pub parameters: Values,
  /// Successor steps. One continues the path, several fan out into new paths.
  #[serde(default)]
  pub next: Vec<String>,
}

impl Step {
  pub fn new(name: impl Into<String>, step_type: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      step_type: step_type.into(),
      description: None,
      parameters: Values::new(),
      next: Vec::new(),
    }
  }

  pub fn with_next<I, S>(mut self, next: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.next = next.into_iter().map(Into::into).collect();
    self
  }

  pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
    self.parameters.insert(key.into(), value);
    self
  }
}

/// A workflow definition: a graph of steps plus its declared inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(default)]
  pub inputs: Vec<Input>,
  pub steps: Vec<Step>,
  /// Entry step. Defaults to the first declared step.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub start: Option<String>,
  #[serde(default)]
  pub path_failure: PathFailureMode,
}

impl Workflow {
  pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
    Self {
      name: name.into(),
      description: None,
      inputs: Vec::new(),
      steps,
      start: None,
      path_failure: PathFailureMode::default(),
    }
  }

  /// Build the graph structure for traversal.
  pub fn graph(&self) -> Graph {
    Graph::new(&self.steps)
  }

  /// Get a step by name.
  pub fn get_step(&self, name: &str) -> Option<&Step> {
    self.steps.iter().find(|s| s.name == name)
  }

  /// Name of the step the first path starts at.
  pub fn start_step(&self) -> Option<&str> {
    self
      .start
      .as_deref()
      .or_else(|| self.steps.first().map(|s| s.name.as_str()))
  }

  /// Validate the graph: non-empty, unique names, known edges and start,
  /// and no cycles.
  pub fn validate(&self) -> Result<(), WorkflowError> {
    if self.steps.is_empty() {
      return Err(WorkflowError::Empty(self.name.clone()));
    }

    let mut names = HashSet::new();
    for step in &self.steps {
      if !names.insert(step.name.as_str()) {
        return Err(WorkflowError::DuplicateStep(step.name.clone()));
      }
    }

    for step in &self.steps {
      for next in &step.next {
        if !names.contains(next.as_str()) {
          return Err(WorkflowError::InvalidEdge {
            from: step.name.clone(),
            to: next.clone(),
          });
        }
      }
    }

    if let Some(start) = &self.start {
      if !names.contains(start.as_str()) {
        return Err(WorkflowError::InvalidStart(start.clone()));
      }
    }

    if let Some(step) = self.graph().find_cycle() {
      return Err(WorkflowError::CycleDetected(step));
    }

    Ok(())
  }

  /// Check provided inputs against the declarations and fill in defaults.
  ///
  /// Undeclared inputs are passed through untouched.
  pub fn resolve_inputs(&self, provided: Values) -> Result<Values, WorkflowError> {
    let mut resolved = provided;

    for input in &self.inputs {
      match resolved.get(&input.name) {
        Some(value) => {
          if !input.accepts(value) {
            return Err(WorkflowError::InvalidInputs(format!(
              "input '{}' must be of type {}",
              input.name,
              input.input_type.as_deref().unwrap_or("any")
            )));
          }
        }
        None => match &input.default {
          Some(default) => {
            resolved.insert(input.name.clone(), default.clone());
          }
          None if input.required => {
            return Err(WorkflowError::InvalidInputs(format!(
              "missing required input '{}'",
              input.name
            )));
          }
          None => {}
        },
      }
    }

    Ok(resolved)
  }
}
