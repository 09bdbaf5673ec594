//! Reconstructs run state from a recorded history.
//!
//! Folding the log never invokes a step executor. The result says which
//! steps already completed on which path (with their outputs), which paths
//! failed or never finished, and which branch targets were never started.
//! Replay is keyed on `(path_id, step)`; path ids are derived from the graph,
//! so a resumed run walks the same paths as the original.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use strand_store::{BranchTarget, Event, EventPayload, ExecutionStatus};
use strand_workflow::Values;

/// Id of the path every execution starts with.
pub const ROOT_PATH: &str = "path-1";

/// Id of the n-th (1-based) child path created when `parent` branches.
pub fn child_path_id(parent: &str, n: usize) -> String {
  format!("{parent}-{n}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathState {
  Running,
  Completed,
  Failed,
}

/// What the log says about one path.
#[derive(Debug, Clone, PartialEq)]
pub struct PathRecord {
  pub path_id: String,
  pub start_step: String,
  pub parent: Option<String>,
  pub state: PathState,
  /// Completed steps, in completion order.
  pub completed_steps: Vec<String>,
  pub failed_step: Option<String>,
  /// Child paths announced when this path branched.
  pub children: Vec<BranchTarget>,
}

impl PathRecord {
  fn new(path_id: &str, start_step: &str, parent: Option<String>) -> Self {
    Self {
      path_id: path_id.to_string(),
      start_step: start_step.to_string(),
      parent,
      state: PathState::Running,
      completed_steps: Vec::new(),
      failed_step: None,
      children: Vec::new(),
    }
  }
}

/// A path to run: fresh, restarted, or continued after a replay.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PathPlan {
  pub path_id: String,
  pub start_step: String,
  pub parent: Option<String>,
  /// Record `path_started` before running. False when the log already shows
  /// the path as running.
  pub announce: bool,
  /// Outputs visible to the first step of the path.
  pub outputs: Values,
}

impl PathPlan {
  pub fn root(start_step: &str) -> Self {
    Self {
      path_id: ROOT_PATH.to_string(),
      start_step: start_step.to_string(),
      parent: None,
      announce: true,
      outputs: Values::new(),
    }
  }
}

/// State folded from an execution's history.
#[derive(Debug, Clone, Default)]
pub struct ReplayState {
  status: Option<ExecutionStatus>,
  last_sequence: i64,
  event_count: u64,
  paths: BTreeMap<String, PathRecord>,
  outputs: HashMap<(String, String), Value>,
  recorded_workflow: Option<Value>,
}

impl ReplayState {
  pub fn from_events<'a, I>(events: I) -> Self
  where
    I: IntoIterator<Item = &'a Event>,
  {
    let mut state = Self::default();
    for event in events {
      state.apply(event);
    }
    state
  }

  pub fn apply(&mut self, event: &Event) {
    self.last_sequence = event.sequence;
    self.event_count += 1;

    match &event.payload {
      EventPayload::ExecutionStarted(started) => {
        self.status = Some(ExecutionStatus::Running);
        self.recorded_workflow = started.workflow.clone();
      }
      EventPayload::ExecutionResumed(_) => self.status = Some(ExecutionStatus::Running),
      EventPayload::ExecutionCompleted(_) => self.status = Some(ExecutionStatus::Completed),
      EventPayload::ExecutionFailed(_) => self.status = Some(ExecutionStatus::Failed),
      EventPayload::PathStarted(started) => {
        let record = self
          .paths
          .entry(event.path_id.clone())
          .or_insert_with(|| {
            PathRecord::new(&event.path_id, &started.start_step, started.parent_path.clone())
          });
        // A failed path that is started again keeps its completed steps.
        record.state = PathState::Running;
        record.failed_step = None;
      }
      EventPayload::StepStarted(_) => {
        self.path_mut(event);
      }
      EventPayload::StepCompleted(completed) => {
        let record = self.path_mut(event);
        if !record.completed_steps.contains(&event.step) {
          record.completed_steps.push(event.step.clone());
        }
        if record.failed_step.as_deref() == Some(event.step.as_str()) {
          record.failed_step = None;
        }
        self.outputs.insert(
          (event.path_id.clone(), event.step.clone()),
          completed.output.clone(),
        );
      }
      EventPayload::StepFailed(_) => {
        self.path_mut(event).failed_step = Some(event.step.clone());
      }
      EventPayload::PathBranched(branched) => {
        self.path_mut(event).children = branched.new_paths.clone();
      }
      EventPayload::PathCompleted(_) => self.path_mut(event).state = PathState::Completed,
      EventPayload::PathFailed(_) => self.path_mut(event).state = PathState::Failed,
      EventPayload::Unknown(_) => {}
    }
  }

  fn path_mut(&mut self, event: &Event) -> &mut PathRecord {
    self
      .paths
      .entry(event.path_id.clone())
      .or_insert_with(|| PathRecord::new(&event.path_id, &event.step, None))
  }

  /// Execution status according to the log; `None` before
  /// `execution_started`.
  pub fn status(&self) -> Option<ExecutionStatus> {
    self.status
  }

  pub fn last_sequence(&self) -> i64 {
    self.last_sequence
  }

  pub fn event_count(&self) -> u64 {
    self.event_count
  }

  /// The normalized definition recorded when the execution started.
  pub fn recorded_workflow(&self) -> Option<&Value> {
    self.recorded_workflow.as_ref()
  }

  pub fn path(&self, path_id: &str) -> Option<&PathRecord> {
    self.paths.get(path_id)
  }

  pub fn paths(&self) -> impl Iterator<Item = &PathRecord> {
    self.paths.values()
  }

  /// Recorded output of a step that completed on this path.
  pub fn completed_output(&self, path_id: &str, step: &str) -> Option<&Value> {
    self.outputs.get(&(path_id.to_string(), step.to_string()))
  }

  pub fn completed_step_count(&self) -> usize {
    self.outputs.len()
  }

  /// Outputs produced on a path and its ancestors, nearest path winning.
  pub fn lineage_outputs(&self, path_id: &str) -> Values {
    let mut chain = Vec::new();
    let mut current = Some(path_id);
    while let Some(id) = current {
      let Some(record) = self.paths.get(id) else {
        break;
      };
      chain.push(record);
      current = record.parent.as_deref();
    }

    let mut outputs = Values::new();
    for record in chain.into_iter().rev() {
      for step in &record.completed_steps {
        if let Some(output) = self.completed_output(&record.path_id, step) {
          outputs.insert(step.clone(), output.clone());
        }
      }
    }
    outputs
  }

  /// Paths a resumed run has to (re)start, in path id order.
  ///
  /// Running paths continue where they stopped, failed paths are restarted,
  /// and branch targets that never started are started. Completed steps are
  /// skipped by the path runner, not here.
  pub(crate) fn frontier(&self, start_step: &str) -> Vec<PathPlan> {
    if self.paths.is_empty() {
      return vec![PathPlan::root(start_step)];
    }

    let mut plans = Vec::new();
    for record in self.paths.values() {
      let parent_outputs = || {
        record
          .parent
          .as_deref()
          .map(|parent| self.lineage_outputs(parent))
          .unwrap_or_default()
      };

      match record.state {
        PathState::Running | PathState::Failed => plans.push(PathPlan {
          path_id: record.path_id.clone(),
          start_step: record.start_step.clone(),
          parent: record.parent.clone(),
          announce: record.state == PathState::Failed,
          outputs: parent_outputs(),
        }),
        PathState::Completed => {
          for child in &record.children {
            if !self.paths.contains_key(&child.path_id) {
              plans.push(PathPlan {
                path_id: child.path_id.clone(),
                start_step: child.start_step.clone(),
                parent: Some(record.path_id.clone()),
                announce: true,
                outputs: self.lineage_outputs(&record.path_id),
              });
            }
          }
        }
      }
    }

    plans.sort_by(|a, b| a.path_id.cmp(&b.path_id));
    plans
  }
}
