//! Content hashing of workflow definitions.
//!
//! Hashes are SHA-256 over a canonical JSON rendering: object keys are
//! sorted recursively and steps are ordered by name, so formatting and
//! declaration order never change the hash. The resolved start step is part
//! of the hashed form, since reordering steps can move the default start.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::WorkflowError;
use crate::workflow::{Values, Workflow};

/// Render a JSON value with object keys sorted at every level.
pub fn to_canonical_json(value: &Value) -> Result<String, WorkflowError> {
  Ok(match value {
    Value::Null => "null".to_string(),
    Value::Bool(b) => b.to_string(),
    Value::Number(n) => n.to_string(),
    Value::String(s) => serde_json::to_string(s)?,
    Value::Array(items) => {
      let items = items
        .iter()
        .map(to_canonical_json)
        .collect::<Result<Vec<_>, _>>()?;
      format!("[{}]", items.join(","))
    }
    Value::Object(map) => {
      let mut sorted = BTreeMap::new();
      for (key, value) in map {
        sorted.insert(key, to_canonical_json(value)?);
      }
      let items = sorted
        .into_iter()
        .map(|(key, value)| -> Result<String, serde_json::Error> {
          Ok(format!("{}:{}", serde_json::to_string(key)?, value))
        })
        .collect::<Result<Vec<_>, _>>()?;
      format!("{{{}}}", items.join(","))
    }
  })
}

/// The normalized definition that is hashed and recorded with an execution.
pub fn normalized_definition(workflow: &Workflow) -> Result<Value, WorkflowError> {
  let mut normalized = workflow.clone();
  normalized.start = workflow.start_step().map(str::to_string);
  normalized.steps.sort_by(|a, b| a.name.cmp(&b.name));
  normalized.inputs.sort_by(|a, b| a.name.cmp(&b.name));
  Ok(serde_json::to_value(&normalized)?)
}

fn sha256_hex(data: &str) -> String {
  format!("{:x}", Sha256::digest(data.as_bytes()))
}

/// Stable hex digest of a workflow definition.
pub fn hash_workflow(workflow: &Workflow) -> Result<String, WorkflowError> {
  let canonical = to_canonical_json(&normalized_definition(workflow)?)?;
  Ok(sha256_hex(&canonical))
}

/// Stable hex digest of an input map.
pub fn hash_inputs(inputs: &Values) -> Result<String, WorkflowError> {
  let canonical = to_canonical_json(&serde_json::to_value(inputs)?)?;
  Ok(sha256_hex(&canonical))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputChangeKind {
  Added,
  Removed,
  Modified,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputChange {
  pub name: String,
  pub kind: InputChangeKind,
}

/// How a changed definition relates to the one an execution started with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowCompatibility {
  /// False when a step the old run may have reached was removed or retyped.
  pub is_compatible: bool,
  pub incompatible_steps: Vec<String>,
  pub changed_inputs: Vec<InputChange>,
  pub summary: String,
}

/// Compare two definitions for resume compatibility.
pub fn compare_workflows(
  old: &Workflow,
  new: &Workflow,
) -> Result<WorkflowCompatibility, WorkflowError> {
  if hash_workflow(old)? == hash_workflow(new)? {
    return Ok(WorkflowCompatibility {
      is_compatible: true,
      incompatible_steps: Vec::new(),
      changed_inputs: Vec::new(),
      summary: "no changes detected".to_string(),
    });
  }

  let new_steps: HashMap<&str, &str> = new
    .steps
    .iter()
    .map(|s| (s.name.as_str(), s.step_type.as_str()))
    .collect();

  let mut incompatible_steps: Vec<String> = old
    .steps
    .iter()
    .filter(|step| {
      new_steps
        .get(step.name.as_str())
        .is_none_or(|ty| *ty != step.step_type)
    })
    .map(|step| step.name.clone())
    .collect();
  incompatible_steps.sort();

  let old_inputs: BTreeMap<&str, _> = old.inputs.iter().map(|i| (i.name.as_str(), i)).collect();
  let new_inputs: BTreeMap<&str, _> = new.inputs.iter().map(|i| (i.name.as_str(), i)).collect();

  let mut changed_inputs = Vec::new();
  for (name, input) in &old_inputs {
    match new_inputs.get(name) {
      None => changed_inputs.push(InputChange {
        name: name.to_string(),
        kind: InputChangeKind::Removed,
      }),
      Some(current) if current != input => changed_inputs.push(InputChange {
        name: name.to_string(),
        kind: InputChangeKind::Modified,
      }),
      Some(_) => {}
    }
  }
  for name in new_inputs.keys() {
    if !old_inputs.contains_key(name) {
      changed_inputs.push(InputChange {
        name: name.to_string(),
        kind: InputChangeKind::Added,
      });
    }
  }

  let summary = format!(
    "workflow changed: {} incompatible steps, {} input changes",
    incompatible_steps.len(),
    changed_inputs.len()
  );

  Ok(WorkflowCompatibility {
    is_compatible: incompatible_steps.is_empty(),
    incompatible_steps,
    changed_inputs,
    summary,
  })
}
