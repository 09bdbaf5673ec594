use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Named values: execution inputs, or step outputs keyed by step name.
pub type Values = BTreeMap<String, Value>;

/// Version of the payload encoding written by this build.
pub const PAYLOAD_VERSION: i64 = 1;

/// Discriminant of an [`EventPayload`], stored alongside the payload so the
/// log can be filtered without decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
  ExecutionStarted,
  ExecutionResumed,
  PathStarted,
  PathBranched,
  PathCompleted,
  PathFailed,
  StepStarted,
  StepCompleted,
  StepFailed,
  ExecutionCompleted,
  ExecutionFailed,
  Unknown,
}

impl EventType {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::ExecutionStarted => "execution_started",
      Self::ExecutionResumed => "execution_resumed",
      Self::PathStarted => "path_started",
      Self::PathBranched => "path_branched",
      Self::PathCompleted => "path_completed",
      Self::PathFailed => "path_failed",
      Self::StepStarted => "step_started",
      Self::StepCompleted => "step_completed",
      Self::StepFailed => "step_failed",
      Self::ExecutionCompleted => "execution_completed",
      Self::ExecutionFailed => "execution_failed",
      Self::Unknown => "unknown",
    }
  }

  /// Parse a stored type name. Names this build does not know map to
  /// [`EventType::Unknown`].
  pub fn parse(name: &str) -> Self {
    match name {
      "execution_started" => Self::ExecutionStarted,
      "execution_resumed" => Self::ExecutionResumed,
      "path_started" => Self::PathStarted,
      "path_branched" => Self::PathBranched,
      "path_completed" => Self::PathCompleted,
      "path_failed" => Self::PathFailed,
      "step_started" => Self::StepStarted,
      "step_completed" => Self::StepCompleted,
      "step_failed" => Self::StepFailed,
      "execution_completed" => Self::ExecutionCompleted,
      "execution_failed" => Self::ExecutionFailed,
      _ => Self::Unknown,
    }
  }
}

impl fmt::Display for EventType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStarted {
  pub workflow_name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub workflow_path: Option<String>,
  pub workflow_hash: String,
  pub inputs_hash: String,
  #[serde(default)]
  pub inputs: Values,
  /// Normalized definition the execution started with, for drift reports.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub workflow: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResumed {
  pub workflow_hash: String,
  pub replayed_events: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathStarted {
  pub start_step: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub parent_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchTarget {
  pub path_id: String,
  pub start_step: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathBranched {
  pub new_paths: Vec<BranchTarget>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathCompleted {
  pub final_step: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
  pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStarted {
  pub step_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCompleted {
  pub output: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionCompleted {
  #[serde(default)]
  pub outputs: Values,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub failed_paths: Vec<String>,
}

/// Typed event data, one variant per event type.
///
/// Encoded as JSON with a `type` tag. A tag this build does not recognise is
/// kept verbatim as [`EventPayload::Unknown`] so older binaries can still read
/// logs written by newer ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
  ExecutionStarted(ExecutionStarted),
  ExecutionResumed(ExecutionResumed),
  PathStarted(PathStarted),
  PathBranched(PathBranched),
  PathCompleted(PathCompleted),
  PathFailed(Failure),
  StepStarted(StepStarted),
  StepCompleted(StepCompleted),
  StepFailed(Failure),
  ExecutionCompleted(ExecutionCompleted),
  ExecutionFailed(Failure),
  #[serde(skip)]
  Unknown(Value),
}

impl EventPayload {
  pub fn event_type(&self) -> EventType {
    match self {
      Self::ExecutionStarted(_) => EventType::ExecutionStarted,
      Self::ExecutionResumed(_) => EventType::ExecutionResumed,
      Self::PathStarted(_) => EventType::PathStarted,
      Self::PathBranched(_) => EventType::PathBranched,
      Self::PathCompleted(_) => EventType::PathCompleted,
      Self::PathFailed(_) => EventType::PathFailed,
      Self::StepStarted(_) => EventType::StepStarted,
      Self::StepCompleted(_) => EventType::StepCompleted,
      Self::StepFailed(_) => EventType::StepFailed,
      Self::ExecutionCompleted(_) => EventType::ExecutionCompleted,
      Self::ExecutionFailed(_) => EventType::ExecutionFailed,
      Self::Unknown(_) => EventType::Unknown,
    }
  }

  /// Type name as written to the log. Unknown payloads keep their own tag.
  pub fn type_name(&self) -> &str {
    match self {
      Self::Unknown(raw) => raw
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or(EventType::Unknown.as_str()),
      other => other.event_type().as_str(),
    }
  }

  pub fn to_json(&self) -> Result<Value, serde_json::Error> {
    match self {
      Self::Unknown(raw) => Ok(raw.clone()),
      other => serde_json::to_value(other),
    }
  }

  /// Decode a stored payload.
  ///
  /// Payloads written by a newer encoding version, or carrying a tag this
  /// build does not know, decode to [`EventPayload::Unknown`]. A known tag
  /// with malformed data is an error.
  pub fn from_json(type_name: &str, version: i64, raw: Value) -> Result<Self, serde_json::Error> {
    if version > PAYLOAD_VERSION || EventType::parse(type_name) == EventType::Unknown {
      return Ok(Self::Unknown(raw));
    }
    serde_json::from_value(raw)
  }
}

/// An event to be appended. The store assigns the sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
  /// Empty for execution-level events.
  pub path_id: String,
  /// Empty for execution- and path-level events.
  pub step: String,
  pub timestamp: DateTime<Utc>,
  pub payload: EventPayload,
}

impl NewEvent {
  pub fn execution(payload: EventPayload) -> Self {
    Self::step("", "", payload)
  }

  pub fn path(path_id: impl Into<String>, payload: EventPayload) -> Self {
    Self::step(path_id, "", payload)
  }

  pub fn step(path_id: impl Into<String>, step: impl Into<String>, payload: EventPayload) -> Self {
    Self {
      path_id: path_id.into(),
      step: step.into(),
      timestamp: Utc::now(),
      payload,
    }
  }

  pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
    self.timestamp = timestamp;
    self
  }
}

/// A durably recorded event.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
  pub execution_id: String,
  /// Position in the execution's log, starting at 1 with no gaps.
  pub sequence: i64,
  pub path_id: String,
  pub step: String,
  pub timestamp: DateTime<Utc>,
  pub payload: EventPayload,
}

impl Event {
  pub fn event_type(&self) -> EventType {
    self.payload.event_type()
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[test]
  fn test_payload_is_tagged() {
    let payload = EventPayload::StepCompleted(StepCompleted {
      output: json!({"rows": 3}),
    });

    let value = payload.to_json().unwrap();
    assert_eq!(value, json!({"type": "step_completed", "output": {"rows": 3}}));
    assert_eq!(payload.type_name(), "step_completed");

    let decoded = EventPayload::from_json("step_completed", PAYLOAD_VERSION, value).unwrap();
    assert_eq!(decoded, payload);
  }

  #[test]
  fn test_unknown_tag_is_preserved() {
    let raw = json!({"type": "step_paused", "reason": "operator"});
    let decoded = EventPayload::from_json("step_paused", PAYLOAD_VERSION, raw.clone()).unwrap();

    assert_eq!(decoded, EventPayload::Unknown(raw.clone()));
    assert_eq!(decoded.event_type(), EventType::Unknown);
    assert_eq!(decoded.type_name(), "step_paused");
    assert_eq!(decoded.to_json().unwrap(), raw);
  }

  #[test]
  fn test_newer_version_decodes_as_unknown() {
    let raw = json!({"type": "step_completed", "result": {"shape": "new"}});
    let decoded = EventPayload::from_json("step_completed", PAYLOAD_VERSION + 1, raw).unwrap();
    assert_eq!(decoded.event_type(), EventType::Unknown);
  }

  #[test]
  fn test_malformed_known_payload_is_an_error() {
    let raw = json!({"type": "step_failed"});
    assert!(EventPayload::from_json("step_failed", PAYLOAD_VERSION, raw).is_err());
  }

  #[test]
  fn test_event_type_names_round_trip() {
    for ty in [
      EventType::ExecutionStarted,
      EventType::PathBranched,
      EventType::StepFailed,
      EventType::ExecutionCompleted,
    ] {
      assert_eq!(EventType::parse(ty.as_str()), ty);
    }
    assert_eq!(EventType::parse("something_else"), EventType::Unknown);
  }
}
