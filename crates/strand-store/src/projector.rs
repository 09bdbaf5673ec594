//! Folds an event log into an [`ExecutionSnapshot`].
//!
//! Projection is pure and deterministic: the snapshot after event N depends
//! only on events 1..=N. The store applies the same fold inside the append
//! transaction, so a stored snapshot can always be rebuilt from the log.

use crate::event::{Event, EventPayload};
use crate::snapshot::{ExecutionSnapshot, ExecutionStatus};

/// Fold one event into a snapshot.
pub fn apply(snapshot: &mut ExecutionSnapshot, event: &Event) {
  match &event.payload {
    EventPayload::ExecutionStarted(started) => {
      snapshot.workflow_name = started.workflow_name.clone();
      snapshot.workflow_path = started.workflow_path.clone();
      snapshot.workflow_hash = started.workflow_hash.clone();
      snapshot.inputs_hash = started.inputs_hash.clone();
      snapshot.inputs = started.inputs.clone();
      snapshot.status = ExecutionStatus::Running;
      snapshot.start_time = Some(event.timestamp);
      snapshot.created_at = event.timestamp;
    }
    EventPayload::ExecutionResumed(resumed) => {
      snapshot.workflow_hash = resumed.workflow_hash.clone();
      snapshot.status = ExecutionStatus::Running;
      snapshot.end_time = None;
      snapshot.error = None;
    }
    EventPayload::ExecutionCompleted(completed) => {
      snapshot.status = ExecutionStatus::Completed;
      snapshot.outputs = completed.outputs.clone();
      snapshot.end_time = Some(event.timestamp);
      snapshot.error = None;
    }
    EventPayload::ExecutionFailed(failure) => {
      snapshot.status = ExecutionStatus::Failed;
      snapshot.error = Some(failure.error.clone());
      snapshot.end_time = Some(event.timestamp);
    }
    EventPayload::PathStarted(_)
    | EventPayload::PathBranched(_)
    | EventPayload::PathCompleted(_)
    | EventPayload::PathFailed(_)
    | EventPayload::StepStarted(_)
    | EventPayload::StepCompleted(_)
    | EventPayload::StepFailed(_)
    | EventPayload::Unknown(_) => {}
  }

  snapshot.last_event_seq = event.sequence;
  snapshot.updated_at = event.timestamp;
}

/// Project a full history. Returns `None` for an empty history.
pub fn project<'a, I>(events: I) -> Option<ExecutionSnapshot>
where
  I: IntoIterator<Item = &'a Event>,
{
  let mut snapshot: Option<ExecutionSnapshot> = None;
  for event in events {
    let current = snapshot
      .get_or_insert_with(|| ExecutionSnapshot::pending(&event.execution_id, event.timestamp));
    apply(current, event);
  }
  snapshot
}

#[cfg(test)]
mod tests {
  use chrono::{TimeZone, Utc};
  use serde_json::json;

  use super::*;
  use crate::event::{
    ExecutionCompleted, ExecutionResumed, ExecutionStarted, Failure, PathStarted, StepCompleted,
    Values,
  };

  fn event(sequence: i64, payload: EventPayload) -> Event {
    Event {
      execution_id: "exec_1".to_string(),
      sequence,
      path_id: "path-1".to_string(),
      step: String::new(),
      timestamp: Utc.timestamp_opt(1_700_000_000 + sequence, 0).unwrap(),
      payload,
    }
  }

  fn started() -> EventPayload {
    let mut inputs = Values::new();
    inputs.insert("topic".to_string(), json!("rust"));
    EventPayload::ExecutionStarted(ExecutionStarted {
      workflow_name: "research".to_string(),
      workflow_path: Some("/tmp/research.json".to_string()),
      workflow_hash: "abc".to_string(),
      inputs_hash: "def".to_string(),
      inputs,
      workflow: None,
    })
  }

  #[test]
  fn test_project_empty() {
    assert!(project(&Vec::<Event>::new()).is_none());
  }

  #[test]
  fn test_project_completed_run() {
    let mut outputs = Values::new();
    outputs.insert("fetch".to_string(), json!("ok"));

    let events = vec![
      event(1, started()),
      event(
        2,
        EventPayload::PathStarted(PathStarted {
          start_step: "fetch".to_string(),
          parent_path: None,
        }),
      ),
      event(
        3,
        EventPayload::StepCompleted(StepCompleted { output: json!("ok") }),
      ),
      event(
        4,
        EventPayload::ExecutionCompleted(ExecutionCompleted {
          outputs: outputs.clone(),
          failed_paths: vec![],
        }),
      ),
    ];

    let snapshot = project(&events).unwrap();
    assert_eq!(snapshot.id, "exec_1");
    assert_eq!(snapshot.status, ExecutionStatus::Completed);
    assert_eq!(snapshot.workflow_name, "research");
    assert_eq!(snapshot.workflow_path.as_deref(), Some("/tmp/research.json"));
    assert_eq!(snapshot.inputs["topic"], json!("rust"));
    assert_eq!(snapshot.outputs, outputs);
    assert_eq!(snapshot.last_event_seq, 4);
    assert_eq!(snapshot.start_time, Some(events[0].timestamp));
    assert_eq!(snapshot.end_time, Some(events[3].timestamp));
    assert_eq!(snapshot.created_at, events[0].timestamp);
    assert_eq!(snapshot.updated_at, events[3].timestamp);
  }

  #[test]
  fn test_project_is_prefix_consistent() {
    let events = vec![
      event(1, started()),
      event(
        2,
        EventPayload::ExecutionFailed(Failure {
          error: "boom".to_string(),
        }),
      ),
      event(
        3,
        EventPayload::ExecutionResumed(ExecutionResumed {
          workflow_hash: "xyz".to_string(),
          replayed_events: 2,
        }),
      ),
    ];

    let failed = project(&events[..2]).unwrap();
    assert_eq!(failed.status, ExecutionStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("boom"));
    assert!(failed.end_time.is_some());

    let resumed = project(&events).unwrap();
    assert_eq!(resumed.status, ExecutionStatus::Running);
    assert_eq!(resumed.error, None);
    assert_eq!(resumed.end_time, None);
    assert_eq!(resumed.workflow_hash, "xyz");

    // Incremental application matches the batch fold.
    let mut incremental = project(&events[..2]).unwrap();
    apply(&mut incremental, &events[2]);
    assert_eq!(incremental, resumed);
  }

  #[test]
  fn test_unknown_event_only_advances_sequence() {
    let events = vec![
      event(1, started()),
      event(2, EventPayload::Unknown(json!({"type": "future_thing"}))),
    ];

    let before = project(&events[..1]).unwrap();
    let after = project(&events).unwrap();
    assert_eq!(after.status, before.status);
    assert_eq!(after.outputs, before.outputs);
    assert_eq!(after.last_event_seq, 2);
  }
}
