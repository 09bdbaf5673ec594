use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use futures::TryStreamExt;
use serde_json::json;
use strand_store::{
  Event, EventPayload, EventStore, ExecutionCompleted, ExecutionFilter, ExecutionStarted,
  ExecutionStatus, Failure, NewEvent, SqliteEventStore, StepCompleted, StoreError, Values,
  projector,
};

fn started(name: &str) -> NewEvent {
  NewEvent::execution(EventPayload::ExecutionStarted(ExecutionStarted {
    workflow_name: name.to_string(),
    workflow_path: None,
    workflow_hash: "hash".to_string(),
    inputs_hash: "inputs".to_string(),
    inputs: Values::new(),
    workflow: None,
  }))
}

fn step_completed(path_id: &str, step: &str) -> NewEvent {
  NewEvent::step(
    path_id,
    step,
    EventPayload::StepCompleted(StepCompleted {
      output: json!(step),
    }),
  )
}

async fn file_store() -> (tempfile::TempDir, Arc<SqliteEventStore>) {
  let dir = tempfile::tempdir().unwrap();
  let store = SqliteEventStore::connect(dir.path().join("executions.db"))
    .await
    .unwrap();
  (dir, Arc::new(store))
}

#[tokio::test]
async fn test_concurrent_appends_get_unique_gapless_sequences() {
  let (_dir, store) = file_store().await;
  store.append("exec_1", vec![started("fanout")]).await.unwrap();

  let mut handles = Vec::new();
  for path in 0..8 {
    let store = store.clone();
    handles.push(tokio::spawn(async move {
      let path_id = format!("path-1-{path}");
      for step in 0..10 {
        store
          .append(
            "exec_1",
            vec![step_completed(&path_id, &format!("s{step}"))],
          )
          .await
          .unwrap();
      }
    }));
  }
  for handle in handles {
    handle.await.unwrap();
  }

  let history: Vec<Event> = store.get_event_history("exec_1").try_collect().await.unwrap();
  assert_eq!(history.len(), 81);
  for (i, event) in history.iter().enumerate() {
    assert_eq!(event.sequence, i as i64 + 1);
  }
  for pair in history.windows(2) {
    assert!(pair[0].timestamp <= pair[1].timestamp);
  }

  let snapshot = store.get_snapshot("exec_1").await.unwrap();
  assert_eq!(snapshot.last_event_seq, 81);
}

#[tokio::test]
async fn test_concurrent_executions_are_independent() {
  let (_dir, store) = file_store().await;

  let mut handles = Vec::new();
  for exec in 0..4 {
    let store = store.clone();
    handles.push(tokio::spawn(async move {
      let id = format!("exec_{exec}");
      store.append(&id, vec![started("parallel")]).await.unwrap();
      for step in 0..5 {
        store
          .append(&id, vec![step_completed("path-1", &format!("s{step}"))])
          .await
          .unwrap();
      }
      id
    }));
  }

  for handle in handles {
    let id = handle.await.unwrap();
    let history: Vec<Event> = store.get_event_history(&id).try_collect().await.unwrap();
    let sequences: Vec<i64> = history.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4, 5, 6]);
  }
}

#[tokio::test]
async fn test_cleanup_only_removes_old_completed_executions() {
  let store = SqliteEventStore::in_memory().await.unwrap();
  let now = Utc::now();
  let sixty_days_ago = now - TimeDelta::days(60);

  // Old and completed: removed.
  store
    .append(
      "exec_old_done",
      vec![
        started("report").at(sixty_days_ago),
        NewEvent::execution(EventPayload::ExecutionCompleted(ExecutionCompleted {
          outputs: Values::new(),
          failed_paths: vec![],
        }))
        .at(sixty_days_ago),
      ],
    )
    .await
    .unwrap();

  // Old but failed: kept.
  store
    .append(
      "exec_old_failed",
      vec![
        started("report").at(sixty_days_ago),
        NewEvent::execution(EventPayload::ExecutionFailed(Failure {
          error: "boom".to_string(),
        }))
        .at(sixty_days_ago),
      ],
    )
    .await
    .unwrap();

  // Old but still running: kept.
  store
    .append("exec_old_running", vec![started("report").at(sixty_days_ago)])
    .await
    .unwrap();

  // Completed recently: kept.
  store
    .append(
      "exec_new_done",
      vec![
        started("report"),
        NewEvent::execution(EventPayload::ExecutionCompleted(ExecutionCompleted {
          outputs: Values::new(),
          failed_paths: vec![],
        })),
      ],
    )
    .await
    .unwrap();

  let removed = store
    .cleanup_completed_executions(now - TimeDelta::days(30))
    .await
    .unwrap();
  assert_eq!(removed, 1);

  assert!(matches!(
    store.get_snapshot("exec_old_done").await,
    Err(StoreError::NotFound(_))
  ));
  let old_events: Vec<Event> = store
    .get_event_history("exec_old_done")
    .try_collect()
    .await
    .unwrap();
  assert!(old_events.is_empty());

  let remaining = store.list_executions(&ExecutionFilter::new()).await.unwrap();
  let mut ids: Vec<&str> = remaining.iter().map(|s| s.id.as_str()).collect();
  ids.sort();
  assert_eq!(ids, vec!["exec_new_done", "exec_old_failed", "exec_old_running"]);

  let failed = store.get_snapshot("exec_old_failed").await.unwrap();
  assert_eq!(failed.status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn test_every_prefix_projects_to_the_snapshot_at_that_point() {
  let store = SqliteEventStore::in_memory().await.unwrap();

  let mut snapshots = Vec::new();
  store.append("exec_1", vec![started("demo")]).await.unwrap();
  snapshots.push(store.get_snapshot("exec_1").await.unwrap());

  for step in ["a", "b", "c"] {
    store
      .append("exec_1", vec![step_completed("path-1", step)])
      .await
      .unwrap();
    snapshots.push(store.get_snapshot("exec_1").await.unwrap());
  }

  let mut outputs = Values::new();
  outputs.insert("c".to_string(), json!("c"));
  store
    .append(
      "exec_1",
      vec![NewEvent::execution(EventPayload::ExecutionCompleted(
        ExecutionCompleted {
          outputs,
          failed_paths: vec![],
        },
      ))],
    )
    .await
    .unwrap();
  snapshots.push(store.get_snapshot("exec_1").await.unwrap());

  let history: Vec<Event> = store.get_event_history("exec_1").try_collect().await.unwrap();
  for (n, expected) in snapshots.iter().enumerate() {
    let projected = projector::project(&history[..=n]).unwrap();
    assert_eq!(&projected, expected, "prefix of {} events", n + 1);
  }
}
