//! Shared fakes for the engine integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use strand_engine::{
  ConfirmationPort, ConfirmationRequest, ExecutionOrchestrator, OrchestratorConfig, StepContext,
  StepError, StepExecutor,
};
use strand_store::{
  Event, EventStore, EventStream, ExecutionFilter, ExecutionSnapshot, NewEvent,
  SqliteEventStore, StoreError, load_history,
};
use strand_workflow::{FsWorkflowLoader, Step, Workflow};

/// Step executor driven by test state.
///
/// Every step succeeds with `{"step": name, "call": n, "seen": [...]}` where
/// `seen` lists the outputs visible to it, unless the step was marked to
/// fail or to block.
#[derive(Default)]
pub struct ScriptedExecutor {
  calls: Mutex<HashMap<String, usize>>,
  failing: Mutex<HashSet<String>>,
  delays: Mutex<HashMap<String, Duration>>,
}

impl ScriptedExecutor {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn fail(&self, step: &str) {
    self.failing.lock().unwrap().insert(step.to_string());
  }

  pub fn clear_failures(&self) {
    self.failing.lock().unwrap().clear();
  }

  /// Make a step take this long.
  pub fn delay(&self, step: &str, delay: Duration) {
    self.delays.lock().unwrap().insert(step.to_string(), delay);
  }

  pub fn clear_delays(&self) {
    self.delays.lock().unwrap().clear();
  }

  pub fn calls(&self, step: &str) -> usize {
    self.calls.lock().unwrap().get(step).copied().unwrap_or(0)
  }

  pub fn total_calls(&self) -> usize {
    self.calls.lock().unwrap().values().sum()
  }

  /// Wait until the executor has been invoked for `step`.
  pub async fn wait_for_call(&self, step: &str) {
    tokio::time::timeout(Duration::from_secs(5), async {
      while self.calls(step) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    })
    .await
    .expect("step was never invoked");
  }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
  async fn execute(&self, step: &Step, ctx: StepContext) -> Result<Value, StepError> {
    let call = {
      let mut calls = self.calls.lock().unwrap();
      let count = calls.entry(step.name.clone()).or_insert(0);
      *count += 1;
      *count
    };

    let delay = self.delays.lock().unwrap().get(&step.name).copied();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }

    if self.failing.lock().unwrap().contains(&step.name) {
      return Err(StepError::new(format!("{} exploded", step.name)));
    }

    let seen: Vec<&String> = ctx.outputs.keys().collect();
    Ok(json!({ "step": step.name, "call": call, "seen": seen }))
  }
}

/// Wraps a store and fails a configurable number of appends.
pub struct FlakyStore {
  inner: Arc<SqliteEventStore>,
  failures: AtomicUsize,
  attempts: AtomicUsize,
}

impl FlakyStore {
  pub fn new(inner: Arc<SqliteEventStore>) -> Arc<Self> {
    Arc::new(Self {
      inner,
      failures: AtomicUsize::new(0),
      attempts: AtomicUsize::new(0),
    })
  }

  /// Fail the next `n` appends with an IO error.
  pub fn fail_next(&self, n: usize) {
    self.failures.store(n, Ordering::SeqCst);
  }

  pub fn attempts(&self) -> usize {
    self.attempts.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl EventStore for FlakyStore {
  async fn append(&self, execution_id: &str, events: Vec<NewEvent>) -> Result<Vec<Event>, StoreError> {
    self.attempts.fetch_add(1, Ordering::SeqCst);
    let should_fail = self
      .failures
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
      .is_ok();
    if should_fail {
      return Err(StoreError::Io(std::io::Error::other("disk unavailable")));
    }
    self.inner.append(execution_id, events).await
  }

  fn get_events<'a>(&'a self, execution_id: &'a str, from_sequence: i64) -> EventStream<'a> {
    self.inner.get_events(execution_id, from_sequence)
  }

  async fn get_snapshot(&self, execution_id: &str) -> Result<ExecutionSnapshot, StoreError> {
    self.inner.get_snapshot(execution_id).await
  }

  async fn list_executions(
    &self,
    filter: &ExecutionFilter,
  ) -> Result<Vec<ExecutionSnapshot>, StoreError> {
    self.inner.list_executions(filter).await
  }

  async fn delete_execution(&self, execution_id: &str) -> Result<(), StoreError> {
    self.inner.delete_execution(execution_id).await
  }

  async fn cleanup_completed_executions(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
    self.inner.cleanup_completed_executions(older_than).await
  }

  async fn rebuild_snapshot(&self, execution_id: &str) -> Result<ExecutionSnapshot, StoreError> {
    self.inner.rebuild_snapshot(execution_id).await
  }
}

/// Answers every confirmation the same way and records the requests.
pub struct RecordingConfirm {
  answer: bool,
  questions: Mutex<Vec<String>>,
}

impl RecordingConfirm {
  pub fn new(answer: bool) -> Arc<Self> {
    Arc::new(Self {
      answer,
      questions: Mutex::new(Vec::new()),
    })
  }

  pub fn count(&self) -> usize {
    self.questions.lock().unwrap().len()
  }
}

#[async_trait]
impl ConfirmationPort for RecordingConfirm {
  async fn confirm(&self, request: &ConfirmationRequest) -> bool {
    self.questions.lock().unwrap().push(request.question());
    self.answer
  }
}

pub fn test_config() -> OrchestratorConfig {
  let mut config = OrchestratorConfig::default();
  config.shutdown_grace = Duration::from_millis(200);
  config.append_retry.initial_delay = Duration::from_millis(1);
  config
}

pub async fn memory_store() -> Arc<SqliteEventStore> {
  Arc::new(SqliteEventStore::in_memory().await.expect("in-memory store"))
}

pub fn orchestrator(
  store: Arc<dyn EventStore>,
  executor: Arc<ScriptedExecutor>,
  config: OrchestratorConfig,
) -> ExecutionOrchestrator {
  ExecutionOrchestrator::new(store, Arc::new(FsWorkflowLoader::new()), executor, config)
}

/// `a → b → c`
pub fn linear_workflow() -> Workflow {
  Workflow::new(
    "linear",
    vec![
      Step::new("a", "test").with_next(["b"]),
      Step::new("b", "test").with_next(["c"]),
      Step::new("c", "test"),
    ],
  )
}

/// `a → {b, c}`
pub fn fan_out_workflow() -> Workflow {
  Workflow::new(
    "fan-out",
    vec![
      Step::new("a", "test").with_next(["b", "c"]),
      Step::new("b", "test"),
      Step::new("c", "test"),
    ],
  )
}

pub fn write_workflow(dir: &Path, workflow: &Workflow) -> PathBuf {
  let path = dir.join("workflow.json");
  std::fs::write(&path, serde_json::to_string_pretty(workflow).unwrap()).unwrap();
  path
}

pub async fn history(store: &dyn EventStore, execution_id: &str) -> Vec<Event> {
  load_history(store, execution_id).await.unwrap()
}

pub async fn event_types(store: &dyn EventStore, execution_id: &str) -> Vec<String> {
  history(store, execution_id)
    .await
    .iter()
    .map(|e| e.event_type().to_string())
    .collect()
}
