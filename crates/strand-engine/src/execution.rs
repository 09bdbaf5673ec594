//! The execution driver.
//!
//! An [`Execution`] runs a workflow's paths as concurrent tokio tasks and
//! records every transition before it moves on. In replay mode it first
//! folds the recorded history into a [`ReplayState`] and then continues:
//! steps that already completed are skipped and their recorded outputs
//! reused, while failed or unfinished steps run again.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde_json::Value;
use strand_store::{
  BranchTarget, EventPayload, EventStore, ExecutionCompleted, ExecutionResumed, ExecutionSnapshot,
  ExecutionStarted, ExecutionStatus, Failure, NewEvent, PathBranched, PathCompleted, PathStarted,
  StepCompleted, StepStarted, load_history,
};
use strand_workflow::hash::normalized_definition;
use strand_workflow::{
  Graph, PathFailureMode, Step, Values, Workflow, WorkflowError, hash_inputs, hash_workflow,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::OrchestratorConfig;
use crate::error::EngineError;
use crate::executor::{StepContext, StepError, StepExecutor};
use crate::formatter::Formatter;
use crate::recorder::Recorder;
use crate::replay::{PathPlan, PathState, ReplayState, child_path_id};
use crate::stats::{ExecutionReport, ExecutionStats};

/// Everything needed to construct an [`Execution`].
pub struct ExecutionParams {
  pub workflow: Workflow,
  /// Where the definition was loaded from. Required to resume later.
  pub workflow_path: Option<PathBuf>,
  /// Resolved inputs. Ignored in replay mode, where the recorded inputs are
  /// used.
  pub inputs: Values,
  pub replay_mode: bool,
  /// Required in replay mode; generated for fresh runs when absent.
  pub execution_id: Option<String>,
  /// Snapshot the replay starts from. Required in replay mode.
  pub initial_snapshot: Option<ExecutionSnapshot>,
  pub store: Arc<dyn EventStore>,
  pub executor: Arc<dyn StepExecutor>,
  pub formatter: Arc<dyn Formatter>,
  pub config: OrchestratorConfig,
}

enum Mode {
  Fresh,
  Replay { snapshot: ExecutionSnapshot },
}

/// Generate a new execution id.
pub fn new_execution_id() -> String {
  format!("exec_{}", uuid::Uuid::now_v7().simple())
}

/// A single run of a workflow, fresh or resumed.
pub struct Execution {
  id: String,
  workflow: Workflow,
  workflow_path: Option<PathBuf>,
  workflow_hash: String,
  inputs: Values,
  mode: Mode,
  store: Arc<dyn EventStore>,
  executor: Arc<dyn StepExecutor>,
  formatter: Arc<dyn Formatter>,
  config: OrchestratorConfig,
}

impl Execution {
  pub fn new(params: ExecutionParams) -> Result<Self, EngineError> {
    params.workflow.validate()?;
    let workflow_hash = hash_workflow(&params.workflow)?;

    let (id, inputs, mode) = if params.replay_mode {
      let id = params.execution_id.ok_or_else(|| {
        EngineError::InvalidOptions("replay mode requires an execution id".to_string())
      })?;
      let snapshot = params.initial_snapshot.ok_or_else(|| {
        EngineError::InvalidOptions("replay mode requires an initial snapshot".to_string())
      })?;
      if snapshot.id != id {
        return Err(EngineError::InvalidOptions(format!(
          "snapshot belongs to execution '{}', not '{id}'",
          snapshot.id
        )));
      }
      if snapshot.status == ExecutionStatus::Completed {
        return Err(EngineError::CannotResume { execution_id: id });
      }
      (id, snapshot.inputs.clone(), Mode::Replay { snapshot })
    } else {
      let id = params.execution_id.unwrap_or_else(new_execution_id);
      (id, params.inputs, Mode::Fresh)
    };

    Ok(Self {
      id,
      workflow: params.workflow,
      workflow_path: params.workflow_path,
      workflow_hash,
      inputs,
      mode,
      store: params.store,
      executor: params.executor,
      formatter: params.formatter,
      config: params.config,
    })
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn workflow(&self) -> &Workflow {
    &self.workflow
  }

  pub fn inputs(&self) -> &Values {
    &self.inputs
  }

  pub fn is_replay(&self) -> bool {
    matches!(self.mode, Mode::Replay { .. })
  }

  /// Status before [`Execution::run`]: pending for a fresh run, the recorded
  /// status for a replay.
  pub fn status(&self) -> ExecutionStatus {
    match &self.mode {
      Mode::Fresh => ExecutionStatus::Pending,
      Mode::Replay { snapshot } => snapshot.status,
    }
  }

  /// Run to completion, failure, or cancellation.
  ///
  /// A failed execution is a normal outcome, reported with status
  /// `failed`. Errors are reserved for storage problems, invalid replay
  /// state and cancellation; in all of those cases the execution stays
  /// resumable.
  #[instrument(
    name = "execution_run",
    skip(self, cancel),
    fields(
      execution_id = %self.id,
      workflow = %self.workflow.name,
      replay = self.is_replay(),
    )
  )]
  pub async fn run(self, cancel: CancellationToken) -> Result<ExecutionReport, EngineError> {
    let started = Instant::now();
    let formatter = self.formatter.clone();

    formatter.workflow_header(&self.workflow, &self.inputs);
    formatter.execution_id(&self.id, self.is_replay());

    let result = self.drive(cancel, started).await;

    match &result {
      Ok(report) => {
        match report.status {
          ExecutionStatus::Completed => formatter.workflow_complete(report),
          _ => formatter.workflow_error(report.error.as_deref().unwrap_or("execution failed")),
        }
        formatter.execution_stats(&report.stats);
      }
      Err(EngineError::Cancelled) => {
        warn!("execution cancelled; it can be resumed");
        formatter.workflow_error(&EngineError::Cancelled.to_string());
      }
      Err(e) => {
        error!(error = %e, "execution aborted");
        formatter.workflow_error(&e.to_string());
      }
    }

    result
  }

  async fn drive(
    self,
    cancel: CancellationToken,
    started: Instant,
  ) -> Result<ExecutionReport, EngineError> {
    let recorder = Recorder::new(
      self.id.clone(),
      self.store.clone(),
      self.config.append_retry.clone(),
    );

    let start_step = self
      .workflow
      .start_step()
      .ok_or_else(|| WorkflowError::Empty(self.workflow.name.clone()))?
      .to_string();

    let (replay, frontier) = match &self.mode {
      Mode::Fresh => {
        recorder
          .record_one(NewEvent::execution(EventPayload::ExecutionStarted(
            ExecutionStarted {
              workflow_name: self.workflow.name.clone(),
              workflow_path: self
                .workflow_path
                .as_ref()
                .map(|p| p.display().to_string()),
              workflow_hash: self.workflow_hash.clone(),
              inputs_hash: hash_inputs(&self.inputs)?,
              inputs: self.inputs.clone(),
              workflow: Some(normalized_definition(&self.workflow)?),
            },
          )))
          .await?;
        info!("execution started");
        (ReplayState::default(), vec![PathPlan::root(&start_step)])
      }
      Mode::Replay { snapshot } => {
        let history = load_history(self.store.as_ref(), &self.id).await?;
        if history.is_empty() {
          return Err(EngineError::InvalidResumeState {
            execution_id: self.id.clone(),
            message: "no recorded events".to_string(),
          });
        }

        let replay = ReplayState::from_events(&history);
        match replay.status() {
          Some(ExecutionStatus::Completed) => {
            return Err(EngineError::CannotResume {
              execution_id: self.id.clone(),
            });
          }
          None => {
            return Err(EngineError::InvalidResumeState {
              execution_id: self.id.clone(),
              message: "history does not start with execution_started".to_string(),
            });
          }
          Some(_) => {}
        }
        if replay.last_sequence() < snapshot.last_event_seq {
          return Err(EngineError::InvalidResumeState {
            execution_id: self.id.clone(),
            message: format!(
              "log ends at event {} but the snapshot has seen {}",
              replay.last_sequence(),
              snapshot.last_event_seq
            ),
          });
        }

        let frontier = replay.frontier(&start_step);
        recorder
          .record_one(NewEvent::execution(EventPayload::ExecutionResumed(
            ExecutionResumed {
              workflow_hash: self.workflow_hash.clone(),
              replayed_events: replay.event_count(),
            },
          )))
          .await?;
        info!(
          replayed_events = replay.event_count(),
          completed_steps = replay.completed_step_count(),
          paths = frontier.len(),
          "resuming execution"
        );
        (replay, frontier)
      }
    };

    let runner = Arc::new(PathRunner {
      execution_id: self.id.clone(),
      graph: self.workflow.graph(),
      failure_mode: self.workflow.path_failure,
      workflow: self.workflow,
      inputs: Arc::new(self.inputs),
      recorder,
      executor: self.executor,
      formatter: self.formatter,
      replay,
      shutdown_grace: self.config.shutdown_grace,
      halt: cancel.child_token(),
      cancel,
      steps_executed: AtomicUsize::new(0),
      steps_failed: AtomicUsize::new(0),
      steps_replayed: AtomicUsize::new(0),
    });

    // Each path runs as its own task; the children of a branch are spawned
    // as soon as it has been recorded, independent of sibling paths.
    let mut tasks = JoinSet::new();
    for plan in frontier {
      tasks.spawn(runner.clone().run_path(plan));
    }

    let mut outcomes = Vec::new();
    let mut unfinished = 0usize;
    while let Some(joined) = tasks.join_next().await {
      let outcome = joined.map_err(|e| EngineError::Join(e.to_string()))??;
      match &outcome.end {
        PathEnd::Branched(children) => {
          if runner.halt.is_cancelled() {
            unfinished += children.len();
          } else {
            debug!(parent = %outcome.path_id, paths = children.len(), "spawning child paths");
            for child in children.iter().cloned() {
              tasks.spawn(runner.clone().run_path(child));
            }
          }
        }
        PathEnd::Interrupted => unfinished += 1,
        PathEnd::Completed | PathEnd::Failed(_) => {}
      }
      outcomes.push(outcome);
    }

    if runner.cancel.is_cancelled() && unfinished > 0 {
      return Err(EngineError::Cancelled);
    }

    outcomes.sort_by(|a, b| a.path_id.cmp(&b.path_id));

    let failures: Vec<(&str, &str)> = outcomes
      .iter()
      .filter_map(|o| match &o.end {
        PathEnd::Failed(reason) => Some((o.path_id.as_str(), reason.as_str())),
        _ => None,
      })
      .collect();
    let failed_paths: Vec<String> = failures.iter().map(|(id, _)| id.to_string()).collect();

    // Paths that finished in an earlier run contribute their recorded
    // outputs; merged in path id order, later paths overwriting earlier ones.
    let mut per_path: BTreeMap<String, Values> = runner
      .replay
      .paths()
      .filter(|record| record.state == PathState::Completed)
      .map(|record| {
        (
          record.path_id.clone(),
          runner.replay.lineage_outputs(&record.path_id),
        )
      })
      .collect();
    for outcome in &outcomes {
      if matches!(outcome.end, PathEnd::Completed | PathEnd::Branched(_)) {
        per_path.insert(outcome.path_id.clone(), outcome.outputs.clone());
      }
    }
    let mut outputs = Values::new();
    for values in per_path.into_values() {
      outputs.extend(values);
    }

    let (status, error) = match (failures.first(), runner.failure_mode) {
      (Some((path_id, reason)), PathFailureMode::StopAndFail) => {
        let message = format!("path {path_id} failed: {reason}");
        runner
          .recorder
          .record_one(NewEvent::execution(EventPayload::ExecutionFailed(Failure {
            error: message.clone(),
          })))
          .await?;
        error!(failed_paths = ?failed_paths, "execution failed");
        (ExecutionStatus::Failed, Some(message))
      }
      _ => {
        runner
          .recorder
          .record_one(NewEvent::execution(EventPayload::ExecutionCompleted(
            ExecutionCompleted {
              outputs: outputs.clone(),
              failed_paths: failed_paths.clone(),
            },
          )))
          .await?;
        if failed_paths.is_empty() {
          info!("execution completed");
        } else {
          warn!(failed_paths = ?failed_paths, "execution completed with failed paths");
        }
        (ExecutionStatus::Completed, None)
      }
    };

    let stats = ExecutionStats {
      total_paths: outcomes.len(),
      completed_paths: outcomes
        .iter()
        .filter(|o| matches!(o.end, PathEnd::Completed | PathEnd::Branched(_)))
        .count(),
      failed_paths: failed_paths.len(),
      steps_executed: runner.steps_executed.load(Ordering::Relaxed),
      steps_failed: runner.steps_failed.load(Ordering::Relaxed),
      steps_replayed: runner.steps_replayed.load(Ordering::Relaxed),
      duration: started.elapsed(),
    };

    Ok(ExecutionReport {
      execution_id: runner.execution_id.clone(),
      status,
      outputs: match status {
        ExecutionStatus::Completed => outputs,
        _ => Values::new(),
      },
      failed_paths,
      error,
      stats,
    })
  }
}

/// How a path task ended.
#[derive(Debug)]
enum PathEnd {
  /// Reached a step without successors.
  Completed,
  /// Reached a fan-out step; these child paths continue the work.
  Branched(Vec<PathPlan>),
  Failed(String),
  /// Stopped at a step boundary by cancellation or a failing sibling.
  Interrupted,
}

#[derive(Debug)]
struct PathOutcome {
  path_id: String,
  end: PathEnd,
  /// Outputs along this path's lineage when it ended.
  outputs: Values,
}

enum StepEnd {
  Completed(Value),
  Failed(String),
  Interrupted,
}

/// State shared by the path tasks of one run.
struct PathRunner {
  execution_id: String,
  workflow: Workflow,
  graph: Graph,
  failure_mode: PathFailureMode,
  inputs: Arc<Values>,
  recorder: Recorder,
  executor: Arc<dyn StepExecutor>,
  formatter: Arc<dyn Formatter>,
  replay: ReplayState,
  shutdown_grace: Duration,
  /// Stops new steps from being scheduled. A child of `cancel`, also fired
  /// when a path fails under `stop_and_fail`.
  halt: CancellationToken,
  cancel: CancellationToken,
  steps_executed: AtomicUsize,
  steps_failed: AtomicUsize,
  steps_replayed: AtomicUsize,
}

impl PathRunner {
  #[instrument(
    name = "path_run",
    skip(self, plan),
    fields(execution_id = %self.execution_id, path_id = %plan.path_id)
  )]
  async fn run_path(self: Arc<Self>, plan: PathPlan) -> Result<PathOutcome, EngineError> {
    let PathPlan {
      path_id,
      start_step,
      parent,
      announce,
      mut outputs,
    } = plan;

    if announce {
      self
        .recorder
        .record_one(NewEvent::path(
          &path_id,
          EventPayload::PathStarted(PathStarted {
            start_step: start_step.clone(),
            parent_path: parent,
          }),
        ))
        .await?;
    }

    let mut current = start_step;
    loop {
      if self.halt.is_cancelled() {
        debug!(step = %current, "path interrupted before step");
        return Ok(PathOutcome {
          path_id,
          end: PathEnd::Interrupted,
          outputs,
        });
      }

      let Some(step) = self.workflow.get_step(&current).cloned() else {
        let reason = format!("step '{current}' not found in workflow");
        return self.fail_path(path_id, reason, outputs).await;
      };

      if let Some(output) = self.replay.completed_output(&path_id, &step.name) {
        debug!(step = %step.name, "step already completed, reusing recorded output");
        self.steps_replayed.fetch_add(1, Ordering::Relaxed);
        self.formatter.step_replayed(&path_id, &step, output);
        outputs.insert(step.name.clone(), output.clone());
      } else {
        match self.execute_step(&path_id, &step, &outputs).await? {
          StepEnd::Completed(output) => {
            outputs.insert(step.name.clone(), output);
          }
          StepEnd::Failed(reason) => {
            return self.fail_path(path_id, reason, outputs).await;
          }
          StepEnd::Interrupted => {
            return Ok(PathOutcome {
              path_id,
              end: PathEnd::Interrupted,
              outputs,
            });
          }
        }
      }

      if self.graph.is_branch_point(&step.name) {
        let children: Vec<PathPlan> = self
          .graph
          .successors(&step.name)
          .iter()
          .enumerate()
          .map(|(i, next)| PathPlan {
            path_id: child_path_id(&path_id, i + 1),
            start_step: next.clone(),
            parent: Some(path_id.clone()),
            announce: true,
            outputs: outputs.clone(),
          })
          .collect();

        // Branch and completion are recorded together so a crash cannot
        // leave a completed path without its children, or the reverse.
        self
          .recorder
          .record(vec![
            NewEvent::step(
              &path_id,
              &step.name,
              EventPayload::PathBranched(PathBranched {
                new_paths: children
                  .iter()
                  .map(|c| BranchTarget {
                    path_id: c.path_id.clone(),
                    start_step: c.start_step.clone(),
                  })
                  .collect(),
              }),
            ),
            NewEvent::step(
              &path_id,
              &step.name,
              EventPayload::PathCompleted(PathCompleted {
                final_step: step.name.clone(),
              }),
            ),
          ])
          .await?;
        info!(step = %step.name, branches = children.len(), "path branched");
        return Ok(PathOutcome {
          path_id,
          end: PathEnd::Branched(children),
          outputs,
        });
      }

      match self.graph.successors(&step.name).first() {
        Some(next) => current = next.clone(),
        None => {
          self
            .recorder
            .record_one(NewEvent::step(
              &path_id,
              &step.name,
              EventPayload::PathCompleted(PathCompleted {
                final_step: step.name.clone(),
              }),
            ))
            .await?;
          info!(final_step = %step.name, "path completed");
          return Ok(PathOutcome {
            path_id,
            end: PathEnd::Completed,
            outputs,
          });
        }
      }
    }
  }

  async fn fail_path(
    &self,
    path_id: String,
    reason: String,
    outputs: Values,
  ) -> Result<PathOutcome, EngineError> {
    self
      .recorder
      .record_one(NewEvent::path(
        &path_id,
        EventPayload::PathFailed(Failure {
          error: reason.clone(),
        }),
      ))
      .await?;
    warn!(path_id = %path_id, error = %reason, "path failed");

    if self.failure_mode == PathFailureMode::StopAndFail {
      self.halt.cancel();
    }

    Ok(PathOutcome {
      path_id,
      end: PathEnd::Failed(reason),
      outputs,
    })
  }

  #[instrument(
    name = "step_execute",
    skip(self, step, outputs),
    fields(execution_id = %self.execution_id, path_id = %path_id, step = %step.name)
  )]
  async fn execute_step(
    &self,
    path_id: &str,
    step: &Step,
    outputs: &Values,
  ) -> Result<StepEnd, EngineError> {
    self
      .recorder
      .record_one(NewEvent::step(
        path_id,
        &step.name,
        EventPayload::StepStarted(StepStarted {
          step_type: step.step_type.clone(),
        }),
      ))
      .await?;
    self.formatter.step_started(path_id, step);

    let abort = CancellationToken::new();
    let ctx = StepContext {
      execution_id: self.execution_id.clone(),
      path_id: path_id.to_string(),
      inputs: self.inputs.clone(),
      outputs: outputs.clone(),
      abort: abort.clone(),
    };

    let running = AssertUnwindSafe(self.executor.execute(step, ctx))
      .catch_unwind()
      .map(|result| {
        result.unwrap_or_else(|panic| {
          Err(StepError::new(format!(
            "step panicked: {}",
            panic_message(panic.as_ref())
          )))
        })
      });
    tokio::pin!(running);

    let result = tokio::select! {
      result = &mut running => Some(result),
      _ = self.cancel.cancelled() => {
        warn!(
          grace_ms = self.shutdown_grace.as_millis() as u64,
          "cancelled while step in flight, waiting for it to finish"
        );
        abort.cancel();
        match tokio::time::timeout(self.shutdown_grace, &mut running).await {
          Ok(Ok(output)) => Some(Ok(output)),
          // Stopped because of the abort signal; it runs again on resume.
          Ok(Err(e)) => {
            debug!(error = %e, "step stopped after abort");
            None
          }
          Err(_) => None,
        }
      }
    };

    match result {
      Some(Ok(output)) => {
        self.steps_executed.fetch_add(1, Ordering::Relaxed);
        self
          .recorder
          .record_one(NewEvent::step(
            path_id,
            &step.name,
            EventPayload::StepCompleted(StepCompleted {
              output: output.clone(),
            }),
          ))
          .await?;
        self.formatter.step_completed(path_id, step, &output);
        Ok(StepEnd::Completed(output))
      }
      Some(Err(e)) => {
        self.steps_executed.fetch_add(1, Ordering::Relaxed);
        self.steps_failed.fetch_add(1, Ordering::Relaxed);
        self
          .recorder
          .record_one(NewEvent::step(
            path_id,
            &step.name,
            EventPayload::StepFailed(Failure {
              error: e.message.clone(),
            }),
          ))
          .await?;
        warn!(error = %e, "step failed");
        self.formatter.step_failed(path_id, step, &e.message);
        Ok(StepEnd::Failed(e.message))
      }
      None => {
        warn!("step interrupted by shutdown");
        Ok(StepEnd::Interrupted)
      }
    }
  }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
  if let Some(message) = panic.downcast_ref::<&str>() {
    message
  } else if let Some(message) = panic.downcast_ref::<String>() {
    message
  } else {
    "no message"
  }
}
