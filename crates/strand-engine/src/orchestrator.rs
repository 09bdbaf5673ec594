use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use strand_store::{
  Event, EventStore, ExecutionFilter, ExecutionSnapshot, ExecutionStatus,
  StoreError, load_history,
};
use strand_workflow::{
  Values, Workflow, WorkflowCompatibility, WorkflowError, WorkflowLoader, compare_workflows,
  hash_workflow,
};
use tracing::{debug, info, instrument, warn};

use crate::config::OrchestratorConfig;
use crate::confirm::{ConfirmationPort, ConfirmationRequest, DriftReport, NeverConfirm};
use crate::error::EngineError;
use crate::execution::{Execution, ExecutionParams, new_execution_id};
use crate::executor::StepExecutor;
use crate::formatter::{Formatter, NoopFormatter};
use crate::replay::ReplayState;
use crate::stats::HistoryStats;

/// Where the workflow of a new execution comes from.
#[derive(Debug, Clone)]
pub enum WorkflowSource {
  /// Load from a file (or a directory containing `workflow.json`). Only
  /// executions created this way can be resumed.
  Path(PathBuf),
  /// An already constructed definition.
  Definition(Workflow),
}

/// Options for [`ExecutionOrchestrator::create_execution`].
#[derive(Clone)]
pub struct ExecutionOptions {
  pub source: WorkflowSource,
  pub inputs: Values,
  pub formatter: Arc<dyn Formatter>,
}

impl ExecutionOptions {
  pub fn from_path(path: impl Into<PathBuf>) -> Self {
    Self::new(WorkflowSource::Path(path.into()))
  }

  pub fn from_definition(workflow: Workflow) -> Self {
    Self::new(WorkflowSource::Definition(workflow))
  }

  fn new(source: WorkflowSource) -> Self {
    Self {
      source,
      inputs: Values::new(),
      formatter: Arc::new(NoopFormatter),
    }
  }

  pub fn with_inputs(mut self, inputs: Values) -> Self {
    self.inputs = inputs;
    self
  }

  pub fn with_input(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
    self.inputs.insert(name.into(), value);
    self
  }

  pub fn with_formatter(mut self, formatter: Arc<dyn Formatter>) -> Self {
    self.formatter = formatter;
    self
  }
}

/// How [`ExecutionOrchestrator::retry_execution`] starts over.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryStrategy {
  /// The recorded workflow file with the recorded inputs.
  FromStart,
  /// The recorded workflow file with these inputs replacing recorded values
  /// of the same name.
  WithNewInputs(Values),
}

/// Result of [`ExecutionOrchestrator::cleanup`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupOutcome {
  /// Completed executions older than the cutoff, as previewed.
  pub candidates: Vec<ExecutionSnapshot>,
  /// Executions that were removed.
  pub deleted: Vec<ExecutionSnapshot>,
  /// Whether the deletion was confirmed. False when there was nothing to
  /// delete.
  pub confirmed: bool,
}

/// Creates, resumes and manages executions against a shared store.
pub struct ExecutionOrchestrator {
  store: Arc<dyn EventStore>,
  loader: Arc<dyn WorkflowLoader>,
  executor: Arc<dyn StepExecutor>,
  confirmation: Arc<dyn ConfirmationPort>,
  config: OrchestratorConfig,
}

impl ExecutionOrchestrator {
  /// Requests that need confirmation are declined unless a port is set with
  /// [`with_confirmation`](Self::with_confirmation) or `assume_yes` is on.
  pub fn new(
    store: Arc<dyn EventStore>,
    loader: Arc<dyn WorkflowLoader>,
    executor: Arc<dyn StepExecutor>,
    config: OrchestratorConfig,
  ) -> Self {
    Self {
      store,
      loader,
      executor,
      confirmation: Arc::new(NeverConfirm),
      config,
    }
  }

  pub fn with_confirmation(mut self, confirmation: Arc<dyn ConfirmationPort>) -> Self {
    self.confirmation = confirmation;
    self
  }

  pub fn config(&self) -> &OrchestratorConfig {
    &self.config
  }

  pub fn store(&self) -> &Arc<dyn EventStore> {
    &self.store
  }

  /// Load and validate a workflow and wire a fresh execution for it.
  ///
  /// Nothing is recorded until the execution is run.
  pub async fn create_execution(&self, options: ExecutionOptions) -> Result<Execution, EngineError> {
    let (workflow, workflow_path) = match options.source {
      WorkflowSource::Path(path) => {
        let path = std::path::absolute(&path).map_err(|source| WorkflowError::Io {
          path: path.clone(),
          source,
        })?;
        let workflow = self.loader.load(&path).await?;
        (workflow, Some(path))
      }
      WorkflowSource::Definition(workflow) => {
        workflow.validate()?;
        (workflow, None)
      }
    };

    let inputs = workflow.resolve_inputs(options.inputs)?;

    let execution = Execution::new(ExecutionParams {
      workflow,
      workflow_path,
      inputs,
      replay_mode: false,
      execution_id: Some(new_execution_id()),
      initial_snapshot: None,
      store: self.store.clone(),
      executor: self.executor.clone(),
      formatter: options.formatter,
      config: self.config.clone(),
    })?;

    info!(
      execution_id = %execution.id(),
      workflow = %execution.workflow().name,
      "execution created"
    );
    Ok(execution)
  }

  /// Start a new execution from the workflow file and inputs recorded by an
  /// earlier one, which is left untouched. Unlike a resume, nothing is
  /// replayed and every step runs again.
  #[instrument(name = "retry_execution", skip(self, strategy, formatter))]
  pub async fn retry_execution(
    &self,
    execution_id: &str,
    strategy: RetryStrategy,
    formatter: Arc<dyn Formatter>,
  ) -> Result<Execution, EngineError> {
    let snapshot = self.store.get_snapshot(execution_id).await?;

    let Some(recorded_path) = snapshot.workflow_path else {
      return Err(EngineError::InvalidOptions(format!(
        "execution {execution_id} recorded no workflow path; executions of inline definitions cannot be retried"
      )));
    };

    let mut inputs = snapshot.inputs;
    match strategy {
      RetryStrategy::FromStart => {}
      RetryStrategy::WithNewInputs(overrides) => {
        if overrides.is_empty() {
          return Err(EngineError::InvalidOptions(
            "retrying with new inputs requires at least one input".to_string(),
          ));
        }
        inputs.extend(overrides);
      }
    }

    let execution = self
      .create_execution(
        ExecutionOptions::from_path(recorded_path)
          .with_inputs(inputs)
          .with_formatter(formatter),
      )
      .await?;
    info!(retry_execution_id = %execution.id(), "retrying execution from the start");
    Ok(execution)
  }

  /// Prepare a stopped, crashed or failed execution to continue.
  ///
  /// The workflow is reloaded from the path recorded when the execution
  /// started. If its hash differs from the recorded one the change has to be
  /// confirmed, otherwise [`EngineError::DefinitionDrift`] is returned.
  #[instrument(name = "resume_execution", skip(self, formatter))]
  pub async fn resume_execution(
    &self,
    execution_id: &str,
    formatter: Arc<dyn Formatter>,
  ) -> Result<Execution, EngineError> {
    let snapshot = self.store.get_snapshot(execution_id).await?;

    if snapshot.status == ExecutionStatus::Completed {
      return Err(EngineError::CannotResume {
        execution_id: execution_id.to_string(),
      });
    }

    let Some(recorded_path) = snapshot.workflow_path.clone() else {
      return Err(EngineError::InvalidResumeState {
        execution_id: execution_id.to_string(),
        message: "no workflow path was recorded; executions of inline definitions cannot be resumed"
          .to_string(),
      });
    };
    let path = PathBuf::from(&recorded_path);

    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
      return Err(EngineError::InvalidResumeState {
        execution_id: execution_id.to_string(),
        message: format!("workflow file {recorded_path} no longer exists; restore it to resume"),
      });
    }

    let workflow = self.loader.load(&path).await?;
    let current_hash = hash_workflow(&workflow)?;

    if current_hash != snapshot.workflow_hash {
      let report = DriftReport {
        execution_id: execution_id.to_string(),
        workflow_path: recorded_path,
        recorded_hash: snapshot.workflow_hash.clone(),
        current_hash,
        compatibility: self.recorded_compatibility(execution_id, &workflow).await?,
      };
      warn!(
        recorded_hash = %report.recorded_hash,
        current_hash = %report.current_hash,
        "workflow definition changed since the execution started"
      );

      let request = ConfirmationRequest::ResumeWithDrift(report.clone());
      if !self.confirm(&request).await {
        return Err(EngineError::DefinitionDrift(Box::new(report)));
      }
      info!("resuming with the changed definition");
    } else {
      debug!("workflow definition unchanged");
    }

    Execution::new(ExecutionParams {
      workflow,
      workflow_path: Some(path),
      inputs: Values::new(),
      replay_mode: true,
      execution_id: Some(execution_id.to_string()),
      initial_snapshot: Some(snapshot),
      store: self.store.clone(),
      executor: self.executor.clone(),
      formatter,
      config: self.config.clone(),
    })
  }

  /// Compare against the definition recorded in `execution_started`, if it
  /// can be recovered.
  async fn recorded_compatibility(
    &self,
    execution_id: &str,
    current: &Workflow,
  ) -> Result<Option<WorkflowCompatibility>, EngineError> {
    let mut history = self.store.get_event_history(execution_id);
    let Some(first) = history.try_next().await? else {
      return Ok(None);
    };

    let opening = ReplayState::from_events([&first]);
    let Some(recorded) = opening
      .recorded_workflow()
      .and_then(|definition| serde_json::from_value::<Workflow>(definition.clone()).ok())
    else {
      return Ok(None);
    };

    Ok(Some(compare_workflows(&recorded, current)?))
  }

  async fn confirm(&self, request: &ConfirmationRequest) -> bool {
    if self.config.assume_yes {
      return true;
    }
    self.confirmation.confirm(request).await
  }

  pub async fn list_executions(
    &self,
    filter: &ExecutionFilter,
  ) -> Result<Vec<ExecutionSnapshot>, EngineError> {
    Ok(self.store.list_executions(filter).await?)
  }

  pub async fn get_execution(&self, execution_id: &str) -> Result<ExecutionSnapshot, EngineError> {
    Ok(self.store.get_snapshot(execution_id).await?)
  }

  /// Full event history, oldest first.
  pub async fn get_event_history(&self, execution_id: &str) -> Result<Vec<Event>, EngineError> {
    self.store.get_snapshot(execution_id).await?;
    Ok(load_history(self.store.as_ref(), execution_id).await?)
  }

  /// Delete an execution after confirmation. Returns false when declined.
  #[instrument(name = "delete_execution", skip(self))]
  pub async fn delete_execution(&self, execution_id: &str) -> Result<bool, EngineError> {
    let snapshot = self.store.get_snapshot(execution_id).await?;

    if !self
      .confirm(&ConfirmationRequest::DeleteExecution { snapshot })
      .await
    {
      info!("deletion declined");
      return Ok(false);
    }

    self.store.delete_execution(execution_id).await?;
    info!("execution deleted");
    Ok(true)
  }

  /// Delete completed executions last updated before `older_than`, after
  /// previewing them and asking for confirmation.
  #[instrument(name = "cleanup", skip(self))]
  pub async fn cleanup(&self, older_than: DateTime<Utc>) -> Result<CleanupOutcome, EngineError> {
    let candidates: Vec<ExecutionSnapshot> = self
      .store
      .list_executions(&ExecutionFilter::new().status(ExecutionStatus::Completed))
      .await?
      .into_iter()
      .filter(|snapshot| snapshot.updated_at < older_than)
      .collect();

    if candidates.is_empty() {
      debug!("nothing to clean up");
      return Ok(CleanupOutcome::default());
    }

    let request = ConfirmationRequest::Cleanup {
      candidates: candidates.clone(),
      older_than,
    };
    if !self.confirm(&request).await {
      info!(candidates = candidates.len(), "cleanup declined");
      return Ok(CleanupOutcome {
        candidates,
        deleted: Vec::new(),
        confirmed: false,
      });
    }

    let removed = self.store.cleanup_completed_executions(older_than).await?;

    let mut deleted = Vec::new();
    for candidate in &candidates {
      match self.store.get_snapshot(&candidate.id).await {
        Err(StoreError::NotFound(_)) => deleted.push(candidate.clone()),
        Err(e) => return Err(e.into()),
        Ok(_) => {}
      }
    }

    info!(removed, "cleanup finished");
    Ok(CleanupOutcome {
      candidates,
      deleted,
      confirmed: true,
    })
  }

  /// Executions that can be resumed, most recently updated first.
  pub async fn list_resumable(&self, limit: Option<u32>) -> Result<Vec<ExecutionSnapshot>, EngineError> {
    let resumable = self
      .store
      .list_executions(&ExecutionFilter::new())
      .await?
      .into_iter()
      .filter(|snapshot| snapshot.status.is_resumable() && snapshot.workflow_path.is_some());

    Ok(match limit {
      Some(limit) => resumable.take(limit as usize).collect(),
      None => resumable.collect(),
    })
  }

  pub async fn stats(&self, filter: &ExecutionFilter) -> Result<HistoryStats, EngineError> {
    let snapshots = self.store.list_executions(filter).await?;
    Ok(HistoryStats::from_snapshots(&snapshots))
  }

  /// Rebuild an execution's snapshot from its event log.
  pub async fn rebuild_snapshot(&self, execution_id: &str) -> Result<ExecutionSnapshot, EngineError> {
    Ok(self.store.rebuild_snapshot(execution_id).await?)
  }
}

