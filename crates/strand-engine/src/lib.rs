//! Strand Execution Engine
//!
//! Runs workflows durably: every state transition is appended to an event
//! log before the run moves on, so a stopped or crashed execution can be
//! resumed by replaying its history.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  ExecutionOrchestrator                      │
//! │  - create_execution(options) → Execution                    │
//! │  - resume_execution(id) with drift detection                │
//! │  - list / get / delete / cleanup / stats                    │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Execution                             │
//! │  - run(cancel) → ExecutionReport                            │
//! │  - paths as concurrent tasks, appends through a Recorder    │
//! │  - replay: fold history, skip completed steps               │
//! └─────────────────────────────────────────────────────────────┘
//!            │                                   │
//!            ▼                                   ▼
//! ┌────────────────────────┐        ┌────────────────────────────┐
//! │     StepExecutor       │        │        EventStore          │
//! │  - opaque step work    │        │  - append / history        │
//! └────────────────────────┘        │  - snapshots               │
//!                                   └────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use strand_engine::{ExecutionOptions, ExecutionOrchestrator, OrchestratorConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let orchestrator = ExecutionOrchestrator::new(store, loader, executor, OrchestratorConfig::default());
//!
//! let execution = orchestrator
//!   .create_execution(ExecutionOptions::from_path("workflow.json"))
//!   .await?;
//! let report = execution.run(CancellationToken::new()).await?;
//!
//! // Later, after a crash:
//! let execution = orchestrator.resume_execution(&report.execution_id, formatter).await?;
//! execution.run(CancellationToken::new()).await?;
//! ```

mod config;
mod confirm;
mod error;
mod execution;
mod executor;
mod formatter;
mod orchestrator;
mod recorder;
mod replay;
mod stats;

pub use config::{AppendRetry, OrchestratorConfig};
pub use confirm::{AlwaysConfirm, ConfirmationPort, ConfirmationRequest, DriftReport, NeverConfirm};
pub use error::EngineError;
pub use execution::{Execution, ExecutionParams, new_execution_id};
pub use executor::{StepContext, StepError, StepExecutor};
pub use formatter::{ChannelFormatter, Formatter, FormatterEvent, NoopFormatter};
pub use orchestrator::{
  CleanupOutcome, ExecutionOptions, ExecutionOrchestrator, RetryStrategy, WorkflowSource,
};
pub use replay::{PathRecord, PathState, ROOT_PATH, ReplayState, child_path_id};
pub use stats::{ExecutionReport, ExecutionStats, HistoryStats};
