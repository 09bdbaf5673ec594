//! Strand Store
//!
//! Durable storage for workflow executions. Every state transition of an
//! execution is an [`Event`] in an append-only log; an
//! [`ExecutionSnapshot`] per execution is projected from that log and
//! updated in the same transaction as each append.
//!
//! The [`EventStore`] trait defines operations for:
//! - Appending events with store-assigned, gapless sequence numbers
//! - Reading an execution's history, oldest first
//! - Querying, deleting and cleaning up executions by their snapshot

mod event;
pub mod projector;
mod snapshot;
mod sqlite;

pub use event::{
  BranchTarget, Event, EventPayload, EventType, ExecutionCompleted, ExecutionResumed,
  ExecutionStarted, Failure, NewEvent, PAYLOAD_VERSION, PathBranched, PathCompleted, PathStarted,
  StepCompleted, StepStarted, Values,
};
pub use snapshot::{ExecutionFilter, ExecutionSnapshot, ExecutionStatus};
pub use sqlite::SqliteEventStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use futures::stream::BoxStream;

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  /// The requested execution does not exist.
  #[error("execution not found: {0}")]
  NotFound(String),

  /// The batch cannot be appended to this execution.
  #[error("invalid append to execution '{execution_id}': {message}")]
  InvalidAppend {
    execution_id: String,
    message: String,
  },

  /// A stored record could not be interpreted.
  #[error("corrupt record in execution '{execution_id}': {message}")]
  Corrupt {
    execution_id: String,
    message: String,
  },

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  #[error("migration failed: {0}")]
  Migration(#[from] sqlx::migrate::MigrateError),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

impl StoreError {
  /// Whether retrying the same operation may succeed.
  pub fn is_transient(&self) -> bool {
    matches!(self, Self::Database(_) | Self::Io(_))
  }
}

/// Lazy stream of events, oldest first.
pub type EventStream<'a> = BoxStream<'a, Result<Event, StoreError>>;

/// Storage trait for execution event logs and their snapshots.
#[async_trait]
pub trait EventStore: Send + Sync {
  /// Append a batch of events to an execution.
  ///
  /// Sequence numbers are assigned here, continuing from the last stored
  /// event. The events and the updated snapshot are committed together or not
  /// at all. An empty batch is a no-op. The first batch of a new execution
  /// must start with `execution_started`.
  async fn append(&self, execution_id: &str, events: Vec<NewEvent>) -> Result<Vec<Event>, StoreError>;

  /// Events with `sequence >= from_sequence`, oldest first.
  fn get_events<'a>(&'a self, execution_id: &'a str, from_sequence: i64) -> EventStream<'a>;

  /// The full history of an execution, oldest first. Each call starts a new
  /// read from the beginning. Unknown executions yield an empty stream.
  fn get_event_history<'a>(&'a self, execution_id: &'a str) -> EventStream<'a> {
    self.get_events(execution_id, 1)
  }

  /// Get the current snapshot of an execution.
  async fn get_snapshot(&self, execution_id: &str) -> Result<ExecutionSnapshot, StoreError>;

  /// List snapshots, most recently updated first.
  async fn list_executions(
    &self,
    filter: &ExecutionFilter,
  ) -> Result<Vec<ExecutionSnapshot>, StoreError>;

  /// Delete an execution's events and snapshot.
  async fn delete_execution(&self, execution_id: &str) -> Result<(), StoreError>;

  /// Delete completed executions last updated before `older_than`.
  /// Returns the number of executions removed.
  async fn cleanup_completed_executions(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;

  /// Re-project the snapshot from the log and store it.
  async fn rebuild_snapshot(&self, execution_id: &str) -> Result<ExecutionSnapshot, StoreError>;
}

/// Collect an execution's full history into memory.
pub async fn load_history(
  store: &dyn EventStore,
  execution_id: &str,
) -> Result<Vec<Event>, StoreError> {
  store.get_event_history(execution_id).try_collect().await
}
