use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use futures::StreamExt;
use sqlx::sqlite::{
  SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::types::Json;
use sqlx::{FromRow, QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::event::{Event, EventPayload, EventType, NewEvent, PAYLOAD_VERSION, Values};
use crate::projector;
use crate::snapshot::{ExecutionFilter, ExecutionSnapshot, ExecutionStatus};
use crate::{EventStore, EventStream, StoreError};

const SELECT_EVENTS: &str = r#"
  SELECT execution_id, sequence, event_type, path_id, step, timestamp, payload_version, payload
  FROM execution_events
  WHERE execution_id = ? AND sequence >= ?
  ORDER BY sequence ASC
"#;

const SELECT_SNAPSHOTS: &str = r#"
  SELECT execution_id, workflow_name, workflow_path, workflow_hash, inputs_hash, status,
         start_time, end_time, inputs, outputs, error, last_event_seq, created_at, updated_at
  FROM execution_snapshots
"#;

/// SQLite-backed event store.
///
/// All mutating operations pass through a single async write gate, which
/// serializes sequence assignment per execution. Readers never wait on it.
pub struct SqliteEventStore {
  pool: SqlitePool,
  write_gate: Mutex<()>,
}

#[derive(FromRow)]
struct EventRow {
  execution_id: String,
  sequence: i64,
  event_type: String,
  path_id: String,
  step: String,
  timestamp: DateTime<Utc>,
  payload_version: i64,
  payload: Json<serde_json::Value>,
}

impl EventRow {
  fn into_event(self) -> Result<Event, StoreError> {
    let payload = EventPayload::from_json(&self.event_type, self.payload_version, self.payload.0)
      .map_err(|e| StoreError::Corrupt {
        execution_id: self.execution_id.clone(),
        message: format!("event {} ({}): {e}", self.sequence, self.event_type),
      })?;

    Ok(Event {
      execution_id: self.execution_id,
      sequence: self.sequence,
      path_id: self.path_id,
      step: self.step,
      timestamp: self.timestamp,
      payload,
    })
  }
}

#[derive(FromRow)]
struct SnapshotRow {
  execution_id: String,
  workflow_name: String,
  workflow_path: Option<String>,
  workflow_hash: String,
  inputs_hash: String,
  status: ExecutionStatus,
  start_time: Option<DateTime<Utc>>,
  end_time: Option<DateTime<Utc>>,
  inputs: Json<Values>,
  outputs: Json<Values>,
  error: Option<String>,
  last_event_seq: i64,
  created_at: DateTime<Utc>,
  updated_at: DateTime<Utc>,
}

impl From<SnapshotRow> for ExecutionSnapshot {
  fn from(row: SnapshotRow) -> Self {
    Self {
      id: row.execution_id,
      workflow_name: row.workflow_name,
      workflow_path: row.workflow_path,
      workflow_hash: row.workflow_hash,
      inputs_hash: row.inputs_hash,
      status: row.status,
      start_time: row.start_time,
      end_time: row.end_time,
      inputs: row.inputs.0,
      outputs: row.outputs.0,
      error: row.error,
      last_event_seq: row.last_event_seq,
      created_at: row.created_at,
      updated_at: row.updated_at,
    }
  }
}

impl SqliteEventStore {
  /// Create a store over an existing pool. Call [`SqliteEventStore::migrate`]
  /// before use.
  pub fn new(pool: SqlitePool) -> Self {
    Self {
      pool,
      write_gate: Mutex::new(()),
    }
  }

  /// Open (or create) the database file at `path` and run migrations.
  pub async fn connect(path: impl AsRef<Path>) -> Result<Self, StoreError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        tokio::fs::create_dir_all(parent).await?;
      }
    }

    let options = SqliteConnectOptions::new()
      .filename(path)
      .create_if_missing(true)
      .journal_mode(SqliteJournalMode::Wal)
      .synchronous(SqliteSynchronous::Normal)
      .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
      .max_connections(8)
      .connect_with(options)
      .await?;

    let store = Self::new(pool);
    store.migrate().await?;
    info!(path = %path.display(), "opened execution store");
    Ok(store)
  }

  /// A private in-memory database, mostly for tests.
  pub async fn in_memory() -> Result<Self, StoreError> {
    // Every connection to :memory: is a separate database, so the pool
    // must keep exactly one connection alive.
    let pool = SqlitePoolOptions::new()
      .max_connections(1)
      .min_connections(1)
      .idle_timeout(None)
      .max_lifetime(None)
      .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?)
      .await?;

    let store = Self::new(pool);
    store.migrate().await?;
    Ok(store)
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), StoreError> {
    sqlx::migrate!("../../migrations").run(&self.pool).await?;
    Ok(())
  }

  /// The underlying connection pool.
  pub fn pool(&self) -> &SqlitePool {
    &self.pool
  }

  async fn fetch_snapshot(
    conn: &mut SqliteConnection,
    execution_id: &str,
  ) -> Result<Option<ExecutionSnapshot>, StoreError> {
    let query = format!("{SELECT_SNAPSHOTS} WHERE execution_id = ?");
    let row: Option<SnapshotRow> = sqlx::query_as(&query)
      .bind(execution_id)
      .fetch_optional(&mut *conn)
      .await?;
    Ok(row.map(ExecutionSnapshot::from))
  }

  async fn insert_event(conn: &mut SqliteConnection, event: &Event) -> Result<(), StoreError> {
    sqlx::query(
      r#"
      INSERT INTO execution_events
        (execution_id, sequence, event_type, path_id, step, timestamp, payload_version, payload)
      VALUES (?, ?, ?, ?, ?, ?, ?, ?)
      "#,
    )
    .bind(&event.execution_id)
    .bind(event.sequence)
    .bind(event.payload.type_name())
    .bind(&event.path_id)
    .bind(&event.step)
    .bind(event.timestamp)
    .bind(PAYLOAD_VERSION)
    .bind(Json(event.payload.to_json()?))
    .execute(&mut *conn)
    .await?;

    Ok(())
  }

  async fn upsert_snapshot(
    conn: &mut SqliteConnection,
    snapshot: &ExecutionSnapshot,
  ) -> Result<(), StoreError> {
    sqlx::query(
      r#"
      INSERT INTO execution_snapshots
        (execution_id, workflow_name, workflow_path, workflow_hash, inputs_hash, status,
         start_time, end_time, inputs, outputs, error, last_event_seq, created_at, updated_at)
      VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
      ON CONFLICT(execution_id) DO UPDATE SET
        workflow_name = excluded.workflow_name,
        workflow_path = excluded.workflow_path,
        workflow_hash = excluded.workflow_hash,
        inputs_hash = excluded.inputs_hash,
        status = excluded.status,
        start_time = excluded.start_time,
        end_time = excluded.end_time,
        inputs = excluded.inputs,
        outputs = excluded.outputs,
        error = excluded.error,
        last_event_seq = excluded.last_event_seq,
        created_at = excluded.created_at,
        updated_at = excluded.updated_at
      "#,
    )
    .bind(&snapshot.id)
    .bind(&snapshot.workflow_name)
    .bind(&snapshot.workflow_path)
    .bind(&snapshot.workflow_hash)
    .bind(&snapshot.inputs_hash)
    .bind(snapshot.status)
    .bind(snapshot.start_time)
    .bind(snapshot.end_time)
    .bind(Json(&snapshot.inputs))
    .bind(Json(&snapshot.outputs))
    .bind(&snapshot.error)
    .bind(snapshot.last_event_seq)
    .bind(snapshot.created_at)
    .bind(snapshot.updated_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
  }
}

/// Check that a batch may be appended given the execution's current state.
fn validate_batch(
  execution_id: &str,
  existing: Option<&ExecutionSnapshot>,
  events: &[NewEvent],
) -> Result<(), StoreError> {
  // A raw payload tagged with a known type would be decoded strictly on read.
  if let Some(name) = events.iter().find_map(|e| match &e.payload {
    EventPayload::Unknown(_) if EventType::parse(e.payload.type_name()) != EventType::Unknown => {
      Some(e.payload.type_name())
    }
    _ => None,
  }) {
    return Err(StoreError::InvalidAppend {
      execution_id: execution_id.to_string(),
      message: format!("raw payload uses the reserved type '{name}'"),
    });
  }

  let starts_fresh = events
    .first()
    .is_some_and(|e| e.payload.event_type() == EventType::ExecutionStarted);

  if existing.is_none() && !starts_fresh {
    return Err(StoreError::NotFound(execution_id.to_string()));
  }

  let skip = usize::from(existing.is_none());
  if events[skip..]
    .iter()
    .any(|e| e.payload.event_type() == EventType::ExecutionStarted)
  {
    return Err(StoreError::InvalidAppend {
      execution_id: execution_id.to_string(),
      message: "execution_started may only open a new execution".to_string(),
    });
  }

  Ok(())
}

#[async_trait]
impl EventStore for SqliteEventStore {
  async fn append(&self, execution_id: &str, events: Vec<NewEvent>) -> Result<Vec<Event>, StoreError> {
    if events.is_empty() {
      return Ok(Vec::new());
    }

    let _guard = self.write_gate.lock().await;
    let mut tx = self.pool.begin().await?;

    let existing = Self::fetch_snapshot(&mut tx, execution_id).await?;
    validate_batch(execution_id, existing.as_ref(), &events)?;

    // Timestamps are stored at millisecond precision and never go backwards
    // within an execution.
    let mut previous = existing.as_ref().map(|s| s.updated_at);
    let mut snapshot = match existing {
      Some(snapshot) => snapshot,
      None => ExecutionSnapshot::pending(execution_id, events[0].timestamp.trunc_subsecs(3)),
    };

    let mut appended = Vec::with_capacity(events.len());
    for new in events {
      let mut timestamp = new.timestamp.trunc_subsecs(3);
      if let Some(prev) = previous {
        timestamp = timestamp.max(prev);
      }
      previous = Some(timestamp);

      let event = Event {
        execution_id: execution_id.to_string(),
        sequence: snapshot.last_event_seq + 1,
        path_id: new.path_id,
        step: new.step,
        timestamp,
        payload: new.payload,
      };

      Self::insert_event(&mut tx, &event).await?;
      projector::apply(&mut snapshot, &event);
      appended.push(event);
    }

    Self::upsert_snapshot(&mut tx, &snapshot).await?;
    tx.commit().await?;

    debug!(
      execution_id = %execution_id,
      count = appended.len(),
      last_sequence = snapshot.last_event_seq,
      status = %snapshot.status,
      "appended events"
    );

    Ok(appended)
  }

  fn get_events<'a>(&'a self, execution_id: &'a str, from_sequence: i64) -> EventStream<'a> {
    sqlx::query_as::<_, EventRow>(SELECT_EVENTS)
      .bind(execution_id)
      .bind(from_sequence)
      .fetch(&self.pool)
      .map(|row| row.map_err(StoreError::from).and_then(EventRow::into_event))
      .boxed()
  }

  async fn get_snapshot(&self, execution_id: &str) -> Result<ExecutionSnapshot, StoreError> {
    let mut conn = self.pool.acquire().await?;
    Self::fetch_snapshot(&mut conn, execution_id)
      .await?
      .ok_or_else(|| StoreError::NotFound(execution_id.to_string()))
  }

  async fn list_executions(
    &self,
    filter: &ExecutionFilter,
  ) -> Result<Vec<ExecutionSnapshot>, StoreError> {
    let mut query = QueryBuilder::<Sqlite>::new(SELECT_SNAPSHOTS);
    query.push(" WHERE 1 = 1");

    if let Some(status) = filter.status {
      query.push(" AND status = ").push_bind(status);
    }
    if let Some(name) = &filter.workflow_name {
      query.push(" AND workflow_name = ").push_bind(name.clone());
    }

    query.push(" ORDER BY updated_at DESC, execution_id DESC");

    match (filter.limit, filter.offset) {
      (Some(limit), _) => {
        query.push(" LIMIT ").push_bind(i64::from(limit));
      }
      // SQLite only accepts OFFSET after a LIMIT.
      (None, Some(_)) => {
        query.push(" LIMIT -1");
      }
      (None, None) => {}
    }
    if let Some(offset) = filter.offset {
      query.push(" OFFSET ").push_bind(i64::from(offset));
    }

    let rows: Vec<SnapshotRow> = query.build_query_as().fetch_all(&self.pool).await?;
    Ok(rows.into_iter().map(ExecutionSnapshot::from).collect())
  }

  async fn delete_execution(&self, execution_id: &str) -> Result<(), StoreError> {
    let _guard = self.write_gate.lock().await;
    let mut tx = self.pool.begin().await?;

    sqlx::query("DELETE FROM execution_events WHERE execution_id = ?")
      .bind(execution_id)
      .execute(&mut *tx)
      .await?;

    let deleted = sqlx::query("DELETE FROM execution_snapshots WHERE execution_id = ?")
      .bind(execution_id)
      .execute(&mut *tx)
      .await?;

    if deleted.rows_affected() == 0 {
      return Err(StoreError::NotFound(execution_id.to_string()));
    }

    tx.commit().await?;
    info!(execution_id = %execution_id, "deleted execution");
    Ok(())
  }

  async fn cleanup_completed_executions(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
    let _guard = self.write_gate.lock().await;
    let mut tx = self.pool.begin().await?;

    sqlx::query(
      r#"
      DELETE FROM execution_events
      WHERE execution_id IN (
        SELECT execution_id FROM execution_snapshots
        WHERE status = ? AND updated_at < ?
      )
      "#,
    )
    .bind(ExecutionStatus::Completed)
    .bind(older_than)
    .execute(&mut *tx)
    .await?;

    let deleted = sqlx::query("DELETE FROM execution_snapshots WHERE status = ? AND updated_at < ?")
      .bind(ExecutionStatus::Completed)
      .bind(older_than)
      .execute(&mut *tx)
      .await?;

    tx.commit().await?;

    let count = deleted.rows_affected();
    info!(count, older_than = %older_than, "cleaned up completed executions");
    Ok(count)
  }

  async fn rebuild_snapshot(&self, execution_id: &str) -> Result<ExecutionSnapshot, StoreError> {
    let _guard = self.write_gate.lock().await;
    let mut tx = self.pool.begin().await?;

    let rows: Vec<EventRow> = sqlx::query_as(SELECT_EVENTS)
      .bind(execution_id)
      .bind(1_i64)
      .fetch_all(&mut *tx)
      .await?;

    let events = rows
      .into_iter()
      .map(EventRow::into_event)
      .collect::<Result<Vec<_>, _>>()?;

    let snapshot = projector::project(&events)
      .ok_or_else(|| StoreError::NotFound(execution_id.to_string()))?;

    Self::upsert_snapshot(&mut tx, &snapshot).await?;
    tx.commit().await?;

    info!(
      execution_id = %execution_id,
      events = events.len(),
      "rebuilt snapshot from event log"
    );
    Ok(snapshot)
  }
}
