use std::sync::Arc;

use strand_store::{Event, EventStore, NewEvent, StoreError};
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::AppendRetry;
use crate::error::EngineError;

/// Serializes one execution's appends and retries transient failures.
///
/// Path tasks share a recorder; the lock is held only for the duration of an
/// append, never while a step runs.
pub(crate) struct Recorder {
  execution_id: String,
  store: Arc<dyn EventStore>,
  retry: AppendRetry,
  lock: Mutex<()>,
}

impl Recorder {
  pub fn new(execution_id: String, store: Arc<dyn EventStore>, retry: AppendRetry) -> Self {
    Self {
      execution_id,
      store,
      retry,
      lock: Mutex::new(()),
    }
  }

  /// Durably append a batch. Returns only once the events are stored; if
  /// every attempt fails the error is returned and the caller must not
  /// advance.
  pub async fn record(&self, events: Vec<NewEvent>) -> Result<Vec<Event>, EngineError> {
    let _guard = self.lock.lock().await;
    let max_attempts = self.retry.max_attempts.max(1);

    let mut attempt = 1;
    loop {
      match self.store.append(&self.execution_id, events.clone()).await {
        Ok(stored) => return Ok(stored),
        Err(error) if error.is_transient() && attempt < max_attempts => {
          let delay = self.retry.delay_after(attempt);
          warn!(
            execution_id = %self.execution_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "append failed, retrying"
          );
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        Err(error) => return Err(self.exhausted(error)),
      }
    }
  }

  pub async fn record_one(&self, event: NewEvent) -> Result<Event, EngineError> {
    let mut stored = self.record(vec![event]).await?;
    stored.pop().ok_or_else(|| {
      EngineError::Storage(StoreError::InvalidAppend {
        execution_id: self.execution_id.clone(),
        message: "store returned no event for a non-empty batch".to_string(),
      })
    })
  }

  fn exhausted(&self, error: StoreError) -> EngineError {
    warn!(
      execution_id = %self.execution_id,
      error = %error,
      "append failed, giving up"
    );
    error.into()
  }
}
