use std::time::Duration;

/// Retry policy for appending events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendRetry {
  /// Total attempts, including the first.
  pub max_attempts: u32,
  /// Delay before the second attempt; doubles after each further failure.
  pub initial_delay: Duration,
}

impl AppendRetry {
  /// Delay to wait after the given failed attempt (1-based).
  pub fn delay_after(&self, attempt: u32) -> Duration {
    self
      .initial_delay
      .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
  }
}

impl Default for AppendRetry {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      initial_delay: Duration::from_millis(50),
    }
  }
}

/// Configuration for the orchestrator and the executions it creates.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
  /// Treat every confirmation request as accepted.
  pub assume_yes: bool,
  /// How long an in-flight step may keep running after cancellation.
  pub shutdown_grace: Duration,
  pub append_retry: AppendRetry,
}

impl Default for OrchestratorConfig {
  fn default() -> Self {
    Self {
      assume_yes: false,
      shutdown_grace: Duration::from_secs(10),
      append_retry: AppendRetry::default(),
    }
  }
}
