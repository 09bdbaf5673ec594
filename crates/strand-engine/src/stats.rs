use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::Serialize;
use strand_store::{ExecutionSnapshot, ExecutionStatus};
use strand_workflow::Values;

/// Counters for a single run of an execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionStats {
  pub total_paths: usize,
  pub completed_paths: usize,
  pub failed_paths: usize,
  /// Steps the executor was invoked for in this run.
  pub steps_executed: usize,
  pub steps_failed: usize,
  /// Steps skipped because an earlier run already completed them.
  pub steps_replayed: usize,
  pub duration: Duration,
}

/// Result of [`Execution::run`](crate::Execution::run).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionReport {
  pub execution_id: String,
  pub status: ExecutionStatus,
  /// Step outputs keyed by step name.
  pub outputs: Values,
  pub failed_paths: Vec<String>,
  pub error: Option<String>,
  pub stats: ExecutionStats,
}

/// Aggregate view over stored executions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistoryStats {
  pub total: usize,
  pub by_status: BTreeMap<ExecutionStatus, usize>,
  /// Mean wall-clock time of executions that reached an end.
  pub average_duration: Option<Duration>,
  /// Most frequently run workflows, most runs first.
  pub top_workflows: Vec<(String, usize)>,
}

impl HistoryStats {
  pub const TOP_WORKFLOWS: usize = 5;

  pub fn from_snapshots(snapshots: &[ExecutionSnapshot]) -> Self {
    let mut by_status = BTreeMap::new();
    let mut per_workflow: HashMap<&str, usize> = HashMap::new();
    let mut total_duration = Duration::ZERO;
    let mut timed = 0u32;

    for snapshot in snapshots {
      *by_status.entry(snapshot.status).or_insert(0) += 1;
      *per_workflow.entry(snapshot.workflow_name.as_str()).or_insert(0) += 1;

      if let Some(duration) = snapshot.duration().and_then(|d| d.to_std().ok()) {
        total_duration += duration;
        timed += 1;
      }
    }

    let mut top_workflows: Vec<(String, usize)> = per_workflow
      .into_iter()
      .map(|(name, count)| (name.to_string(), count))
      .collect();
    top_workflows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    top_workflows.truncate(Self::TOP_WORKFLOWS);

    Self {
      total: snapshots.len(),
      by_status,
      average_duration: (timed > 0).then(|| total_duration / timed),
      top_workflows,
    }
  }

  /// Share of executions with this status, in percent.
  pub fn percentage(&self, status: ExecutionStatus) -> f64 {
    if self.total == 0 {
      return 0.0;
    }
    let count = self.by_status.get(&status).copied().unwrap_or(0);
    count as f64 * 100.0 / self.total as f64
  }
}

#[cfg(test)]
mod tests {
  use chrono::{TimeDelta, Utc};

  use super::*;

  fn snapshot(name: &str, status: ExecutionStatus, seconds: Option<i64>) -> ExecutionSnapshot {
    let start = Utc::now();
    let mut snapshot = ExecutionSnapshot::pending(format!("exec_{name}"), start);
    snapshot.workflow_name = name.to_string();
    snapshot.status = status;
    snapshot.start_time = Some(start);
    snapshot.end_time = seconds.map(|s| start + TimeDelta::seconds(s));
    snapshot
  }

  #[test]
  fn test_history_stats() {
    let snapshots = vec![
      snapshot("a", ExecutionStatus::Completed, Some(10)),
      snapshot("a", ExecutionStatus::Failed, Some(20)),
      snapshot("b", ExecutionStatus::Running, None),
      snapshot("a", ExecutionStatus::Completed, Some(30)),
    ];

    let stats = HistoryStats::from_snapshots(&snapshots);
    assert_eq!(stats.total, 4);
    assert_eq!(stats.by_status[&ExecutionStatus::Completed], 2);
    assert_eq!(stats.percentage(ExecutionStatus::Completed), 50.0);
    assert_eq!(stats.percentage(ExecutionStatus::Pending), 0.0);
    assert_eq!(stats.average_duration, Some(Duration::from_secs(20)));
    assert_eq!(
      stats.top_workflows,
      vec![("a".to_string(), 3), ("b".to_string(), 1)]
    );
  }

  #[test]
  fn test_history_stats_empty() {
    let stats = HistoryStats::from_snapshots(&[]);
    assert_eq!(stats.total, 0);
    assert_eq!(stats.average_duration, None);
    assert_eq!(stats.percentage(ExecutionStatus::Failed), 0.0);
  }
}
