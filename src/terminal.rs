//! Terminal presentation: progress output, confirmation prompts and
//! execution listings.

use std::io::{self, BufRead, IsTerminal, Write};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use strand_engine::{
  ConfirmationPort, ConfirmationRequest, ExecutionReport, ExecutionStats, Formatter, HistoryStats,
};
use strand_store::{Event, ExecutionSnapshot, ExecutionStatus};
use strand_workflow::{Step, Values, Workflow};

/// Writes progress to stderr, keeping stdout for results.
#[derive(Debug, Clone, Default)]
pub struct TerminalFormatter;

impl Formatter for TerminalFormatter {
  fn workflow_header(&self, workflow: &Workflow, inputs: &Values) {
    eprintln!("Workflow: {}", workflow.name);
    if let Some(description) = &workflow.description {
      eprintln!("  {description}");
    }
    for (name, value) in inputs {
      eprintln!("  input {name} = {value}");
    }
  }

  fn execution_id(&self, execution_id: &str, resumed: bool) {
    if resumed {
      eprintln!("Resuming execution {execution_id}");
    } else {
      eprintln!("Execution {execution_id}");
    }
  }

  fn step_started(&self, path_id: &str, step: &Step) {
    eprintln!("  [{path_id}] {} ({})...", step.name, step.step_type);
  }

  fn step_replayed(&self, path_id: &str, step: &Step, _output: &Value) {
    eprintln!("  [{path_id}] {} (already completed)", step.name);
  }

  fn step_completed(&self, path_id: &str, step: &Step, _output: &Value) {
    eprintln!("  [{path_id}] {} done", step.name);
  }

  fn step_failed(&self, path_id: &str, step: &Step, error: &str) {
    eprintln!("  [{path_id}] {} failed: {error}", step.name);
  }

  fn workflow_complete(&self, report: &ExecutionReport) {
    if report.failed_paths.is_empty() {
      eprintln!("Execution {} completed", report.execution_id);
    } else {
      eprintln!(
        "Execution {} completed with failed paths: {}",
        report.execution_id,
        report.failed_paths.join(", ")
      );
    }
  }

  fn workflow_error(&self, error: &str) {
    eprintln!("Execution did not complete: {error}");
  }

  fn execution_stats(&self, stats: &ExecutionStats) {
    eprintln!(
      "Paths: {} total, {} completed, {} failed",
      stats.total_paths, stats.completed_paths, stats.failed_paths
    );
    eprintln!(
      "Steps: {} executed ({} failed), {} replayed",
      stats.steps_executed, stats.steps_failed, stats.steps_replayed
    );
    eprintln!("Duration: {}", format_duration(stats.duration));
  }
}

/// Asks on the terminal. Declines when stdin is not interactive.
#[derive(Debug, Clone, Default)]
pub struct TerminalConfirm;

#[async_trait]
impl ConfirmationPort for TerminalConfirm {
  async fn confirm(&self, request: &ConfirmationRequest) -> bool {
    describe_request(request);

    if !io::stdin().is_terminal() {
      eprintln!("Not running interactively; declining. Pass --yes to confirm.");
      return false;
    }

    let question = request.question();
    tokio::task::spawn_blocking(move || prompt_yes_no(&question))
      .await
      .unwrap_or(false)
  }
}

fn describe_request(request: &ConfirmationRequest) {
  match request {
    ConfirmationRequest::DeleteExecution { snapshot } => print_snapshot(snapshot),
    ConfirmationRequest::Cleanup {
      candidates,
      older_than,
    } => {
      eprintln!(
        "Completed executions last updated before {}:",
        older_than.format("%Y-%m-%d %H:%M")
      );
      for snapshot in candidates {
        eprintln!("  {}  {}", snapshot.id, snapshot.workflow_name);
      }
    }
    ConfirmationRequest::ResumeWithDrift(report) => {
      eprintln!("Workflow definition changed: {}", report.workflow_path);
      eprintln!("  recorded {}", report.recorded_hash);
      eprintln!("  current  {}", report.current_hash);
      if let Some(compatibility) = &report.compatibility {
        eprintln!("  {}", compatibility.summary);
        if !compatibility.is_compatible {
          eprintln!(
            "  steps removed or changed: {}",
            compatibility.incompatible_steps.join(", ")
          );
        }
      }
    }
  }
}

fn prompt_yes_no(question: &str) -> bool {
  eprint!("{question} [y/N] ");
  if io::stderr().flush().is_err() {
    return false;
  }

  let mut answer = String::new();
  match io::stdin().lock().read_line(&mut answer) {
    Ok(_) => matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"),
    Err(_) => false,
  }
}

pub fn format_duration(duration: Duration) -> String {
  let millis = duration.as_millis();
  if millis < 1_000 {
    format!("{millis}ms")
  } else if millis < 60_000 {
    format!("{:.1}s", duration.as_secs_f64())
  } else {
    let secs = duration.as_secs();
    format!("{}m{:02}s", secs / 60, secs % 60)
  }
}

fn snapshot_duration(snapshot: &ExecutionSnapshot) -> String {
  snapshot
    .duration()
    .and_then(|d| d.to_std().ok())
    .map(format_duration)
    .unwrap_or_else(|| "-".to_string())
}

pub fn print_snapshot_list(snapshots: &[ExecutionSnapshot]) {
  if snapshots.is_empty() {
    println!("No executions found.");
    return;
  }

  println!(
    "{:<40} {:<24} {:<10} {:<17} {:>9}",
    "ID", "WORKFLOW", "STATUS", "UPDATED", "DURATION"
  );
  for snapshot in snapshots {
    println!(
      "{:<40} {:<24} {:<10} {:<17} {:>9}",
      snapshot.id,
      snapshot.workflow_name,
      snapshot.status,
      snapshot.updated_at.format("%Y-%m-%d %H:%M"),
      snapshot_duration(snapshot)
    );
  }
}

pub fn print_snapshot(snapshot: &ExecutionSnapshot) {
  println!("Execution:  {}", snapshot.id);
  println!("Workflow:   {}", snapshot.workflow_name);
  if let Some(path) = &snapshot.workflow_path {
    println!("Path:       {path}");
  }
  println!("Hash:       {}", snapshot.workflow_hash);
  println!("Status:     {}", snapshot.status);
  if let Some(start) = snapshot.start_time {
    println!("Started:    {}", start.format("%Y-%m-%d %H:%M:%S"));
  }
  if let Some(end) = snapshot.end_time {
    println!("Ended:      {}", end.format("%Y-%m-%d %H:%M:%S"));
  }
  println!("Duration:   {}", snapshot_duration(snapshot));
  println!("Last event: {}", snapshot.last_event_seq);
  if let Some(error) = &snapshot.error {
    println!("Error:      {error}");
  }
  if !snapshot.inputs.is_empty() {
    println!("Inputs:");
    for (name, value) in &snapshot.inputs {
      println!("  {name} = {value}");
    }
  }
  if !snapshot.outputs.is_empty() {
    println!("Outputs:");
    for (name, value) in &snapshot.outputs {
      println!("  {name} = {value}");
    }
  }
}

pub fn print_events(events: &[Event]) {
  println!("Events:");
  for event in events {
    let location = match (event.path_id.is_empty(), event.step.is_empty()) {
      (true, _) => String::new(),
      (false, true) => format!(" [{}]", event.path_id),
      (false, false) => format!(" [{}] {}", event.path_id, event.step),
    };
    println!(
      "  {:>4}  {}  {}{}",
      event.sequence,
      event.timestamp.format("%H:%M:%S%.3f"),
      event.event_type(),
      location
    );
  }
}

pub fn print_stats(stats: &HistoryStats) {
  println!("Executions: {}", stats.total);
  for status in [
    ExecutionStatus::Pending,
    ExecutionStatus::Running,
    ExecutionStatus::Completed,
    ExecutionStatus::Failed,
  ] {
    let count = stats.by_status.get(&status).copied().unwrap_or(0);
    println!(
      "  {:<10} {:>5}  ({:.1}%)",
      status.as_str(),
      count,
      stats.percentage(status)
    );
  }
  if let Some(average) = stats.average_duration {
    println!("Average duration: {}", format_duration(average));
  }
  if !stats.top_workflows.is_empty() {
    println!("Most run workflows:");
    for (name, count) in &stats.top_workflows {
      println!("  {name:<24} {count:>5}");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_format_duration() {
    assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
    assert_eq!(format_duration(Duration::from_millis(1_500)), "1.5s");
    assert_eq!(format_duration(Duration::from_secs(125)), "2m05s");
  }
}
