mod executor;
mod template;
mod terminal;

use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{TimeDelta, Utc};
use clap::{Parser, Subcommand};
use serde_json::Value;
use strand_engine::{
  EngineError, Execution, ExecutionOptions, ExecutionOrchestrator, OrchestratorConfig,
  RetryStrategy,
};
use strand_store::{ExecutionFilter, ExecutionStatus, SqliteEventStore, Values};
use strand_workflow::FsWorkflowLoader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use crate::executor::BuiltinStepExecutor;
use crate::terminal::{TerminalConfirm, TerminalFormatter};

/// Strand - durable, resumable workflow execution
#[derive(Parser)]
#[command(name = "strand")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: <config dir>/strand)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  /// Path to the execution database (default: <data dir>/executions.db)
  #[arg(long, global = true)]
  database: Option<PathBuf>,

  /// Answer yes to every confirmation prompt
  #[arg(short = 'y', long, global = true)]
  yes: bool,

  /// Increase log output (-v, -vv)
  #[arg(short, long, action = clap::ArgAction::Count, global = true)]
  verbose: u8,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Run a workflow
  Run {
    /// Path to the workflow file, or a directory containing workflow.json
    workflow_file: PathBuf,

    /// Workflow input as KEY=VALUE. VALUE is parsed as JSON, falling back
    /// to a plain string.
    #[arg(short, long = "input", value_name = "KEY=VALUE")]
    inputs: Vec<String>,

    /// Read a JSON object of inputs from stdin
    #[arg(long)]
    stdin: bool,
  },

  /// Resume an interrupted or failed execution
  Resume {
    execution_id: String,
  },

  /// Start a finished execution over with its recorded workflow and inputs
  Retry {
    execution_id: String,

    /// Replace a recorded input as KEY=VALUE
    #[arg(short, long = "input", value_name = "KEY=VALUE")]
    inputs: Vec<String>,
  },

  /// Inspect and manage recorded executions
  Executions {
    #[command(subcommand)]
    command: ExecutionsCommand,
  },
}

#[derive(Subcommand)]
enum ExecutionsCommand {
  /// List executions, most recently updated first
  List {
    /// Only executions with this status (pending, running, completed, failed)
    #[arg(long)]
    status: Option<ExecutionStatus>,

    /// Only executions of this workflow
    #[arg(long)]
    workflow: Option<String>,

    #[arg(long, default_value_t = 20)]
    limit: u32,

    /// Only executions that can be resumed
    #[arg(long)]
    resumable: bool,
  },

  /// Show one execution
  Show {
    execution_id: String,

    /// Also print the event history
    #[arg(long)]
    events: bool,
  },

  /// Delete an execution and its history
  Delete {
    execution_id: String,
  },

  /// Delete completed executions that have not been updated recently
  Cleanup {
    /// Age in days
    #[arg(long, default_value_t = 30)]
    older_than: u32,
  },

  /// Summarize recorded executions
  Stats {
    /// Only executions of this workflow
    #[arg(long)]
    workflow: Option<String>,
  },

  /// Recompute an execution's snapshot from its event history
  Rebuild {
    execution_id: String,
  },
}

fn main() -> Result<()> {
  let cli = Cli::parse();
  init_tracing(cli.verbose);

  let Some(command) = cli.command else {
    println!("strand - use --help to see available commands");
    return Ok(());
  };

  let data_dir = match cli.data_dir {
    Some(dir) => dir,
    None => default_data_dir()?,
  };
  let database = cli
    .database
    .unwrap_or_else(|| data_dir.join("executions.db"));

  let config = OrchestratorConfig {
    assume_yes: cli.yes,
    ..OrchestratorConfig::default()
  };

  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async {
    let orchestrator = open_orchestrator(&database, config).await?;
    match command {
      Commands::Run {
        workflow_file,
        inputs,
        stdin,
      } => run_workflow(&orchestrator, workflow_file, inputs, stdin).await,
      Commands::Resume { execution_id } => resume_workflow(&orchestrator, &execution_id).await,
      Commands::Retry {
        execution_id,
        inputs,
      } => retry_workflow(&orchestrator, &execution_id, inputs).await,
      Commands::Executions { command } => manage_executions(&orchestrator, command).await,
    }
  })
}

fn init_tracing(verbose: u8) {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
    EnvFilter::new(match verbose {
      0 => "warn",
      1 => "info",
      _ => "debug",
    })
  });

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(io::stderr)
    .init();
}

fn default_data_dir() -> Result<PathBuf> {
  if let Some(config) = dirs::config_dir() {
    return Ok(config.join("strand"));
  }
  dirs::home_dir()
    .map(|home| home.join(".strand"))
    .context("could not determine a data directory; pass --data-dir")
}

async fn open_orchestrator(
  database: &Path,
  config: OrchestratorConfig,
) -> Result<ExecutionOrchestrator> {
  let store = SqliteEventStore::connect(database)
    .await
    .with_context(|| format!("failed to open execution store: {}", database.display()))?;

  Ok(
    ExecutionOrchestrator::new(
      Arc::new(store),
      Arc::new(FsWorkflowLoader::new()),
      Arc::new(BuiltinStepExecutor),
      config,
    )
    .with_confirmation(Arc::new(TerminalConfirm)),
  )
}

async fn run_workflow(
  orchestrator: &ExecutionOrchestrator,
  workflow_file: PathBuf,
  raw_inputs: Vec<String>,
  from_stdin: bool,
) -> Result<()> {
  let mut inputs = if from_stdin {
    read_inputs_from_stdin()?
  } else {
    Values::new()
  };
  for raw in &raw_inputs {
    let (key, value) = parse_input(raw)?;
    inputs.insert(key, value);
  }

  let options = ExecutionOptions::from_path(&workflow_file)
    .with_inputs(inputs)
    .with_formatter(Arc::new(TerminalFormatter));
  let execution = orchestrator
    .create_execution(options)
    .await
    .with_context(|| format!("failed to start workflow: {}", workflow_file.display()))?;

  drive(execution).await
}

async fn resume_workflow(orchestrator: &ExecutionOrchestrator, execution_id: &str) -> Result<()> {
  let execution = match orchestrator
    .resume_execution(execution_id, Arc::new(TerminalFormatter))
    .await
  {
    Ok(execution) => execution,
    Err(EngineError::DefinitionDrift(report)) => bail!(
      "workflow {} changed since execution {} started; resume declined",
      report.workflow_path,
      report.execution_id
    ),
    Err(e) => return Err(e).with_context(|| format!("cannot resume execution {execution_id}")),
  };

  drive(execution).await
}

async fn retry_workflow(
  orchestrator: &ExecutionOrchestrator,
  execution_id: &str,
  raw_inputs: Vec<String>,
) -> Result<()> {
  let strategy = if raw_inputs.is_empty() {
    RetryStrategy::FromStart
  } else {
    let mut overrides = Values::new();
    for raw in &raw_inputs {
      let (key, value) = parse_input(raw)?;
      overrides.insert(key, value);
    }
    RetryStrategy::WithNewInputs(overrides)
  };

  let execution = orchestrator
    .retry_execution(execution_id, strategy, Arc::new(TerminalFormatter))
    .await
    .with_context(|| format!("cannot retry execution {execution_id}"))?;

  drive(execution).await
}

/// Run an execution until it finishes or Ctrl-C is pressed.
async fn drive(execution: Execution) -> Result<()> {
  let execution_id = execution.id().to_string();
  let cancel = CancellationToken::new();

  let on_interrupt = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      eprintln!("Interrupted; waiting for running steps to finish...");
      on_interrupt.cancel();
    }
  });

  match execution.run(cancel).await {
    Ok(report) => {
      println!("{}", serde_json::to_string_pretty(&report.outputs)?);
      if report.status == ExecutionStatus::Failed {
        bail!(
          "execution {execution_id} failed: {}",
          report.error.as_deref().unwrap_or("unknown error")
        );
      }
      Ok(())
    }
    Err(EngineError::Cancelled) => {
      bail!("execution {execution_id} was interrupted; continue it with `strand resume {execution_id}`")
    }
    Err(e) => Err(e).with_context(|| format!("execution {execution_id} did not complete")),
  }
}

async fn manage_executions(
  orchestrator: &ExecutionOrchestrator,
  command: ExecutionsCommand,
) -> Result<()> {
  match command {
    ExecutionsCommand::List {
      status,
      workflow,
      limit,
      resumable,
    } => {
      let snapshots = if resumable {
        orchestrator.list_resumable(Some(limit)).await?
      } else {
        let mut filter = ExecutionFilter::new().limit(limit);
        if let Some(status) = status {
          filter = filter.status(status);
        }
        if let Some(workflow) = workflow {
          filter = filter.workflow_name(workflow);
        }
        orchestrator.list_executions(&filter).await?
      };
      terminal::print_snapshot_list(&snapshots);
    }
    ExecutionsCommand::Show {
      execution_id,
      events,
    } => {
      let snapshot = orchestrator.get_execution(&execution_id).await?;
      terminal::print_snapshot(&snapshot);
      if events {
        let history = orchestrator.get_event_history(&execution_id).await?;
        terminal::print_events(&history);
      }
    }
    ExecutionsCommand::Delete { execution_id } => {
      if orchestrator.delete_execution(&execution_id).await? {
        eprintln!("Deleted execution {execution_id}");
      } else {
        eprintln!("Kept execution {execution_id}");
      }
    }
    ExecutionsCommand::Cleanup { older_than } => {
      let cutoff = Utc::now() - TimeDelta::days(i64::from(older_than));
      let outcome = orchestrator.cleanup(cutoff).await?;
      if outcome.candidates.is_empty() {
        eprintln!("No completed executions older than {older_than} days");
      } else if !outcome.confirmed {
        eprintln!("Cleanup cancelled");
      } else {
        eprintln!("Deleted {} execution(s)", outcome.deleted.len());
        if outcome.deleted.len() < outcome.candidates.len() {
          warn!(
            candidates = outcome.candidates.len(),
            deleted = outcome.deleted.len(),
            "some executions changed before cleanup and were kept"
          );
        }
      }
    }
    ExecutionsCommand::Stats { workflow } => {
      let mut filter = ExecutionFilter::new();
      if let Some(workflow) = workflow {
        filter = filter.workflow_name(workflow);
      }
      let stats = orchestrator.stats(&filter).await?;
      terminal::print_stats(&stats);
    }
    ExecutionsCommand::Rebuild { execution_id } => {
      let snapshot = orchestrator.rebuild_snapshot(&execution_id).await?;
      terminal::print_snapshot(&snapshot);
    }
  }
  Ok(())
}

fn parse_input(raw: &str) -> Result<(String, Value)> {
  let Some((key, value)) = raw.split_once('=') else {
    bail!("invalid input '{raw}': expected KEY=VALUE");
  };
  let key = key.trim();
  if key.is_empty() {
    bail!("invalid input '{raw}': empty key");
  }

  let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
  Ok((key.to_string(), value))
}

fn read_inputs_from_stdin() -> Result<Values> {
  if io::stdin().is_terminal() {
    return Ok(Values::new());
  }

  let mut input = String::new();
  io::stdin()
    .read_to_string(&mut input)
    .context("failed to read inputs from stdin")?;

  if input.trim().is_empty() {
    return Ok(Values::new());
  }
  let inputs: Values =
    serde_json::from_str(&input).context("inputs on stdin must be a JSON object")?;
  debug!(count = inputs.len(), "read inputs from stdin");
  Ok(inputs)
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[test]
  fn test_parse_input() {
    assert_eq!(
      parse_input("replicas=3").unwrap(),
      ("replicas".to_string(), json!(3))
    );
    assert_eq!(
      parse_input("target=prod").unwrap(),
      ("target".to_string(), json!("prod"))
    );
    assert_eq!(
      parse_input("query=a=b").unwrap(),
      ("query".to_string(), json!("a=b"))
    );
    assert_eq!(
      parse_input("tags=[\"x\"]").unwrap(),
      ("tags".to_string(), json!(["x"]))
    );
    assert!(parse_input("novalue").is_err());
    assert!(parse_input("=1").is_err());
  }

  #[test]
  fn test_cli_parses_executions_list() {
    let cli = Cli::parse_from([
      "strand",
      "--yes",
      "executions",
      "list",
      "--status",
      "failed",
      "--limit",
      "5",
    ]);
    assert!(cli.yes);
    match cli.command {
      Some(Commands::Executions {
        command: ExecutionsCommand::List { status, limit, .. },
      }) => {
        assert_eq!(status, Some(ExecutionStatus::Failed));
        assert_eq!(limit, 5);
      }
      _ => panic!("expected executions list"),
    }
  }

  #[test]
  fn test_cli_parses_retry_inputs() {
    let cli = Cli::parse_from(["strand", "retry", "exec-1", "-i", "target=staging"]);
    match cli.command {
      Some(Commands::Retry {
        execution_id,
        inputs,
      }) => {
        assert_eq!(execution_id, "exec-1");
        assert_eq!(inputs, vec!["target=staging".to_string()]);
      }
      _ => panic!("expected retry"),
    }
  }
}
