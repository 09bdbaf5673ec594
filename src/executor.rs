//! Step types built into the command line runner.
//!
//! | type      | parameters                               | output                          |
//! |-----------|------------------------------------------|---------------------------------|
//! | `echo`    | any                                      | the rendered parameters         |
//! | `command` | `command`, optional `args`, `cwd`        | `stdout`, `stderr`, `exit_code` |
//! | `wait`    | `seconds`                                | `waited_ms`                     |

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use strand_engine::{StepContext, StepError, StepExecutor};
use strand_workflow::{Step, Values};
use tokio::process::Command;
use tracing::debug;

use crate::template::render_parameters;

#[derive(Debug, Clone, Default)]
pub struct BuiltinStepExecutor;

#[async_trait]
impl StepExecutor for BuiltinStepExecutor {
  async fn execute(&self, step: &Step, ctx: StepContext) -> Result<Value, StepError> {
    let parameters = render_parameters(&step.name, &step.parameters, &ctx)?;
    debug!(step = %step.name, step_type = %step.step_type, "executing builtin step");

    match step.step_type.as_str() {
      "echo" => Ok(json!(parameters)),
      "command" => run_command(&parameters, &ctx).await,
      "wait" => wait(&parameters, &ctx).await,
      other => Err(StepError::new(format!(
        "unknown step type '{other}' (expected echo, command or wait)"
      ))),
    }
  }
}

fn string_parameter<'a>(parameters: &'a Values, name: &str) -> Result<Option<&'a str>, StepError> {
  match parameters.get(name) {
    None => Ok(None),
    Some(Value::String(s)) => Ok(Some(s.as_str())),
    Some(other) => Err(StepError::new(format!(
      "parameter '{name}' must be a string, got {other}"
    ))),
  }
}

async fn run_command(parameters: &Values, ctx: &StepContext) -> Result<Value, StepError> {
  let program = string_parameter(parameters, "command")?
    .ok_or_else(|| StepError::new("command step requires a 'command' parameter"))?;

  let args: Vec<String> = match parameters.get("args") {
    None => Vec::new(),
    Some(Value::Array(items)) => items
      .iter()
      .map(|item| match item {
        Value::String(s) => s.clone(),
        other => other.to_string(),
      })
      .collect(),
    Some(other) => {
      return Err(StepError::new(format!(
        "parameter 'args' must be an array, got {other}"
      )));
    }
  };

  let mut command = Command::new(program);
  command.args(&args).kill_on_drop(true);
  if let Some(cwd) = string_parameter(parameters, "cwd")? {
    command.current_dir(cwd);
  }

  let output = tokio::select! {
    output = command.output() => output
      .map_err(|e| StepError::new(format!("failed to run '{program}': {e}")))?,
    _ = ctx.abort.cancelled() => return Err(StepError::new(format!("'{program}' was aborted"))),
  };

  let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
  let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

  if !output.status.success() {
    let code = output
      .status
      .code()
      .map_or_else(|| "a signal".to_string(), |c| c.to_string());
    return Err(StepError::new(format!(
      "'{program}' exited with {code}: {}",
      stderr.trim()
    )));
  }

  Ok(json!({
    "stdout": stdout,
    "stderr": stderr,
    "exit_code": output.status.code(),
  }))
}

async fn wait(parameters: &Values, ctx: &StepContext) -> Result<Value, StepError> {
  let seconds = match parameters.get("seconds") {
    Some(value) => value
      .as_f64()
      .filter(|s| s.is_finite() && *s >= 0.0)
      .ok_or_else(|| StepError::new("parameter 'seconds' must be a non-negative number"))?,
    None => 1.0,
  };
  let duration = Duration::try_from_secs_f64(seconds)
    .map_err(|e| StepError::new(format!("parameter 'seconds' is out of range: {e}")))?;

  tokio::select! {
    _ = tokio::time::sleep(duration) => Ok(json!({ "waited_ms": duration.as_millis() as u64 })),
    _ = ctx.abort.cancelled() => Err(StepError::new("wait was aborted")),
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use tokio_util::sync::CancellationToken;

  use super::*;

  fn context() -> StepContext {
    StepContext {
      execution_id: "exec_1".to_string(),
      path_id: "path-1".to_string(),
      inputs: Arc::new(Values::from([("name".to_string(), json!("strand"))])),
      outputs: Values::new(),
      abort: CancellationToken::new(),
    }
  }

  #[tokio::test]
  async fn test_echo_renders_parameters() {
    let step = Step::new("greet", "echo").with_parameter("message", json!("hello {{ inputs.name }}"));

    let output = BuiltinStepExecutor.execute(&step, context()).await.unwrap();
    assert_eq!(output, json!({ "message": "hello strand" }));
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn test_command_captures_output() {
    let step = Step::new("say", "command")
      .with_parameter("command", json!("echo"))
      .with_parameter("args", json!(["{{ inputs.name }}"]));

    let output = BuiltinStepExecutor.execute(&step, context()).await.unwrap();
    assert_eq!(output["stdout"], "strand\n");
    assert_eq!(output["exit_code"], 0);
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn test_command_failure_is_a_step_error() {
    let step = Step::new("fail", "command").with_parameter("command", json!("false"));

    let err = BuiltinStepExecutor.execute(&step, context()).await.unwrap_err();
    assert!(err.message.contains("exited with 1"), "{}", err.message);
  }

  #[tokio::test]
  async fn test_wait_stops_when_aborted() {
    let step = Step::new("pause", "wait").with_parameter("seconds", json!(60));
    let ctx = context();
    ctx.abort.cancel();

    let err = BuiltinStepExecutor.execute(&step, ctx).await.unwrap_err();
    assert_eq!(err.message, "wait was aborted");
  }

  #[tokio::test]
  async fn test_wait_rejects_out_of_range_seconds() {
    let step = Step::new("pause", "wait").with_parameter("seconds", json!(1e30));

    let err = BuiltinStepExecutor.execute(&step, context()).await.unwrap_err();
    assert!(err.message.contains("out of range"), "{}", err.message);

    let step = Step::new("pause", "wait").with_parameter("seconds", json!(-1));
    let err = BuiltinStepExecutor.execute(&step, context()).await.unwrap_err();
    assert!(err.message.contains("non-negative"), "{}", err.message);
  }

  #[tokio::test]
  async fn test_unknown_step_type() {
    let step = Step::new("mystery", "teleport");

    let err = BuiltinStepExecutor.execute(&step, context()).await.unwrap_err();
    assert!(err.message.contains("unknown step type 'teleport'"));
  }
}
