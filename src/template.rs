//! Template rendering for step parameters.
//!
//! String parameters may reference execution inputs and the outputs of
//! earlier steps on the same path:
//! ```json
//! { "message": "Deploying {{ inputs.service }}", "build": "{{ steps.build.artifact }}" }
//! ```

use minijinja::{Environment, Value};
use serde_json::json;
use strand_engine::{StepContext, StepError};
use strand_workflow::Values;

/// Render every templated string in a step's parameters.
pub fn render_parameters(
  step: &str,
  parameters: &Values,
  ctx: &StepContext,
) -> Result<Values, StepError> {
  let env = Environment::new();
  let context = Value::from_serialize(json!({
    "inputs": &*ctx.inputs,
    "steps": &ctx.outputs,
    "execution_id": &ctx.execution_id,
    "path_id": &ctx.path_id,
  }));

  parameters
    .iter()
    .map(|(key, value)| {
      render_value(&env, step, key, value, &context).map(|rendered| (key.clone(), rendered))
    })
    .collect()
}

fn render_value(
  env: &Environment,
  step: &str,
  key: &str,
  value: &serde_json::Value,
  context: &Value,
) -> Result<serde_json::Value, StepError> {
  match value {
    serde_json::Value::String(s) if s.contains("{{") || s.contains("{%") => {
      let rendered = env.render_str(s, context.clone()).map_err(|e| {
        StepError::new(format!(
          "step '{step}': failed to render parameter '{key}': {e}"
        ))
      })?;
      // A parameter that is a single expression keeps the type of its result
      if is_pure_template(s) {
        if let Ok(parsed) = serde_json::from_str(&rendered) {
          return Ok(parsed);
        }
      }
      Ok(serde_json::Value::String(rendered))
    }
    serde_json::Value::Array(items) => items
      .iter()
      .map(|item| render_value(env, step, key, item, context))
      .collect::<Result<Vec<_>, _>>()
      .map(serde_json::Value::Array),
    serde_json::Value::Object(map) => {
      let mut rendered = serde_json::Map::new();
      for (k, v) in map {
        rendered.insert(k.clone(), render_value(env, step, key, v, context)?);
      }
      Ok(serde_json::Value::Object(rendered))
    }
    _ => Ok(value.clone()),
  }
}

fn is_pure_template(s: &str) -> bool {
  let trimmed = s.trim();
  trimmed.starts_with("{{")
    && trimmed.ends_with("}}")
    && trimmed.matches("{{").count() == 1
    && trimmed.matches("}}").count() == 1
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
      inputs: Arc::new(Values::from([
        ("service".to_string(), json!("api")),
        ("replicas".to_string(), json!(3)),
      ])),
      outputs: Values::from([("build".to_string(), json!({ "artifact": "api-1.2.tar" }))]),
      abort: CancellationToken::new(),
    }
  }

  #[test]
  fn test_render_inputs_and_outputs() {
    let parameters = Values::from([
      ("message".to_string(), json!("Deploying {{ inputs.service | upper }}")),
      ("artifact".to_string(), json!("{{ steps.build.artifact }}")),
      ("count".to_string(), json!("{{ inputs.replicas }}")),
      ("args".to_string(), json!(["--path", "{{ path_id }}"])),
      ("fixed".to_string(), json!(true)),
    ]);

    let rendered = render_parameters("deploy", &parameters, &context()).unwrap();

    assert_eq!(rendered["message"], "Deploying API");
    assert_eq!(rendered["artifact"], "api-1.2.tar");
    assert_eq!(rendered["count"], 3);
    assert_eq!(rendered["args"], json!(["--path", "path-1"]));
    assert_eq!(rendered["fixed"], true);
  }

  #[test]
  fn test_render_error_names_parameter() {
    let parameters = Values::from([("bad".to_string(), json!("{{ inputs.service | nope }}"))]);

    let err = render_parameters("deploy", &parameters, &context()).unwrap_err();
    assert!(err.message.contains("'bad'"), "{}", err.message);
  }
}
