//! Expression evaluation in the page, layered on the default session.

use crate::errors::{EvaluateError, ProtocolError};
use crate::protocol::ProtocolSession;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Timeout for an evaluation when the session has no pending override.
pub const DEFAULT_EVALUATE_TIMEOUT: Duration = Duration::from_secs(60);

const ISOLATED_WORLD_NAME: &str = "__pharos_isolated_world";

/// Evaluates expressions in the page's main world or an isolated world.
pub struct ExecutionContext {
    session: Arc<ProtocolSession>,
    isolated_context_id: Mutex<Option<i64>>,
}

impl ExecutionContext {
    pub fn new(session: Arc<ProtocolSession>) -> Self {
        Self {
            session,
            isolated_context_id: Mutex::new(None),
        }
    }

    /// Forget the cached isolated world, e.g. after a navigation.
    pub fn clear_context_id(&self) {
        *self
            .isolated_context_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn cached_context_id(&self) -> Option<i64> {
        *self
            .isolated_context_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Evaluate `expression` in the page's main world and return its value.
    ///
    /// Promises are awaited. An exception thrown by the expression becomes
    /// `EvaluateError::Exception`.
    pub async fn evaluate(&self, expression: &str) -> Result<Value, EvaluateError> {
        self.evaluate_in_context(expression, None).await
    }

    /// Call `function_source` with JSON-serialized `args` in the main world.
    pub async fn evaluate_function(
        &self,
        function_source: &str,
        args: &[Value],
    ) -> Result<Value, EvaluateError> {
        let args = args
            .iter()
            .map(Value::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        let expression = format!("({function_source})({args})");
        self.evaluate(&expression).await
    }

    /// Evaluate in an isolated world, so page scripts cannot observe or tamper
    /// with the evaluation.
    ///
    /// Retries once in a fresh world if the cached one was destroyed.
    pub async fn evaluate_isolated(&self, expression: &str) -> Result<Value, EvaluateError> {
        let context_id = self.ensure_isolated_context().await?;
        match self.evaluate_in_context(expression, Some(context_id)).await {
            Err(EvaluateError::Protocol(err)) if is_context_destroyed(&err) => {
                debug!(target: "gather", "Isolated context was destroyed; retrying once");
                self.clear_context_id();
                let context_id = self.ensure_isolated_context().await?;
                self.evaluate_in_context(expression, Some(context_id)).await
            }
            other => other,
        }
    }

    async fn ensure_isolated_context(&self) -> Result<i64, EvaluateError> {
        if let Some(id) = self.cached_context_id() {
            return Ok(id);
        }

        let tree = self
            .session
            .send_command("Page.getFrameTree", json!({}))
            .await?;
        let frame_id = tree["frameTree"]["frame"]["id"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        let world = self
            .session
            .send_command(
                "Page.createIsolatedWorld",
                json!({
                    "frameId": frame_id,
                    "worldName": ISOLATED_WORLD_NAME,
                    "grantUniveralAccess": true,
                }),
            )
            .await?;
        let id = world["executionContextId"].as_i64().ok_or_else(|| {
            EvaluateError::Exception("Page.createIsolatedWorld returned no context id".into())
        })?;

        *self
            .isolated_context_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(id);
        Ok(id)
    }

    async fn evaluate_in_context(
        &self,
        expression: &str,
        context_id: Option<i64>,
    ) -> Result<Value, EvaluateError> {
        // A pending one-shot override wins over the evaluation default.
        let timeout = self
            .session
            .take_next_protocol_timeout()
            .unwrap_or(DEFAULT_EVALUATE_TIMEOUT);

        let mut params = json!({
            "expression": wrap_expression(expression),
            "includeCommandLineAPI": true,
            "awaitPromise": true,
            "returnByValue": true,
            "timeout": timeout.as_millis() as u64,
        });
        if let Some(id) = context_id {
            params["contextId"] = json!(id);
        }

        let response = self
            .session
            .send_command_with_timeout("Runtime.evaluate", params, timeout)
            .await?;

        if let Some(details) = response.get("exceptionDetails") {
            return Err(EvaluateError::Exception(exception_message(details)));
        }

        let result = &response["result"];
        if result["type"] == "undefined" {
            return Ok(Value::Null);
        }
        Ok(result.get("value").cloned().unwrap_or(Value::Null))
    }
}

/// Run the expression inside a native promise so page-replaced `Promise`
/// implementations cannot interfere, and turn thrown errors into rejections.
fn wrap_expression(expression: &str) -> String {
    format!(
        r#"(function wrapInNativePromise() {{
  const Promise = globalThis.__nativePromise || globalThis.Promise;
  return new Promise(function (resolve, reject) {{
    return Promise.resolve()
      .then(() => {expression})
      .then(resolve, reject);
  }});
}}())"#
    )
}

fn exception_message(details: &Value) -> String {
    details["exception"]["description"]
        .as_str()
        .or_else(|| details["text"].as_str())
        .unwrap_or("Unknown exception")
        .to_string()
}

fn is_context_destroyed(err: &ProtocolError) -> bool {
    match err {
        ProtocolError::Command { message, .. } => {
            message.contains("Cannot find context with specified id")
                || message.contains("Execution context was destroyed")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testing::ScriptedTransport;

    fn context() -> (Arc<ScriptedTransport>, ExecutionContext) {
        let transport = ScriptedTransport::new();
        let session = ProtocolSession::new(transport.clone(), None);
        (transport, ExecutionContext::new(session))
    }

    #[tokio::test]
    async fn test_evaluate_returns_value() {
        let (transport, ctx) = context();
        transport.respond(
            "Runtime.evaluate",
            json!({"result": {"type": "number", "value": 42}}),
        );

        let value = ctx.evaluate("21 * 2").await.unwrap();
        assert_eq!(value, json!(42));

        let params = &transport.params_for("Runtime.evaluate")[0];
        assert_eq!(params["returnByValue"], true);
        assert_eq!(params["awaitPromise"], true);
        assert_eq!(params["timeout"], 60_000);
        assert!(params["expression"].as_str().unwrap().contains("21 * 2"));
    }

    #[tokio::test]
    async fn test_evaluate_undefined_is_null() {
        let (transport, ctx) = context();
        transport.respond("Runtime.evaluate", json!({"result": {"type": "undefined"}}));
        assert_eq!(ctx.evaluate("void 0").await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn test_exception_details_become_error() {
        let (transport, ctx) = context();
        transport.respond(
            "Runtime.evaluate",
            json!({
                "result": {"type": "object"},
                "exceptionDetails": {
                    "text": "Uncaught",
                    "exception": {"description": "ReferenceError: nope is not defined"}
                }
            }),
        );

        let err = ctx.evaluate("nope").await.unwrap_err();
        match err {
            EvaluateError::Exception(message) => assert!(message.contains("ReferenceError")),
            other => panic!("Expected exception, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pending_override_sets_evaluation_timeout() {
        let (transport, ctx) = context();
        ctx.session.set_next_protocol_timeout(Duration::from_millis(1000));

        ctx.evaluate("1").await.unwrap();
        assert_eq!(transport.params_for("Runtime.evaluate")[0]["timeout"], 1000);
        assert!(!ctx.session.has_next_protocol_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_override_bounds_the_evaluate_command_itself() {
        let (transport, ctx) = context();
        transport.hang("Runtime.evaluate");
        ctx.session.set_next_protocol_timeout(Duration::from_millis(1000));

        let start = tokio::time::Instant::now();
        assert!(ctx.evaluate("1").await.is_err());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1000), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1100), "{elapsed:?}");
        assert_eq!(ctx.session.take_next_protocol_timeout(), None);
    }

    #[tokio::test]
    async fn test_evaluate_function_serializes_arguments() {
        let (transport, ctx) = context();
        ctx.evaluate_function("(a, b) => a + b.x", &[json!(1), json!({"x": 2})])
            .await
            .unwrap();

        let expression = transport.params_for("Runtime.evaluate")[0]["expression"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(expression.contains(r#"((a, b) => a + b.x)(1, {"x":2})"#));
    }

    #[tokio::test]
    async fn test_isolated_evaluation_retries_after_context_destroyed() {
        let (transport, ctx) = context();
        transport.respond(
            "Page.getFrameTree",
            json!({"frameTree": {"frame": {"id": "main"}}}),
        );
        transport.respond("Page.createIsolatedWorld", json!({"executionContextId": 7}));
        transport.respond("Page.createIsolatedWorld", json!({"executionContextId": 8}));
        transport.fail(
            "Runtime.evaluate",
            -32000,
            "Cannot find context with specified id",
        );
        transport.respond("Runtime.evaluate", json!({"result": {"value": "ok"}}));

        let value = ctx.evaluate_isolated("'ok'").await.unwrap();
        assert_eq!(value, json!("ok"));

        let evaluations = transport.params_for("Runtime.evaluate");
        assert_eq!(evaluations.len(), 2);
        assert_eq!(evaluations[0]["contextId"], 7);
        assert_eq!(evaluations[1]["contextId"], 8);
    }
}
