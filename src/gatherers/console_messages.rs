//! Console calls, uncaught exceptions, and browser log entries.

use crate::gather::{GatherContext, Gatherer, GathererMeta};
use crate::protocol::ListenerId;
use anyhow::{Context, Result};
use async_trait::async_trait;
use pharos_common::GatherMode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex, PoisonError};

/// One console entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleMessage {
    /// `consoleAPI`, `exception` or `protocolLog`.
    pub event_type: String,
    pub source: String,
    pub level: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column_number: Option<u64>,
    pub timestamp: f64,
}

fn console_api_message(params: &Value) -> ConsoleMessage {
    let args = params["args"].as_array().cloned().unwrap_or_default();
    let text = args
        .iter()
        .map(|arg| {
            arg["value"]
                .as_str()
                .map(str::to_string)
                .or_else(|| arg.get("value").map(Value::to_string))
                .or_else(|| arg["description"].as_str().map(str::to_string))
                .unwrap_or_default()
        })
        .collect::<Vec<_>>()
        .join(" ");
    let frame = &params["stackTrace"]["callFrames"][0];
    let level = match params["type"].as_str().unwrap_or("log") {
        "warning" => "warning",
        "error" | "assert" => "error",
        "debug" => "verbose",
        _ => "info",
    };

    ConsoleMessage {
        event_type: "consoleAPI".into(),
        source: format!("console.{}", params["type"].as_str().unwrap_or("log")),
        level: level.into(),
        text,
        url: frame["url"].as_str().map(str::to_string),
        line_number: frame["lineNumber"].as_u64(),
        column_number: frame["columnNumber"].as_u64(),
        timestamp: params["timestamp"].as_f64().unwrap_or_default(),
    }
}

fn exception_message(params: &Value) -> ConsoleMessage {
    let details = &params["exceptionDetails"];
    let text = details["exception"]["description"]
        .as_str()
        .or_else(|| details["text"].as_str())
        .unwrap_or_default()
        .to_string();

    ConsoleMessage {
        event_type: "exception".into(),
        source: "exception".into(),
        level: "error".into(),
        text,
        url: details["url"].as_str().map(str::to_string),
        line_number: details["lineNumber"].as_u64(),
        column_number: details["columnNumber"].as_u64(),
        timestamp: params["timestamp"].as_f64().unwrap_or_default(),
    }
}

fn log_entry_message(params: &Value) -> ConsoleMessage {
    let entry = &params["entry"];
    ConsoleMessage {
        event_type: "protocolLog".into(),
        source: entry["source"].as_str().unwrap_or("other").to_string(),
        level: entry["level"].as_str().unwrap_or("info").to_string(),
        text: entry["text"].as_str().unwrap_or_default().to_string(),
        url: entry["url"].as_str().map(str::to_string),
        line_number: entry["lineNumber"].as_u64(),
        column_number: None,
        timestamp: entry["timestamp"].as_f64().unwrap_or_default(),
    }
}

#[derive(Default)]
pub struct ConsoleMessages {
    messages: Arc<Mutex<Vec<ConsoleMessage>>>,
    listeners: Mutex<Vec<ListenerId>>,
}

impl ConsoleMessages {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Gatherer for ConsoleMessages {
    fn meta(&self) -> GathererMeta {
        GathererMeta::new(&[GatherMode::Navigation, GatherMode::Timespan])
    }

    async fn start_instrumentation(&self, context: &GatherContext) -> Result<()> {
        let session = context.driver.default_session();
        let handlers: [(&str, fn(&Value) -> ConsoleMessage); 3] = [
            ("Runtime.consoleAPICalled", console_api_message),
            ("Runtime.exceptionThrown", exception_message),
            ("Log.entryAdded", log_entry_message),
        ];

        {
            let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
            for (event, convert) in handlers {
                let messages = self.messages.clone();
                listeners.push(session.on(
                    event,
                    Arc::new(move |params: &Value| {
                        messages
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push(convert(params));
                    }),
                ));
            }
        }

        session.send_command("Runtime.enable", json!({})).await?;
        session
            .send_command("Log.enable", json!({}))
            .await
            .context("Failed to enable the Log domain")?;
        Ok(())
    }

    async fn stop_instrumentation(&self, context: &GatherContext) -> Result<()> {
        let session = context.driver.default_session();
        let ids: Vec<_> =
            std::mem::take(&mut *self.listeners.lock().unwrap_or_else(PoisonError::into_inner));
        for id in ids {
            session.off(id);
        }
        session.send_command("Log.disable", json!({})).await?;
        Ok(())
    }

    async fn get_artifact(&self, _context: &GatherContext) -> Result<Value> {
        let messages = self
            .messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Ok(serde_json::to_value(messages)?)
    }
}
