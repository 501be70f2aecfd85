//! Performance trace of the sensitive span.

use crate::gather::{DependencyKey, GatherContext, Gatherer, GathererMeta};
use crate::protocol::{ListenerId, ProtocolSession};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use pharos_common::GatherMode;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

pub const TRACE: DependencyKey = DependencyKey::new("Trace");

/// How long the browser gets to flush buffered trace events after `Tracing.end`.
const TRACING_COMPLETE_TIMEOUT: Duration = Duration::from_secs(60);

/// Trace categories recorded by default.
pub const DEFAULT_CATEGORIES: &[&str] = &[
    "-*",
    "devtools.timeline",
    "v8.execute",
    "blink.user_timing",
    "loading",
    "latencyInfo",
    "disabled-by-default-devtools.timeline",
    "disabled-by-default-devtools.timeline.frame",
    "disabled-by-default-devtools.screenshot",
];

#[derive(Default)]
pub struct Trace {
    events: Arc<Mutex<Vec<Value>>>,
    listener: Mutex<Option<ListenerId>>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    fn detach(&self, session: &ProtocolSession) {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = listener {
            session.off(id);
        }
    }
}

#[async_trait]
impl Gatherer for Trace {
    fn meta(&self) -> GathererMeta {
        GathererMeta::new(&[GatherMode::Navigation, GatherMode::Timespan]).produces(TRACE)
    }

    async fn start_sensitive_instrumentation(&self, context: &GatherContext) -> Result<()> {
        let session = context.driver.default_session();
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        let events = self.events.clone();
        let id = session.on(
            "Tracing.dataCollected",
            Arc::new(move |params: &Value| {
                if let Some(batch) = params["value"].as_array() {
                    events
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .extend(batch.iter().cloned());
                }
            }),
        );
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(id);

        session
            .send_command(
                "Tracing.start",
                json!({
                    "categories": DEFAULT_CATEGORIES.join(","),
                    "options": "sampling-frequency=10000",
                    "transferMode": "ReportEvents",
                }),
            )
            .await
            .context("Failed to start tracing")?;
        Ok(())
    }

    async fn stop_sensitive_instrumentation(&self, context: &GatherContext) -> Result<()> {
        let session = context.driver.default_session();

        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let complete = session.once(
            "Tracing.tracingComplete",
            Arc::new(move |_: &Value| {
                if let Some(tx) = tx.lock().unwrap_or_else(PoisonError::into_inner).take() {
                    let _ = tx.send(());
                }
            }),
        );

        if let Err(e) = session.send_command("Tracing.end", json!({})).await {
            session.off(complete);
            self.detach(session);
            return Err(e).context("Failed to stop tracing");
        }

        let finished = tokio::time::timeout(TRACING_COMPLETE_TIMEOUT, rx).await;
        session.off(complete);
        self.detach(session);
        match finished {
            Ok(Ok(())) => {}
            Ok(Err(_)) => bail!("Session closed before the trace completed"),
            Err(_) => bail!("Timed out waiting for the trace to complete"),
        }

        debug!(
            target: "gather",
            events = self.events.lock().unwrap_or_else(PoisonError::into_inner).len(),
            "Trace collected"
        );
        Ok(())
    }

    async fn get_artifact(&self, _context: &GatherContext) -> Result<Value> {
        let events = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Ok(json!({ "traceEvents": events }))
    }
}
