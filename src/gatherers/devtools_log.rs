//! Records every protocol event seen on the page session during the sensitive span.

use crate::driver::DevtoolsLogEntry;
use crate::gather::{DependencyKey, GatherContext, Gatherer, GathererMeta};
use crate::protocol::ListenerId;
use anyhow::{Context, Result};
use async_trait::async_trait;
use pharos_common::GatherMode;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

pub const DEVTOOLS_LOG: DependencyKey = DependencyKey::new("DevtoolsLog");

#[derive(Default)]
pub struct DevtoolsLog {
    entries: Arc<Mutex<Vec<DevtoolsLogEntry>>>,
    listener: Mutex<Option<ListenerId>>,
}

impl DevtoolsLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Gatherer for DevtoolsLog {
    fn meta(&self) -> GathererMeta {
        GathererMeta::new(&[GatherMode::Navigation, GatherMode::Timespan]).produces(DEVTOOLS_LOG)
    }

    async fn start_sensitive_instrumentation(&self, context: &GatherContext) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let entries = self.entries.clone();
        let id = context.driver.default_session().on_any(Arc::new(
            move |method: &str, params: &Value| {
                entries
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(DevtoolsLogEntry {
                        method: method.to_string(),
                        params: params.clone(),
                    });
            },
        ));
        *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(id);
        Ok(())
    }

    async fn stop_sensitive_instrumentation(&self, context: &GatherContext) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = listener {
            context.driver.default_session().off(id);
        }
        debug!(
            target: "gather",
            entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner).len(),
            "Devtools log recording stopped"
        );
        Ok(())
    }

    async fn get_artifact(&self, _context: &GatherContext) -> Result<Value> {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        serde_json::to_value(entries).context("Failed to serialize devtools log")
    }
}
