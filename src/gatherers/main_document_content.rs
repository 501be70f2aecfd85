//! Response body of the main document, located through the devtools log.

use crate::driver::network::find_resource_for_url;
use crate::driver::{DevtoolsLogEntry, NetworkRecorder};
use crate::gather::{GatherContext, Gatherer, GathererMeta};
use crate::gatherers::devtools_log::DEVTOOLS_LOG;
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64_STANDARD};
use pharos_common::GatherMode;
use serde_json::{Value, json};
use std::time::Duration;

/// `Network.getResponseBody` answers from the cache or not at all.
const RESPONSE_BODY_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
pub struct MainDocumentContent;

#[async_trait]
impl Gatherer for MainDocumentContent {
    fn meta(&self) -> GathererMeta {
        GathererMeta::new(&[GatherMode::Navigation]).depends_on(DEVTOOLS_LOG)
    }

    async fn get_artifact(&self, context: &GatherContext) -> Result<Value> {
        let log: Vec<DevtoolsLogEntry> = context.dependencies.typed(DEVTOOLS_LOG)?;
        let records = NetworkRecorder::records_from_log(&log);

        let url = context
            .base_artifacts
            .url
            .main_document_url
            .as_deref()
            .unwrap_or(&context.url);
        let main_record = find_resource_for_url(&records, url)
            .with_context(|| format!("Unable to identify the main resource for {url}"))?;

        let body = context
            .driver
            .default_session()
            .send_command_with_timeout(
                "Network.getResponseBody",
                json!({"requestId": main_record.request_id}),
                RESPONSE_BODY_TIMEOUT,
            )
            .await
            .context("Failed to fetch the main document body")?;

        let text = body["body"].as_str().unwrap_or_default();
        if body["base64Encoded"].as_bool().unwrap_or(false) {
            let bytes = BASE64_STANDARD
                .decode(text)
                .context("Main document body is not valid base64")?;
            return Ok(Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        }
        Ok(Value::String(text.to_string()))
    }
}
