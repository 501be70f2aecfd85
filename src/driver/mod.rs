//! The driver: the default page session plus the facilities layered on it.

pub mod execution_context;
pub mod navigation;
pub mod network;
pub mod prepare;
pub mod storage;
pub mod target_manager;
pub mod wait_for;

pub use execution_context::ExecutionContext;
pub use navigation::{GotoOptions, NavigationOutcome, WaitCondition, goto_url};
pub use network::{DevtoolsLogEntry, NetworkMonitor, NetworkRecord, NetworkRecorder};
pub use target_manager::{TargetInfo, TargetManager};

use crate::errors::{ProtocolError, RunError};
use crate::protocol::{ProtocolSession, ProtocolTransport};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info};

/// Owns the session attached to the page under test.
pub struct Driver {
    session: Arc<ProtocolSession>,
    execution_context: ExecutionContext,
    target_manager: TargetManager,
}

impl Driver {
    /// Attach to the first page target on `transport`.
    pub async fn connect(transport: Arc<dyn ProtocolTransport>) -> Result<Self, RunError> {
        let browser = ProtocolSession::new(transport.clone(), None);
        let targets = browser.send_command("Target.getTargets", json!({})).await?;

        let target_id = targets["targetInfos"]
            .as_array()
            .into_iter()
            .flatten()
            .find(|info| info["type"] == "page")
            .and_then(|info| info["targetId"].as_str())
            .map(str::to_string)
            .ok_or(RunError::NoPageTarget)?;

        let attached = browser
            .send_command(
                "Target.attachToTarget",
                json!({"targetId": target_id, "flatten": true}),
            )
            .await?;
        browser.dispose();

        let session_id = attached["sessionId"]
            .as_str()
            .ok_or(RunError::NoPageTarget)?
            .to_string();
        info!(target: "protocol", %target_id, %session_id, "Attached to page target");

        Ok(Self::from_session(ProtocolSession::new(
            transport,
            Some(session_id),
        )))
    }

    /// Wrap a session that is already attached to the page.
    pub fn from_session(session: Arc<ProtocolSession>) -> Self {
        Self {
            execution_context: ExecutionContext::new(session.clone()),
            target_manager: TargetManager::new(session.clone()),
            session,
        }
    }

    pub fn default_session(&self) -> &Arc<ProtocolSession> {
        &self.session
    }

    pub fn execution_context(&self) -> &ExecutionContext {
        &self.execution_context
    }

    pub fn target_manager(&self) -> &TargetManager {
        &self.target_manager
    }

    /// URL the page currently displays.
    pub async fn url(&self) -> Result<String, ProtocolError> {
        let info = self
            .session
            .send_command("Target.getTargetInfo", json!({}))
            .await?;
        Ok(info["targetInfo"]["url"]
            .as_str()
            .unwrap_or_default()
            .to_string())
    }

    /// Product and user agent of the browser.
    pub async fn browser_version(&self) -> Result<(String, String), ProtocolError> {
        let version = self
            .session
            .send_command("Browser.getVersion", json!({}))
            .await?;
        let field = |name: &str| {
            version
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Ok((field("product"), field("userAgent")))
    }

    /// Stop tracking child targets and dispose the page session.
    pub async fn disconnect(&self) {
        if self.session.is_disposed() {
            return;
        }
        self.target_manager.disable().await;
        self.session.dispose();
        debug!(target: "protocol", "Driver disconnected");
    }
}
