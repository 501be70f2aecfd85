//! The transport seam between sessions and the instrumented target.

use crate::errors::ProtocolError;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

/// An out-of-band event delivered by the target.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolEvent {
    /// Session the event belongs to; `None` for the browser-level connection.
    pub session_id: Option<String>,
    pub method: String,
    pub params: Value,
}

impl ProtocolEvent {
    pub fn new(session_id: Option<&str>, method: &str, params: Value) -> Self {
        Self {
            session_id: session_id.map(str::to_string),
            method: method.to_string(),
            params,
        }
    }
}

/// A single persistent connection to the target, shared by every session on it.
///
/// Implementations guarantee at most one response per request. Events may
/// arrive interleaved with responses at any time and are fanned out to every
/// subscriber in arrival order.
#[async_trait]
pub trait ProtocolTransport: Send + Sync {
    /// Send a command and wait for its response. No timeout is applied here.
    async fn send(
        &self,
        session_id: Option<&str>,
        method: &str,
        params: Value,
    ) -> Result<Value, ProtocolError>;

    /// Subscribe to every event arriving on the connection from now on.
    fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent>;
}
