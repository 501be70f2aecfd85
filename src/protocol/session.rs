//! A logical protocol session on top of a shared transport.

use crate::errors::ProtocolError;
use crate::protocol::events::{AnyEventHandler, EventHandler, ListenerId, ListenerRegistry};
use crate::protocol::transport::ProtocolTransport;
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Timeout applied to a command when no one-shot override is pending.
pub const DEFAULT_PROTOCOL_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Longest timeout a command can wait for.
///
/// Anything longer (including `Duration::MAX`, which callers use for "no
/// timeout") is clamped to this. Callers that must never time out also need to
/// suppress any watchdog imposed around the run.
pub const MAX_PROTOCOL_TIMEOUT: Duration = Duration::from_millis(i32::MAX as u64);

fn clamp_timeout(timeout: Duration) -> Duration {
    timeout.min(MAX_PROTOCOL_TIMEOUT)
}

/// One logical connection to a target: commands with timeouts plus event
/// subscription, scoped to a session id on the shared transport.
pub struct ProtocolSession {
    transport: Arc<dyn ProtocolTransport>,
    session_id: Option<String>,
    listeners: Arc<ListenerRegistry>,
    next_timeout: Mutex<Option<Duration>>,
    disposed: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ProtocolSession {
    /// Create a session and start delivering its events.
    ///
    /// Must be called inside a tokio runtime. Events for other session ids on
    /// the same transport are ignored.
    pub fn new(transport: Arc<dyn ProtocolTransport>, session_id: Option<String>) -> Arc<Self> {
        let mut rx = transport.subscribe();
        let listeners = Arc::new(ListenerRegistry::new());
        let disposed = CancellationToken::new();

        let pump_listeners = listeners.clone();
        let pump_token = disposed.clone();
        let pump_session = session_id.clone();
        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = pump_token.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(event) => {
                            if event.session_id != pump_session {
                                continue;
                            }
                            if pump_token.is_cancelled() {
                                break;
                            }
                            pump_listeners.emit(&event.method, &event.params);
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(
                                target: "protocol",
                                session = ?pump_session,
                                skipped,
                                "Event delivery lagged; events were dropped"
                            );
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });

        Arc::new(Self {
            transport,
            session_id,
            listeners,
            next_timeout: Mutex::new(None),
            disposed,
            pump: Mutex::new(Some(pump)),
        })
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// The transport this session sends on, for creating sibling sessions.
    pub fn transport(&self) -> Arc<dyn ProtocolTransport> {
        self.transport.clone()
    }

    /// Override the timeout of the very next command sent on this session.
    ///
    /// The override is consumed by the next `send_command`, whoever sends it.
    /// Concurrent callers should use `send_command_with_timeout` instead.
    pub fn set_next_protocol_timeout(&self, timeout: Duration) {
        *self
            .next_timeout
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(clamp_timeout(timeout));
    }

    pub fn has_next_protocol_timeout(&self) -> bool {
        self.next_timeout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Timeout the next command would get, without consuming the override.
    pub fn next_protocol_timeout(&self) -> Duration {
        self.next_timeout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unwrap_or(DEFAULT_PROTOCOL_TIMEOUT)
    }

    /// Consume the pending one-shot override, if any.
    pub fn take_next_protocol_timeout(&self) -> Option<Duration> {
        self.next_timeout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Send a command using the pending one-shot timeout, or the default.
    ///
    /// The override is consumed when this is called, not when the returned
    /// future is first polled.
    pub fn send_command<'a>(
        &'a self,
        method: &'a str,
        params: Value,
    ) -> impl Future<Output = Result<Value, ProtocolError>> + Send + 'a {
        let timeout = self
            .take_next_protocol_timeout()
            .unwrap_or(DEFAULT_PROTOCOL_TIMEOUT);
        self.send_command_with_timeout(method, params, timeout)
    }

    /// Send a command with an explicit timeout, leaving any pending override alone.
    pub async fn send_command_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, ProtocolError> {
        if self.is_disposed() {
            return Err(ProtocolError::Disposed {
                method: method.to_string(),
            });
        }

        let timeout = clamp_timeout(timeout);
        debug!(
            target: "protocol",
            method,
            session = ?self.session_id,
            timeout_ms = timeout.as_millis() as u64,
            "Sending command"
        );

        let request = self
            .transport
            .send(self.session_id.as_deref(), method, params);

        tokio::select! {
            biased;
            _ = self.disposed.cancelled() => Err(ProtocolError::Disposed {
                method: method.to_string(),
            }),
            result = tokio::time::timeout(timeout, request) => match result {
                Ok(response) => response,
                Err(_) => Err(ProtocolError::Timeout {
                    method: method.to_string(),
                    timeout,
                }),
            },
        }
    }

    /// Register a handler for every occurrence of `event`.
    pub fn on(&self, event: &str, handler: EventHandler) -> ListenerId {
        self.listeners.on(event, handler)
    }

    /// Register a handler for the next occurrence of `event` only.
    pub fn once(&self, event: &str, handler: EventHandler) -> ListenerId {
        self.listeners.once(event, handler)
    }

    /// Register a handler for every event on this session.
    pub fn on_any(&self, handler: AnyEventHandler) -> ListenerId {
        self.listeners.on_any(handler)
    }

    /// Remove a registration made with `on`, `once` or `on_any`.
    pub fn off(&self, id: ListenerId) -> bool {
        self.listeners.off(id)
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.listener_count(event)
    }

    /// Deliver an event to this session's handlers as if it came from the transport.
    pub fn dispatch(&self, event: &str, params: &Value) {
        self.listeners.emit(event, params);
    }

    /// Detach from the transport and drop every handler.
    ///
    /// In-flight commands resolve with `ProtocolError::Disposed`. Calling this
    /// more than once is harmless.
    pub fn dispose(&self) {
        if self.disposed.is_cancelled() {
            return;
        }
        debug!(target: "protocol", session = ?self.session_id, "Disposing session");
        self.disposed.cancel();
        self.listeners.close();
        if let Some(pump) = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pump.abort();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.is_cancelled()
    }
}

impl Drop for ProtocolSession {
    fn drop(&mut self) {
        self.disposed.cancel();
        if let Some(pump) = self
            .pump
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pump.abort();
        }
    }
}

impl std::fmt::Debug for ProtocolSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolSession")
            .field("session_id", &self.session_id)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
