//! Pipe-framed protocol connection over any byte stream.
//!
//! Messages are JSON objects terminated by a NUL byte, the framing browsers
//! use for `--remote-debugging-pipe`. A reader task routes responses to their
//! waiting request by id and broadcasts everything else as an event. A writer
//! task owns the write half, so a caller that stops waiting never leaves a
//! partial frame on the wire.

use crate::errors::ProtocolError;
use crate::protocol::transport::{ProtocolEvent, ProtocolTransport};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

const EVENT_BUFFER: usize = 4096;
const OUTGOING_BUFFER: usize = 256;

type PendingMap = DashMap<u64, (String, oneshot::Sender<Result<Value, ProtocolError>>)>;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutgoingMessage<'a> {
    id: u64,
    method: &'a str,
    params: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IncomingMessage {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<WireError>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct WireError {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: String,
}

/// Removes a request's pending entry if its caller stops waiting.
struct PendingGuard {
    id: u64,
    pending: Arc<PendingMap>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// A protocol connection over a split byte stream.
pub struct StreamConnection {
    outgoing: std::sync::Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    pending: Arc<PendingMap>,
    next_id: AtomicU64,
    events: broadcast::Sender<ProtocolEvent>,
    closed: Arc<AtomicBool>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl StreamConnection {
    /// Start a connection over the given halves. Must be called inside a tokio runtime.
    pub fn new<R, W>(reader: R, writer: W) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let pending: Arc<PendingMap> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        let handle = tokio::spawn(read_loop(
            reader,
            pending.clone(),
            events.clone(),
            closed.clone(),
        ));

        let (outgoing, frames) = mpsc::channel(OUTGOING_BUFFER);
        tokio::spawn(write_loop(writer, frames, pending.clone(), closed.clone()));

        Arc::new(Self {
            outgoing: std::sync::Mutex::new(Some(outgoing)),
            pending,
            next_id: AtomicU64::new(1),
            events,
            closed,
            reader: std::sync::Mutex::new(Some(handle)),
        })
    }

    /// Connect to a pipe-framed endpoint over TCP.
    pub async fn connect_tcp(addr: &str) -> Result<Arc<Self>, ProtocolError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        debug!(target: "protocol", addr, "Connected");
        Ok(Self::new(read_half, write_half))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop reading and fail every outstanding request.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let handle = self
            .reader
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        fail_all_pending(&self.pending);
        // The writer shuts the stream down once the queue drains.
        self.outgoing
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[async_trait]
impl ProtocolTransport for StreamConnection {
    async fn send(
        &self,
        session_id: Option<&str>,
        method: &str,
        params: Value,
    ) -> Result<Value, ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::TransportClosed {
                method: method.to_string(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let message = OutgoingMessage {
            id,
            method,
            params,
            session_id,
        };
        let mut frame = serde_json::to_vec(&message).map_err(|source| ProtocolError::Encode {
            method: method.to_string(),
            source,
        })?;
        frame.push(0);

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, (method.to_string(), tx));
        let _guard = PendingGuard {
            id,
            pending: self.pending.clone(),
        };

        let outgoing = self
            .outgoing
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        let queued = match outgoing {
            Some(outgoing) => outgoing.send(frame).await.is_ok(),
            None => false,
        };
        if !queued {
            return Err(ProtocolError::TransportClosed {
                method: method.to_string(),
            });
        }
        trace!(target: "protocol", id, method, "Frame queued");

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::TransportClosed {
                method: method.to_string(),
            }),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.events.subscribe()
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        if let Some(handle) = self
            .reader
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut frames: mpsc::Receiver<Vec<u8>>,
    pending: Arc<PendingMap>,
    closed: Arc<AtomicBool>,
) where
    W: AsyncWrite + Send + Unpin,
{
    while let Some(frame) = frames.recv().await {
        let written = match writer.write_all(&frame).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!(target: "protocol", error = %e, "Write error; closing connection");
            closed.store(true, Ordering::SeqCst);
            fail_all_pending(&pending);
            return;
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!(target: "protocol", error = %e, "Error shutting down writer");
    }
}

async fn read_loop<R>(
    reader: R,
    pending: Arc<PendingMap>,
    events: broadcast::Sender<ProtocolEvent>,
    closed: Arc<AtomicBool>,
) where
    R: AsyncRead + Send + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(0, &mut buf).await {
            Ok(0) => {
                debug!(target: "protocol", "Connection closed by peer");
                break;
            }
            Ok(_) => {
                if buf.last() == Some(&0) {
                    buf.pop();
                }
                if buf.is_empty() {
                    continue;
                }
                route_frame(&buf, &pending, &events);
            }
            Err(e) => {
                warn!(target: "protocol", error = %e, "Read error; closing connection");
                break;
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    fail_all_pending(&pending);
}

fn route_frame(frame: &[u8], pending: &PendingMap, events: &broadcast::Sender<ProtocolEvent>) {
    let message: IncomingMessage = match serde_json::from_slice(frame) {
        Ok(m) => m,
        Err(e) => {
            warn!(target: "protocol", error = %e, "Dropping malformed frame");
            return;
        }
    };

    if let Some(id) = message.id {
        let Some((_, (method, tx))) = pending.remove(&id) else {
            trace!(target: "protocol", id, "Response for abandoned request");
            return;
        };
        let result = match message.error {
            Some(error) => Err(ProtocolError::Command {
                method,
                code: error.code,
                message: error.message,
            }),
            None => Ok(message.result.unwrap_or(Value::Object(Default::default()))),
        };
        let _ = tx.send(result);
        return;
    }

    if let Some(method) = message.method {
        let event = ProtocolEvent {
            session_id: message.session_id,
            method,
            params: message.params.unwrap_or(Value::Null),
        };
        // No subscribers is fine; nobody is listening yet.
        let _ = events.send(event);
    }
}

fn fail_all_pending(pending: &PendingMap) {
    let ids: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        if let Some((_, (method, tx))) = pending.remove(&id) {
            let _ = tx.send(Err(ProtocolError::TransportClosed { method }));
        }
    }
}
