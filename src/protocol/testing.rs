//! Scripted in-memory transport for unit tests.

use crate::errors::ProtocolError;
use crate::protocol::transport::{ProtocolEvent, ProtocolTransport};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Clone)]
enum Reply {
    Ok(Value),
    Err { code: i64, message: String },
    Hang,
    Delay(Duration, Value),
}

type Hook = Arc<dyn Fn(&ScriptedTransport, Option<&str>, &Value) + Send + Sync>;

/// A transport whose replies are scripted per method.
///
/// Unscripted methods answer `{}` immediately. Scripted replies are consumed in
/// order; the last one for a method is sticky.
pub struct ScriptedTransport {
    events: broadcast::Sender<ProtocolEvent>,
    sent: Mutex<Vec<(Option<String>, String, Value)>>,
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    hooks: Mutex<HashMap<String, Hook>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            events,
            sent: Mutex::new(Vec::new()),
            replies: Mutex::new(HashMap::new()),
            hooks: Mutex::new(HashMap::new()),
        })
    }

    fn push(&self, method: &str, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn respond(&self, method: &str, result: Value) {
        self.push(method, Reply::Ok(result));
    }

    pub fn fail(&self, method: &str, code: i64, message: &str) {
        self.push(
            method,
            Reply::Err {
                code,
                message: message.to_string(),
            },
        );
    }

    pub fn hang(&self, method: &str) {
        self.push(method, Reply::Hang);
    }

    pub fn respond_after(&self, method: &str, delay: Duration, result: Value) {
        self.push(method, Reply::Delay(delay, result));
    }

    /// Run `hook` whenever `method` is sent, before replying.
    pub fn on_command(
        &self,
        method: &str,
        hook: impl Fn(&ScriptedTransport, Option<&str>, &Value) + Send + Sync + 'static,
    ) {
        self.hooks
            .lock()
            .unwrap()
            .insert(method.to_string(), Arc::new(hook));
    }

    pub fn emit(&self, session_id: Option<&str>, method: &str, params: Value) {
        let _ = self
            .events
            .send(ProtocolEvent::new(session_id, method, params));
    }

    pub fn sent(&self) -> Vec<(Option<String>, String, Value)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_methods(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, m, _)| m.clone())
            .collect()
    }

    /// Params of every send of `method`.
    pub fn params_for(&self, method: &str) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, m, _)| m == method)
            .map(|(_, _, p)| p.clone())
            .collect()
    }

    fn next_reply(&self, method: &str) -> Reply {
        let mut replies = self.replies.lock().unwrap();
        match replies.get_mut(method) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(Reply::Ok(json!({}))),
            Some(queue) => queue.front().cloned().unwrap_or(Reply::Ok(json!({}))),
            None => Reply::Ok(json!({})),
        }
    }
}

#[async_trait]
impl ProtocolTransport for ScriptedTransport {
    async fn send(
        &self,
        session_id: Option<&str>,
        method: &str,
        params: Value,
    ) -> Result<Value, ProtocolError> {
        self.sent.lock().unwrap().push((
            session_id.map(str::to_string),
            method.to_string(),
            params.clone(),
        ));
        let hook = self.hooks.lock().unwrap().get(method).cloned();
        if let Some(hook) = hook {
            hook(self, session_id, &params);
        }

        match self.next_reply(method) {
            Reply::Ok(value) => Ok(value),
            Reply::Err { code, message } => Err(ProtocolError::Command {
                method: method.to_string(),
                code: Some(code),
                message,
            }),
            Reply::Hang => std::future::pending().await,
            Reply::Delay(delay, value) => {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.events.subscribe()
    }
}
