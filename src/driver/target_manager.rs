//! Auto-attach to child targets (iframes, workers) and track their sessions.

use crate::errors::ProtocolError;
use crate::protocol::{ListenerId, ProtocolSession};
use dashmap::DashMap;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// A target the manager attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetInfo {
    pub target_id: String,
    pub target_type: String,
    pub url: String,
}

struct Inner {
    root: Arc<ProtocolSession>,
    children: DashMap<String, (TargetInfo, Arc<ProtocolSession>)>,
    listeners: Mutex<Vec<(Arc<ProtocolSession>, ListenerId)>>,
    enabled: AtomicBool,
}

/// Keeps one protocol session per attached child target.
pub struct TargetManager {
    inner: Arc<Inner>,
}

fn auto_attach_params() -> Value {
    json!({
        "autoAttach": true,
        "flatten": true,
        "waitForDebuggerOnStart": true,
    })
}

impl TargetManager {
    pub fn new(root: Arc<ProtocolSession>) -> Self {
        Self {
            inner: Arc::new(Inner {
                root,
                children: DashMap::new(),
                listeners: Mutex::new(Vec::new()),
                enabled: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Start auto-attaching to child targets of the root session.
    pub async fn enable(&self) -> Result<(), ProtocolError> {
        if self.inner.enabled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let root = self.inner.root.clone();
        Inner::watch(&self.inner, &root);
        root.send_command("Target.setAutoAttach", auto_attach_params())
            .await?;
        debug!(target: "protocol", "Target auto-attach enabled");
        Ok(())
    }

    /// Stop tracking children and dispose their sessions.
    pub async fn disable(&self) {
        if !self.inner.enabled.swap(false, Ordering::SeqCst) {
            return;
        }
        let listeners: Vec<_> = std::mem::take(
            &mut *self
                .inner
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for (session, id) in listeners {
            session.off(id);
        }
        for entry in self.inner.children.iter() {
            entry.value().1.dispose();
        }
        self.inner.children.clear();

        let result = self
            .inner
            .root
            .send_command(
                "Target.setAutoAttach",
                json!({"autoAttach": false, "waitForDebuggerOnStart": false}),
            )
            .await;
        if let Err(e) = result {
            debug!(target: "protocol", error = %e, "Failed to turn off auto-attach");
        }
    }

    /// Sessions of every attached child target.
    pub fn child_sessions(&self) -> Vec<Arc<ProtocolSession>> {
        self.inner
            .children
            .iter()
            .map(|entry| entry.value().1.clone())
            .collect()
    }

    pub fn child_targets(&self) -> Vec<TargetInfo> {
        self.inner
            .children
            .iter()
            .map(|entry| entry.value().0.clone())
            .collect()
    }

    pub fn child_count(&self) -> usize {
        self.inner.children.len()
    }
}

impl Inner {
    fn watch(inner: &Arc<Inner>, session: &Arc<ProtocolSession>) {
        let weak = Arc::downgrade(inner);
        let attached = session.on(
            "Target.attachedToTarget",
            Arc::new(move |params: &Value| {
                if let Some(inner) = weak.upgrade() {
                    Inner::on_attached(&inner, params);
                }
            }),
        );

        let weak = Arc::downgrade(inner);
        let detached = session.on(
            "Target.detachedFromTarget",
            Arc::new(move |params: &Value| {
                if let Some(inner) = weak.upgrade()
                    && let Some(session_id) = params["sessionId"].as_str()
                    && let Some((_, (info, child))) = inner.children.remove(session_id)
                {
                    debug!(target: "protocol", target = %info.target_id, "Child target detached");
                    child.dispose();
                }
            }),
        );

        let mut listeners = inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        listeners.push((session.clone(), attached));
        listeners.push((session.clone(), detached));
    }

    fn on_attached(inner: &Arc<Inner>, params: &Value) {
        if !inner.enabled.load(Ordering::SeqCst) {
            return;
        }
        let Some(session_id) = params["sessionId"].as_str() else {
            return;
        };
        let info = &params["targetInfo"];
        let target = TargetInfo {
            target_id: info["targetId"].as_str().unwrap_or_default().to_string(),
            target_type: info["type"].as_str().unwrap_or_default().to_string(),
            url: info["url"].as_str().unwrap_or_default().to_string(),
        };
        debug!(
            target: "protocol",
            session_id,
            kind = %target.target_type,
            url = %target.url,
            "Child target attached"
        );

        let child = ProtocolSession::new(inner.root.transport(), Some(session_id.to_string()));
        inner
            .children
            .insert(session_id.to_string(), (target.clone(), child.clone()));

        // Workers and frames can spawn targets of their own.
        if matches!(target.target_type.as_str(), "iframe" | "page") {
            Inner::watch(inner, &child);
        }

        tokio::spawn(async move {
            if matches!(target.target_type.as_str(), "iframe" | "page")
                && let Err(e) = child
                    .send_command("Target.setAutoAttach", auto_attach_params())
                    .await
            {
                warn!(target: "protocol", error = %e, "Failed to auto-attach in child target");
            }
            if let Err(e) = child
                .send_command("Runtime.runIfWaitingForDebugger", json!({}))
                .await
            {
                debug!(target: "protocol", error = %e, "Failed to resume child target");
            }
        });
    }
}
