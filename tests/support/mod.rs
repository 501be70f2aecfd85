//! An in-memory browser that answers the protocol commands a gather run sends.

#![allow(dead_code)]

use async_trait::async_trait;
use pharos::errors::ProtocolError;
use pharos::protocol::{ProtocolEvent, ProtocolTransport};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

pub const PAGE_SESSION: &str = "page-session";

/// How the fake page answers a navigation.
#[derive(Debug, Clone)]
pub struct PageScript {
    pub status: u16,
    pub mime_type: String,
    pub body: String,
    /// `Network.loadingFailed` error text; the document never loads.
    pub error_text: Option<String>,
    /// Main frame lands on this URL instead of the requested one.
    pub redirect_to: Option<String>,
}

impl Default for PageScript {
    fn default() -> Self {
        Self {
            status: 200,
            mime_type: "text/html".into(),
            body: "<html><body>hello</body></html>".into(),
            error_text: None,
            redirect_to: None,
        }
    }
}

pub struct FakeBrowser {
    events: broadcast::Sender<ProtocolEvent>,
    sent: Mutex<Vec<(Option<String>, String, Value)>>,
    url: Mutex<String>,
    page: Mutex<PageScript>,
    next_request: Mutex<u64>,
}

impl FakeBrowser {
    pub fn new(initial_url: &str) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            events,
            sent: Mutex::new(Vec::new()),
            url: Mutex::new(initial_url.to_string()),
            page: Mutex::new(PageScript::default()),
            next_request: Mutex::new(1),
        })
    }

    pub fn set_page(&self, page: PageScript) {
        *self.page.lock().unwrap() = page;
    }

    pub fn emit(&self, method: &str, params: Value) {
        let _ = self
            .events
            .send(ProtocolEvent::new(Some(PAGE_SESSION), method, params));
    }

    /// The page navigates on its own, as after a link click.
    pub fn user_navigates(&self, url: &str) {
        *self.url.lock().unwrap() = url.to_string();
        self.emit(
            "Page.frameNavigated",
            json!({"frame": {"id": "main", "url": url}}),
        );
    }

    /// A console call made by page script.
    pub fn console_log(&self, text: &str) {
        self.emit(
            "Runtime.consoleAPICalled",
            json!({"type": "log", "args": [{"type": "string", "value": text}], "timestamp": 5.0}),
        );
    }

    pub fn sent_methods(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, method, _)| method.clone())
            .collect()
    }

    pub fn params_for(&self, method: &str) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, m, _)| m == method)
            .map(|(_, _, params)| params.clone())
            .collect()
    }

    fn navigate(&self, url: &str) -> Value {
        if url == "about:blank" {
            self.user_navigates(url);
            return json!({"frameId": "main"});
        }

        let page = self.page.lock().unwrap().clone();
        let request_id = {
            let mut next = self.next_request.lock().unwrap();
            let id = next.to_string();
            *next += 1;
            id
        };
        let final_url = page.redirect_to.clone().unwrap_or_else(|| url.to_string());

        self.emit(
            "Network.requestWillBeSent",
            json!({"requestId": request_id, "loaderId": request_id, "type": "Document",
                   "frameId": "main", "documentURL": url, "timestamp": 1.0,
                   "request": {"url": url, "method": "GET"}}),
        );
        if let Some(target) = &page.redirect_to {
            self.emit(
                "Network.requestWillBeSent",
                json!({"requestId": request_id, "loaderId": request_id, "type": "Document",
                       "frameId": "main", "documentURL": target, "timestamp": 1.05,
                       "redirectResponse": {"url": url, "status": 302, "mimeType": ""},
                       "request": {"url": target, "method": "GET"}}),
            );
        }

        if let Some(error_text) = &page.error_text {
            self.emit(
                "Network.loadingFailed",
                json!({"requestId": request_id, "timestamp": 1.1, "errorText": error_text}),
            );
            self.user_navigates(url);
            self.emit("Page.loadEventFired", json!({"timestamp": 1.2}));
            return json!({"frameId": "main", "errorText": error_text});
        }

        self.emit(
            "Network.responseReceived",
            json!({"requestId": request_id, "type": "Document", "timestamp": 1.1,
                   "response": {"url": final_url, "status": page.status, "mimeType": page.mime_type}}),
        );
        self.emit(
            "Network.loadingFinished",
            json!({"requestId": request_id, "timestamp": 1.2}),
        );
        self.user_navigates(&final_url);
        self.emit(
            "Page.lifecycleEvent",
            json!({"frameId": "main", "name": "firstContentfulPaint", "timestamp": 1.3}),
        );
        self.emit("Page.loadEventFired", json!({"timestamp": 1.4}));
        json!({"frameId": "main", "loaderId": request_id})
    }

    fn evaluate(&self, params: &Value) -> Value {
        let expression = params["expression"].as_str().unwrap_or_default();
        let value = if expression.contains("innerWidth") {
            json!({"innerWidth": 412, "innerHeight": 823, "outerWidth": 412,
                   "outerHeight": 823, "devicePixelRatio": 1.75})
        } else if expression.contains("__pharosLastLongTask") && expression.contains("performance.now") {
            json!(1.0e9)
        } else if expression.contains("'ping'") {
            json!("ping")
        } else {
            json!(1500)
        };
        json!({"result": {"type": "object", "value": value}})
    }

    fn end_trace(&self) {
        self.emit(
            "Tracing.dataCollected",
            json!({"value": [{"name": "TracingStartedInBrowser", "ph": "I", "ts": 1000}]}),
        );
        self.emit("Tracing.tracingComplete", json!({"dataLossOccurred": false}));
    }
}

#[async_trait]
impl ProtocolTransport for FakeBrowser {
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

        let reply = match method {
            "Target.getTargets" => json!({"targetInfos": [
                {"targetId": "browser", "type": "browser"},
                {"targetId": "page-1", "type": "page"},
            ]}),
            "Target.attachToTarget" => json!({"sessionId": PAGE_SESSION}),
            "Target.getTargetInfo" => {
                let url = self.url.lock().unwrap().clone();
                json!({"targetInfo": {"targetId": "page-1", "type": "page", "url": url}})
            }
            "Browser.getVersion" => json!({
                "product": "HeadlessChrome/126.0.0.0",
                "userAgent": "Mozilla/5.0 HeadlessChrome/126.0.0.0",
            }),
            "Page.navigate" => self.navigate(params["url"].as_str().unwrap_or_default()),
            "Page.getFrameTree" => json!({"frameTree": {"frame": {"id": "main"}}}),
            "Page.createIsolatedWorld" => json!({"executionContextId": 3}),
            "Runtime.evaluate" => self.evaluate(&params),
            "Tracing.end" => {
                self.end_trace();
                json!({})
            }
            "Network.getResponseBody" => {
                let body = self.page.lock().unwrap().body.clone();
                json!({"body": body, "base64Encoded": false})
            }
            _ => json!({}),
        };
        Ok(reply)
    }

    fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.events.subscribe()
    }
}
