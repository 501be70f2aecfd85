//! Network request records built from `Network.*` events, and live
//! in-flight tracking for idle detection.

use crate::errors::ProtocolError;
use crate::protocol::{ListenerId, ProtocolSession};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::debug;

/// One protocol message as captured in a devtools log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DevtoolsLogEntry {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// One network request, reconstructed from its protocol events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRecord {
    pub request_id: String,
    pub url: String,
    /// URL of the document that issued the request.
    pub document_url: String,
    pub frame_id: Option<String>,
    pub request_method: String,
    pub resource_type: Option<String>,
    pub status_code: Option<u16>,
    pub mime_type: Option<String>,
    pub failed: bool,
    pub error_text: Option<String>,
    /// Milliseconds on the protocol's monotonic clock.
    pub start_time_ms: f64,
    pub end_time_ms: Option<f64>,
    pub finished: bool,
    /// URL of the request this one was redirected from.
    pub redirect_source: Option<String>,
}

impl NetworkRecord {
    pub fn is_document(&self) -> bool {
        self.resource_type.as_deref() == Some("Document")
    }

    fn is_non_network(&self) -> bool {
        self.url.starts_with("data:") || self.url.starts_with("blob:")
    }
}

fn seconds_to_ms(value: &Value) -> f64 {
    value.as_f64().unwrap_or_default() * 1000.0
}

fn str_field(value: &Value) -> Option<String> {
    value.as_str().map(str::to_string)
}

/// Builds `NetworkRecord`s from a stream of protocol events.
#[derive(Debug, Default)]
pub struct NetworkRecorder {
    records: Vec<NetworkRecord>,
    by_request_id: HashMap<String, usize>,
}

impl NetworkRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the records of a captured devtools log.
    pub fn records_from_log(log: &[DevtoolsLogEntry]) -> Vec<NetworkRecord> {
        let mut recorder = Self::new();
        for entry in log {
            recorder.dispatch(&entry.method, &entry.params);
        }
        recorder.records
    }

    pub fn records(&self) -> &[NetworkRecord] {
        &self.records
    }

    /// Requests that have not finished or failed yet.
    pub fn in_flight_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| !r.finished && !r.is_non_network())
            .count()
    }

    fn record_mut(&mut self, params: &Value) -> Option<&mut NetworkRecord> {
        let id = params["requestId"].as_str()?;
        let idx = *self.by_request_id.get(id)?;
        self.records.get_mut(idx)
    }

    /// Feed one protocol event. Events outside the `Network` domain are ignored.
    pub fn dispatch(&mut self, method: &str, params: &Value) {
        match method {
            "Network.requestWillBeSent" => self.on_request_will_be_sent(params),
            "Network.responseReceived" => {
                if let Some(record) = self.record_mut(params) {
                    apply_response(record, &params["response"]);
                    if let Some(kind) = str_field(&params["type"]) {
                        record.resource_type = Some(kind);
                    }
                }
            }
            "Network.loadingFinished" => {
                if let Some(record) = self.record_mut(params) {
                    record.end_time_ms = Some(seconds_to_ms(&params["timestamp"]));
                    record.finished = true;
                }
            }
            "Network.loadingFailed" => {
                if let Some(record) = self.record_mut(params) {
                    record.end_time_ms = Some(seconds_to_ms(&params["timestamp"]));
                    record.finished = true;
                    record.failed = true;
                    record.error_text = str_field(&params["errorText"]);
                    if let Some(kind) = str_field(&params["type"]) {
                        record.resource_type = Some(kind);
                    }
                }
            }
            _ => {}
        }
    }

    fn on_request_will_be_sent(&mut self, params: &Value) {
        let Some(request_id) = params["requestId"].as_str() else {
            return;
        };
        let timestamp = seconds_to_ms(&params["timestamp"]);
        let mut redirect_source = None;

        // A redirect reuses the request id: close out the earlier hop first.
        if params.get("redirectResponse").is_some()
            && let Some(idx) = self.by_request_id.remove(request_id)
        {
            let previous = &mut self.records[idx];
            apply_response(previous, &params["redirectResponse"]);
            previous.end_time_ms = Some(timestamp);
            previous.finished = true;
            previous.request_id = format!("{request_id}:redirect");
            redirect_source = Some(previous.url.clone());
        }

        let request = &params["request"];
        let record = NetworkRecord {
            request_id: request_id.to_string(),
            url: str_field(&request["url"]).unwrap_or_default(),
            document_url: str_field(&params["documentURL"]).unwrap_or_default(),
            frame_id: str_field(&params["frameId"]),
            request_method: str_field(&request["method"]).unwrap_or_else(|| "GET".into()),
            resource_type: str_field(&params["type"]),
            status_code: None,
            mime_type: None,
            failed: false,
            error_text: None,
            start_time_ms: timestamp,
            end_time_ms: None,
            finished: false,
            redirect_source,
        };
        self.by_request_id
            .insert(request_id.to_string(), self.records.len());
        self.records.push(record);
    }
}

fn apply_response(record: &mut NetworkRecord, response: &Value) {
    record.status_code = response["status"].as_u64().map(|s| s as u16);
    if let Some(mime) = str_field(&response["mimeType"]) {
        record.mime_type = Some(mime);
    }
}

/// Find the record that loaded `url`, preferring documents and the latest hop.
pub fn find_resource_for_url<'a>(
    records: &'a [NetworkRecord],
    url: &str,
) -> Option<&'a NetworkRecord> {
    let without_fragment = |u: &str| u.split('#').next().unwrap_or(u).to_string();
    let target = without_fragment(url);
    records
        .iter()
        .filter(|r| without_fragment(&r.url) == target)
        .max_by_key(|r| (r.is_document(), r.redirect_source.is_some()))
}

/// In-flight counts seen by a `NetworkMonitor`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStatus {
    pub in_flight: usize,
}

impl NetworkStatus {
    /// At most two requests in flight.
    pub fn is_2_idle(&self) -> bool {
        self.in_flight <= 2
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight == 0
    }
}

#[derive(Default)]
struct MonitorState {
    recorder: NetworkRecorder,
    main_frame_navigations: Vec<String>,
    main_document_requests: Vec<String>,
}

/// Live network observer on one session.
///
/// Records every request, publishes in-flight counts for idle waits, and
/// remembers main-frame navigations so the requested and final document URLs
/// can be told apart.
pub struct NetworkMonitor {
    session: Arc<ProtocolSession>,
    state: Arc<Mutex<MonitorState>>,
    status: watch::Sender<NetworkStatus>,
    listeners: Mutex<Vec<ListenerId>>,
}

impl NetworkMonitor {
    pub fn new(session: Arc<ProtocolSession>) -> Self {
        let (status, _) = watch::channel(NetworkStatus::default());
        Self {
            session,
            state: Arc::new(Mutex::new(MonitorState::default())),
            status,
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start observing. Listeners are registered before `Network.enable` is sent.
    pub async fn enable(&self) -> Result<(), ProtocolError> {
        self.attach_listeners();
        self.session.send_command("Network.enable", json!({})).await?;
        Ok(())
    }

    fn attach_listeners(&self) {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        if !listeners.is_empty() {
            return;
        }

        let state = self.state.clone();
        let status = self.status.clone();
        listeners.push(self.session.on_any(Arc::new(move |method: &str, params: &Value| {
            if !method.starts_with("Network.") {
                return;
            }
            let in_flight = {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                if method == "Network.requestWillBeSent"
                    && params["type"] == "Document"
                    && params["requestId"] == params["loaderId"]
                    && let Some(url) = params["request"]["url"].as_str()
                {
                    state.main_document_requests.push(url.to_string());
                }
                state.recorder.dispatch(method, params);
                state.recorder.in_flight_count()
            };
            status.send_replace(NetworkStatus { in_flight });
        })));

        let state = self.state.clone();
        listeners.push(self.session.on(
            "Page.frameNavigated",
            Arc::new(move |params: &Value| {
                let frame = &params["frame"];
                if frame.get("parentId").is_some() {
                    return;
                }
                if let Some(url) = frame["url"].as_str() {
                    state
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .main_frame_navigations
                        .push(url.to_string());
                }
            }),
        ));
    }

    /// Stop observing. Records collected so far stay available.
    pub fn disable(&self) {
        let ids: Vec<_> = std::mem::take(
            &mut *self.listeners.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for id in ids {
            self.session.off(id);
        }
        debug!(target: "navigation", "Network monitor disabled");
    }

    pub fn records(&self) -> Vec<NetworkRecord> {
        self.lock_state().recorder.records().to_vec()
    }

    pub fn status(&self) -> NetworkStatus {
        *self.status.borrow()
    }

    /// Receiver that observes every change in the in-flight count.
    pub fn subscribe_status(&self) -> watch::Receiver<NetworkStatus> {
        self.status.subscribe()
    }

    /// Number of main-frame navigations seen since `enable`.
    pub fn main_frame_navigation_count(&self) -> usize {
        self.lock_state().main_frame_navigations.len()
    }

    /// The URL first requested for the main frame and the URL it finally committed.
    pub fn navigation_urls(&self) -> (Option<String>, Option<String>) {
        let state = self.lock_state();
        let main_document = state.main_frame_navigations.last().cloned();
        let requested = state
            .main_document_requests
            .first()
            .cloned()
            .or_else(|| state.main_frame_navigations.first().cloned());
        (requested, main_document)
    }
}

impl Drop for NetworkMonitor {
    fn drop(&mut self) {
        self.disable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testing::ScriptedTransport;

    fn request(id: &str, url: &str, kind: &str, ts: f64) -> Value {
        json!({
            "requestId": id,
            "frameId": "F",
            "loaderId": id,
            "documentURL": url,
            "type": kind,
            "timestamp": ts,
            "request": {"url": url, "method": "GET"},
        })
    }

    #[test]
    fn test_records_track_response_and_finish() {
        let mut recorder = NetworkRecorder::new();
        recorder.dispatch(
            "Network.requestWillBeSent",
            &request("1", "https://a.test/", "Document", 1.0),
        );
        assert_eq!(recorder.in_flight_count(), 1);

        recorder.dispatch(
            "Network.responseReceived",
            &json!({"requestId": "1", "type": "Document",
                    "response": {"status": 200, "mimeType": "text/html"}}),
        );
        recorder.dispatch(
            "Network.loadingFinished",
            &json!({"requestId": "1", "timestamp": 1.25}),
        );

        let record = &recorder.records()[0];
        assert_eq!(record.status_code, Some(200));
        assert_eq!(record.mime_type.as_deref(), Some("text/html"));
        assert_eq!(record.start_time_ms, 1000.0);
        assert_eq!(record.end_time_ms, Some(1250.0));
        assert!(record.finished);
        assert_eq!(recorder.in_flight_count(), 0);
    }

    #[test]
    fn test_redirect_splits_into_two_records() {
        let mut recorder = NetworkRecorder::new();
        recorder.dispatch(
            "Network.requestWillBeSent",
            &request("1", "http://a.test/", "Document", 1.0),
        );
        let mut hop = request("1", "https://a.test/", "Document", 1.1);
        hop["redirectResponse"] = json!({"status": 301, "mimeType": "text/html"});
        recorder.dispatch("Network.requestWillBeSent", &hop);

        let records = recorder.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].request_id, "1:redirect");
        assert_eq!(records[0].status_code, Some(301));
        assert!(records[0].finished);
        assert_eq!(records[1].redirect_source.as_deref(), Some("http://a.test/"));
    }

    #[test]
    fn test_failed_request_is_marked() {
        let log = vec![
            DevtoolsLogEntry {
                method: "Network.requestWillBeSent".into(),
                params: request("9", "https://bad.test/", "Document", 2.0),
            },
            DevtoolsLogEntry {
                method: "Network.loadingFailed".into(),
                params: json!({"requestId": "9", "timestamp": 2.5,
                               "errorText": "net::ERR_NAME_NOT_RESOLVED"}),
            },
        ];
        let records = NetworkRecorder::records_from_log(&log);
        assert!(records[0].failed);
        assert_eq!(
            records[0].error_text.as_deref(),
            Some("net::ERR_NAME_NOT_RESOLVED")
        );
    }

    #[test]
    fn test_find_resource_ignores_fragment() {
        let mut recorder = NetworkRecorder::new();
        recorder.dispatch(
            "Network.requestWillBeSent",
            &request("1", "https://a.test/page", "Document", 1.0),
        );
        let found = find_resource_for_url(recorder.records(), "https://a.test/page#top");
        assert_eq!(found.map(|r| r.request_id.as_str()), Some("1"));
    }

    #[tokio::test]
    async fn test_monitor_tracks_in_flight_and_navigations() {
        let transport = ScriptedTransport::new();
        let session = ProtocolSession::new(transport.clone(), None);
        let monitor = NetworkMonitor::new(session);
        monitor.enable().await.unwrap();
        let mut status = monitor.subscribe_status();

        transport.emit(
            None,
            "Network.requestWillBeSent",
            request("1", "https://a.test/", "Document", 1.0),
        );
        status.changed().await.unwrap();
        assert_eq!(status.borrow_and_update().in_flight, 1);

        transport.emit(
            None,
            "Page.frameNavigated",
            json!({"frame": {"id": "F", "url": "https://a.test/"}}),
        );
        transport.emit(
            None,
            "Page.frameNavigated",
            json!({"frame": {"id": "child", "parentId": "F", "url": "https://ads.test/"}}),
        );
        transport.emit(
            None,
            "Network.loadingFinished",
            json!({"requestId": "1", "timestamp": 1.5}),
        );
        status.changed().await.unwrap();
        assert!(status.borrow_and_update().is_idle());

        assert_eq!(monitor.main_frame_navigation_count(), 1);
        let (requested, main) = monitor.navigation_urls();
        assert_eq!(requested.as_deref(), Some("https://a.test/"));
        assert_eq!(main.as_deref(), Some("https://a.test/"));
    }
}
