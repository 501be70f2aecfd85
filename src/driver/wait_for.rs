//! Cancellable waits for page-load conditions.
//!
//! Every wait registers its listeners when it is created, not when it is first
//! polled, so it can be set up before the command that triggers the event is
//! sent. Cancelling a wait detaches its listeners immediately.

use crate::driver::network::NetworkMonitor;
use crate::errors::NavigateError;
use crate::protocol::{ListenerId, ProtocolSession};
use futures::FutureExt;
use futures::future::BoxFuture;
use pharos_common::PageLoadError;
use serde_json::{Value, json};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Listener registrations removed together on cancel or drop.
struct ListenerSet {
    session: Arc<ProtocolSession>,
    ids: Mutex<Vec<ListenerId>>,
}

impl ListenerSet {
    fn new(session: Arc<ProtocolSession>) -> Arc<Self> {
        Arc::new(Self {
            session,
            ids: Mutex::new(Vec::new()),
        })
    }

    fn add(&self, id: ListenerId) {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id);
    }

    fn detach(&self) {
        let ids: Vec<_> =
            std::mem::take(&mut *self.ids.lock().unwrap_or_else(PoisonError::into_inner));
        for id in ids {
            self.session.off(id);
        }
    }
}

impl Drop for ListenerSet {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Handle that cancels a wait from outside.
#[derive(Clone)]
pub struct WaitCanceller {
    token: CancellationToken,
    listeners: Option<Arc<ListenerSet>>,
}

impl WaitCanceller {
    pub fn cancel(&self) {
        self.token.cancel();
        if let Some(listeners) = &self.listeners {
            listeners.detach();
        }
    }
}

/// A pending wait that can be cancelled.
///
/// Resolves to `NavigateError::WaitCancelled` once cancelled.
pub struct CancellableWait<T> {
    promise: BoxFuture<'static, Result<T, NavigateError>>,
    canceller: WaitCanceller,
}

impl<T: Send + 'static> CancellableWait<T> {
    fn new<F>(
        listeners: Option<Arc<ListenerSet>>,
        build: impl FnOnce(CancellationToken) -> F,
    ) -> Self
    where
        F: Future<Output = Result<T, NavigateError>> + Send + 'static,
    {
        let token = CancellationToken::new();
        let inner = build(token.clone());
        let cancelled = token.clone();
        let held = listeners.clone();
        let promise = async move {
            let _held = held;
            tokio::select! {
                biased;
                _ = cancelled.cancelled() => Err(NavigateError::WaitCancelled),
                result = inner => result,
            }
        }
        .boxed();
        Self {
            promise,
            canceller: WaitCanceller { token, listeners },
        }
    }

    /// A wait that is already satisfied.
    pub fn ready(value: T) -> Self {
        Self::new(None, |_| async move { Ok(value) })
    }

    pub fn canceller(&self) -> WaitCanceller {
        self.canceller.clone()
    }

    pub fn cancel(&self) {
        self.canceller.cancel();
    }
}

impl<T> Future for CancellableWait<T> {
    type Output = Result<T, NavigateError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.promise.as_mut().poll(cx)
    }
}

/// Forward every occurrence of `event` on `session` into a channel.
fn subscribe(
    session: &Arc<ProtocolSession>,
    listeners: &ListenerSet,
    event: &str,
) -> mpsc::UnboundedReceiver<Value> {
    let (tx, rx) = mpsc::unbounded_channel();
    listeners.add(session.on(
        event,
        Arc::new(move |params: &Value| {
            let _ = tx.send(params.clone());
        }),
    ));
    rx
}

fn is_main_frame(params: &Value) -> bool {
    params["frame"].get("parentId").is_none()
}

/// Wait for the main frame to commit a navigation.
pub fn wait_for_frame_navigated(session: &Arc<ProtocolSession>) -> CancellableWait<()> {
    let listeners = ListenerSet::new(session.clone());
    let mut rx = subscribe(session, &listeners, "Page.frameNavigated");
    CancellableWait::new(Some(listeners), |_| async move {
        while let Some(params) = rx.recv().await {
            if is_main_frame(&params) {
                return Ok(());
            }
        }
        Err(NavigateError::WaitCancelled)
    })
}

/// Wait for first contentful paint, then `pause_after_fcp`.
///
/// Fails with `NO_FCP` if no paint arrives within `max_wait_for_fcp`.
pub fn wait_for_fcp(
    session: &Arc<ProtocolSession>,
    pause_after_fcp: Duration,
    max_wait_for_fcp: Duration,
) -> CancellableWait<()> {
    let listeners = ListenerSet::new(session.clone());
    let mut rx = subscribe(session, &listeners, "Page.lifecycleEvent");
    CancellableWait::new(Some(listeners), move |_| async move {
        let painted = async {
            while let Some(params) = rx.recv().await {
                if params["name"] == "firstContentfulPaint" {
                    return true;
                }
            }
            false
        };
        match tokio::time::timeout(max_wait_for_fcp, painted).await {
            Ok(true) => {
                debug!(target: "wait_for", "First contentful paint observed");
                tokio::time::sleep(pause_after_fcp).await;
                Ok(())
            }
            Ok(false) => Err(NavigateError::WaitCancelled),
            Err(_) => Err(NavigateError::PageLoad(PageLoadError::NoFcp)),
        }
    })
}

/// Wait for the load event, then `pause_after_load`.
pub fn wait_for_load_event(
    session: &Arc<ProtocolSession>,
    pause_after_load: Duration,
) -> CancellableWait<()> {
    let listeners = ListenerSet::new(session.clone());
    let mut rx = subscribe(session, &listeners, "Page.loadEventFired");
    CancellableWait::new(Some(listeners), move |_| async move {
        if rx.recv().await.is_none() {
            return Err(NavigateError::WaitCancelled);
        }
        debug!(target: "wait_for", "Load event fired");
        tokio::time::sleep(pause_after_load).await;
        Ok(())
    })
}

/// Wait until at most two requests have been in flight for `quiet_threshold`.
pub fn wait_for_network_idle(
    monitor: &NetworkMonitor,
    quiet_threshold: Duration,
) -> CancellableWait<()> {
    let mut status = monitor.subscribe_status();
    CancellableWait::new(None, move |_| async move {
        loop {
            while !status.borrow_and_update().is_2_idle() {
                if status.changed().await.is_err() {
                    return Err(NavigateError::WaitCancelled);
                }
            }

            let quiet = tokio::time::sleep(quiet_threshold);
            tokio::pin!(quiet);
            loop {
                tokio::select! {
                    _ = &mut quiet => {
                        debug!(target: "wait_for", "Network is quiet");
                        return Ok(());
                    }
                    changed = status.changed() => {
                        if changed.is_err() {
                            return Err(NavigateError::WaitCancelled);
                        }
                        if !status.borrow_and_update().is_2_idle() {
                            break;
                        }
                    }
                }
            }
        }
    })
}

const LONG_TASK_OBSERVER: &str = r#"(() => {
  if (window.__pharosLastLongTask !== undefined) return;
  window.__pharosLastLongTask = performance.now();
  new PerformanceObserver(entries => {
    for (const entry of entries.getEntries()) {
      if (entry.entryType === 'longtask') {
        const end = entry.startTime + entry.duration;
        window.__pharosLastLongTask = Math.max(window.__pharosLastLongTask, end);
      }
    }
  }).observe({type: 'longtask', buffered: true});
})()"#;

const TIME_SINCE_LONG_TASK: &str =
    "performance.now() - (window.__pharosLastLongTask || 0)";

async fn evaluate_number(session: &ProtocolSession, expression: &str) -> Option<f64> {
    let response = session
        .send_command(
            "Runtime.evaluate",
            json!({"expression": expression, "returnByValue": true}),
        )
        .await;
    match response {
        Ok(value) => value["result"]["value"].as_f64(),
        Err(e) => {
            debug!(target: "wait_for", error = %e, "CPU idle probe failed");
            None
        }
    }
}

/// Wait until no long task has run on the main thread for `quiet_threshold`.
pub fn wait_for_cpu_idle(
    session: &Arc<ProtocolSession>,
    quiet_threshold: Duration,
) -> CancellableWait<()> {
    if quiet_threshold.is_zero() {
        return CancellableWait::ready(());
    }
    let session = session.clone();
    CancellableWait::new(None, move |_| async move {
        session
            .send_command(
                "Runtime.evaluate",
                json!({"expression": LONG_TASK_OBSERVER, "returnByValue": true}),
            )
            .await?;

        let threshold_ms = quiet_threshold.as_secs_f64() * 1000.0;
        loop {
            let Some(since) = evaluate_number(&session, TIME_SINCE_LONG_TASK).await else {
                // Page is navigating or unresponsive; let the overall load timeout decide.
                tokio::time::sleep(quiet_threshold).await;
                continue;
            };
            if since >= threshold_ms {
                debug!(target: "wait_for", "CPU is idle");
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs_f64((threshold_ms - since) / 1000.0)).await;
        }
    })
}

/// Limits for `wait_for_fully_loaded`.
#[derive(Debug, Clone, Copy)]
pub struct LoadWaitOptions {
    pub wait_for_fcp: bool,
    pub pause_after_fcp: Duration,
    pub pause_after_load: Duration,
    pub network_quiet_threshold: Duration,
    pub cpu_quiet_threshold: Duration,
    pub max_wait_for_fcp: Duration,
    pub max_wait_for_load: Duration,
}

/// How the page finished loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOutcome {
    pub timed_out: bool,
}

/// How long the page gets to answer a trivial evaluation before it counts as hung.
const PAGE_HUNG_TIMEOUT: Duration = Duration::from_secs(1);

/// Whether the page fails to evaluate a trivial expression promptly.
pub async fn is_page_hung(session: &ProtocolSession) -> bool {
    session
        .send_command_with_timeout(
            "Runtime.evaluate",
            json!({"expression": "'ping'", "returnByValue": true, "timeout": 1000}),
            PAGE_HUNG_TIMEOUT,
        )
        .await
        .is_err()
}

/// Wait for FCP (optionally), the load event and network quiet, then CPU idle,
/// all raced against `max_wait_for_load`.
///
/// On the overall timeout the page is probed; a hung page has script execution
/// stopped and fails with `PAGE_HUNG`, otherwise the outcome reports
/// `timed_out`. Every outstanding wait is cancelled on every exit path.
pub fn wait_for_fully_loaded(
    session: &Arc<ProtocolSession>,
    monitor: &NetworkMonitor,
    options: LoadWaitOptions,
) -> impl Future<Output = Result<LoadOutcome, NavigateError>> + Send + 'static {
    let fcp = if options.wait_for_fcp {
        wait_for_fcp(session, options.pause_after_fcp, options.max_wait_for_fcp)
    } else {
        CancellableWait::ready(())
    };
    let load = wait_for_load_event(session, options.pause_after_load);
    let network = wait_for_network_idle(monitor, options.network_quiet_threshold);

    let cancellers = Arc::new(Mutex::new(vec![
        fcp.canceller(),
        load.canceller(),
        network.canceller(),
    ]));
    let session = session.clone();

    async move {
        let loaded = {
            let session = session.clone();
            let cancellers = cancellers.clone();
            async move {
                futures::future::try_join3(fcp, load, network).await?;
                let cpu = wait_for_cpu_idle(&session, options.cpu_quiet_threshold);
                cancellers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(cpu.canceller());
                cpu.await
            }
        };

        let result = tokio::select! {
            loaded = loaded => loaded.map(|()| LoadOutcome { timed_out: false }),
            _ = tokio::time::sleep(options.max_wait_for_load) => {
                if is_page_hung(&session).await {
                    warn!(target: "wait_for", "Page appears to be hung; stopping script execution");
                    stop_script_execution(&session).await;
                    Err(NavigateError::PageLoad(PageLoadError::PageHung))
                } else {
                    warn!(target: "wait_for", "Timed out waiting for page load; continuing");
                    Ok(LoadOutcome { timed_out: true })
                }
            }
        };

        for canceller in cancellers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            canceller.cancel();
        }
        result
    }
}

async fn stop_script_execution(session: &ProtocolSession) {
    for (method, params) in [
        (
            "Emulation.setScriptExecutionDisabled",
            json!({"value": true}),
        ),
        ("Runtime.terminateExecution", json!({})),
    ] {
        if let Err(e) = session.send_command(method, params).await {
            debug!(target: "wait_for", method, error = %e, "Failed to stop hung page");
        }
    }
}
