//! Preparing the target before instrumentation: emulation, throttling,
//! network policy, dialogs, async stacks and storage.

use crate::driver::Driver;
use crate::driver::storage;
use crate::errors::ProtocolError;
use crate::protocol::{ListenerId, ProtocolSession};
use pharos_common::{Settings, ThrottlingMethod};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, warn};

/// Apply screen and user-agent emulation.
pub async fn prepare_device_emulation(
    session: &ProtocolSession,
    settings: &Settings,
) -> Result<(), ProtocolError> {
    let screen = &settings.screen_emulation;
    if !screen.disabled {
        session
            .send_command(
                "Emulation.setDeviceMetricsOverride",
                json!({
                    "mobile": screen.mobile,
                    "width": screen.width,
                    "height": screen.height,
                    "deviceScaleFactor": screen.device_scale_factor,
                }),
            )
            .await?;
        session
            .send_command(
                "Emulation.setTouchEmulationEnabled",
                json!({"enabled": screen.mobile}),
            )
            .await?;
    }

    if let Some(user_agent) = &settings.emulated_user_agent {
        session
            .send_command(
                "Network.setUserAgentOverride",
                json!({"userAgent": user_agent}),
            )
            .await?;
    }
    Ok(())
}

/// Apply network and CPU throttling when the method is `devtools`; clear it otherwise.
pub async fn throttle(session: &ProtocolSession, settings: &Settings) -> Result<(), ProtocolError> {
    if settings.throttling_method != ThrottlingMethod::Devtools {
        return clear_throttling(session).await;
    }
    let throttling = &settings.throttling;
    debug!(
        target: "navigation",
        latency_ms = throttling.request_latency_ms,
        cpu = throttling.cpu_slowdown_multiplier,
        "Applying devtools throttling"
    );
    session
        .send_command(
            "Network.emulateNetworkConditions",
            json!({
                "offline": false,
                "latency": throttling.request_latency_ms,
                "downloadThroughput": kbps_to_bytes_per_second(throttling.download_throughput_kbps),
                "uploadThroughput": kbps_to_bytes_per_second(throttling.upload_throughput_kbps),
            }),
        )
        .await?;
    session
        .send_command(
            "Emulation.setCPUThrottlingRate",
            json!({"rate": throttling.cpu_slowdown_multiplier}),
        )
        .await?;
    Ok(())
}

fn kbps_to_bytes_per_second(kbps: f64) -> f64 {
    (kbps * 1024.0 / 8.0).floor()
}

/// Remove any network and CPU throttling.
pub async fn clear_throttling(session: &ProtocolSession) -> Result<(), ProtocolError> {
    session
        .send_command(
            "Network.emulateNetworkConditions",
            json!({"offline": false, "latency": 0, "downloadThroughput": 0, "uploadThroughput": 0}),
        )
        .await?;
    session
        .send_command("Emulation.setCPUThrottlingRate", json!({"rate": 1}))
        .await?;
    Ok(())
}

/// Enable the network domain and apply blocked URLs and extra headers.
pub async fn prepare_network(
    session: &ProtocolSession,
    settings: &Settings,
) -> Result<(), ProtocolError> {
    session.send_command("Network.enable", json!({})).await?;
    session
        .send_command(
            "Network.setBlockedURLs",
            json!({"urls": settings.blocked_url_patterns}),
        )
        .await?;
    if !settings.extra_headers.is_empty() {
        session
            .send_command(
                "Network.setExtraHTTPHeaders",
                json!({"headers": settings.extra_headers}),
            )
            .await?;
    }
    Ok(())
}

/// Accept every JavaScript dialog so it cannot block the run.
pub async fn dismiss_javascript_dialogs(
    session: &Arc<ProtocolSession>,
) -> Result<ListenerId, ProtocolError> {
    let weak = Arc::downgrade(session);
    let id = session.on(
        "Page.javascriptDialogOpening",
        Arc::new(move |params: &Value| {
            let Some(session) = weak.upgrade() else {
                return;
            };
            warn!(
                target: "navigation",
                message = params["message"].as_str().unwrap_or_default(),
                "Dismissing JavaScript dialog"
            );
            tokio::spawn(async move {
                let result = session
                    .send_command(
                        "Page.handleJavaScriptDialog",
                        json!({"accept": true, "promptText": "pharos prompt response"}),
                    )
                    .await;
                if let Err(e) = result {
                    debug!(target: "navigation", error = %e, "Failed to dismiss dialog");
                }
            });
        }),
    );
    session.send_command("Page.enable", json!({})).await?;
    Ok(id)
}

/// Async stack traces for the instrumented span. Disable with `disable`.
pub struct AsyncStacks {
    session: Arc<ProtocolSession>,
    listeners: Vec<ListenerId>,
}

async fn enable_debugger(session: &ProtocolSession) -> Result<(), ProtocolError> {
    session.send_command("Debugger.enable", json!({})).await?;
    session
        .send_command("Debugger.setSkipAllPauses", json!({"skip": true}))
        .await?;
    session
        .send_command("Debugger.setAsyncCallStackDepth", json!({"maxDepth": 8}))
        .await?;
    Ok(())
}

/// Turn on async call stacks and keep them on across main-frame navigations.
pub async fn enable_async_stacks(
    session: &Arc<ProtocolSession>,
) -> Result<AsyncStacks, ProtocolError> {
    let weak = Arc::downgrade(session);
    let paused = session.on(
        "Debugger.paused",
        Arc::new(move |_: &Value| {
            // Pauses that slip past setSkipAllPauses would stall the page.
            if let Some(session) = weak.upgrade() {
                tokio::spawn(async move {
                    if let Err(e) = session.send_command("Debugger.resume", json!({})).await {
                        debug!(target: "navigation", error = %e, "Failed to resume paused debugger");
                    }
                });
            }
        }),
    );

    let weak = Arc::downgrade(session);
    let navigated = session.on(
        "Page.frameNavigated",
        Arc::new(move |params: &Value| {
            if params["frame"].get("parentId").is_some() {
                return;
            }
            // setSkipAllPauses resets on every navigation.
            if let Some(session) = weak.upgrade() {
                tokio::spawn(async move {
                    if let Err(e) = enable_debugger(&session).await {
                        debug!(target: "navigation", error = %e, "Failed to re-enable async stacks");
                    }
                });
            }
        }),
    );

    enable_debugger(session).await?;
    Ok(AsyncStacks {
        session: session.clone(),
        listeners: vec![paused, navigated],
    })
}

impl AsyncStacks {
    pub async fn disable(self) -> Result<(), ProtocolError> {
        for id in &self.listeners {
            self.session.off(*id);
        }
        self.session
            .send_command("Debugger.disable", json!({}))
            .await?;
        Ok(())
    }
}

/// One-time preparation for a navigation-mode run.
pub async fn prepare_target_for_navigation_mode(
    driver: &Driver,
    settings: &Settings,
) -> Result<(), ProtocolError> {
    let session = driver.default_session();
    prepare_device_emulation(session, settings).await?;
    dismiss_javascript_dialogs(session).await?;
    if let Err(e) = driver.target_manager().enable().await {
        debug!(target: "navigation", error = %e, "Target auto-attach unavailable");
    }
    Ok(())
}

/// Per-navigation preparation: storage reset, then network policy and throttling.
///
/// Returns warnings for the run.
pub async fn prepare_target_for_individual_navigation(
    session: &ProtocolSession,
    settings: &Settings,
    url: &str,
) -> Result<Vec<String>, ProtocolError> {
    let mut warnings = Vec::new();

    if !settings.disable_storage_reset {
        if let Some(warning) = storage::important_storage_warning(session, url).await? {
            warnings.push(warning);
        }
        storage::clear_browser_caches(session).await?;
        if let Some(warning) = storage::clear_data_for_origin(session, url).await? {
            warnings.push(warning);
        }
    }

    prepare_network(session, settings).await?;
    throttle(session, settings).await?;
    Ok(warnings)
}

/// Preparation for a timespan run: emulation, network policy, throttling, dialogs.
pub async fn prepare_target_for_timespan_mode(
    driver: &Driver,
    settings: &Settings,
) -> Result<(), ProtocolError> {
    let session = driver.default_session();
    prepare_device_emulation(session, settings).await?;
    prepare_network(session, settings).await?;
    throttle(session, settings).await?;
    dismiss_javascript_dialogs(session).await?;
    Ok(())
}

/// Preparation for a snapshot run: emulation only, the page is left as it is.
pub async fn prepare_target_for_snapshot_mode(
    driver: &Driver,
    settings: &Settings,
) -> Result<(), ProtocolError> {
    prepare_device_emulation(driver.default_session(), settings).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testing::ScriptedTransport;

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_device_emulation_uses_screen_settings() {
        let transport = ScriptedTransport::new();
        let session = ProtocolSession::new(transport.clone(), None);
        let mut settings = Settings::default();
        settings.emulated_user_agent = Some("pharos-test".into());

        prepare_device_emulation(&session, &settings).await.unwrap();

        let metrics = &transport.params_for("Emulation.setDeviceMetricsOverride")[0];
        assert_eq!(metrics["width"], 412);
        assert_eq!(metrics["mobile"], true);
        assert_eq!(
            transport.params_for("Network.setUserAgentOverride")[0]["userAgent"],
            "pharos-test"
        );
    }

    #[tokio::test]
    async fn test_disabled_screen_emulation_is_skipped() {
        let transport = ScriptedTransport::new();
        let session = ProtocolSession::new(transport.clone(), None);
        let mut settings = Settings::default();
        settings.screen_emulation.disabled = true;

        prepare_device_emulation(&session, &settings).await.unwrap();
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_devtools_throttling_applies_conditions() {
        let transport = ScriptedTransport::new();
        let session = ProtocolSession::new(transport.clone(), None);
        let mut settings = Settings::default();
        settings.throttling_method = ThrottlingMethod::Devtools;

        throttle(&session, &settings).await.unwrap();

        let network = &transport.params_for("Network.emulateNetworkConditions")[0];
        assert_eq!(network["latency"], 562.5);
        assert_eq!(network["downloadThroughput"], 188743.0);
        assert_eq!(
            transport.params_for("Emulation.setCPUThrottlingRate")[0]["rate"],
            4.0
        );
    }

    #[tokio::test]
    async fn test_simulated_throttling_clears_conditions() {
        let transport = ScriptedTransport::new();
        let session = ProtocolSession::new(transport.clone(), None);

        throttle(&session, &Settings::default()).await.unwrap();
        assert_eq!(
            transport.params_for("Emulation.setCPUThrottlingRate")[0]["rate"],
            1
        );
    }

    #[tokio::test]
    async fn test_individual_navigation_respects_storage_reset_setting() {
        let transport = ScriptedTransport::new();
        let session = ProtocolSession::new(transport.clone(), None);
        let mut settings = Settings::default();
        settings.disable_storage_reset = true;
        settings.blocked_url_patterns = vec!["*.woff2".into()];

        prepare_target_for_individual_navigation(&session, &settings, "https://a.test/")
            .await
            .unwrap();

        let methods = transport.sent_methods();
        assert!(!methods.contains(&"Storage.clearDataForOrigin".to_string()));
        assert_eq!(
            transport.params_for("Network.setBlockedURLs")[0]["urls"][0],
            "*.woff2"
        );
    }

    #[tokio::test]
    async fn test_dialogs_are_accepted() {
        let transport = ScriptedTransport::new();
        let session = ProtocolSession::new(transport.clone(), None);
        dismiss_javascript_dialogs(&session).await.unwrap();

        transport.emit(
            None,
            "Page.javascriptDialogOpening",
            json!({"message": "Leave site?", "type": "beforeunload"}),
        );
        settle().await;

        let handled = transport.params_for("Page.handleJavaScriptDialog");
        assert_eq!(handled.len(), 1);
        assert_eq!(handled[0]["accept"], true);
    }

    #[tokio::test]
    async fn test_async_stacks_reenable_on_navigation_and_disable_cleanly() {
        let transport = ScriptedTransport::new();
        let session = ProtocolSession::new(transport.clone(), None);
        let stacks = enable_async_stacks(&session).await.unwrap();

        transport.emit(None, "Page.frameNavigated", json!({"frame": {"id": "m"}}));
        settle().await;
        assert_eq!(transport.params_for("Debugger.setAsyncCallStackDepth").len(), 2);

        stacks.disable().await.unwrap();
        assert_eq!(session.listener_count("Debugger.paused"), 0);
        assert_eq!(session.listener_count("Page.frameNavigated"), 0);
        assert!(transport.sent_methods().contains(&"Debugger.disable".to_string()));
    }

    #[tokio::test]
    async fn test_failed_resume_does_not_stop_later_resumes() {
        let transport = ScriptedTransport::new();
        transport.fail("Debugger.resume", -32000, "Can only perform operation while paused");
        transport.respond("Debugger.resume", json!({}));
        let session = ProtocolSession::new(transport.clone(), None);
        let _stacks = enable_async_stacks(&session).await.unwrap();

        transport.emit(None, "Debugger.paused", json!({}));
        settle().await;
        transport.emit(None, "Debugger.paused", json!({}));
        settle().await;

        assert_eq!(transport.params_for("Debugger.resume").len(), 2);
        assert_eq!(session.listener_count("Debugger.paused"), 1);
    }
}
