//! Navigating the page and waiting for it to load.

use crate::driver::Driver;
use crate::driver::network::NetworkMonitor;
use crate::driver::wait_for::{LoadWaitOptions, wait_for_frame_navigated, wait_for_fully_loaded};
use crate::errors::NavigateError;
use crate::protocol::MAX_PROTOCOL_TIMEOUT;
use pharos_common::Settings;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Condition `goto_url` waits for before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitCondition {
    /// The main frame committed the navigation.
    Navigated,
    /// First contentful paint.
    Fcp,
    /// Load event, network quiet and CPU idle.
    Load,
}

/// Options for one navigation.
#[derive(Debug, Clone)]
pub struct GotoOptions {
    pub wait_until: Vec<WaitCondition>,
    pub max_wait_for_fcp: Duration,
    pub max_wait_for_load: Duration,
    pub pause_after_fcp: Duration,
    pub pause_after_load: Duration,
    pub network_quiet_threshold: Duration,
    pub cpu_quiet_threshold: Duration,
}

impl GotoOptions {
    /// Wait conditions and limits taken from run settings.
    pub fn from_settings(settings: &Settings, wait_until: Vec<WaitCondition>) -> Self {
        Self {
            wait_until,
            max_wait_for_fcp: Duration::from_millis(settings.max_wait_for_fcp_ms),
            max_wait_for_load: Duration::from_millis(settings.max_wait_for_load_ms),
            pause_after_fcp: Duration::from_millis(settings.pause_after_fcp_ms),
            pause_after_load: Duration::from_millis(settings.pause_after_load_ms),
            network_quiet_threshold: Duration::from_millis(settings.network_quiet_threshold_ms),
            cpu_quiet_threshold: Duration::from_millis(settings.cpu_quiet_threshold_ms),
        }
    }

    fn waits_for(&self, condition: WaitCondition) -> bool {
        self.wait_until.contains(&condition)
    }
}

/// Where a navigation ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationOutcome {
    pub requested_url: String,
    pub main_document_url: String,
    pub warnings: Vec<String>,
}

pub const LOAD_TIMED_OUT_WARNING: &str =
    "The page loaded too slowly to finish within the time limit. Results may be incomplete.";

fn navigation_warnings(timed_out: bool, requested_url: &str, main_document_url: &str) -> Vec<String> {
    let mut warnings = Vec::new();
    if timed_out {
        warnings.push(LOAD_TIMED_OUT_WARNING.to_string());
    }
    if requested_url != main_document_url {
        warnings.push(format!(
            "The page may not be loading as expected because your test URL ({requested_url}) \
             was redirected to {main_document_url}. Try testing the second URL directly."
        ));
    }
    warnings
}

/// Navigate the page to `url` and wait for the requested conditions.
///
/// `Page.navigate` itself gets the longest possible timeout: how long a load
/// may take is governed by the wait conditions instead.
pub async fn goto_url(
    driver: &Driver,
    url: &str,
    options: &GotoOptions,
) -> Result<NavigationOutcome, NavigateError> {
    if options.wait_until.is_empty() {
        return Err(NavigateError::NoWaitCondition);
    }
    let wait_navigated = options.waits_for(WaitCondition::Navigated);
    let wait_load = options.waits_for(WaitCondition::Load);
    let wait_fcp = options.waits_for(WaitCondition::Fcp);
    if wait_fcp && !wait_load && !wait_navigated {
        return Err(NavigateError::FcpWithoutLoad);
    }

    let session = driver.default_session().clone();
    info!(target: "navigation", url, "Navigating");

    let monitor = NetworkMonitor::new(session.clone());
    monitor.enable().await?;
    session.send_command("Page.enable", json!({})).await?;
    session
        .send_command("Page.setLifecycleEventsEnabled", json!({"enabled": true}))
        .await?;

    // Waits register their listeners now, before the navigation starts.
    let navigated = wait_for_frame_navigated(&session);
    let loaded = wait_load.then(|| {
        wait_for_fully_loaded(
            &session,
            &monitor,
            LoadWaitOptions {
                wait_for_fcp: wait_fcp,
                pause_after_fcp: options.pause_after_fcp,
                pause_after_load: options.pause_after_load,
                network_quiet_threshold: options.network_quiet_threshold,
                cpu_quiet_threshold: options.cpu_quiet_threshold,
                max_wait_for_fcp: options.max_wait_for_fcp,
                max_wait_for_load: options.max_wait_for_load,
            },
        )
    });

    let navigate = {
        let session = session.clone();
        let url = url.to_string();
        tokio::spawn(async move {
            session
                .send_command_with_timeout(
                    "Page.navigate",
                    json!({"url": url}),
                    MAX_PROTOCOL_TIMEOUT,
                )
                .await
        })
    };

    let mut timed_out = false;
    if wait_navigated {
        navigated.await?;
    } else {
        navigated.cancel();
        if let Some(loaded) = loaded {
            timed_out = loaded.await?.timed_out;
        }
    }

    match navigate.await {
        Ok(Ok(response)) => {
            if let Some(error_text) = response["errorText"].as_str() {
                // Reported again through network records; not fatal here.
                debug!(target: "navigation", error_text, "Page.navigate reported an error");
            }
        }
        Ok(Err(e)) => return Err(e.into()),
        Err(join_err) => {
            warn!(target: "navigation", error = %join_err, "Navigation command task failed");
        }
    }
    driver.execution_context().clear_context_id();

    let (requested_url, main_document_url) = monitor.navigation_urls();
    monitor.disable();
    let (Some(requested_url), Some(main_document_url)) = (requested_url, main_document_url) else {
        return Err(NavigateError::NoNavigationDetected);
    };

    let warnings = navigation_warnings(timed_out, &requested_url, &main_document_url);
    for warning in &warnings {
        warn!(target: "navigation", "{warning}");
    }
    Ok(NavigationOutcome {
        requested_url,
        main_document_url,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProtocolSession;
    use crate::protocol::testing::ScriptedTransport;
    use pharos_common::PageLoadError;
    use serde_json::Value;

    fn driver_with_page(
        redirect_to: Option<&'static str>,
        fires_load: bool,
    ) -> (std::sync::Arc<ScriptedTransport>, Driver) {
        let transport = ScriptedTransport::new();
        transport.on_command("Page.navigate", move |t, sid, params: &Value| {
            let url = params["url"].as_str().unwrap_or_default().to_string();
            let final_url = redirect_to.map(str::to_string).unwrap_or_else(|| url.clone());
            t.emit(
                sid,
                "Network.requestWillBeSent",
                json!({"requestId": "nav", "loaderId": "nav", "type": "Document",
                       "frameId": "main", "timestamp": 1.0,
                       "request": {"url": url, "method": "GET"}}),
            );
            t.emit(
                sid,
                "Network.loadingFinished",
                json!({"requestId": "nav", "timestamp": 1.2}),
            );
            t.emit(
                sid,
                "Page.frameNavigated",
                json!({"frame": {"id": "main", "url": final_url}}),
            );
            t.emit(
                sid,
                "Page.lifecycleEvent",
                json!({"name": "firstContentfulPaint"}),
            );
            if fires_load {
                t.emit(sid, "Page.loadEventFired", json!({}));
            }
        });
        let session = ProtocolSession::new(transport.clone(), Some("page".into()));
        (transport, Driver::from_session(session))
    }

    fn fast_options(wait_until: Vec<WaitCondition>) -> GotoOptions {
        let mut settings = Settings::default();
        settings.pause_after_fcp_ms = 0;
        settings.pause_after_load_ms = 0;
        settings.network_quiet_threshold_ms = 100;
        settings.cpu_quiet_threshold_ms = 0;
        GotoOptions::from_settings(&settings, wait_until)
    }

    #[tokio::test]
    async fn test_requires_a_wait_condition() {
        let (_, driver) = driver_with_page(None, true);
        let err = goto_url(&driver, "https://a.test/", &fast_options(vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, NavigateError::NoWaitCondition));

        let err = goto_url(&driver, "https://a.test/", &fast_options(vec![WaitCondition::Fcp]))
            .await
            .unwrap_err();
        assert!(matches!(err, NavigateError::FcpWithoutLoad));
    }

    #[tokio::test(start_paused = true)]
    async fn test_navigates_with_unbounded_timeout_and_waits_for_load() {
        let (transport, driver) = driver_with_page(None, true);
        let outcome = goto_url(
            &driver,
            "https://a.test/",
            &fast_options(vec![WaitCondition::Fcp, WaitCondition::Load]),
        )
        .await
        .unwrap();

        assert_eq!(outcome.requested_url, "https://a.test/");
        assert_eq!(outcome.main_document_url, "https://a.test/");
        assert!(outcome.warnings.is_empty());
        assert_eq!(
            transport.params_for("Page.navigate")[0]["url"],
            "https://a.test/"
        );
        let session = driver.default_session();
        assert_eq!(session.listener_count("Page.loadEventFired"), 0);
        assert_eq!(session.listener_count("Page.frameNavigated"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_redirect_and_slow_load_produce_warnings() {
        let (_, driver) = driver_with_page(Some("https://b.test/"), false);
        let outcome = goto_url(
            &driver,
            "https://a.test/",
            &fast_options(vec![WaitCondition::Load]),
        )
        .await
        .unwrap();

        assert_eq!(outcome.main_document_url, "https://b.test/");
        assert_eq!(outcome.warnings.len(), 2);
        assert_eq!(outcome.warnings[0], LOAD_TIMED_OUT_WARNING);
        assert!(outcome.warnings[1].contains("redirected to https://b.test/"));
    }

    #[tokio::test]
    async fn test_navigated_only_waits_for_commit() {
        let (_, driver) = driver_with_page(None, false);
        let outcome = goto_url(
            &driver,
            "about:blank",
            &fast_options(vec![WaitCondition::Navigated]),
        )
        .await
        .unwrap();
        assert_eq!(outcome.main_document_url, "about:blank");
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_paint_is_no_fcp() {
        let transport = ScriptedTransport::new();
        let driver = Driver::from_session(ProtocolSession::new(transport, None));
        let mut options = fast_options(vec![WaitCondition::Fcp, WaitCondition::Load]);
        options.max_wait_for_fcp = Duration::from_millis(1000);

        let err = goto_url(&driver, "https://a.test/", &options)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NavigateError::PageLoad(PageLoadError::NoFcp)
        ));
    }
}
