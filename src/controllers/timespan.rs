//! Timespan mode: instrument the page while the caller drives it, then collect.

use crate::driver::prepare::prepare_target_for_timespan_mode;
use crate::driver::{Driver, NetworkMonitor};
use crate::errors::RunError;
use crate::gather::{
    ArtifactDefinition, PhaseRunner, collect_base_artifacts, finalize_base_artifacts,
    validate_definitions,
};
use pharos_common::{BaseArtifacts, GatherMode, GatherResult, Phase, Settings};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub const NAVIGATION_DURING_TIMESPAN_WARNING: &str = "A page navigation was detected during the run. \
     Using timespan mode to audit page navigations is not recommended. \
     Use navigation mode to audit page navigations.";

/// An instrumented span in progress. Finish it with [`TimespanSession::end`].
pub struct TimespanSession {
    driver: Arc<Driver>,
    runner: PhaseRunner,
    base: BaseArtifacts,
    monitor: NetworkMonitor,
    started: Instant,
}

/// Prepare the page and run the two start phases.
pub async fn start_timespan(
    driver: Arc<Driver>,
    definitions: Vec<ArtifactDefinition>,
    settings: Settings,
) -> Result<TimespanSession, RunError> {
    validate_definitions(&definitions)?;
    let settings = Arc::new(settings);

    let mut base = collect_base_artifacts(&driver, GatherMode::Timespan, &settings).await;
    prepare_target_for_timespan_mode(&driver, &settings).await?;

    let session = driver.default_session().clone();
    let monitor = NetworkMonitor::new(session.clone());
    monitor.enable().await?;
    session.send_command("Page.enable", json!({})).await?;

    let initial_url = driver.url().await?;
    base.url.final_displayed_url = initial_url.clone();

    let mut runner = PhaseRunner::new(
        driver.clone(),
        GatherMode::Timespan,
        settings,
        definitions,
    )?;
    runner
        .run_phase(Phase::StartInstrumentation, &initial_url, &base)
        .await;
    runner
        .run_phase(Phase::StartSensitiveInstrumentation, &initial_url, &base)
        .await;
    info!(target: "timespan", url = %initial_url, "Timespan started");

    Ok(TimespanSession {
        driver,
        runner,
        base,
        monitor,
        started: Instant::now(),
    })
}

impl TimespanSession {
    /// Stop instrumentation and collect the artifacts.
    ///
    /// A main-frame navigation during the span is a run warning, not an error.
    pub async fn end(mut self) -> Result<GatherResult, RunError> {
        let final_url = self.driver.url().await?;
        self.base.url.final_displayed_url = final_url.clone();

        self.runner
            .run_phase(Phase::StopSensitiveInstrumentation, &final_url, &self.base)
            .await;
        self.runner
            .run_phase(Phase::StopInstrumentation, &final_url, &self.base)
            .await;

        let navigations = self.monitor.main_frame_navigation_count();
        self.monitor.disable();
        if navigations > 0 {
            warn!(target: "timespan", navigations, "Page navigated during timespan");
            self.base.warn(NAVIGATION_DURING_TIMESPAN_WARNING);
        }

        self.runner
            .run_phase(Phase::GetArtifact, &final_url, &self.base)
            .await;
        let artifacts = self.runner.collect().await;
        finalize_base_artifacts(&mut self.base)?;

        debug!(target: "timespan", elapsed_ms = self.started.elapsed().as_millis() as u64, "Timespan ended");
        Ok(GatherResult {
            base: self.base,
            artifacts,
        })
    }

    /// Base artifacts as they stand mid-span.
    pub fn base_artifacts(&self) -> &BaseArtifacts {
        &self.base
    }
}
