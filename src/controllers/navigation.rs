//! Navigation mode: load a URL under instrumentation and collect artifacts
//! about that load.
//!
//! ```text
//! setup     base artifacts, target preparation, optional blank page
//! navigate  per-navigation prep, start phases, goto_url, stop phases
//! collect   classify the load, then getArtifact (or skip it)
//! cleanup   clear origin storage, disconnect
//! ```

use crate::controllers::page_load_error::page_load_error;
use crate::driver::navigation::{GotoOptions, WaitCondition, goto_url};
use crate::driver::prepare::{
    clear_throttling, enable_async_stacks, prepare_target_for_individual_navigation,
    prepare_target_for_navigation_mode,
};
use crate::driver::{Driver, NetworkMonitor, storage};
use crate::errors::{NavigateError, RunError};
use crate::gather::{
    ArtifactDefinition, PhaseRunner, collect_base_artifacts, finalize_base_artifacts,
    validate_definitions,
};
use pharos_common::{
    BaseArtifacts, GatherMode, GatherResult, LoadFailureMode, PageLoadError, Phase, Settings,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Load `url` and collect every navigation-mode artifact in `definitions`.
///
/// The driver is disconnected before returning, on success and on failure.
pub async fn navigation_gather(
    driver: Arc<Driver>,
    url: &str,
    definitions: Vec<ArtifactDefinition>,
    settings: Settings,
) -> Result<GatherResult, RunError> {
    let started = Instant::now();
    let result = run_navigation(&driver, url, definitions, settings).await;
    driver.disconnect().await;

    match &result {
        Ok(gathered) => info!(
            target: "navigation",
            url,
            collected = gathered.success_count(),
            failed = gathered.failure_count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Navigation gather complete"
        ),
        Err(e) => error!(target: "navigation", url, error = %e, "Navigation gather failed"),
    }
    result
}

async fn run_navigation(
    driver: &Arc<Driver>,
    url: &str,
    definitions: Vec<ArtifactDefinition>,
    settings: Settings,
) -> Result<GatherResult, RunError> {
    validate_definitions(&definitions)?;
    let settings = Arc::new(settings);

    // Setup
    let mut base = collect_base_artifacts(driver, GatherMode::Navigation, &settings).await;
    base.url.requested_url = Some(url.to_string());
    prepare_target_for_navigation_mode(driver, &settings).await?;
    if !settings.skip_about_blank {
        debug!(target: "navigation", blank_page = %settings.blank_page, "Loading blank page");
        let options = GotoOptions::from_settings(&settings, vec![WaitCondition::Navigated]);
        goto_url(driver, &settings.blank_page, &options).await?;
    }

    let mut runner = PhaseRunner::new(
        driver.clone(),
        GatherMode::Navigation,
        settings.clone(),
        definitions,
    )?;

    // Navigate
    let session = driver.default_session().clone();
    let warnings = prepare_target_for_individual_navigation(&session, &settings, url).await?;
    base.run_warnings.extend(warnings);

    let monitor = NetworkMonitor::new(session.clone());
    monitor.enable().await?;
    let async_stacks = enable_async_stacks(&session).await?;

    runner
        .run_phase(Phase::StartInstrumentation, url, &base)
        .await;
    runner
        .run_phase(Phase::StartSensitiveInstrumentation, url, &base)
        .await;

    let options =
        GotoOptions::from_settings(&settings, vec![WaitCondition::Fcp, WaitCondition::Load]);
    let navigation_error = match goto_url(driver, url, &options).await {
        Ok(outcome) => {
            base.url.requested_url = Some(outcome.requested_url);
            base.url.main_document_url = Some(outcome.main_document_url);
            base.run_warnings.extend(outcome.warnings);
            None
        }
        Err(NavigateError::PageLoad(e @ (PageLoadError::NoFcp | PageLoadError::PageHung))) => {
            warn!(target: "navigation", url, code = e.code(), "Navigation did not complete");
            Some(e)
        }
        Err(e) => return Err(e.into()),
    };

    let page_url = base.url.main_document_url.clone().unwrap_or_else(|| url.to_string());
    runner
        .run_phase(Phase::StopSensitiveInstrumentation, &page_url, &base)
        .await;
    runner
        .run_phase(Phase::StopInstrumentation, &page_url, &base)
        .await;

    if let Err(e) = async_stacks.disable().await {
        debug!(target: "navigation", error = %e, "Failed to disable async stacks");
    }
    clear_throttling(&session).await?;

    // Collect
    let records = monitor.records();
    monitor.disable();
    let load_error = page_load_error(
        navigation_error,
        &page_url,
        &records,
        settings.load_failure_mode,
    );
    apply_page_load_error(&mut base, load_error, settings.load_failure_mode);

    if let Some(load_error) = &base.page_load_error {
        runner.skip_get_artifact(&format!("page failed to load: {load_error}"));
    } else {
        runner
            .run_phase(Phase::GetArtifact, &page_url, &base)
            .await;
    }

    match driver.url().await {
        Ok(final_url) => base.url.final_displayed_url = final_url,
        Err(e) => debug!(target: "navigation", error = %e, "Could not read final URL"),
    }
    if base.page_load_error.is_some() {
        base.url.final_displayed_url.clear();
    }

    // Cleanup
    if !settings.disable_storage_reset
        && let Some(warning) = storage::clear_data_for_origin(&session, url).await?
    {
        base.warn(warning);
    }

    let artifacts = runner.collect().await;
    finalize_base_artifacts(&mut base)?;
    Ok(GatherResult { base, artifacts })
}

/// Record a classified page-load error according to `mode`.
///
/// `Fatal` stores it on the base artifacts, which skips artifact collection.
/// `Warn` turns it into a run warning. `Ignore` never produces one.
pub fn apply_page_load_error(
    base: &mut BaseArtifacts,
    load_error: Option<PageLoadError>,
    mode: LoadFailureMode,
) {
    let Some(load_error) = load_error else {
        return;
    };
    match mode {
        LoadFailureMode::Fatal => {
            error!(target: "navigation", code = load_error.code(), "{load_error}");
            base.page_load_error = Some(load_error);
        }
        LoadFailureMode::Warn => {
            warn!(target: "navigation", code = load_error.code(), "{load_error}");
            base.warn(load_error.to_string());
        }
        LoadFailureMode::Ignore => {}
    }
}
