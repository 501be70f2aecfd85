//! Snapshot mode: collect artifacts from the page as it is right now.

use crate::driver::Driver;
use crate::driver::prepare::prepare_target_for_snapshot_mode;
use crate::errors::RunError;
use crate::gather::{
    ArtifactDefinition, PhaseRunner, collect_base_artifacts, finalize_base_artifacts,
    validate_definitions,
};
use pharos_common::{GatherMode, GatherResult, Phase, Settings};
use std::sync::Arc;
use tracing::info;

/// Run `getArtifact` for every snapshot-mode artifact. No instrumentation phase runs.
pub async fn snapshot_gather(
    driver: Arc<Driver>,
    definitions: Vec<ArtifactDefinition>,
    settings: Settings,
) -> Result<GatherResult, RunError> {
    validate_definitions(&definitions)?;
    let settings = Arc::new(settings);

    let mut base = collect_base_artifacts(&driver, GatherMode::Snapshot, &settings).await;
    prepare_target_for_snapshot_mode(&driver, &settings).await?;

    let url = driver.url().await?;
    base.url.final_displayed_url = url.clone();

    let mut runner = PhaseRunner::new(driver, GatherMode::Snapshot, settings, definitions)?;
    runner.run_phase(Phase::GetArtifact, &url, &base).await;
    let artifacts = runner.collect().await;
    finalize_base_artifacts(&mut base)?;

    info!(target: "snapshot", %url, collected = artifacts.len(), "Snapshot complete");
    Ok(GatherResult { base, artifacts })
}
