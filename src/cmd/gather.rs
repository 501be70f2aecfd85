use anyhow::{Context, Result};
use pharos::config::PharosConfig;
use pharos::controllers::{navigation_gather, snapshot_gather, start_timespan};
use pharos::driver::Driver;
use pharos::protocol::{ProtocolTransport, StreamConnection};
use pharos_common::GatherResult;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

async fn connect(config: &PharosConfig) -> Result<(Arc<StreamConnection>, Arc<Driver>)> {
    let endpoint = config.endpoint();
    let connection = StreamConnection::connect_tcp(&endpoint)
        .await
        .with_context(|| format!("Failed to connect to {endpoint}"))?;
    let transport: Arc<dyn ProtocolTransport> = connection.clone();
    let driver = Driver::connect(transport)
        .await
        .with_context(|| format!("Failed to attach to a page at {endpoint}"))?;
    Ok((connection, Arc::new(driver)))
}

/// Print the result as JSON, to `output` when given, stdout otherwise.
fn write_result(result: &GatherResult, output: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(result).context("Failed to serialize result")?;
    match output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write result: {}", path.display()))?;
            info!(path = %path.display(), "Result written");
        }
        None => println!("{json}"),
    }
    for warning in &result.base.run_warnings {
        eprintln!("warning: {warning}");
    }
    Ok(())
}

pub async fn cmd_navigate(config: &PharosConfig, url: &str, output: Option<&Path>) -> Result<()> {
    let definitions = config.build_definitions()?;
    let settings = config.settings()?;
    let (connection, driver) = connect(config).await?;

    let result = navigation_gather(driver, url, definitions, settings).await;
    connection.close().await;
    write_result(&result?, output)
}

pub async fn cmd_timespan(
    config: &PharosConfig,
    duration: Option<Duration>,
    output: Option<&Path>,
) -> Result<()> {
    let definitions = config.build_definitions()?;
    let settings = config.settings()?;
    let (connection, driver) = connect(config).await?;

    let session = start_timespan(driver.clone(), definitions, settings).await?;
    match duration {
        Some(duration) => {
            eprintln!("Recording for {}s...", duration.as_secs_f64());
            tokio::time::sleep(duration).await;
        }
        None => {
            eprintln!("Recording. Interact with the page, then press Ctrl-C to stop.");
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
        }
    }
    let result = session.end().await;
    driver.disconnect().await;
    connection.close().await;
    write_result(&result?, output)
}

pub async fn cmd_snapshot(config: &PharosConfig, output: Option<&Path>) -> Result<()> {
    let definitions = config.build_definitions()?;
    let settings = config.settings()?;
    let (connection, driver) = connect(config).await?;

    let result = snapshot_gather(driver.clone(), definitions, settings).await;
    driver.disconnect().await;
    connection.close().await;
    write_result(&result?, output)
}
