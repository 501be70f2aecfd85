//! Run-level metadata collected outside the gatherer pipeline.

use crate::driver::Driver;
use crate::errors::RunError;
use pharos_common::{BaseArtifacts, GatherMode, Settings, ThrottlingMethod};
use tracing::{debug, warn};

/// Host CPUs scoring below this are too slow for simulated throttling to be trusted.
pub const SLOW_CPU_BENCHMARK_THRESHOLD: f64 = 1000.0;

pub const SLOW_CPU_WARNING: &str = "The tested device appears to have a slower CPU than expected. \
     This can negatively affect performance results.";

/// Busy-loop for a fixed slice of wall time and report iterations per second,
/// scaled into the same range the scoring layer expects.
const BENCHMARK_SCRIPT: &str = r#"(() => {
  const start = Date.now();
  let iterations = 0;
  while (Date.now() - start < 500) {
    let s = '';
    for (let j = 0; j < 10000; j++) s += 'a';
    const arr = new Array(1000).fill(1);
    arr.sort();
    iterations++;
  }
  const elapsed = (Date.now() - start) / 1000;
  return Math.round(iterations / elapsed);
})()"#;

/// Collect the base artifacts available before any navigation.
///
/// Failures to read host details degrade to empty values with a debug log.
pub async fn collect_base_artifacts(
    driver: &Driver,
    gather_mode: GatherMode,
    settings: &Settings,
) -> BaseArtifacts {
    let mut base = BaseArtifacts::new(gather_mode, settings.clone());

    match driver.browser_version().await {
        Ok((product, user_agent)) => {
            base.host_product = product;
            base.host_user_agent = user_agent;
        }
        Err(e) => debug!(target: "gather", error = %e, "Could not read browser version"),
    }

    match driver.execution_context().evaluate(BENCHMARK_SCRIPT).await {
        Ok(value) => base.benchmark_index = value.as_f64(),
        Err(e) => debug!(target: "gather", error = %e, "Could not compute benchmark index"),
    }

    base
}

/// Close out the base artifacts once collection is over.
///
/// Warnings are de-duplicated in first-seen order, environment warnings are
/// added, and the final displayed URL is checked. A run without a final URL is
/// an engine error unless a page-load error explains it, in which case the
/// requested URL stands in.
pub fn finalize_base_artifacts(base: &mut BaseArtifacts) -> Result<(), RunError> {
    if base.settings.throttling_method == ThrottlingMethod::Simulate
        && let Some(index) = base.benchmark_index
        && index < SLOW_CPU_BENCHMARK_THRESHOLD
    {
        warn!(target: "gather", benchmark_index = index, "Host CPU is slow");
        base.warn(SLOW_CPU_WARNING);
    }

    let mut seen = std::collections::HashSet::new();
    base.run_warnings.retain(|w| seen.insert(w.clone()));

    if base.url.final_displayed_url.is_empty() {
        match (&base.page_load_error, &base.url.requested_url) {
            (Some(_), Some(requested)) => {
                base.url.final_displayed_url = requested.clone();
            }
            _ => return Err(RunError::MissingFinalUrl),
        }
    }
    Ok(())
}
