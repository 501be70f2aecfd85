//! Size of the layout viewport and the window around it.

use crate::gather::{GatherContext, Gatherer, GathererMeta};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use pharos_common::GatherMode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const VIEWPORT_SCRIPT: &str = r#"({
  innerWidth: window.innerWidth,
  innerHeight: window.innerHeight,
  outerWidth: window.outerWidth,
  outerHeight: window.outerHeight,
  devicePixelRatio: window.devicePixelRatio,
})"#;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    pub inner_width: f64,
    pub inner_height: f64,
    pub outer_width: f64,
    pub outer_height: f64,
    pub device_pixel_ratio: f64,
}

#[derive(Debug, Default)]
pub struct ViewportDimensions;

#[async_trait]
impl Gatherer for ViewportDimensions {
    fn meta(&self) -> GathererMeta {
        GathererMeta::new(&[
            GatherMode::Navigation,
            GatherMode::Timespan,
            GatherMode::Snapshot,
        ])
    }

    async fn get_artifact(&self, context: &GatherContext) -> Result<Value> {
        let value = context
            .driver
            .execution_context()
            .evaluate_isolated(VIEWPORT_SCRIPT)
            .await?;
        let viewport: Viewport = serde_json::from_value(value)
            .context("ViewportDimensions results were not numeric")?;

        let all_finite = [
            viewport.inner_width,
            viewport.inner_height,
            viewport.outer_width,
            viewport.outer_height,
            viewport.device_pixel_ratio,
        ]
        .iter()
        .all(|n| n.is_finite());
        if !all_finite {
            bail!("ViewportDimensions results were not numeric: {viewport:?}");
        }
        Ok(serde_json::to_value(viewport)?)
    }
}
