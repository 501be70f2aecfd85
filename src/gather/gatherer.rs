//! The gatherer trait: capability metadata plus five optional lifecycle methods.

use crate::gather::context::GatherContext;
use anyhow::Result;
use async_trait::async_trait;
use pharos_common::{GatherMode, Phase};
use serde_json::Value;
use std::fmt;

/// Stable name of an artifact kind that other gatherers can depend on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DependencyKey(&'static str);

impl DependencyKey {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for DependencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// What a gatherer can do and what it needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GathererMeta {
    /// Modes the gatherer runs in. Empty means the gatherer is unusable.
    pub supported_modes: Vec<GatherMode>,
    /// Key under which this gatherer's artifact can be depended on.
    pub dependency_key: Option<DependencyKey>,
    /// Keys this gatherer reads from `GatherContext::dependencies`.
    pub dependencies: Vec<DependencyKey>,
}

impl GathererMeta {
    pub fn new(supported_modes: &[GatherMode]) -> Self {
        Self {
            supported_modes: supported_modes.to_vec(),
            ..Self::default()
        }
    }

    pub fn produces(mut self, key: DependencyKey) -> Self {
        self.dependency_key = Some(key);
        self
    }

    pub fn depends_on(mut self, key: DependencyKey) -> Self {
        self.dependencies.push(key);
        self
    }

    pub fn supports(&self, mode: GatherMode) -> bool {
        self.supported_modes.contains(&mode)
    }
}

/// A pluggable collector.
///
/// Every lifecycle method except `get_artifact` defaults to a no-op. One
/// instance serves one run, so instrumentation state may live on `self`.
#[async_trait]
pub trait Gatherer: Send + Sync {
    fn meta(&self) -> GathererMeta;

    async fn start_instrumentation(&self, _context: &GatherContext) -> Result<()> {
        Ok(())
    }

    async fn start_sensitive_instrumentation(&self, _context: &GatherContext) -> Result<()> {
        Ok(())
    }

    async fn stop_sensitive_instrumentation(&self, _context: &GatherContext) -> Result<()> {
        Ok(())
    }

    async fn stop_instrumentation(&self, _context: &GatherContext) -> Result<()> {
        Ok(())
    }

    async fn get_artifact(&self, context: &GatherContext) -> Result<Value>;
}

/// Run the lifecycle method for `phase`. Instrumentation phases yield `Null`.
pub async fn run_gatherer_phase(
    gatherer: &dyn Gatherer,
    phase: Phase,
    context: &GatherContext,
) -> Result<Value> {
    match phase {
        Phase::StartInstrumentation => gatherer.start_instrumentation(context).await?,
        Phase::StartSensitiveInstrumentation => {
            gatherer.start_sensitive_instrumentation(context).await?
        }
        Phase::StopSensitiveInstrumentation => {
            gatherer.stop_sensitive_instrumentation(context).await?
        }
        Phase::StopInstrumentation => gatherer.stop_instrumentation(context).await?,
        Phase::GetArtifact => return gatherer.get_artifact(context).await,
    }
    Ok(Value::Null)
}
