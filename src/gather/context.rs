//! The argument every lifecycle method receives.

use crate::driver::Driver;
use crate::gather::gatherer::DependencyKey;
use anyhow::{Context, Result};
use pharos_common::{BaseArtifacts, GatherMode, Settings};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Resolved dependency values, keyed by dependency key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dependencies {
    values: BTreeMap<String, Value>,
}

impl Dependencies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Raw value of a dependency.
    pub fn get(&self, key: DependencyKey) -> Option<&Value> {
        self.values.get(key.as_str())
    }

    /// A dependency deserialized into the type its producer emits.
    pub fn typed<T: DeserializeOwned>(&self, key: DependencyKey) -> Result<T> {
        let value = self
            .get(key)
            .with_context(|| format!("Dependency {key} was not provided"))?;
        serde_json::from_value(value.clone())
            .with_context(|| format!("Dependency {key} has an unexpected shape"))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Everything a gatherer can see during one phase.
#[derive(Clone)]
pub struct GatherContext {
    pub driver: Arc<Driver>,
    /// URL the page displayed when the phase started.
    pub url: String,
    pub gather_mode: GatherMode,
    pub settings: Arc<Settings>,
    /// Base artifacts as they stood when the phase started.
    pub base_artifacts: Arc<BaseArtifacts>,
    /// Empty outside `getArtifact`.
    pub dependencies: Dependencies,
}
