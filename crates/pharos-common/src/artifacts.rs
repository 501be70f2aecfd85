//! Run output: base artifacts, per-artifact outcomes, and the errors they carry.

use crate::mode::{GatherMode, Phase};
use crate::settings::Settings;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Why a page failed to load.
///
/// Variants serialize with a stable `code` so the consuming layer can match on
/// it without parsing messages.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PageLoadError {
    #[error("The page could not be loaded because no document request was observed")]
    NoDocumentRequest,

    #[error("The page failed to load ({error_text})")]
    FailedDocumentRequest { error_text: String },

    #[error("The page returned status code {status_code}")]
    ErroredDocumentRequest { status_code: u16 },

    #[error("The URL provided is insecure ({security_message})")]
    InsecureDocumentRequest { security_message: String },

    #[serde(rename = "CHROME_INTERSTITIAL_ERROR")]
    #[error("The browser prevented the page from loading with an interstitial")]
    ChromeInterstitial,

    #[error("The page provided is not HTML (served as MIME type {mime_type})")]
    NotHtml { mime_type: String },

    #[error("The page did not paint any content")]
    NoFcp,

    #[error("The page stopped responding")]
    PageHung,
}

impl PageLoadError {
    /// Stable identifier for the failure class.
    pub fn code(&self) -> &'static str {
        match self {
            PageLoadError::NoDocumentRequest => "NO_DOCUMENT_REQUEST",
            PageLoadError::FailedDocumentRequest { .. } => "FAILED_DOCUMENT_REQUEST",
            PageLoadError::ErroredDocumentRequest { .. } => "ERRORED_DOCUMENT_REQUEST",
            PageLoadError::InsecureDocumentRequest { .. } => "INSECURE_DOCUMENT_REQUEST",
            PageLoadError::ChromeInterstitial => "CHROME_INTERSTITIAL_ERROR",
            PageLoadError::NotHtml { .. } => "NOT_HTML",
            PageLoadError::NoFcp => "NO_FCP",
            PageLoadError::PageHung => "PAGE_HUNG",
        }
    }
}

/// A captured failure for one artifact.
///
/// Cloneable so one failure can be recorded for every later phase of the same
/// artifact and reported to every dependent.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactError {
    #[error("{artifact} failed during {phase}: {message}")]
    Gatherer {
        artifact: String,
        phase: Phase,
        message: String,
    },

    #[error("Dependency \"{dependency}\" ({name}) of {artifact} did not run")]
    DependencyDidNotRun {
        artifact: String,
        name: String,
        dependency: String,
    },

    #[error("Dependency \"{dependency}\" ({name}) of {artifact} failed with exception: {message}")]
    DependencyFailed {
        artifact: String,
        name: String,
        dependency: String,
        message: String,
    },

    #[error("Gatherer for {artifact} declares no supported modes")]
    MissingMeta { artifact: String },

    #[error("{artifact} was aborted during {phase}: {message}")]
    Aborted {
        artifact: String,
        phase: Phase,
        message: String,
    },

    #[error("{artifact} was not collected: {reason}")]
    NotCollected { artifact: String, reason: String },
}

impl ArtifactError {
    /// Id of the artifact this error was recorded for.
    pub fn artifact(&self) -> &str {
        match self {
            ArtifactError::Gatherer { artifact, .. }
            | ArtifactError::DependencyDidNotRun { artifact, .. }
            | ArtifactError::DependencyFailed { artifact, .. }
            | ArtifactError::MissingMeta { artifact }
            | ArtifactError::Aborted { artifact, .. }
            | ArtifactError::NotCollected { artifact, .. } => artifact,
        }
    }
}

/// Final state of one artifact: a value or the structured error that replaced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactOutcome {
    Value(Value),
    Error(ArtifactError),
}

impl ArtifactOutcome {
    pub fn is_value(&self) -> bool {
        matches!(self, ArtifactOutcome::Value(_))
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            ArtifactOutcome::Value(v) => Some(v),
            ArtifactOutcome::Error(_) => None,
        }
    }

    pub fn error(&self) -> Option<&ArtifactError> {
        match self {
            ArtifactOutcome::Value(_) => None,
            ArtifactOutcome::Error(e) => Some(e),
        }
    }
}

impl From<Result<Value, ArtifactError>> for ArtifactOutcome {
    fn from(result: Result<Value, ArtifactError>) -> Self {
        match result {
            Ok(v) => ArtifactOutcome::Value(v),
            Err(e) => ArtifactOutcome::Error(e),
        }
    }
}

/// URLs observed for the run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlInfo {
    /// URL the caller asked for (navigation mode only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_url: Option<String>,
    /// URL of the document that finished loading after redirects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_document_url: Option<String>,
    /// URL displayed when artifact collection ended.
    #[serde(default)]
    pub final_displayed_url: String,
}

/// Run-level metadata collected outside the gatherer pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseArtifacts {
    pub fetch_time: DateTime<Utc>,
    pub gather_mode: GatherMode,
    pub settings: Settings,
    #[serde(default)]
    pub host_user_agent: String,
    #[serde(default)]
    pub host_product: String,
    /// Rough measure of host CPU speed; `None` when it could not be computed.
    #[serde(default)]
    pub benchmark_index: Option<f64>,
    #[serde(default)]
    pub url: UrlInfo,
    #[serde(default)]
    pub run_warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_load_error: Option<PageLoadError>,
}

impl BaseArtifacts {
    pub fn new(gather_mode: GatherMode, settings: Settings) -> Self {
        Self {
            fetch_time: Utc::now(),
            gather_mode,
            settings,
            host_user_agent: String::new(),
            host_product: String::new(),
            benchmark_index: None,
            url: UrlInfo::default(),
            run_warnings: Vec::new(),
            page_load_error: None,
        }
    }

    /// Add a run warning.
    pub fn warn(&mut self, warning: impl Into<String>) {
        self.run_warnings.push(warning.into());
    }
}

/// Everything one run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatherResult {
    pub base: BaseArtifacts,
    /// Outcome per artifact id, in id order.
    pub artifacts: BTreeMap<String, ArtifactOutcome>,
}

impl GatherResult {
    pub fn get(&self, id: &str) -> Option<&ArtifactOutcome> {
        self.artifacts.get(id)
    }

    /// The value for `id`, if it was collected successfully.
    pub fn value(&self, id: &str) -> Option<&Value> {
        self.artifacts.get(id).and_then(ArtifactOutcome::value)
    }

    /// The error for `id`, if collection failed.
    pub fn error(&self, id: &str) -> Option<&ArtifactError> {
        self.artifacts.get(id).and_then(ArtifactOutcome::error)
    }

    /// Count of successfully collected artifacts.
    pub fn success_count(&self) -> usize {
        self.artifacts.values().filter(|o| o.is_value()).count()
    }

    /// Count of failed artifacts.
    pub fn failure_count(&self) -> usize {
        self.artifacts.len() - self.success_count()
    }
}
