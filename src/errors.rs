//! Typed error hierarchy for the gather engine.
//!
//! Top-level enums cover the engine's failure classes:
//! - `ProtocolError`: transport and timeout failures of a single command
//! - `DefinitionError`: invalid artifact definitions, caught before a run starts
//! - `NavigateError`: failures of one navigation attempt
//! - `EvaluateError`: failures of an in-page expression
//! - `RunError`: anything fatal to a whole run
//! - `QuietPeriodError`: why no CPU and network quiet window was found
//!
//! Artifact-level failures are not errors of the run; they are captured as
//! `pharos_common::ArtifactError` values in the result map. Page-load failures
//! use `pharos_common::PageLoadError` so they can be carried on base artifacts.

use pharos_common::PageLoadError;
use std::time::Duration;
use thiserror::Error;

/// Errors from sending one protocol command.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Protocol method {method} timed out after {}ms", timeout.as_millis())]
    Timeout { method: String, timeout: Duration },

    #[error("Protocol error from {method}: {message}")]
    Command {
        method: String,
        code: Option<i64>,
        message: String,
    },

    #[error("Transport closed before {method} received a response")]
    TransportClosed { method: String },

    #[error("Session was disposed before {method} completed")]
    Disposed { method: String },

    #[error("Failed to encode parameters for {method}: {source}")]
    Encode {
        method: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Name of the command that failed, when the failure belongs to one.
    pub fn method(&self) -> Option<&str> {
        match self {
            ProtocolError::Timeout { method, .. }
            | ProtocolError::Command { method, .. }
            | ProtocolError::TransportClosed { method }
            | ProtocolError::Disposed { method }
            | ProtocolError::Encode { method, .. } => Some(method),
            ProtocolError::Io(_) => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ProtocolError::Timeout { .. })
    }
}

/// Errors in the artifact definition list, detected before any phase runs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("No artifacts were defined")]
    NoArtifacts,

    #[error("Duplicate artifact id: {0}")]
    DuplicateId(String),

    #[error("Unknown dependency '{dependency}' in artifact '{artifact}': no artifact with that id exists")]
    UnknownDependency { artifact: String, dependency: String },

    #[error("Artifact '{artifact}' depends on '{dependency}', which is defined after it")]
    ForwardDependency { artifact: String, dependency: String },

    #[error("Cycle detected in artifact dependencies. Involved artifacts: {0:?}")]
    Cycle(Vec<String>),

    #[error("Gatherer for '{0}' declares no supported modes")]
    NoSupportedModes(String),

    #[error("Artifact '{artifact}' requires dependency '{key}' but does not bind it")]
    UnboundDependency { artifact: String, key: String },

    #[error("Artifact '{artifact}' binds unknown dependency key '{key}'")]
    UnexpectedDependency { artifact: String, key: String },

    #[error("Artifact '{artifact}' binds '{key}' to '{dependency}', which does not produce '{key}'")]
    DependencyKeyMismatch {
        artifact: String,
        key: String,
        dependency: String,
    },

    #[error("Artifact '{artifact}' supports {mode} mode but its dependency '{dependency}' does not")]
    ModeMismatch {
        artifact: String,
        dependency: String,
        mode: String,
    },

    #[error("Unknown gatherer '{0}'")]
    UnknownGatherer(String),
}

/// Errors from one navigation attempt.
#[derive(Debug, Error)]
pub enum NavigateError {
    #[error(transparent)]
    PageLoad(#[from] PageLoadError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("No navigations detected")]
    NoNavigationDetected,

    #[error("Cannot wait for FCP without waiting for page load")]
    FcpWithoutLoad,

    #[error("Must wait for at least one navigation condition")]
    NoWaitCondition,

    #[error("Wait was cancelled")]
    WaitCancelled,
}

/// Errors from evaluating an expression in the page.
#[derive(Debug, Error)]
pub enum EvaluateError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Expression failed in the page: {0}")]
    Exception(String),
}

/// Errors that end a whole run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Navigation failed: {0}")]
    Navigation(#[source] NavigateError),

    #[error("No page target available to attach to")]
    NoPageTarget,

    #[error("Run finished without a final displayed URL")]
    MissingFinalUrl,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<NavigateError> for RunError {
    fn from(err: NavigateError) -> Self {
        match err {
            NavigateError::Protocol(e) => RunError::Protocol(e),
            other => RunError::Navigation(other),
        }
    }
}

/// Why no overlapping CPU + network quiet window could be found.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum QuietPeriodError {
    #[error("Neither the CPU nor the network went quiet for long enough before the end of the trace")]
    NoQuietPeriod,

    #[error("The network went quiet but the CPU never went idle for long enough before the end of the trace")]
    NoCpuIdlePeriod,

    #[error("The CPU went idle but the network never went quiet for long enough before the end of the trace")]
    NoNetworkIdlePeriod,
}

impl QuietPeriodError {
    pub fn code(&self) -> &'static str {
        match self {
            QuietPeriodError::NoQuietPeriod => "NO_QUIET_PERIOD",
            QuietPeriodError::NoCpuIdlePeriod => "NO_CPU_IDLE_PERIOD",
            QuietPeriodError::NoNetworkIdlePeriod => "NO_NETWORK_IDLE_PERIOD",
        }
    }
}
