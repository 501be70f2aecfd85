//! Gather modes and lifecycle phases.

use serde::{Deserialize, Serialize};

/// The three ways a run can observe a page.
///
/// | Mode         | Controller | Instrumentation | Navigation |
/// |--------------|------------|-----------------|------------|
/// | `Navigation` | navigation | all five phases | yes        |
/// | `Timespan`   | timespan   | all five phases | caller-driven |
/// | `Snapshot`   | snapshot   | `getArtifact` only | no      |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatherMode {
    Navigation,
    Timespan,
    Snapshot,
}

impl GatherMode {
    /// Returns all gather modes.
    pub fn all() -> &'static [GatherMode] {
        &[
            GatherMode::Navigation,
            GatherMode::Timespan,
            GatherMode::Snapshot,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GatherMode::Navigation => "navigation",
            GatherMode::Timespan => "timespan",
            GatherMode::Snapshot => "snapshot",
        }
    }
}

impl std::fmt::Display for GatherMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for GatherMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "navigation" => Ok(GatherMode::Navigation),
            "timespan" => Ok(GatherMode::Timespan),
            "snapshot" => Ok(GatherMode::Snapshot),
            _ => anyhow::bail!(
                "Invalid gather mode '{}'. Valid values: navigation, timespan, snapshot",
                s
            ),
        }
    }
}

/// The five gatherer lifecycle phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    /// Begin low-overhead observation.
    StartInstrumentation,
    /// Begin observation that must start right before the critical instant.
    StartSensitiveInstrumentation,
    /// End time-sensitive observation.
    StopSensitiveInstrumentation,
    /// End low-overhead observation.
    StopInstrumentation,
    /// Produce the artifact value.
    GetArtifact,
}

impl Phase {
    /// Returns all phases in execution order.
    pub fn all() -> &'static [Phase] {
        &[
            Phase::StartInstrumentation,
            Phase::StartSensitiveInstrumentation,
            Phase::StopSensitiveInstrumentation,
            Phase::StopInstrumentation,
            Phase::GetArtifact,
        ]
    }

    /// Position of this phase in the fixed lifecycle order.
    pub fn index(&self) -> usize {
        match self {
            Phase::StartInstrumentation => 0,
            Phase::StartSensitiveInstrumentation => 1,
            Phase::StopSensitiveInstrumentation => 2,
            Phase::StopInstrumentation => 3,
            Phase::GetArtifact => 4,
        }
    }

    /// The phase that runs immediately before this one, if any.
    pub fn previous(&self) -> Option<Phase> {
        match self.index() {
            0 => None,
            i => Some(Phase::all()[i - 1]),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::StartInstrumentation => "startInstrumentation",
            Phase::StartSensitiveInstrumentation => "startSensitiveInstrumentation",
            Phase::StopSensitiveInstrumentation => "stopSensitiveInstrumentation",
            Phase::StopInstrumentation => "stopInstrumentation",
            Phase::GetArtifact => "getArtifact",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
