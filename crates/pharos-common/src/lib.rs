//! Shared domain types for the pharos gather engine.
//!
//! These are the types exchanged with the collaborators around the engine:
//! settings come in from the configuration layer, and `GatherResult` goes out
//! to whatever scores the artifacts.

pub mod artifacts;
pub mod mode;
pub mod settings;

pub use artifacts::{
    ArtifactError, ArtifactOutcome, BaseArtifacts, GatherResult, PageLoadError, UrlInfo,
};
pub use mode::{GatherMode, Phase};
pub use settings::{
    FormFactor, LoadFailureMode, ScreenEmulation, Settings, ThrottlingMethod, ThrottlingSettings,
};
