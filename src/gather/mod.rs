//! The gather engine: gatherer contract, definitions, and the phase runner.

pub mod base_artifacts;
pub mod context;
pub mod definition;
pub mod dependencies;
pub mod gatherer;
pub mod runner;
pub mod state;

pub use base_artifacts::{collect_base_artifacts, finalize_base_artifacts};
pub use context::{Dependencies, GatherContext};
pub use definition::{ArtifactDefinition, validate_definitions};
pub use dependencies::{PendingDependency, resolve_dependencies};
pub use gatherer::{DependencyKey, Gatherer, GathererMeta, run_gatherer_phase};
pub use runner::PhaseRunner;
pub use state::{ArtifactFuture, ArtifactState, PhaseResult};
