//! Resolving an artifact's declared dependencies from the `getArtifact` table.

use crate::gather::context::Dependencies;
use crate::gather::state::ArtifactFuture;
use pharos_common::ArtifactError;

/// One declared dependency, captured when the dependent's phase is scheduled.
pub struct PendingDependency {
    /// Dependency key the consumer reads it under.
    pub name: String,
    /// Id of the producing artifact.
    pub artifact_id: String,
    /// The producer's `getArtifact` result, if it was scheduled at all.
    pub result: Option<ArtifactFuture>,
}

/// Wait for every dependency to settle and collect their values.
///
/// A dependency that was never scheduled fails with `DependencyDidNotRun`;
/// one that ran and failed fails with `DependencyFailed` carrying its message.
/// The first failure in declaration order wins.
pub async fn resolve_dependencies(
    artifact: &str,
    pending: Vec<PendingDependency>,
) -> Result<Dependencies, ArtifactError> {
    let mut dependencies = Dependencies::new();
    for dependency in pending {
        let Some(result) = dependency.result else {
            return Err(ArtifactError::DependencyDidNotRun {
                artifact: artifact.to_string(),
                name: dependency.name,
                dependency: dependency.artifact_id,
            });
        };
        match result.await {
            Ok(value) => dependencies.insert(dependency.name, value),
            Err(cause) => {
                return Err(ArtifactError::DependencyFailed {
                    artifact: artifact.to_string(),
                    name: dependency.name,
                    dependency: dependency.artifact_id,
                    message: cause.to_string(),
                });
            }
        }
    }
    Ok(dependencies)
}
