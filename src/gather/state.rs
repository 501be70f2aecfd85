//! Per-phase table of in-flight artifact results.

use futures::future::{BoxFuture, FutureExt, Shared};
use pharos_common::{ArtifactError, Phase};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;

/// Outcome of one phase for one artifact.
pub type PhaseResult = Result<Value, ArtifactError>;

/// A phase result that any number of readers can await.
pub type ArtifactFuture = Shared<BoxFuture<'static, PhaseResult>>;

/// Wrap a future so it can be awaited from several places.
pub fn share<F>(future: F) -> ArtifactFuture
where
    F: Future<Output = PhaseResult> + Send + 'static,
{
    future.boxed().shared()
}

/// One cell per phase per artifact, each written exactly once.
#[derive(Default)]
pub struct ArtifactState {
    phases: [HashMap<String, ArtifactFuture>; 5],
}

impl ArtifactState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, phase: Phase, artifact_id: &str) -> Option<ArtifactFuture> {
        self.phases[phase.index()].get(artifact_id).cloned()
    }

    /// Record the result of `phase` for `artifact_id`.
    ///
    /// Returns false, leaving the table untouched, if the cell was already written.
    pub fn insert(&mut self, phase: Phase, artifact_id: &str, future: ArtifactFuture) -> bool {
        let table = &mut self.phases[phase.index()];
        if table.contains_key(artifact_id) {
            return false;
        }
        table.insert(artifact_id.to_string(), future);
        true
    }

    pub fn phase(&self, phase: Phase) -> &HashMap<String, ArtifactFuture> {
        &self.phases[phase.index()]
    }

    pub fn has_run(&self, phase: Phase) -> bool {
        !self.phases[phase.index()].is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_cells_are_written_once() {
        let mut state = ArtifactState::new();
        assert!(state.insert(
            Phase::GetArtifact,
            "A",
            share(async { Ok(json!(1)) })
        ));
        assert!(!state.insert(
            Phase::GetArtifact,
            "A",
            share(async { Ok(json!(2)) })
        ));

        let value = state.get(Phase::GetArtifact, "A").unwrap().await.unwrap();
        assert_eq!(value, json!(1));
        assert!(state.get(Phase::StopInstrumentation, "A").is_none());
    }

    #[tokio::test]
    async fn test_shared_result_can_be_awaited_twice() {
        let mut state = ArtifactState::new();
        state.insert(
            Phase::StartInstrumentation,
            "A",
            share(async {
                Err(ArtifactError::NotCollected {
                    artifact: "A".into(),
                    reason: "test".into(),
                })
            }),
        );

        let first = state.get(Phase::StartInstrumentation, "A").unwrap().await;
        let second = state.get(Phase::StartInstrumentation, "A").unwrap().await;
        assert_eq!(first, second);
        assert!(state.has_run(Phase::StartInstrumentation));
        assert!(!state.has_run(Phase::GetArtifact));
    }
}
