//! The phase runner: walks artifact definitions through the five lifecycle
//! phases, one phase at a time, with per-artifact failure isolation.
//!
//! Within a phase every applicable gatherer is spawned before any is awaited.
//! An artifact whose earlier phase failed is not invoked again: its later
//! cells resolve to the original error. `getArtifact` additionally waits for
//! the artifact's dependencies to settle.

use crate::driver::Driver;
use crate::errors::DefinitionError;
use crate::gather::context::{Dependencies, GatherContext};
use crate::gather::definition::ArtifactDefinition;
use crate::gather::dependencies::{PendingDependency, resolve_dependencies};
use crate::gather::gatherer::{GathererMeta, run_gatherer_phase};
use crate::gather::state::{ArtifactFuture, ArtifactState, share};
use pharos_common::{ArtifactError, ArtifactOutcome, BaseArtifacts, GatherMode, Phase, Settings};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Runs the lifecycle of one gather run.
pub struct PhaseRunner {
    driver: Arc<Driver>,
    gather_mode: GatherMode,
    settings: Arc<Settings>,
    definitions: Vec<ArtifactDefinition>,
    state: ArtifactState,
    completed: [bool; 5],
}

impl PhaseRunner {
    /// Create a runner. An empty definition list is an engine error.
    pub fn new(
        driver: Arc<Driver>,
        gather_mode: GatherMode,
        settings: Arc<Settings>,
        definitions: Vec<ArtifactDefinition>,
    ) -> Result<Self, DefinitionError> {
        if definitions.is_empty() {
            return Err(DefinitionError::NoArtifacts);
        }
        Ok(Self {
            driver,
            gather_mode,
            settings,
            definitions,
            state: ArtifactState::new(),
            completed: [false; 5],
        })
    }

    pub fn gather_mode(&self) -> GatherMode {
        self.gather_mode
    }

    pub fn state(&self) -> &ArtifactState {
        &self.state
    }

    /// Run `phase` for every applicable artifact and wait for all of them to settle.
    ///
    /// Failures are captured in the state table, never returned.
    pub async fn run_phase(&mut self, phase: Phase, url: &str, base_artifacts: &BaseArtifacts) {
        if self.completed[phase.index()] {
            warn!(target: "gather", %phase, "Phase already ran; skipping");
            return;
        }
        self.completed[phase.index()] = true;

        let started = Instant::now();
        let base_artifacts = Arc::new(base_artifacts.clone());
        let mut launched: Vec<ArtifactFuture> = Vec::new();

        for definition in &self.definitions {
            let Some(meta) = self.applicable_meta(definition) else {
                continue;
            };
            if meta.supported_modes.is_empty() {
                let error = ArtifactError::MissingMeta {
                    artifact: definition.id.clone(),
                };
                self.state
                    .insert(phase, &definition.id, share(async move { Err(error) }));
                continue;
            }

            let prior = phase
                .previous()
                .and_then(|previous| self.state.get(previous, &definition.id));
            let pending = if phase == Phase::GetArtifact {
                self.pending_dependencies(definition)
            } else {
                Vec::new()
            };
            let context = GatherContext {
                driver: self.driver.clone(),
                url: url.to_string(),
                gather_mode: self.gather_mode,
                settings: self.settings.clone(),
                base_artifacts: base_artifacts.clone(),
                dependencies: Dependencies::new(),
            };
            let gatherer = definition.gatherer.clone();
            let id = definition.id.clone();

            let task = tokio::spawn({
                let id = id.clone();
                async move {
                    if let Some(prior) = prior {
                        prior.await?;
                    }
                    let mut context = context;
                    if phase == Phase::GetArtifact {
                        context.dependencies = resolve_dependencies(&id, pending)
                            .await
                            .inspect_err(|e| {
                                warn!(target: "gather", artifact = %id, error = %e, "Dependency unavailable");
                            })?;
                    }

                    debug!(target: "gather", artifact = %id, %phase, "Running phase");
                    run_gatherer_phase(gatherer.as_ref(), phase, &context)
                        .await
                        .map_err(|e| {
                            warn!(target: "gather", artifact = %id, %phase, error = %e, "Gatherer failed");
                            ArtifactError::Gatherer {
                                artifact: id.clone(),
                                phase,
                                message: format!("{e:#}"),
                            }
                        })
                }
            });

            let future = share({
                let id = id.clone();
                async move {
                    task.await.unwrap_or_else(|join_err| {
                        Err(ArtifactError::Aborted {
                            artifact: id,
                            phase,
                            message: join_err.to_string(),
                        })
                    })
                }
            });
            self.state.insert(phase, &id, future.clone());
            launched.push(future);
        }

        let results = futures::future::join_all(launched).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        info!(
            target: "gather",
            %phase,
            artifacts = results.len(),
            failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Phase complete"
        );
    }

    /// Record `getArtifact` as not collected for every applicable artifact.
    ///
    /// Artifacts that already failed keep their original error.
    pub fn skip_get_artifact(&mut self, reason: &str) {
        let phase = Phase::GetArtifact;
        if self.completed[phase.index()] {
            return;
        }
        self.completed[phase.index()] = true;

        for definition in &self.definitions {
            if self.applicable_meta(definition).is_none() {
                continue;
            }
            let prior = self
                .state
                .get(Phase::StopInstrumentation, &definition.id);
            let error = ArtifactError::NotCollected {
                artifact: definition.id.clone(),
                reason: reason.to_string(),
            };
            self.state.insert(
                phase,
                &definition.id,
                share(async move {
                    if let Some(prior) = prior {
                        prior.await?;
                    }
                    Err(error)
                }),
            );
        }
    }

    /// Final outcome of every definition, keyed by artifact id.
    ///
    /// Artifacts that never reached `getArtifact` get a `NotCollected` error
    /// saying why, so every id has an entry.
    pub async fn collect(&self) -> BTreeMap<String, ArtifactOutcome> {
        let mut outcomes = BTreeMap::new();
        for definition in &self.definitions {
            let outcome = match self.state.get(Phase::GetArtifact, &definition.id) {
                Some(result) => ArtifactOutcome::from(result.await),
                None => ArtifactOutcome::Error(self.not_collected(definition)),
            };
            outcomes.insert(definition.id.clone(), outcome);
        }
        outcomes
    }

    fn not_collected(&self, definition: &ArtifactDefinition) -> ArtifactError {
        let meta = definition.meta();
        if meta.supported_modes.is_empty() {
            return ArtifactError::MissingMeta {
                artifact: definition.id.clone(),
            };
        }
        let reason = if meta.supports(self.gather_mode) {
            "the getArtifact phase did not run".to_string()
        } else {
            format!("gatherer does not support {} mode", self.gather_mode)
        };
        ArtifactError::NotCollected {
            artifact: definition.id.clone(),
            reason,
        }
    }

    /// Meta of a definition that takes part in this run's mode. Gatherers
    /// without any mode are returned too, so they can be refused loudly.
    fn applicable_meta(&self, definition: &ArtifactDefinition) -> Option<GathererMeta> {
        let meta = definition.meta();
        (meta.supported_modes.is_empty() || meta.supports(self.gather_mode)).then_some(meta)
    }

    fn pending_dependencies(&self, definition: &ArtifactDefinition) -> Vec<PendingDependency> {
        definition
            .dependencies
            .iter()
            .map(|(name, artifact_id)| PendingDependency {
                name: name.clone(),
                artifact_id: artifact_id.clone(),
                result: self.state.get(Phase::GetArtifact, artifact_id),
            })
            .collect()
    }
}
