//! Artifact definitions and their construction-time validation.
//!
//! A definition binds a gatherer instance to an output id and maps each
//! dependency key the gatherer reads to the id of the artifact producing it.

use crate::errors::DefinitionError;
use crate::gather::gatherer::{Gatherer, GathererMeta};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// One artifact to collect.
#[derive(Clone)]
pub struct ArtifactDefinition {
    pub id: String,
    pub gatherer: Arc<dyn Gatherer>,
    /// Dependency key → id of the producing artifact.
    pub dependencies: BTreeMap<String, String>,
}

impl ArtifactDefinition {
    pub fn new(id: impl Into<String>, gatherer: Arc<dyn Gatherer>) -> Self {
        Self {
            id: id.into(),
            gatherer,
            dependencies: BTreeMap::new(),
        }
    }

    pub fn with_dependency(mut self, key: impl Into<String>, artifact_id: impl Into<String>) -> Self {
        self.dependencies.insert(key.into(), artifact_id.into());
        self
    }

    pub fn meta(&self) -> GathererMeta {
        self.gatherer.meta()
    }
}

impl fmt::Debug for ArtifactDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactDefinition")
            .field("id", &self.id)
            .field("dependencies", &self.dependencies)
            .finish_non_exhaustive()
    }
}

/// Validate a definition list before any phase runs.
///
/// Checks, in order:
/// - the list is non-empty and ids are unique
/// - every gatherer declares at least one mode
/// - dependencies name existing artifacts and form no cycle
/// - dependencies only point to earlier definitions
/// - every declared dependency key is bound, and only declared keys are bound
/// - the bound producer emits that key and supports every mode the consumer does
pub fn validate_definitions(definitions: &[ArtifactDefinition]) -> Result<(), DefinitionError> {
    if definitions.is_empty() {
        return Err(DefinitionError::NoArtifacts);
    }

    let mut index_map: HashMap<&str, usize> = HashMap::new();
    for (i, definition) in definitions.iter().enumerate() {
        if index_map.insert(definition.id.as_str(), i).is_some() {
            return Err(DefinitionError::DuplicateId(definition.id.clone()));
        }
    }

    let metas: Vec<GathererMeta> = definitions.iter().map(ArtifactDefinition::meta).collect();
    for (definition, meta) in definitions.iter().zip(&metas) {
        if meta.supported_modes.is_empty() {
            return Err(DefinitionError::NoSupportedModes(definition.id.clone()));
        }
    }

    // Edges: producer -> consumer.
    let mut forward_edges: Vec<Vec<usize>> = vec![Vec::new(); definitions.len()];
    let mut reverse_edges: Vec<Vec<usize>> = vec![Vec::new(); definitions.len()];
    for (to_idx, definition) in definitions.iter().enumerate() {
        for dependency in definition.dependencies.values() {
            let from_idx = *index_map.get(dependency.as_str()).ok_or_else(|| {
                DefinitionError::UnknownDependency {
                    artifact: definition.id.clone(),
                    dependency: dependency.clone(),
                }
            })?;
            forward_edges[from_idx].push(to_idx);
            reverse_edges[to_idx].push(from_idx);
        }
    }
    validate_no_cycles(definitions, &forward_edges, &reverse_edges)?;

    for (to_idx, definition) in definitions.iter().enumerate() {
        let meta = &metas[to_idx];
        let declared: HashSet<&str> = meta.dependencies.iter().map(|k| k.as_str()).collect();

        for key in &meta.dependencies {
            if !definition.dependencies.contains_key(key.as_str()) {
                return Err(DefinitionError::UnboundDependency {
                    artifact: definition.id.clone(),
                    key: key.to_string(),
                });
            }
        }

        for (key, dependency) in &definition.dependencies {
            if !declared.contains(key.as_str()) {
                return Err(DefinitionError::UnexpectedDependency {
                    artifact: definition.id.clone(),
                    key: key.clone(),
                });
            }

            let from_idx = index_map[dependency.as_str()];
            if from_idx >= to_idx {
                return Err(DefinitionError::ForwardDependency {
                    artifact: definition.id.clone(),
                    dependency: dependency.clone(),
                });
            }

            let producer = &metas[from_idx];
            if producer.dependency_key.map(|k| k.as_str()) != Some(key.as_str()) {
                return Err(DefinitionError::DependencyKeyMismatch {
                    artifact: definition.id.clone(),
                    key: key.clone(),
                    dependency: dependency.clone(),
                });
            }

            if let Some(mode) = meta
                .supported_modes
                .iter()
                .find(|mode| !producer.supports(**mode))
            {
                return Err(DefinitionError::ModeMismatch {
                    artifact: definition.id.clone(),
                    dependency: dependency.clone(),
                    mode: mode.to_string(),
                });
            }
        }
    }

    Ok(())
}

/// Kahn's algorithm over the dependency edges.
fn validate_no_cycles(
    definitions: &[ArtifactDefinition],
    forward_edges: &[Vec<usize>],
    reverse_edges: &[Vec<usize>],
) -> Result<(), DefinitionError> {
    let mut in_degree: Vec<usize> = reverse_edges.iter().map(Vec::len).collect();
    let mut queue: Vec<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|&(_, deg)| *deg == 0)
        .map(|(i, _)| i)
        .collect();

    let mut processed = 0;
    while let Some(node) = queue.pop() {
        processed += 1;
        for &dependent in &forward_edges[node] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                queue.push(dependent);
            }
        }
    }

    if processed != definitions.len() {
        let involved = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg > 0)
            .map(|(i, _)| definitions[i].id.clone())
            .collect();
        return Err(DefinitionError::Cycle(involved));
    }
    Ok(())
}
