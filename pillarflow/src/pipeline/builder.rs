//! Registry builder with validation.

use super::{StageRegistry, StageSpec};
use crate::errors::ValidationError;
use std::collections::{HashMap, HashSet};

/// Builder for creating validated stage registries.
///
/// Stages may be added in any order; the whole graph is validated once, in
/// [`RegistryBuilder::build`].
#[derive(Debug, Clone)]
pub struct RegistryBuilder {
    name: String,
    stages: Vec<StageSpec>,
}

impl RegistryBuilder {
    /// Creates a new builder for the named pipeline.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
        }
    }

    /// Adds a stage.
    #[must_use]
    pub fn stage(mut self, spec: StageSpec) -> Self {
        self.stages.push(spec);
        self
    }

    /// Adds a stage in place.
    pub fn add_stage(&mut self, spec: StageSpec) {
        self.stages.push(spec);
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of stages added so far.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Validates the graph and builds the registry.
    ///
    /// # Errors
    ///
    /// Returns the first problem found, checked in this order: empty
    /// registry, per-stage problems, duplicate ids, unknown dependencies,
    /// cycles.
    pub fn build(self) -> Result<StageRegistry, ValidationError> {
        validate_specs(&self.name, &self.stages)?;
        Ok(StageRegistry::from_validated(self.name, self.stages))
    }
}

/// Validates a full set of stage specs as one graph.
pub(crate) fn validate_specs(name: &str, stages: &[StageSpec]) -> Result<(), ValidationError> {
    if stages.is_empty() {
        return Err(ValidationError::Empty {
            pipeline: name.to_string(),
        });
    }

    let mut ids = HashSet::new();
    for spec in stages {
        spec.validate()?;
        if !ids.insert(spec.id.as_str()) {
            return Err(ValidationError::Duplicate {
                stage: spec.id.clone(),
            });
        }
    }

    for spec in stages {
        if let Some(dep) = spec.dependencies.iter().find(|d| !ids.contains(d.as_str())) {
            return Err(ValidationError::UnknownDependency {
                stage: spec.id.clone(),
                dependency: dep.clone(),
            });
        }
    }

    match detect_cycle(stages) {
        Some(path) => Err(ValidationError::Cycle { path }),
        None => Ok(()),
    }
}

/// Finds a dependency cycle, returning its path with the first stage
/// repeated at the end.
fn detect_cycle(stages: &[StageSpec]) -> Option<Vec<String>> {
    let graph: HashMap<&str, &[String]> = stages
        .iter()
        .map(|s| (s.id.as_str(), s.dependencies.as_slice()))
        .collect();

    let mut visited = HashSet::new();
    let mut on_path = HashSet::new();
    let mut path = Vec::new();

    for spec in stages {
        if !visited.contains(spec.id.as_str()) {
            if let Some(cycle) = dfs_cycle(&graph, &spec.id, &mut visited, &mut on_path, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

fn dfs_cycle<'a>(
    graph: &HashMap<&'a str, &'a [String]>,
    node: &'a str,
    visited: &mut HashSet<&'a str>,
    on_path: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    visited.insert(node);
    on_path.insert(node);
    path.push(node);

    for dep in graph.get(node).copied().unwrap_or_default() {
        let dep = dep.as_str();
        if on_path.contains(dep) {
            let start = path.iter().position(|n| *n == dep).unwrap_or(0);
            let mut cycle: Vec<String> = path[start..].iter().map(|s| (*s).to_string()).collect();
            cycle.push(dep.to_string());
            return Some(cycle);
        }
        if !visited.contains(dep) {
            if let Some(cycle) = dfs_cycle(graph, dep, visited, on_path, path) {
                return Some(cycle);
            }
        }
    }

    path.pop();
    on_path.remove(node);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StageOperation;
    use crate::testing::StaticOperation;
    use std::sync::Arc;

    fn stage(id: &str, deps: &[&str]) -> StageSpec {
        let op: Arc<dyn StageOperation> = Arc::new(StaticOperation::score(0.5));
        StageSpec::new(id, op).with_dependencies(deps.iter().copied())
    }

    #[test]
    fn test_builder_creation() {
        let builder = RegistryBuilder::new("test");
        assert_eq!(builder.name(), "test");
        assert_eq!(builder.stage_count(), 0);
    }

    #[test]
    fn test_empty_build() {
        let err = RegistryBuilder::new("test").build().unwrap_err();
        assert_eq!(err.code(), "PIPELINE-EMPTY");
    }

    #[test]
    fn test_stages_may_be_declared_before_their_dependencies() {
        let registry = RegistryBuilder::new("test")
            .stage(stage("b", &["a"]))
            .stage(stage("a", &[]))
            .build()
            .unwrap();
        assert_eq!(registry.topological_order(), ["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_missing_dependency() {
        let err = RegistryBuilder::new("test")
            .stage(stage("a", &["missing"]))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnknownDependency {
                stage: "a".into(),
                dependency: "missing".into()
            }
        );
    }

    #[test]
    fn test_duplicate_stage() {
        let err = RegistryBuilder::new("test")
            .stage(stage("a", &[]))
            .stage(stage("a", &[]))
            .build()
            .unwrap_err();
        assert_eq!(err, ValidationError::Duplicate { stage: "a".into() });
    }

    #[test]
    fn test_cycle_detection_reports_path() {
        let err = RegistryBuilder::new("test")
            .stage(stage("a", &["c"]))
            .stage(stage("b", &["a"]))
            .stage(stage("c", &["b"]))
            .build()
            .unwrap_err();

        let ValidationError::Cycle { path } = &err else {
            panic!("expected cycle, got {err:?}");
        };
        assert_eq!(path.first(), path.last());
        assert_eq!(path.len(), 4);
        for id in ["a", "b", "c"] {
            assert!(path.iter().any(|p| p == id));
        }
    }

    #[test]
    fn test_cycle_below_acyclic_root() {
        let err = RegistryBuilder::new("test")
            .stage(stage("root", &[]))
            .stage(stage("x", &["root", "y"]))
            .stage(stage("y", &["x"]))
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::Cycle { .. }));
    }

    #[test]
    fn test_add_stage_in_place() {
        let mut builder = RegistryBuilder::new("test");
        builder.add_stage(stage("a", &[]));
        assert_eq!(builder.stage_count(), 1);
        assert!(builder.build().is_ok());
    }
}
