//! The validated stage registry.
//!
//! A [`StageRegistry`] is the static DAG a pipeline runs over. It is built
//! once through [`RegistryBuilder`](super::RegistryBuilder), never changes
//! afterwards, and is shared read-only between every run of the pipeline.

use super::builder::validate_specs;
use super::StageSpec;
use crate::core::{CheckpointDecision, PipelineRun, StageId, StageStatus};
use crate::errors::ValidationError;
use std::collections::{HashMap, HashSet, VecDeque};

/// A directed acyclic graph of stage specifications.
#[derive(Debug, Clone)]
pub struct StageRegistry {
    name: String,
    stages: Vec<StageSpec>,
    index: HashMap<StageId, usize>,
    dependents: HashMap<StageId, Vec<StageId>>,
    topological: Vec<StageId>,
}

impl StageRegistry {
    pub(crate) fn from_validated(name: String, stages: Vec<StageSpec>) -> Self {
        let index = stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();

        let mut dependents: HashMap<StageId, Vec<StageId>> =
            stages.iter().map(|s| (s.id.clone(), Vec::new())).collect();
        for spec in &stages {
            for dep in &spec.dependencies {
                if let Some(list) = dependents.get_mut(dep) {
                    list.push(spec.id.clone());
                }
            }
        }

        let topological = topological_sort(&stages);

        Self {
            name,
            stages,
            index,
            dependents,
            topological,
        }
    }

    /// Re-runs the full graph validation.
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`RegistryBuilder::build`](super::RegistryBuilder::build).
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_specs(&self.name, &self.stages)
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if the registry has no stages. Never true for a built
    /// registry.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Returns a stage by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&StageSpec> {
        self.index.get(id).map(|&i| &self.stages[i])
    }

    /// Returns true if the stage is registered.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Stage ids in declaration order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|s| s.id.as_str())
    }

    /// Stage specs in declaration order.
    pub fn stages(&self) -> impl Iterator<Item = &StageSpec> {
        self.stages.iter()
    }

    /// Checkpoint stages in declaration order.
    pub fn checkpoints(&self) -> impl Iterator<Item = &StageSpec> {
        self.stages.iter().filter(|s| s.checkpoint)
    }

    /// Stages that directly depend on `id`, in declaration order.
    #[must_use]
    pub fn dependents(&self, id: &str) -> &[StageId] {
        self.dependents.get(id).map_or(&[][..], Vec::as_slice)
    }

    /// All stage ids in a dependency-respecting order. Ties keep
    /// declaration order.
    #[must_use]
    pub fn topological_order(&self) -> &[StageId] {
        &self.topological
    }

    /// Stages not in `completed` whose dependencies are all in `completed`,
    /// in declaration order.
    #[must_use]
    pub fn ready_stages(&self, completed: &HashSet<StageId>) -> Vec<StageId> {
        self.stages
            .iter()
            .filter(|s| !completed.contains(&s.id))
            .filter(|s| s.dependencies.iter().all(|d| completed.contains(d)))
            .map(|s| s.id.clone())
            .collect()
    }

    /// Stages of `run` whose result may be observed by dependents.
    ///
    /// A stage is satisfied when it succeeded (and, for a checkpoint, was
    /// approved) or when it is skippable and was skipped.
    #[must_use]
    pub fn satisfied_stages(&self, run: &PipelineRun) -> HashSet<StageId> {
        run.results
            .iter()
            .filter(|r| match r.status {
                StageStatus::Succeeded => self.get(&r.stage_id).is_some_and(|spec| {
                    !spec.checkpoint
                        || run.decision_for(&spec.id) == Some(CheckpointDecision::Approved)
                }),
                StageStatus::Skipped => self.get(&r.stage_id).is_some_and(|spec| spec.skippable),
                StageStatus::Failed => false,
            })
            .map(|r| r.stage_id.clone())
            .collect()
    }

    /// Checkpoints of `run` that succeeded and have no decision yet, in
    /// declaration order.
    #[must_use]
    pub fn awaiting_approval(&self, run: &PipelineRun) -> Vec<StageId> {
        self.checkpoints()
            .filter(|spec| {
                run.result_for(&spec.id).is_some_and(|r| r.is_success())
                    && run.decision_for(&spec.id).is_none()
            })
            .map(|spec| spec.id.clone())
            .collect()
    }
}

/// Kahn's algorithm, taking ready stages in declaration order.
fn topological_sort(stages: &[StageSpec]) -> Vec<StageId> {
    let mut in_degree: HashMap<&str, usize> = stages
        .iter()
        .map(|s| (s.id.as_str(), s.dependencies.len()))
        .collect();
    let mut queue: VecDeque<&str> = stages
        .iter()
        .filter(|s| s.dependencies.is_empty())
        .map(|s| s.id.as_str())
        .collect();
    let mut order = Vec::with_capacity(stages.len());

    while let Some(id) = queue.pop_front() {
        order.push(id.to_string());
        for spec in stages {
            if spec.dependencies.iter().any(|d| d == id) {
                if let Some(degree) = in_degree.get_mut(spec.id.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(&spec.id);
                    }
                }
            }
        }
    }

    order
}
