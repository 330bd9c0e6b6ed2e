//! The stage operation trait and its input.
//!
//! An operation is the opaque computation behind a stage (a pillar
//! analysis, typically one or more model-inference calls). The orchestrator
//! never looks inside; it only sees the tagged output or the classified
//! error.

use crate::core::{StageId, StageOutput};
use crate::errors::OperationError;
use crate::utils::RunId;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;

/// Everything a stage operation receives for one attempt.
#[derive(Debug, Clone)]
pub struct StageInput {
    /// The run being executed.
    pub run_id: RunId,
    /// The stage being executed.
    pub stage_id: StageId,
    /// 1-based attempt number.
    pub attempt: u32,
    /// The pipeline input shared by every stage of the run.
    pub pipeline_input: Arc<Value>,
    /// Outputs of the stage's successful dependencies.
    pub dependencies: Arc<BTreeMap<StageId, StageOutput>>,
}

impl StageInput {
    /// Creates the input for the first attempt of a stage.
    #[must_use]
    pub fn new(
        run_id: RunId,
        stage_id: impl Into<StageId>,
        pipeline_input: Arc<Value>,
        dependencies: BTreeMap<StageId, StageOutput>,
    ) -> Self {
        Self {
            run_id,
            stage_id: stage_id.into(),
            attempt: 1,
            pipeline_input,
            dependencies: Arc::new(dependencies),
        }
    }

    /// Returns a copy of this input for another attempt.
    #[must_use]
    pub fn for_attempt(&self, attempt: u32) -> Self {
        Self {
            attempt,
            ..self.clone()
        }
    }

    /// Returns the output of a dependency.
    #[must_use]
    pub fn dependency(&self, stage_id: &str) -> Option<&StageOutput> {
        self.dependencies.get(stage_id)
    }
}

/// An async stage computation.
#[async_trait]
pub trait StageOperation: Send + Sync + Debug {
    /// Executes one attempt.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::Transient`] when a retry may succeed and
    /// [`OperationError::Fatal`] when it will not.
    async fn execute(&self, input: &StageInput) -> Result<StageOutput, OperationError>;
}

/// An operation backed by an async closure.
pub struct FnOperation<F> {
    name: String,
    func: F,
}

impl<F, Fut> FnOperation<F>
where
    F: Fn(StageInput) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StageOutput, OperationError>> + Send,
{
    /// Creates a new closure-backed operation.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnOperation<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnOperation")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> StageOperation for FnOperation<F>
where
    F: Fn(StageInput) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StageOutput, OperationError>> + Send,
{
    async fn execute(&self, input: &StageInput) -> Result<StageOutput, OperationError> {
        (self.func)(input.clone()).await
    }
}
