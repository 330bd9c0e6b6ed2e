//! Scripted stage operations for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::core::{StageId, StageOutput};
use crate::errors::OperationError;
use crate::pipeline::{StageInput, StageOperation};

/// An operation that always returns the same output.
#[derive(Debug)]
pub struct StaticOperation {
    output: StageOutput,
    calls: AtomicUsize,
}

impl StaticOperation {
    /// Creates an operation returning `output`.
    #[must_use]
    pub fn new(output: StageOutput) -> Self {
        Self {
            output,
            calls: AtomicUsize::new(0),
        }
    }

    /// Creates an operation returning a bare score.
    #[must_use]
    pub fn score(value: f64) -> Self {
        Self::new(StageOutput::score(value))
    }

    /// Returns the number of times the operation was called.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageOperation for StaticOperation {
    async fn execute(&self, _input: &StageInput) -> Result<StageOutput, OperationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.output.clone())
    }
}

/// An operation that plays back a fixed sequence of outcomes.
///
/// Once the script runs out the last outcome repeats.
#[derive(Debug)]
pub struct ScriptedOperation {
    script: Mutex<VecDeque<Result<StageOutput, OperationError>>>,
    last: Mutex<Option<Result<StageOutput, OperationError>>>,
    calls: AtomicUsize,
}

impl ScriptedOperation {
    /// Creates an operation from a sequence of outcomes.
    #[must_use]
    pub fn new(script: impl IntoIterator<Item = Result<StageOutput, OperationError>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    /// Returns the number of times the operation was called.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageOperation for ScriptedOperation {
    async fn execute(&self, _input: &StageInput) -> Result<StageOutput, OperationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().pop_front();
        let mut last = self.last.lock();
        match next {
            Some(outcome) => {
                *last = Some(outcome.clone());
                outcome
            }
            None => last
                .clone()
                .unwrap_or_else(|| Err(OperationError::fatal("empty script"))),
        }
    }
}

/// An operation that always fails.
#[derive(Debug)]
pub struct FailingOperation {
    error: OperationError,
    calls: AtomicUsize,
}

impl FailingOperation {
    /// Creates an operation failing with a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            error: OperationError::transient(message),
            calls: AtomicUsize::new(0),
        }
    }

    /// Creates an operation failing with a fatal error.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            error: OperationError::fatal(message),
            calls: AtomicUsize::new(0),
        }
    }

    /// Returns the number of times the operation was called.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageOperation for FailingOperation {
    async fn execute(&self, _input: &StageInput) -> Result<StageOutput, OperationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

/// An operation that sleeps before returning its output.
#[derive(Debug)]
pub struct SlowOperation {
    delay: Duration,
    output: StageOutput,
    calls: AtomicUsize,
}

impl SlowOperation {
    /// Creates a slow operation.
    #[must_use]
    pub fn new(delay: Duration, output: StageOutput) -> Self {
        Self {
            delay,
            output,
            calls: AtomicUsize::new(0),
        }
    }

    /// Creates a slow operation with delay in milliseconds.
    #[must_use]
    pub fn with_delay_ms(ms: u64, output: StageOutput) -> Self {
        Self::new(Duration::from_millis(ms), output)
    }

    /// Returns the number of times the operation was called.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageOperation for SlowOperation {
    async fn execute(&self, _input: &StageInput) -> Result<StageOutput, OperationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(self.output.clone())
    }
}

/// One invocation seen by a [`RecordingOperation`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedInvocation {
    /// Stage the invocation was for.
    pub stage_id: StageId,
    /// Attempt number.
    pub attempt: u32,
    /// Ids of the dependency outputs handed in, sorted.
    pub dependencies: Vec<StageId>,
}

/// An operation that records its inputs and tracks how many invocations
/// overlap.
#[derive(Debug)]
pub struct RecordingOperation {
    output: StageOutput,
    delay: Duration,
    invocations: Mutex<Vec<RecordedInvocation>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingOperation {
    /// Creates a recording operation returning `output` after `delay`.
    #[must_use]
    pub fn new(output: StageOutput, delay: Duration) -> Self {
        Self {
            output,
            delay,
            invocations: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Returns every recorded invocation in call order.
    #[must_use]
    pub fn invocations(&self) -> Vec<RecordedInvocation> {
        self.invocations.lock().clone()
    }

    /// Returns the largest number of invocations seen running at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageOperation for RecordingOperation {
    async fn execute(&self, input: &StageInput) -> Result<StageOutput, OperationError> {
        self.invocations.lock().push(RecordedInvocation {
            stage_id: input.stage_id.clone(),
            attempt: input.attempt,
            dependencies: input.dependencies.keys().cloned().collect(),
        });
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(self.output.clone())
    }
}
