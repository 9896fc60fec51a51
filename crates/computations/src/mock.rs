//! A recording test double for [`Computation`].
//!
//! Useful in unit and integration tests where a real computation is either
//! unavailable or irrelevant. Records every invocation so tests can assert
//! how often (and with what) a task actually ran.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::{Computation, ComputationError, ExecutionContext};

/// Behaviour injected into `MockComputation` at construction time.
pub enum MockBehaviour {
    /// Return specific output values.
    ReturnValues(Vec<Value>),
    /// Sleep, then return specific output values. Exercises worker-slot
    /// backpressure and cancellation windows.
    DelayThenReturn(Duration, Vec<Value>),
    /// Fail with the given message.
    Fail(String),
}

/// A mock computation that records every call it receives and performs a
/// programmer-specified behaviour.
pub struct MockComputation {
    /// Label used in test assertions.
    pub name: String,
    input_arity: usize,
    behaviour: MockBehaviour,
    /// All input sequences seen by this computation (in call order).
    pub calls: Arc<Mutex<Vec<Vec<Value>>>>,
}

impl MockComputation {
    /// Create a mock that always succeeds with the given outputs.
    pub fn returning(name: impl Into<String>, input_arity: usize, outputs: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            input_arity,
            behaviour: MockBehaviour::ReturnValues(outputs),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a mock that sleeps before succeeding with the given outputs.
    pub fn sleeping(
        name: impl Into<String>,
        input_arity: usize,
        delay: Duration,
        outputs: Vec<Value>,
    ) -> Self {
        Self {
            name: name.into(),
            input_arity,
            behaviour: MockBehaviour::DelayThenReturn(delay, outputs),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a mock that always fails with the given message.
    pub fn failing(name: impl Into<String>, input_arity: usize, msg: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input_arity,
            behaviour: MockBehaviour::Fail(msg.into()),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Number of times this computation has been executed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Shared handle to the recorded calls, for assertions after the mock has
    /// been moved into a registry.
    pub fn calls_handle(&self) -> Arc<Mutex<Vec<Vec<Value>>>> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl Computation for MockComputation {
    fn input_arity(&self) -> usize {
        self.input_arity
    }

    fn output_arity(&self) -> usize {
        match &self.behaviour {
            MockBehaviour::ReturnValues(outputs)
            | MockBehaviour::DelayThenReturn(_, outputs) => outputs.len(),
            // Arbitrary: a failing mock never produces outputs.
            MockBehaviour::Fail(_) => 1,
        }
    }

    async fn run(
        &self,
        inputs: Vec<Value>,
        _ctx: &ExecutionContext,
    ) -> Result<Vec<Value>, ComputationError> {
        debug!("mock computation '{}' invoked", self.name);
        self.calls.lock().unwrap().push(inputs);

        match &self.behaviour {
            MockBehaviour::ReturnValues(outputs) => Ok(outputs.clone()),
            MockBehaviour::DelayThenReturn(delay, outputs) => {
                tokio::time::sleep(*delay).await;
                Ok(outputs.clone())
            }
            MockBehaviour::Fail(msg) => Err(ComputationError::Failed(msg.clone())),
        }
    }
}
