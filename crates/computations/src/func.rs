//! Adapter turning a plain closure into a [`Computation`].
//!
//! Most callers declare tasks from ordinary functions (double a number, add a
//! constant); this wrapper carries the declared arity next to the closure so
//! the engine can validate task references against it.

use async_trait::async_trait;
use serde_json::Value;

use crate::{Computation, ComputationError, ExecutionContext};

type BoxedFn = Box<dyn Fn(Vec<Value>) -> Result<Vec<Value>, ComputationError> + Send + Sync>;

/// A synchronous closure with an explicit input/output arity.
pub struct FnComputation {
    input_arity: usize,
    output_arity: usize,
    func: BoxedFn,
}

impl FnComputation {
    /// Wrap a closure over ordered value sequences.
    pub fn new<F>(input_arity: usize, output_arity: usize, func: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Vec<Value>, ComputationError> + Send + Sync + 'static,
    {
        Self {
            input_arity,
            output_arity,
            func: Box::new(func),
        }
    }

    /// Convenience for the common one-in, one-out shape.
    pub fn unary<F>(func: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        Self::new(1, 1, move |mut inputs| {
            let input = inputs.pop().ok_or_else(|| {
                ComputationError::Failed("unary computation received no input".into())
            })?;
            Ok(vec![func(input)])
        })
    }
}

#[async_trait]
impl Computation for FnComputation {
    fn input_arity(&self) -> usize {
        self.input_arity
    }

    fn output_arity(&self) -> usize {
        self.output_arity
    }

    async fn run(
        &self,
        inputs: Vec<Value>,
        _ctx: &ExecutionContext,
    ) -> Result<Vec<Value>, ComputationError> {
        (self.func)(inputs)
    }
}

impl std::fmt::Debug for FnComputation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnComputation")
            .field("input_arity", &self.input_arity)
            .field("output_arity", &self.output_arity)
            .finish()
    }
}
