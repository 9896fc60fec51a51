//! The contract every task computation must fulfil.

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::ComputationError;

/// Shared context passed to every computation during execution.
///
/// Defined here (in the computations crate) so both the engine and individual
/// computation implementations can import it without a circular dependency.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// ID of the scenario instance this job belongs to.
    pub scenario_instance_id: uuid::Uuid,
    /// ID of the current job.
    pub job_id: uuid::Uuid,
    /// ID of the task config the job was created from.
    pub task_id: String,
    /// Cooperative cancellation signal for the owning submission.
    ///
    /// A long-running computation may poll or await this token and bail out
    /// early; one that ignores it runs to completion, but the engine discards
    /// its outputs once the submission has been cancelled.
    pub cancellation: CancellationToken,
}

/// The core computation trait.
///
/// A computation takes an ordered sequence of opaque values (one per declared
/// input data node) and returns an ordered sequence of opaque values (one per
/// declared output data node). The engine validates the declared arities
/// against the task's data-node references at registration time.
#[async_trait]
pub trait Computation: Send + Sync {
    /// Number of input values `run` expects.
    fn input_arity(&self) -> usize;

    /// Number of output values `run` promises to return.
    fn output_arity(&self) -> usize;

    /// Execute the computation with the current values of the task's declared
    /// inputs, in declaration order, and return one value per declared output.
    async fn run(
        &self,
        inputs: Vec<Value>,
        ctx: &ExecutionContext,
    ) -> Result<Vec<Value>, ComputationError>;
}
