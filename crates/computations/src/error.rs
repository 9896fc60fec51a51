//! Computation-level error type.

use thiserror::Error;

/// Errors returned by a computation's `run` method.
///
/// The engine never retries: any error fails the owning job and cascades to
/// its dependents as Skipped.
#[derive(Debug, Error)]
pub enum ComputationError {
    /// The computation itself reported a failure.
    #[error("computation failed: {0}")]
    Failed(String),

    /// Anything else the computation body bubbled up.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
