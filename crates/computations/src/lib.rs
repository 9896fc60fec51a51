//! The `Computation` trait and reusable implementations.
//!
//! Every computation a task can reference, caller-supplied closures and test
//! doubles alike, implements [`Computation`]. The engine crate dispatches
//! execution through this trait object and never inspects a computation's
//! internals, only its declared arity.

pub mod error;
pub mod func;
pub mod mock;
pub mod traits;

pub use error::ComputationError;
pub use func::FnComputation;
pub use traits::{Computation, ExecutionContext};
