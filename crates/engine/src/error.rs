//! Engine-level error types.

use thiserror::Error;
use uuid::Uuid;

/// Errors produced by the orchestration engine (configuration, graph build,
/// data-node access, scenario operations).
///
/// Task-level execution failures are *not* surfaced through this enum when a
/// submission runs: they are recorded on the owning `JobInstance` and cascade
/// to dependents as Skipped. `submit` only returns an error for problems
/// discovered before any job starts.
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Configuration errors (fail fast at registration) ------

    /// An id was re-registered with a definition that differs from the
    /// existing one. Re-registering an *identical* definition is a no-op.
    #[error("conflicting {kind} definition for id '{id}'")]
    ConflictingDefinition {
        kind: &'static str,
        id: String,
    },

    /// A task's data-node reference count does not match its computation's
    /// declared arity.
    #[error(
        "task '{task}': computation '{computation}' declares {declared} {side}(s) \
         but the task references {referenced}"
    )]
    ArityMismatch {
        task: String,
        computation: String,
        side: &'static str,
        declared: usize,
        referenced: usize,
    },

    /// A registration referenced a data node that doesn't exist.
    #[error("unknown data node '{0}'")]
    UnknownDataNode(String),

    /// A registration referenced a computation that doesn't exist.
    #[error("unknown computation '{0}'")]
    UnknownComputation(String),

    /// A registration referenced a task that doesn't exist.
    #[error("unknown task '{0}'")]
    UnknownTask(String),

    /// A scenario referenced a pipeline that doesn't exist.
    #[error("unknown pipeline '{0}'")]
    UnknownPipeline(String),

    /// An operation referenced a scenario config that doesn't exist.
    #[error("unknown scenario config '{0}'")]
    UnknownScenario(String),

    // ------ Graph build errors ------

    /// The task graph of a scenario is not acyclic.
    #[error("scenario '{scenario}' contains a cycle: {}", cycle.join(" -> "))]
    CycleDetected {
        scenario: String,
        /// Task ids along the offending cycle, ending where it starts.
        cycle: Vec<String>,
    },

    /// Two tasks both declare the same data node as an output.
    #[error("data node '{data_node}' is produced by both '{first}' and '{second}'")]
    ConflictingProducer {
        data_node: String,
        first: String,
        second: String,
    },

    // ------ Data-node access errors ------

    /// A data node was read before any write (including a config default)
    /// occurred.
    #[error("data node '{data_node}' of scenario instance {instance} has never been written")]
    NotWritten {
        instance: Uuid,
        data_node: String,
    },

    /// Two distinct tasks wrote the same data node within one scenario
    /// instance. The graph guarantees one producer per node, so this is a
    /// caller programming error the store refuses to mask.
    #[error(
        "data node '{data_node}' already written by task '{current}', \
         refusing write from task '{attempted}'"
    )]
    ConflictingWriter {
        data_node: String,
        current: String,
        attempted: String,
    },

    // ------ Scenario errors ------

    /// `write_input` targeted a data node that a task produces.
    #[error("data node '{data_node}' is produced by task '{producer}' and cannot be written externally")]
    ReadOnlyDataNode {
        data_node: String,
        producer: String,
    },

    /// `compare` was called with no scenario instances at all.
    #[error("comparison requires at least one scenario instance")]
    EmptyComparison,

    /// `compare` was called for a data node with no configured comparator.
    #[error("scenario '{scenario}' has no comparator registered for data node '{data_node}'")]
    NoComparatorRegistered {
        scenario: String,
        data_node: String,
    },

    /// An operation referenced a scenario instance id the manager doesn't own.
    #[error("unknown scenario instance {0}")]
    UnknownInstance(Uuid),

    /// `compare` was given instances created from different scenario configs.
    #[error("cannot compare instances of scenario '{found}' against scenario '{expected}'")]
    ScenarioConfigMismatch {
        expected: String,
        found: String,
    },

    // ------ Execution errors ------

    /// A computation failed (or returned the wrong number of outputs).
    /// Recorded on the JobInstance; only returned directly by APIs that run a
    /// computation outside a submission.
    #[error("task '{task}' failed: {message}")]
    TaskExecution {
        task: String,
        message: String,
    },
}
