//! Declarative workflow orchestration: data nodes, tasks, scenario graphs,
//! and a bounded-worker job scheduler.
//!
//! Callers declare data nodes, computations, tasks and scenarios in a
//! [`ConfigBuilder`], freeze them into an [`EngineConfig`], and hand the
//! config plus a process-wide [`WorkerPool`] to a [`ScenarioManager`],
//! the in-process API everything else (CLI, UI, REST) would sit on.

pub mod config;
pub mod error;
pub mod graph;
pub mod scenario;
pub mod scheduler;
pub mod store;

pub use config::{
    Comparator, ConfigBuilder, DataNodeConfig, EngineConfig, PipelineConfig, ScenarioConfig,
    StoragePolicy, TaskConfig,
};
pub use error::EngineError;
pub use graph::TaskGraph;
pub use scenario::{ScenarioInstance, ScenarioManager};
pub use scheduler::{
    ExecutionMode, JobExecutionConfig, JobInstance, JobState, Scheduler, Submission,
    SubmissionStatus, WorkerPool,
};
pub use store::{DataNodeSnapshot, DataNodeStore, WriteSource};

#[cfg(test)]
mod scheduler_tests;
