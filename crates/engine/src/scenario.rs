//! Scenario management, the engine's front door.
//!
//! Owns scenario instances (an isolated set of data-node cells plus a built
//! task graph), forwards reads and external writes to the store, hands
//! submissions to the scheduler, and applies configured comparators across
//! sibling instances.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::graph::TaskGraph;
use crate::scheduler::{Scheduler, Submission, WorkerPool};
use crate::store::{DataNodeSnapshot, DataNodeStore, WriteSource};
use crate::EngineError;

/// One materialized scenario: isolated data-node cells (held by the store,
/// keyed by this instance's id) plus the built graph. Instances are never
/// destroyed automatically.
#[derive(Debug, Clone)]
pub struct ScenarioInstance {
    pub id: Uuid,
    pub config_id: String,
    pub created_at: DateTime<Utc>,
    graph: Arc<TaskGraph>,
}

impl ScenarioInstance {
    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }
}

/// Owns every scenario instance and submission handle in the process.
pub struct ScenarioManager {
    config: Arc<EngineConfig>,
    store: Arc<DataNodeStore>,
    scheduler: Scheduler,
    instances: RwLock<HashMap<Uuid, ScenarioInstance>>,
    submissions: RwLock<HashMap<Uuid, Submission>>,
}

impl ScenarioManager {
    /// Create a manager over a frozen config and the process-wide pool.
    ///
    /// The pool is shared across every submission this manager (or any other
    /// holder of the same pool) starts.
    pub fn new(config: Arc<EngineConfig>, pool: Arc<WorkerPool>) -> Self {
        let store = Arc::new(DataNodeStore::new());
        let scheduler = Scheduler::new(Arc::clone(&config), Arc::clone(&store), pool);
        Self {
            config,
            store,
            scheduler,
            instances: RwLock::new(HashMap::new()),
            submissions: RwLock::new(HashMap::new()),
        }
    }

    /// Materialize a new instance of `scenario_config_id`: build the graph,
    /// create one data-node cell per referenced config (defaults count as the
    /// initial write). Runs nothing.
    pub fn create_scenario(&self, scenario_config_id: &str) -> Result<Uuid, EngineError> {
        let graph = Arc::new(TaskGraph::build(scenario_config_id, &self.config)?);
        let instance_id = Uuid::new_v4();

        for node_id in graph.data_node_ids() {
            let node_config = self
                .config
                .data_node(&node_id)
                .ok_or_else(|| EngineError::UnknownDataNode(node_id.clone()))?;
            self.store.create(node_config, instance_id);
        }

        let instance = ScenarioInstance {
            id: instance_id,
            config_id: scenario_config_id.to_owned(),
            created_at: Utc::now(),
            graph,
        };
        self.instances.write().unwrap().insert(instance_id, instance);

        info!(scenario = scenario_config_id, instance = %instance_id, "scenario instantiated");
        Ok(instance_id)
    }

    /// Snapshot of an instance's metadata and graph.
    pub fn instance(&self, instance_id: Uuid) -> Result<ScenarioInstance, EngineError> {
        self.instances
            .read()
            .unwrap()
            .get(&instance_id)
            .cloned()
            .ok_or(EngineError::UnknownInstance(instance_id))
    }

    /// Write a true external input (a data node no task produces). Writing a
    /// produced node fails with `ReadOnlyDataNode`.
    pub fn write_input(
        &self,
        instance_id: Uuid,
        node_id: &str,
        value: Value,
    ) -> Result<(), EngineError> {
        let instance = self.instance(instance_id)?;
        if let Some(producer) = instance.graph.producer_of(node_id) {
            return Err(EngineError::ReadOnlyDataNode {
                data_node: node_id.to_owned(),
                producer: instance.graph.nodes()[producer].task.id.clone(),
            });
        }
        self.store
            .write(instance_id, node_id, value, WriteSource::External)
    }

    /// Current value of a data node; `NotWritten` if nothing (not even a
    /// default) was ever written.
    pub fn read(&self, instance_id: Uuid, node_id: &str) -> Result<Value, EngineError> {
        self.instance(instance_id)?;
        self.store.read(instance_id, node_id)
    }

    /// Version/timestamp view of a data node.
    pub fn data_node(
        &self,
        instance_id: Uuid,
        node_id: &str,
    ) -> Result<DataNodeSnapshot, EngineError> {
        self.instance(instance_id)?;
        self.store.snapshot(instance_id, node_id)
    }

    /// Start executing the instance's graph and return the handle without
    /// waiting.
    pub fn submit_async(&self, instance_id: Uuid) -> Result<Submission, EngineError> {
        let instance = self.instance(instance_id)?;
        let submission = self.scheduler.submit(Arc::clone(&instance.graph), instance_id)?;
        self.submissions
            .write()
            .unwrap()
            .insert(submission.id(), submission.clone());
        Ok(submission)
    }

    /// Submit and block until every job reaches a terminal state. Task-level
    /// failures do not error; inspect the returned handle.
    pub async fn submit(&self, instance_id: Uuid) -> Result<Submission, EngineError> {
        let submission = self.submit_async(instance_id)?;
        submission.wait().await;
        Ok(submission)
    }

    /// Look up a submission handle by id.
    pub fn submission(&self, submission_id: Uuid) -> Option<Submission> {
        self.submissions.read().unwrap().get(&submission_id).cloned()
    }

    /// Every submission started for `instance_id`, in no particular order.
    pub fn submissions_for(&self, instance_id: Uuid) -> Vec<Submission> {
        self.submissions
            .read()
            .unwrap()
            .values()
            .filter(|submission| submission.scenario_instance_id() == instance_id)
            .cloned()
            .collect()
    }

    /// Apply the comparator registered for `node_id` in the instances' shared
    /// scenario config to the node's current values, in the order the
    /// instances are supplied. The comparator's result is returned unmodified.
    pub fn compare(&self, node_id: &str, instance_ids: &[Uuid]) -> Result<Value, EngineError> {
        let first_id = instance_ids
            .first()
            .copied()
            .ok_or(EngineError::EmptyComparison)?;
        let config_id = self.instance(first_id)?.config_id;

        let mut values = Vec::with_capacity(instance_ids.len());
        for &instance_id in instance_ids {
            let instance = self.instance(instance_id)?;
            if instance.config_id != config_id {
                return Err(EngineError::ScenarioConfigMismatch {
                    expected: config_id,
                    found: instance.config_id,
                });
            }
            values.push(self.store.read(instance_id, node_id)?);
        }

        let scenario = self
            .config
            .scenario(&config_id)
            .ok_or_else(|| EngineError::UnknownScenario(config_id.clone()))?;
        let comparator = scenario.comparators.get(node_id).ok_or_else(|| {
            EngineError::NoComparatorRegistered {
                scenario: config_id.clone(),
                data_node: node_id.to_owned(),
            }
        })?;

        Ok(comparator(&values))
    }
}

impl std::fmt::Debug for ScenarioManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScenarioManager")
            .field("instances", &self.instances.read().unwrap().len())
            .field("submissions", &self.submissions.read().unwrap().len())
            .finish()
    }
}
