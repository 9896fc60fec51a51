//! Configuration model for the orchestration engine.
//!
//! These types are the source of truth for what data nodes, tasks, pipelines
//! and scenarios look like. Callers collect them in a [`ConfigBuilder`], an
//! explicit value rather than a process-wide singleton, and freeze them into an
//! immutable [`EngineConfig`] that every component constructor receives.
//!
//! All reference and arity validation happens at registration time: nothing
//! is ever partially registered, and a config that builds cannot fail later
//! for structural reasons.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use computations::Computation;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::EngineError;

// ---------------------------------------------------------------------------
// Data nodes
// ---------------------------------------------------------------------------

/// Where a data node's value should live.
///
/// The engine keeps every value in memory either way; `Persisted` is recorded
/// for the (external) persistence collaborator to act on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoragePolicy {
    #[default]
    InMemory,
    Persisted,
}

/// Declaration of a named, typed storage cell. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataNodeConfig {
    /// Unique identifier, referenced by tasks and comparators.
    pub id: String,
    /// Initial value; counts as the instance's first write when present.
    pub default: Option<Value>,
    pub storage: StoragePolicy,
}

impl DataNodeConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            default: None,
            storage: StoragePolicy::default(),
        }
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn with_storage(mut self, storage: StoragePolicy) -> Self {
        self.storage = storage;
        self
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Declaration of a computation step: which computation to run, and which
/// data nodes feed it and receive its results, in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub id: String,
    /// Id of the registered computation this task runs.
    pub computation: String,
    /// Input data-node ids, in the order the computation receives them.
    pub inputs: Vec<String>,
    /// Output data-node ids, in the order the computation returns them.
    pub outputs: Vec<String>,
}

impl TaskConfig {
    pub fn new(
        id: impl Into<String>,
        computation: impl Into<String>,
        inputs: impl IntoIterator<Item = impl Into<String>>,
        outputs: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            id: id.into(),
            computation: computation.into(),
            inputs: inputs.into_iter().map(Into::into).collect(),
            outputs: outputs.into_iter().map(Into::into).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Pipelines
// ---------------------------------------------------------------------------

/// A named grouping of tasks. Purely organizational: pipelines carry no
/// execution semantics and are flattened away when a scenario's graph is
/// built. The pipeline id survives only as a label on the graph's nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub id: String,
    pub task_ids: Vec<String>,
}

impl PipelineConfig {
    pub fn new(
        id: impl Into<String>,
        task_ids: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            id: id.into(),
            task_ids: task_ids.into_iter().map(Into::into).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// A caller-supplied function comparing one data node's value across several
/// scenario instances. The engine treats the result as opaque and returns it
/// unmodified.
pub type Comparator = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

/// Declaration of a scenario: which tasks it instantiates (directly and/or
/// via pipelines) and which data nodes can be compared across its instances.
#[derive(Clone)]
pub struct ScenarioConfig {
    pub id: String,
    /// Tasks referenced directly, in declaration order.
    pub task_ids: Vec<String>,
    /// Pipelines referenced, in declaration order.
    pub pipeline_ids: Vec<String>,
    /// Data-node id -> comparator over that node's values across instances.
    pub comparators: HashMap<String, Comparator>,
}

impl ScenarioConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task_ids: Vec::new(),
            pipeline_ids: Vec::new(),
            comparators: HashMap::new(),
        }
    }

    /// Reference tasks directly.
    pub fn with_tasks(mut self, task_ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.task_ids.extend(task_ids.into_iter().map(Into::into));
        self
    }

    /// Reference a registered pipeline grouping.
    pub fn with_pipeline(mut self, pipeline_id: impl Into<String>) -> Self {
        self.pipeline_ids.push(pipeline_id.into());
        self
    }

    /// Attach a comparator for one of the scenario's data nodes.
    pub fn with_comparator(
        mut self,
        data_node_id: impl Into<String>,
        comparator: Comparator,
    ) -> Self {
        self.comparators.insert(data_node_id.into(), comparator);
        self
    }

    /// Structural equality for the duplicate-registration policy. Comparator
    /// closures are not comparable, so comparator *key sets* stand in for
    /// them.
    fn same_definition(&self, other: &Self) -> bool {
        self.id == other.id
            && self.task_ids == other.task_ids
            && self.pipeline_ids == other.pipeline_ids
            && self.comparators.len() == other.comparators.len()
            && self.comparators.keys().all(|k| other.comparators.contains_key(k))
    }
}

impl std::fmt::Debug for ScenarioConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScenarioConfig")
            .field("id", &self.id)
            .field("task_ids", &self.task_ids)
            .field("pipeline_ids", &self.pipeline_ids)
            .field("comparators", &self.comparators.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder / EngineConfig
// ---------------------------------------------------------------------------

/// Collects definitions, validating every reference and arity as it goes.
///
/// Duplicate policy: re-registering an id with an identical definition is a
/// no-op; a conflicting definition under the same id fails with
/// [`EngineError::ConflictingDefinition`]. For computations (opaque trait
/// objects) "identical" means the same `Arc` pointer.
#[derive(Default)]
pub struct ConfigBuilder {
    data_nodes: BTreeMap<String, DataNodeConfig>,
    computations: BTreeMap<String, Arc<dyn Computation>>,
    tasks: BTreeMap<String, TaskConfig>,
    pipelines: BTreeMap<String, PipelineConfig>,
    scenarios: BTreeMap<String, ScenarioConfig>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a data node.
    pub fn data_node(&mut self, config: DataNodeConfig) -> Result<&mut Self, EngineError> {
        if let Some(existing) = self.data_nodes.get(&config.id) {
            if *existing == config {
                return Ok(self);
            }
            return Err(EngineError::ConflictingDefinition {
                kind: "data node",
                id: config.id,
            });
        }
        self.data_nodes.insert(config.id.clone(), config);
        Ok(self)
    }

    /// Register a computation under an identifier tasks can reference.
    pub fn computation(
        &mut self,
        id: impl Into<String>,
        computation: Arc<dyn Computation>,
    ) -> Result<&mut Self, EngineError> {
        let id = id.into();
        if let Some(existing) = self.computations.get(&id) {
            if Arc::ptr_eq(existing, &computation) {
                return Ok(self);
            }
            return Err(EngineError::ConflictingDefinition {
                kind: "computation",
                id,
            });
        }
        self.computations.insert(id, computation);
        Ok(self)
    }

    /// Register a task, checking its data-node references and that the
    /// referenced computation's declared arity matches the reference counts.
    pub fn task(&mut self, config: TaskConfig) -> Result<&mut Self, EngineError> {
        if let Some(existing) = self.tasks.get(&config.id) {
            if *existing == config {
                return Ok(self);
            }
            return Err(EngineError::ConflictingDefinition {
                kind: "task",
                id: config.id,
            });
        }

        for node_id in config.inputs.iter().chain(&config.outputs) {
            if !self.data_nodes.contains_key(node_id) {
                return Err(EngineError::UnknownDataNode(node_id.clone()));
            }
        }

        let computation = self
            .computations
            .get(&config.computation)
            .ok_or_else(|| EngineError::UnknownComputation(config.computation.clone()))?;

        if computation.input_arity() != config.inputs.len() {
            return Err(EngineError::ArityMismatch {
                task: config.id,
                computation: config.computation,
                side: "input",
                declared: computation.input_arity(),
                referenced: config.inputs.len(),
            });
        }
        if computation.output_arity() != config.outputs.len() {
            return Err(EngineError::ArityMismatch {
                task: config.id,
                computation: config.computation,
                side: "output",
                declared: computation.output_arity(),
                referenced: config.outputs.len(),
            });
        }

        self.tasks.insert(config.id.clone(), config);
        Ok(self)
    }

    /// Register a pipeline grouping over already-registered tasks.
    pub fn pipeline(&mut self, config: PipelineConfig) -> Result<&mut Self, EngineError> {
        if let Some(existing) = self.pipelines.get(&config.id) {
            if *existing == config {
                return Ok(self);
            }
            return Err(EngineError::ConflictingDefinition {
                kind: "pipeline",
                id: config.id,
            });
        }
        for task_id in &config.task_ids {
            if !self.tasks.contains_key(task_id) {
                return Err(EngineError::UnknownTask(task_id.clone()));
            }
        }
        self.pipelines.insert(config.id.clone(), config);
        Ok(self)
    }

    /// Register a scenario, checking its task/pipeline references and that
    /// every comparator key names a data node one of its tasks touches.
    pub fn scenario(&mut self, config: ScenarioConfig) -> Result<&mut Self, EngineError> {
        if let Some(existing) = self.scenarios.get(&config.id) {
            if existing.same_definition(&config) {
                return Ok(self);
            }
            return Err(EngineError::ConflictingDefinition {
                kind: "scenario",
                id: config.id,
            });
        }

        for task_id in &config.task_ids {
            if !self.tasks.contains_key(task_id) {
                return Err(EngineError::UnknownTask(task_id.clone()));
            }
        }
        for pipeline_id in &config.pipeline_ids {
            if !self.pipelines.contains_key(pipeline_id) {
                return Err(EngineError::UnknownPipeline(pipeline_id.clone()));
            }
        }

        let referenced = flatten_members(&config, &self.pipelines);
        for node_id in config.comparators.keys() {
            let touched = referenced.iter().any(|member| {
                let task = &self.tasks[&member.task_id];
                task.inputs.contains(node_id) || task.outputs.contains(node_id)
            });
            if !touched {
                return Err(EngineError::UnknownDataNode(node_id.clone()));
            }
        }

        self.scenarios.insert(config.id.clone(), config);
        Ok(self)
    }

    /// Freeze the collected definitions.
    pub fn build(self) -> Arc<EngineConfig> {
        Arc::new(EngineConfig {
            data_nodes: self.data_nodes,
            computations: self.computations,
            tasks: self.tasks,
            pipelines: self.pipelines,
            scenarios: self.scenarios,
        })
    }
}

/// One task of a scenario after pipeline flattening, with the pipeline it
/// came from (if any) kept as a label.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioMember {
    pub task_id: String,
    pub pipeline: Option<String>,
}

fn flatten_members(
    scenario: &ScenarioConfig,
    pipelines: &BTreeMap<String, PipelineConfig>,
) -> Vec<ScenarioMember> {
    let mut members: Vec<ScenarioMember> = Vec::new();
    let mut push = |task_id: &str, pipeline: Option<&str>| {
        // First occurrence wins: a task listed twice (or shared between
        // pipelines) still executes once.
        if members.iter().all(|m| m.task_id != task_id) {
            members.push(ScenarioMember {
                task_id: task_id.to_owned(),
                pipeline: pipeline.map(str::to_owned),
            });
        }
    };

    for task_id in &scenario.task_ids {
        push(task_id, None);
    }
    for pipeline_id in &scenario.pipeline_ids {
        // Registration validated the reference.
        for task_id in &pipelines[pipeline_id].task_ids {
            push(task_id, Some(pipeline_id));
        }
    }
    members
}

/// Immutable, validated configuration shared by every engine component.
pub struct EngineConfig {
    data_nodes: BTreeMap<String, DataNodeConfig>,
    computations: BTreeMap<String, Arc<dyn Computation>>,
    tasks: BTreeMap<String, TaskConfig>,
    pipelines: BTreeMap<String, PipelineConfig>,
    scenarios: BTreeMap<String, ScenarioConfig>,
}

impl EngineConfig {
    pub fn data_node(&self, id: &str) -> Option<&DataNodeConfig> {
        self.data_nodes.get(id)
    }

    pub fn computation(&self, id: &str) -> Option<&Arc<dyn Computation>> {
        self.computations.get(id)
    }

    pub fn task(&self, id: &str) -> Option<&TaskConfig> {
        self.tasks.get(id)
    }

    pub fn pipeline(&self, id: &str) -> Option<&PipelineConfig> {
        self.pipelines.get(id)
    }

    pub fn scenario(&self, id: &str) -> Option<&ScenarioConfig> {
        self.scenarios.get(id)
    }

    /// The scenario's tasks after pipeline flattening, in declaration order
    /// (direct tasks first, then each pipeline's tasks). This order is the
    /// tie-breaker for scheduling determinism.
    pub fn scenario_members(&self, scenario_id: &str) -> Result<Vec<ScenarioMember>, EngineError> {
        let scenario = self
            .scenarios
            .get(scenario_id)
            .ok_or_else(|| EngineError::UnknownScenario(scenario_id.to_owned()))?;
        Ok(flatten_members(scenario, &self.pipelines))
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("data_nodes", &self.data_nodes.len())
            .field("computations", &self.computations.len())
            .field("tasks", &self.tasks.len())
            .field("pipelines", &self.pipelines.len())
            .field("scenarios", &self.scenarios.len())
            .finish()
    }
}
