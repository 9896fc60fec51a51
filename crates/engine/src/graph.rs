//! Graph construction. Runs before instantiating or submitting a scenario.
//!
//! Rules enforced:
//! 1. Pipelines are flattened away; each task appears once.
//! 2. Every data node has at most one producing task.
//! 3. Edges are inferred from shared data-node ids: A -> B iff an output of A
//!    is an input of B.
//! 4. The directed graph must be acyclic (depth-first white/gray/black check;
//!    the error names the offending cycle).
//!
//! The resulting graph holds its nodes already in topological order, with
//! ties broken by the scenario's declaration order, so repeated builds from
//! an identical config are identical.

use std::collections::HashMap;

use crate::config::{EngineConfig, TaskConfig};
use crate::EngineError;

/// One task within a built graph, with the pipeline it was declared through
/// (if any) kept as an organizational label.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub task: TaskConfig,
    pub pipeline: Option<String>,
}

/// An acyclic task graph for one scenario config, nodes in topological order.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    scenario_id: String,
    nodes: Vec<GraphNode>,
    successors: Vec<Vec<usize>>,
    predecessors: Vec<Vec<usize>>,
    /// Data-node id -> index of its producing task.
    producers: HashMap<String, usize>,
}

impl TaskGraph {
    /// Build the graph for `scenario_id` from a validated config.
    ///
    /// # Errors
    /// - [`EngineError::UnknownScenario`] if the scenario isn't registered.
    /// - [`EngineError::ConflictingProducer`] if two tasks output one node.
    /// - [`EngineError::CycleDetected`] if the graph is not acyclic.
    pub fn build(scenario_id: &str, config: &EngineConfig) -> Result<Self, EngineError> {
        let members = config.scenario_members(scenario_id)?;

        // Registration validated every task reference.
        let nodes: Vec<GraphNode> = members
            .into_iter()
            .map(|member| GraphNode {
                task: config
                    .task(&member.task_id)
                    .expect("scenario members reference registered tasks")
                    .clone(),
                pipeline: member.pipeline,
            })
            .collect();

        // -------------------------------------------------------------------
        // One producer per data node.
        // -------------------------------------------------------------------
        let mut producers: HashMap<String, usize> = HashMap::new();
        for (index, node) in nodes.iter().enumerate() {
            for output in &node.task.outputs {
                if let Some(&first) = producers.get(output) {
                    return Err(EngineError::ConflictingProducer {
                        data_node: output.clone(),
                        first: nodes[first].task.id.clone(),
                        second: node.task.id.clone(),
                    });
                }
                producers.insert(output.clone(), index);
            }
        }

        // -------------------------------------------------------------------
        // Infer edges from shared data-node references.
        // -------------------------------------------------------------------
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        let mut predecessors: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        for (to, node) in nodes.iter().enumerate() {
            for input in &node.task.inputs {
                if let Some(&from) = producers.get(input) {
                    if !successors[from].contains(&to) {
                        successors[from].push(to);
                        predecessors[to].push(from);
                    }
                }
            }
        }

        // -------------------------------------------------------------------
        // Cycle check (DFS coloring), then deterministic topological order.
        // -------------------------------------------------------------------
        if let Some(cycle) = find_cycle(&successors) {
            return Err(EngineError::CycleDetected {
                scenario: scenario_id.to_owned(),
                cycle: cycle
                    .into_iter()
                    .map(|index| nodes[index].task.id.clone())
                    .collect(),
            });
        }

        let order = topological_order(&predecessors);

        // Permute nodes into topological order and remap the edge lists so a
        // node's index *is* its scheduling position.
        let mut position = vec![0usize; nodes.len()];
        for (new_index, &old_index) in order.iter().enumerate() {
            position[old_index] = new_index;
        }

        let mut ordered_nodes = Vec::with_capacity(nodes.len());
        let mut ordered_successors = vec![Vec::new(); nodes.len()];
        let mut ordered_predecessors = vec![Vec::new(); nodes.len()];
        let mut old_nodes: Vec<Option<GraphNode>> = nodes.into_iter().map(Some).collect();
        for &old_index in &order {
            ordered_nodes.push(old_nodes[old_index].take().expect("each node moved once"));
        }
        for (old_from, succ) in successors.iter().enumerate() {
            for &old_to in succ {
                ordered_successors[position[old_from]].push(position[old_to]);
                ordered_predecessors[position[old_to]].push(position[old_from]);
            }
        }
        for list in ordered_successors.iter_mut().chain(&mut ordered_predecessors) {
            list.sort_unstable();
        }
        let producers = producers
            .into_iter()
            .map(|(node_id, old_index)| (node_id, position[old_index]))
            .collect();

        Ok(Self {
            scenario_id: scenario_id.to_owned(),
            nodes: ordered_nodes,
            successors: ordered_successors,
            predecessors: ordered_predecessors,
            producers,
        })
    }

    pub fn scenario_id(&self) -> &str {
        &self.scenario_id
    }

    /// Nodes in topological order (ties broken by declaration order).
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn successors(&self, index: usize) -> &[usize] {
        &self.successors[index]
    }

    pub fn predecessors(&self, index: usize) -> &[usize] {
        &self.predecessors[index]
    }

    /// Index of the task that produces `node_id`, if any.
    pub fn producer_of(&self, node_id: &str) -> Option<usize> {
        self.producers.get(node_id).copied()
    }

    /// Every data-node id referenced by the graph's tasks, sorted and
    /// deduplicated.
    pub fn data_node_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .nodes
            .iter()
            .flat_map(|node| node.task.inputs.iter().chain(&node.task.outputs))
            .cloned()
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Data nodes with no producing task: the scenario's true external
    /// inputs, which must be written before submission.
    pub fn external_inputs(&self) -> Vec<String> {
        self.data_node_ids()
            .into_iter()
            .filter(|id| !self.producers.contains_key(id))
            .collect()
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Depth-first cycle search. Returns the node indices along the first cycle
/// found, closed (last element repeats the first).
fn find_cycle(successors: &[Vec<usize>]) -> Option<Vec<usize>> {
    fn visit(
        vertex: usize,
        successors: &[Vec<usize>],
        colors: &mut [Color],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        colors[vertex] = Color::Gray;
        stack.push(vertex);

        for &next in &successors[vertex] {
            match colors[next] {
                Color::Gray => {
                    // Back-edge onto the gray stack: the cycle is everything
                    // from `next`'s position to the top, closed with `next`.
                    let start = stack
                        .iter()
                        .position(|&v| v == next)
                        .expect("gray vertices are on the stack");
                    let mut cycle = stack[start..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                Color::White => {
                    if let Some(cycle) = visit(next, successors, colors, stack) {
                        return Some(cycle);
                    }
                }
                Color::Black => {}
            }
        }

        stack.pop();
        colors[vertex] = Color::Black;
        None
    }

    let mut colors = vec![Color::White; successors.len()];
    let mut stack = Vec::new();
    for vertex in 0..successors.len() {
        if colors[vertex] == Color::White {
            if let Some(cycle) = visit(vertex, successors, &mut colors, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

/// Topological order over an acyclic graph, always picking the runnable node
/// with the smallest declaration index so the result is deterministic.
fn topological_order(predecessors: &[Vec<usize>]) -> Vec<usize> {
    let n = predecessors.len();
    let mut in_degree: Vec<usize> = predecessors.iter().map(Vec::len).collect();
    let mut placed = vec![false; n];
    let mut order = Vec::with_capacity(n);

    // O(n^2) smallest-index selection; scenario graphs are small.
    while order.len() < n {
        let next = (0..n)
            .find(|&v| !placed[v] && in_degree[v] == 0)
            .expect("acyclic graph always has a runnable node");
        placed[next] = true;
        order.push(next);
        for v in 0..n {
            if !placed[v] && predecessors[v].contains(&next) {
                in_degree[v] -= 1;
            }
        }
    }
    order
}
