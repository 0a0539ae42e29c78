//! Graph assembly: validated tasks → dependency graph.

use crate::spec::{PipelineConfig, Task};
use indexmap::IndexMap;
use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashSet};
use tracing::debug;

/// A directed dependency → dependent edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Edge {
    pub upstream: String,
    pub downstream: String,
}

/// Where the mutual-exclusion gate goes in a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatePlan {
    /// External projects the pipeline's tasks run against.
    pub projects: BTreeSet<String>,
    /// Tasks with no upstream dependency; the gate precedes each of them.
    pub downstream: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssemblyError {
    #[error("dependency `{dependency}` of task `{task}` does not exist")]
    MissingDependency { dependency: String, task: String },

    #[error("task `{task}` is part of a dependency cycle")]
    DependencyCycle { task: String },
}

/// An assembled pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineGraph {
    pub id: String,
    pub config: PipelineConfig,
    /// Tasks by identifier, in declaration order.
    pub tasks: IndexMap<String, Task>,
    /// Edges in declaration order of the dependent task.
    pub edges: Vec<Edge>,
    pub gate: Option<GatePlan>,
    #[serde(skip)]
    order: Vec<String>,
}

impl PipelineGraph {
    pub fn task(&self, identifier: &str) -> Option<&Task> {
        self.tasks.get(identifier)
    }

    /// Tasks with no upstream dependency.
    pub fn roots(&self) -> Vec<&str> {
        self.tasks
            .values()
            .filter(|t| t.dependencies.is_empty())
            .map(|t| t.identifier.as_str())
            .collect()
    }

    pub fn upstream_of(&self, identifier: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.downstream == identifier)
            .map(|e| e.upstream.as_str())
            .collect()
    }

    pub fn downstream_of(&self, identifier: &str) -> Vec<&str> {
        self.edges
            .iter()
            .filter(|e| e.upstream == identifier)
            .map(|e| e.downstream.as_str())
            .collect()
    }

    /// Tasks in a topological order; ties keep declaration order.
    pub fn execution_order(&self) -> Vec<&Task> {
        self.order.iter().filter_map(|id| self.tasks.get(id)).collect()
    }

    /// External projects the pipeline runs against.
    pub fn external_projects(&self) -> BTreeSet<String> {
        self.gate
            .as_ref()
            .map(|g| g.projects.clone())
            .unwrap_or_default()
    }
}

/// Builds [`PipelineGraph`]s from validated configs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Assembler;

impl Assembler {
    pub fn new() -> Self {
        Self
    }

    /// Wire every declared dependency.
    ///
    /// Fails on the first dependency naming no task, and on cycles.
    pub fn assemble(
        &self,
        id: impl Into<String>,
        config: PipelineConfig,
    ) -> Result<PipelineGraph, AssemblyError> {
        let id = id.into();

        let tasks: IndexMap<String, Task> = config
            .tasks
            .iter()
            .map(|t| (t.identifier.clone(), t.clone()))
            .collect();

        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let nodes: IndexMap<&str, NodeIndex> = tasks
            .keys()
            .map(|name| (name.as_str(), graph.add_node(name.as_str())))
            .collect();

        let mut edges = Vec::new();
        for task in tasks.values() {
            for dependency in &task.dependencies {
                let Some(&upstream) = nodes.get(dependency.as_str()) else {
                    return Err(AssemblyError::MissingDependency {
                        dependency: dependency.clone(),
                        task: task.identifier.clone(),
                    });
                };
                graph.add_edge(upstream, nodes[task.identifier.as_str()], ());
                edges.push(Edge {
                    upstream: dependency.clone(),
                    downstream: task.identifier.clone(),
                });
            }
        }

        if let Some(task) = first_cycle_member(&graph) {
            return Err(AssemblyError::DependencyCycle {
                task: task.to_string(),
            });
        }

        let order = stable_topological_order(&graph);

        let projects: BTreeSet<String> = tasks
            .values()
            .filter_map(Task::external_project)
            .map(str::to_string)
            .collect();
        let gate = (!projects.is_empty()).then(|| GatePlan {
            projects,
            downstream: tasks
                .values()
                .filter(|t| t.dependencies.is_empty())
                .map(|t| t.identifier.clone())
                .collect(),
        });

        debug!(
            pipeline = %id,
            tasks = tasks.len(),
            edges = edges.len(),
            gated = gate.is_some(),
            "assembled pipeline graph"
        );

        Ok(PipelineGraph {
            id,
            config,
            tasks,
            edges,
            gate,
            order,
        })
    }
}

/// The earliest-declared task on a cycle, if any.
fn first_cycle_member<'a>(graph: &DiGraph<&'a str, ()>) -> Option<&'a str> {
    let cyclic: HashSet<NodeIndex> = tarjan_scc(graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .flatten()
        .collect();

    graph
        .node_indices()
        .find(|n| cyclic.contains(n))
        .map(|n| graph[n])
}

/// Kahn's algorithm, always releasing the earliest-declared ready node.
fn stable_topological_order(graph: &DiGraph<&str, ()>) -> Vec<String> {
    let mut indegree: Vec<usize> = graph
        .node_indices()
        .map(|n| graph.neighbors_directed(n, Direction::Incoming).count())
        .collect();

    let mut ready: BinaryHeap<Reverse<usize>> = indegree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(indegree.len());
    while let Some(Reverse(i)) = ready.pop() {
        let node = NodeIndex::new(i);
        order.push(graph[node].to_string());
        for next in graph.neighbors_directed(node, Direction::Outgoing) {
            indegree[next.index()] -= 1;
            if indegree[next.index()] == 0 {
                ready.push(Reverse(next.index()));
            }
        }
    }
    order
}
