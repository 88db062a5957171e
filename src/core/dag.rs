//! Task graph for dependency management.
//!
//! `TaskGraph` owns a working copy of the plan's tasks as nodes of a petgraph
//! `DiGraph`, with an edge `A -> B` whenever B depends on A. It is built
//! permissively from a plan and checked once with [`TaskGraph::validate`]
//! before execution starts.

use crate::core::plan::{DependencyType, TaskPlan};
use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};

/// Metadata carried on each edge.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DependencyEdge {
    pub dep_type: DependencyType,
    pub lag: Option<f64>,
}

/// The task dependency graph.
pub struct TaskGraph {
    graph: DiGraph<Task, DependencyEdge>,
    task_index: HashMap<TaskId, NodeIndex>,
    /// Edges whose endpoint is not a task in the plan, as `(from, to)`.
    dangling: Vec<(TaskId, TaskId)>,
    /// Ids that appeared more than once in the plan.
    duplicates: Vec<TaskId>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
            dangling: Vec::new(),
            duplicates: Vec::new(),
        }
    }

    /// Build the graph from a plan. Never fails: problems are recorded and
    /// reported by `validate()`.
    pub fn from_plan(plan: &TaskPlan) -> Self {
        let mut graph = Self::new();
        for task in &plan.tasks {
            if graph.task_index.contains_key(&task.id) {
                graph.duplicates.push(task.id.clone());
                continue;
            }
            let id = task.id.clone();
            let index = graph.graph.add_node(task.clone());
            graph.task_index.insert(id, index);
        }

        for task in &plan.tasks {
            for dep in &task.depends_on {
                graph.link(dep, &task.id, DependencyEdge::default());
            }
        }
        for dep in &plan.dependencies {
            graph.link(
                &dep.from,
                &dep.to,
                DependencyEdge {
                    dep_type: dep.dep_type,
                    lag: dep.lag,
                },
            );
        }
        graph
    }

    fn link(&mut self, from: &TaskId, to: &TaskId, edge: DependencyEdge) {
        match (self.task_index.get(from), self.task_index.get(to)) {
            (Some(&a), Some(&b)) => {
                // An explicit plan dependency refines an implicit dependsOn edge.
                if let Some(existing) = self.graph.find_edge(a, b) {
                    if edge != DependencyEdge::default() {
                        self.graph[existing] = edge;
                    }
                } else {
                    self.graph.add_edge(a, b, edge);
                }
            }
            _ => self.dangling.push((from.clone(), to.clone())),
        }
    }

    /// Check the graph is executable: unique ids, no dangling references,
    /// no cycles.
    pub fn validate(&self) -> Result<()> {
        if let Some(id) = self.duplicates.first() {
            return Err(Error::DuplicateTask(id.clone()));
        }
        if let Some((from, to)) = self.dangling.first() {
            return Err(Error::DanglingReference {
                from: from.clone(),
                to: to.clone(),
            });
        }
        toposort(&self.graph, None).map_err(|cycle| Error::CyclicDependency {
            task_id: self.graph[cycle.node_id()].id.clone(),
        })?;
        Ok(())
    }

    /// Append a task with no dependencies. Ids must be unique.
    pub fn add_task(&mut self, task: Task) -> Result<NodeIndex> {
        if self.task_index.contains_key(&task.id) {
            return Err(Error::DuplicateTask(task.id));
        }
        let id = task.id.clone();
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        Ok(index)
    }

    pub fn get_task(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    pub fn get_task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        let index = *self.task_index.get(id)?;
        self.graph.node_weight_mut(index)
    }

    /// Like `get_task_mut` but reports a missing id as an error.
    pub fn task_mut(&mut self, id: &TaskId) -> Result<&mut Task> {
        self.get_task_mut(id)
            .ok_or_else(|| Error::TaskNotFound(id.clone()))
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Metadata of the edge `from -> to`, if present.
    pub fn get_dependency(&self, from: &TaskId, to: &TaskId) -> Option<&DependencyEdge> {
        let a = self.task_index.get(from)?;
        let b = self.task_index.get(to)?;
        let edge = self.graph.find_edge(*a, *b)?;
        self.graph.edge_weight(edge)
    }

    /// Tasks in plan order (appended tasks last).
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.node_indices().map(move |i| &self.graph[i])
    }

    /// Direct predecessors of a task.
    pub fn dependencies_of(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct dependents of a task (the derived `blocks` relation).
    pub fn dependents_of(&self, id: &TaskId) -> Vec<&Task> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<&Task> {
        let Some(&index) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut found: Vec<NodeIndex> = self.graph.neighbors_directed(index, direction).collect();
        found.sort();
        found.into_iter().map(|i| &self.graph[i]).collect()
    }

    // ========== Scheduling Operations ==========

    /// Tasks that can start now.
    ///
    /// A task is ready when it is not in `executed`, it is still `pending`,
    /// and every predecessor is in `executed`. Results are in plan order.
    pub fn ready_tasks<'a>(&'a self, executed: &HashSet<TaskId>) -> Vec<&'a Task> {
        self.graph
            .node_indices()
            .filter_map(|index| {
                let task = &self.graph[index];
                if executed.contains(&task.id) || task.status != TaskStatus::Pending {
                    return None;
                }
                let satisfied = self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .all(|dep| executed.contains(&self.graph[dep].id));
                satisfied.then_some(task)
            })
            .collect()
    }

    /// Ids of tasks with the given status, in plan order.
    pub fn ids_with_status(&self, status: TaskStatus) -> Vec<TaskId> {
        self.tasks()
            .filter(|t| t.status == status)
            .map(|t| t.id.clone())
            .collect()
    }

    /// Pending tasks that can never become ready because some transitive
    /// predecessor failed, was blocked, or was cancelled.
    pub fn unreachable(&self) -> Vec<TaskId> {
        let mut queue: VecDeque<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&i| {
                matches!(
                    self.graph[i].status,
                    TaskStatus::Failed | TaskStatus::Blocked | TaskStatus::Cancelled
                )
            })
            .collect();
        let mut seen: HashSet<NodeIndex> = queue.iter().copied().collect();
        let mut stranded: Vec<NodeIndex> = Vec::new();

        while let Some(index) = queue.pop_front() {
            for next in self.graph.neighbors_directed(index, Direction::Outgoing) {
                if seen.insert(next) {
                    if self.graph[next].status == TaskStatus::Pending {
                        stranded.push(next);
                    }
                    queue.push_back(next);
                }
            }
        }

        stranded.sort();
        stranded
            .into_iter()
            .map(|i| self.graph[i].id.clone())
            .collect()
    }

    /// True when no task is pending or in progress.
    pub fn all_settled(&self) -> bool {
        self.tasks().all(|t| t.status.is_terminal())
    }

    /// Tasks in an order where each comes after all of its dependencies.
    pub fn topological_order(&self) -> Result<Vec<&Task>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| Error::CyclicDependency {
            task_id: self.graph[cycle.node_id()].id.clone(),
        })?;
        Ok(sorted.into_iter().map(|i| &self.graph[i]).collect())
    }

    /// Consume the graph, returning tasks in plan order.
    pub fn into_tasks(self) -> Vec<Task> {
        let (nodes, _) = self.graph.into_nodes_edges();
        nodes.into_iter().map(|n| n.weight).collect()
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .field("dangling", &self.dangling.len())
            .finish()
    }
}
