//! Task plans as produced by the external planner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::task::{Task, TaskId};

/// Scheduling relation between two tasks.
///
/// Only `FinishToStart` affects readiness. The other kinds are carried as
/// metadata and scheduled as if they were finish-to-start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    #[default]
    FinishToStart,
    StartToStart,
    FinishToFinish,
    StartToFinish,
}

impl std::fmt::Display for DependencyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyType::FinishToStart => write!(f, "finish_to_start"),
            DependencyType::StartToStart => write!(f, "start_to_start"),
            DependencyType::FinishToFinish => write!(f, "finish_to_finish"),
            DependencyType::StartToFinish => write!(f, "start_to_finish"),
        }
    }
}

/// An explicit edge in the plan: `from` must finish before `to` starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    pub from: TaskId,
    pub to: TaskId,
    #[serde(rename = "type", default)]
    pub dep_type: DependencyType,
    /// Lag in hours. Stored, not scheduled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lag: Option<f64>,
}

impl Dependency {
    pub fn new(from: &str, to: &str) -> Self {
        Self {
            from: TaskId::from(from),
            to: TaskId::from(to),
            dep_type: DependencyType::FinishToStart,
            lag: None,
        }
    }

    pub fn with_type(mut self, dep_type: DependencyType) -> Self {
        self.dep_type = dep_type;
        self
    }
}

/// The planner's output: tasks, edges, and aggregate estimates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPlan {
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    /// Advisory only; the engine never recomputes it.
    #[serde(default)]
    pub critical_path: Vec<TaskId>,
    /// Estimated duration in hours.
    #[serde(default)]
    pub estimated_duration: f64,
    #[serde(default)]
    pub estimated_cost: f64,
    #[serde(default = "Utc::now")]
    pub generated_at: DateTime<Utc>,
}

impl TaskPlan {
    pub fn new(tasks: Vec<Task>) -> Self {
        let mut plan = Self {
            tasks,
            dependencies: Vec::new(),
            critical_path: Vec::new(),
            estimated_duration: 0.0,
            estimated_cost: 0.0,
            generated_at: Utc::now(),
        };
        plan.estimated_cost = plan.task_cost_sum();
        plan.estimated_duration = plan.total_hours();
        plan
    }

    pub fn with_dependency(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    fn task_cost_sum(&self) -> f64 {
        self.tasks.iter().map(|t| t.estimated_cost).sum()
    }

    /// Plan-level cost: the planner's figure, or the task sum when the planner
    /// left it unset.
    pub fn total_cost(&self) -> f64 {
        if self.estimated_cost > 0.0 {
            self.estimated_cost
        } else {
            self.task_cost_sum()
        }
    }

    pub fn total_hours(&self) -> f64 {
        self.tasks.iter().map(|t| t.estimated_hours).sum()
    }

    /// All `(predecessor, dependent)` pairs from task `dependsOn` lists and the
    /// explicit dependency list, deduplicated, in plan order.
    pub fn edges(&self) -> Vec<(TaskId, TaskId)> {
        let mut edges: Vec<(TaskId, TaskId)> = Vec::new();
        let mut push = |from: &TaskId, to: &TaskId| {
            let pair = (from.clone(), to.clone());
            if !edges.contains(&pair) {
                edges.push(pair);
            }
        };
        for task in &self.tasks {
            for dep in &task.depends_on {
                push(dep, &task.id);
            }
        }
        for dep in &self.dependencies {
            push(&dep.from, &dep.to);
        }
        edges
    }

    /// Recompute every task's `blocks` as the inverse of all edges.
    pub fn derive_blocks(&mut self) {
        let mut blocks: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        for (from, to) in self.edges() {
            blocks.entry(from).or_default().push(to);
        }
        for task in &mut self.tasks {
            task.blocks = blocks.remove(&task.id).unwrap_or_default();
        }
    }
}
