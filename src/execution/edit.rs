//! Plan edits offered between rounds in modify mode.
//!
//! Edits only ever touch `pending` tasks. Applying the same edit twice has
//! the same effect as applying it once.

use crate::core::dag::TaskGraph;
use crate::core::task::{Task, TaskId, TaskStatus};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum PlanEdit {
    /// Cancel a pending task; its dependents become unreachable.
    CancelTask(TaskId),
    /// Re-estimate a pending task.
    SetEstimatedHours { task_id: TaskId, hours: f64 },
    /// Add a new pending task with no dependencies.
    AppendTask(Task),
}

impl PlanEdit {
    /// An append edit for a fresh task. The id is fixed here so the edit stays
    /// idempotent.
    pub fn append(name: &str, hours: f64, cost: f64) -> Self {
        PlanEdit::AppendTask(Task::new(TaskId::generate(), name).with_estimate(hours, cost))
    }

    /// Apply to the working graph. Returns `Ok(false)` when the edit was a
    /// no-op (already applied, or aimed at a task that is no longer pending).
    pub fn apply(&self, graph: &mut TaskGraph) -> Result<bool> {
        match self {
            PlanEdit::CancelTask(id) => {
                let task = graph.task_mut(id)?;
                if task.status != TaskStatus::Pending {
                    return Ok(false);
                }
                task.cancel()?;
                task.notes.push("cancelled during review".to_string());
                Ok(true)
            }
            PlanEdit::SetEstimatedHours { task_id, hours } => {
                if !hours.is_finite() || *hours < 0.0 {
                    return Err(Error::Validation(format!(
                        "estimated hours for {} must be non-negative, got {}",
                        task_id, hours
                    )));
                }
                let task = graph.task_mut(task_id)?;
                if task.status != TaskStatus::Pending || task.estimated_hours == *hours {
                    return Ok(false);
                }
                task.estimated_hours = *hours;
                Ok(true)
            }
            PlanEdit::AppendTask(task) => {
                if graph.contains_task(&task.id) {
                    return Ok(false);
                }
                let mut task = task.clone();
                task.status = TaskStatus::Pending;
                task.depends_on.clear();
                task.blocks.clear();
                graph.add_task(task)?;
                Ok(true)
            }
        }
    }
}

impl std::fmt::Display for PlanEdit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanEdit::CancelTask(id) => write!(f, "cancel {}", id),
            PlanEdit::SetEstimatedHours { task_id, hours } => {
                write!(f, "set {} estimate to {}h", task_id, hours)
            }
            PlanEdit::AppendTask(task) => write!(f, "append {} ({})", task.id, task.name),
        }
    }
}
