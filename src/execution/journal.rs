//! Append-only execution log and the state projections derived from it.
//!
//! The log is the history of record for a project. Entries are never edited or
//! removed; `completedTasks`/`blockedTasks` are recomputed from task statuses
//! (or, for audits, replayed from the log) instead of being maintained by hand.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::core::task::{Task, TaskId, TaskStatus};

/// What happened to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogAction {
    Started,
    Completed,
    Failed,
    /// Waiting on a human decision. Left unanswered by `Resumed` when the
    /// decision was a rejection.
    Paused,
    Resumed,
}

impl std::fmt::Display for LogAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogAction::Started => write!(f, "started"),
            LogAction::Completed => write!(f, "completed"),
            LogAction::Failed => write!(f, "failed"),
            LogAction::Paused => write!(f, "paused"),
            LogAction::Resumed => write!(f, "resumed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub task_id: TaskId,
    pub action: LogAction,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    /// Wall-clock duration in hours, on `completed`/`failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    /// References to evidence recorded on the task.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<String>,
}

impl ExecutionLogEntry {
    pub fn new(task_id: &TaskId, action: LogAction, description: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            task_id: task_id.clone(),
            action,
            description: description.to_string(),
            worker: None,
            duration: None,
            evidence: Vec::new(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_worker(mut self, worker: Option<String>) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_duration(mut self, hours: f64) -> Self {
        self.duration = Some(hours);
        self
    }

    pub fn with_evidence(mut self, refs: Vec<String>) -> Self {
        self.evidence = refs;
        self
    }
}

/// Append-only sequence of log entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct ExecutionLog(Vec<ExecutionLogEntry>);

impl ExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, entry: ExecutionLogEntry) {
        crate::klog_trace!(
            "log append task={} action={} {}",
            entry.task_id,
            entry.action,
            entry.description
        );
        self.0.push(entry);
    }

    pub fn entries(&self) -> &[ExecutionLogEntry] {
        &self.0
    }

    /// Entries appended at or after position `from`.
    pub fn since(&self, from: usize) -> &[ExecutionLogEntry] {
        self.0.get(from..).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn count(&self, action: LogAction) -> usize {
        self.0.iter().filter(|e| e.action == action).count()
    }

    /// Entries for one task, oldest first.
    pub fn for_task<'a>(&'a self, id: &'a TaskId) -> impl Iterator<Item = &'a ExecutionLogEntry> {
        self.0.iter().filter(move |e| &e.task_id == id)
    }

    /// Derive aggregate state from the log alone.
    ///
    /// Each task is classified by its last entry: `completed`, `failed`,
    /// `paused` (a rejected approval, i.e. blocked) or `started`/`resumed`
    /// (in progress). Tasks appear in order of their first entry. The result
    /// depends on nothing but the entries.
    pub fn replay(&self) -> Projection {
        let mut order: Vec<&TaskId> = Vec::new();
        let mut last: HashMap<&TaskId, LogAction> = HashMap::new();
        for entry in &self.0 {
            if last.insert(&entry.task_id, entry.action).is_none() {
                order.push(&entry.task_id);
            }
        }

        let mut projection = Projection::default();
        for id in order {
            let bucket = match last[id] {
                LogAction::Completed => &mut projection.completed,
                LogAction::Failed => &mut projection.failed,
                LogAction::Paused => &mut projection.blocked,
                LogAction::Started | LogAction::Resumed => &mut projection.in_progress,
            };
            bucket.push(id.clone());
        }
        projection
    }
}

/// Aggregate task state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Projection {
    pub completed: Vec<TaskId>,
    pub failed: Vec<TaskId>,
    pub blocked: Vec<TaskId>,
    pub in_progress: Vec<TaskId>,
}

impl Projection {
    /// Derive aggregate state from current task statuses, in task order.
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut projection = Self::default();
        for task in tasks {
            match task.status {
                TaskStatus::Completed => projection.completed.push(task.id.clone()),
                TaskStatus::Failed => projection.failed.push(task.id.clone()),
                TaskStatus::Blocked => projection.blocked.push(task.id.clone()),
                TaskStatus::InProgress => projection.in_progress.push(task.id.clone()),
                TaskStatus::Pending | TaskStatus::Cancelled => {}
            }
        }
        projection
    }
}
