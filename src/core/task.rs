//! Task data model for the project task graph.
//!
//! Tasks are the atomic units of physical work in a plan: "frame the deck",
//! "hire an electrician". The plan generator creates them; during a run the
//! coordinator is the only writer of their status and timing fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Identifier of a task within a plan.
///
/// Plan generators choose their own ids (`"demo"`, `"task-3"`), so this is a
/// string newtype. Tasks appended during a run get a generated id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generate a fresh identifier for a task created during execution.
    pub fn generate() -> Self {
        let uuid = Uuid::new_v4().to_string();
        Self(format!("task-{}", &uuid[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task status in its lifecycle.
///
/// `pending -> in_progress -> {completed, failed}`, or `pending -> blocked`
/// when an approval is rejected, or `pending -> cancelled` on explicit skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Blocked,
    Cancelled,
}

impl TaskStatus {
    /// Whether the task will not run again during this run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Blocked | TaskStatus::Cancelled
        )
    }

    /// Whether the task's fields other than evidence/notes are frozen.
    pub fn is_immutable(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Task priority as assigned by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// Proof that a task's side effect happened (a job id, a receipt, a photo ref).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evidence {
    pub kind: String,
    pub reference: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub recorded_at: DateTime<Utc>,
}

impl Evidence {
    pub fn new(kind: &str, reference: &str, description: &str) -> Self {
        Self {
            kind: kind.to_string(),
            reference: reference.to_string(),
            description: description.to_string(),
            recorded_at: Utc::now(),
        }
    }
}

fn is_zero(v: &u8) -> bool {
    *v == 0
}

/// A single task in a project plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub estimated_hours: f64,
    #[serde(default)]
    pub estimated_cost: f64,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    /// Inverse of `depends_on`, maintained by `TaskPlan::derive_blocks`.
    #[serde(default)]
    pub blocks: Vec<TaskId>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub progress: u8,
    #[serde(default)]
    pub evidence: Vec<Evidence>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_hours: Option<f64>,
}

impl Task {
    /// Create a pending task with no estimates and no dependencies.
    pub fn new(id: impl Into<TaskId>, name: &str) -> Self {
        Self {
            id: id.into(),
            name: name.to_string(),
            description: String::new(),
            status: TaskStatus::Pending,
            priority: Priority::Medium,
            estimated_hours: 0.0,
            estimated_cost: 0.0,
            skills: Vec::new(),
            depends_on: Vec::new(),
            blocks: Vec::new(),
            progress: 0,
            evidence: Vec::new(),
            notes: Vec::new(),
            assignee: None,
            start_time: None,
            end_time: None,
            actual_hours: None,
        }
    }

    pub fn with_estimate(mut self, hours: f64, cost: f64) -> Self {
        self.estimated_hours = hours;
        self.estimated_cost = cost;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_skills(mut self, skills: &[&str]) -> Self {
        self.skills = skills.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.depends_on = ids.iter().map(|s| TaskId::from(*s)).collect();
        self
    }

    fn transition(&mut self, allowed: &[TaskStatus], to: TaskStatus) -> Result<()> {
        if !allowed.contains(&self.status) {
            return Err(Error::InvalidTaskTransition {
                task_id: self.id.clone(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }

    /// `pending -> in_progress`, recording the start time.
    pub fn start(&mut self, at: DateTime<Utc>) -> Result<()> {
        self.transition(&[TaskStatus::Pending], TaskStatus::InProgress)?;
        self.start_time = Some(at);
        Ok(())
    }

    /// `in_progress -> completed`, recording end time and wall-clock hours.
    pub fn complete(&mut self, at: DateTime<Utc>) -> Result<()> {
        self.transition(&[TaskStatus::InProgress], TaskStatus::Completed)?;
        self.end_time = Some(at);
        self.progress = 100;
        if let Some(start) = self.start_time {
            let millis = (at - start).num_milliseconds().max(0) as f64;
            self.actual_hours = Some(millis / 3_600_000.0);
        }
        Ok(())
    }

    /// `in_progress -> failed`, recording the end time and the reason.
    pub fn fail(&mut self, at: DateTime<Utc>, reason: &str) -> Result<()> {
        self.transition(&[TaskStatus::InProgress], TaskStatus::Failed)?;
        self.end_time = Some(at);
        self.notes.push(format!("failed: {}", reason));
        Ok(())
    }

    /// `pending -> blocked` after an approval rejection.
    pub fn block(&mut self, reason: &str) -> Result<()> {
        self.transition(&[TaskStatus::Pending], TaskStatus::Blocked)?;
        self.notes.push(format!("blocked: {}", reason));
        Ok(())
    }

    /// `pending -> cancelled` on explicit skip.
    pub fn cancel(&mut self) -> Result<()> {
        self.transition(&[TaskStatus::Pending], TaskStatus::Cancelled)
    }

    /// Status-only transition used in dry-run, which must not touch any other
    /// task field.
    pub fn set_status(&mut self, to: TaskStatus) -> Result<()> {
        let allowed: &[TaskStatus] = match to {
            TaskStatus::InProgress | TaskStatus::Blocked | TaskStatus::Cancelled => {
                &[TaskStatus::Pending]
            }
            TaskStatus::Completed | TaskStatus::Failed => &[TaskStatus::InProgress],
            TaskStatus::Pending => &[TaskStatus::InProgress],
        };
        self.transition(allowed, to)
    }

    /// Append evidence. Allowed in every status.
    pub fn add_evidence(&mut self, evidence: Evidence) {
        self.evidence.push(evidence);
    }

    /// Whether any skill on this task is in `skills` (case-insensitive).
    pub fn has_any_skill(&self, skills: &[String]) -> bool {
        self.skills
            .iter()
            .any(|s| skills.iter().any(|k| k.eq_ignore_ascii_case(s)))
    }

    pub fn is_pending(&self) -> bool {
        self.status == TaskStatus::Pending
    }
}
