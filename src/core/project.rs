//! The project record handed to and returned from the engine.
//!
//! The project phase lives in `state.currentPhase` so that a dry run, which
//! may only touch `state` and task statuses, can still report its outcome.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::plan::TaskPlan;
use super::task::{TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::execution::journal::ExecutionLog;

/// Project-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectPhase {
    #[default]
    Plan,
    Execute,
    Completed,
    Failed,
    Cancelled,
}

/// Coarse stage a phase belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Planning,
    Execution,
    Completion,
}

impl ProjectPhase {
    pub fn stage(&self) -> Stage {
        match self {
            ProjectPhase::Plan => Stage::Planning,
            ProjectPhase::Execute => Stage::Execution,
            ProjectPhase::Completed | ProjectPhase::Failed | ProjectPhase::Cancelled => {
                Stage::Completion
            }
        }
    }

    /// Valid transitions:
    /// - Plan, Failed, Cancelled, Execute -> Execute (start or resume a run)
    /// - Execute -> Completed | Failed | Cancelled
    pub fn can_transition(&self, target: ProjectPhase) -> bool {
        matches!(
            (self, target),
            (
                ProjectPhase::Plan
                    | ProjectPhase::Failed
                    | ProjectPhase::Cancelled
                    | ProjectPhase::Execute,
                ProjectPhase::Execute
            ) | (
                ProjectPhase::Execute,
                ProjectPhase::Completed | ProjectPhase::Failed | ProjectPhase::Cancelled
            )
        )
    }
}

impl std::fmt::Display for ProjectPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProjectPhase::Plan => write!(f, "PLAN"),
            ProjectPhase::Execute => write!(f, "EXECUTE"),
            ProjectPhase::Completed => write!(f, "COMPLETED"),
            ProjectPhase::Failed => write!(f, "FAILED"),
            ProjectPhase::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalType {
    Plan,
    LaborHire,
    Purchase,
    Safety,
    Permit,
}

impl std::fmt::Display for ApprovalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApprovalType::Plan => write!(f, "plan"),
            ApprovalType::LaborHire => write!(f, "labor_hire"),
            ApprovalType::Purchase => write!(f, "purchase"),
            ApprovalType::Safety => write!(f, "safety"),
            ApprovalType::Permit => write!(f, "permit"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

/// A recorded human (or auto) decision on a gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    pub id: String,
    #[serde(rename = "type")]
    pub approval_type: ApprovalType,
    pub status: ApprovalStatus,
    /// Task the approval concerns; `None` for run-level approval points.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default)]
    pub description: String,
    pub requested_at: DateTime<Utc>,
    pub requested_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
}

impl Approval {
    pub fn request(
        approval_type: ApprovalType,
        task_id: Option<TaskId>,
        description: &str,
        amount: Option<f64>,
        requested_by: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            approval_type,
            status: ApprovalStatus::Pending,
            task_id,
            description: description.to_string(),
            requested_at: Utc::now(),
            requested_by: requested_by.to_string(),
            approved_at: None,
            approved_by: None,
            amount,
        }
    }

    /// Settle a pending approval. Settled approvals are terminal.
    pub fn resolve(&mut self, approved: bool, by: &str) -> Result<()> {
        if self.status != ApprovalStatus::Pending {
            return Err(Error::Validation(format!(
                "approval {} already resolved",
                self.id
            )));
        }
        self.status = if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        self.approved_at = Some(Utc::now());
        self.approved_by = Some(by.to_string());
        Ok(())
    }
}

/// Execution bookkeeping. Owned by the coordinator during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    #[serde(default)]
    pub current_phase: ProjectPhase,
    #[serde(default)]
    pub completed_tasks: Vec<TaskId>,
    #[serde(default)]
    pub blocked_tasks: Vec<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<TaskId>,
    #[serde(default)]
    pub execution_log: ExecutionLog,
    #[serde(default)]
    pub approvals: Vec<Approval>,
}

impl ExecutionState {
    pub fn transition(&mut self, target: ProjectPhase) -> Result<()> {
        if !self.current_phase.can_transition(target) {
            return Err(Error::InvalidPhaseTransition {
                from: self.current_phase.to_string(),
                to: target.to_string(),
            });
        }
        self.current_phase = target;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Budget {
    pub total: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "USD".to_string()
}

impl Budget {
    pub fn new(total: f64) -> Self {
        Self {
            total,
            currency: default_currency(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Timeline {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_end_date: Option<DateTime<Utc>>,
}

/// A physical-world project: what to build, with what money, by when.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub budget: Budget,
    #[serde(default)]
    pub timeline: Timeline,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<TaskPlan>,
    #[serde(default)]
    pub state: ExecutionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(name: &str, budget: f64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: String::new(),
            budget: Budget::new(budget),
            timeline: Timeline::default(),
            owner: None,
            plan: None,
            state: ExecutionState::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_plan(mut self, plan: TaskPlan) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn phase(&self) -> ProjectPhase {
        self.state.current_phase
    }

    pub fn plan(&self) -> Result<&TaskPlan> {
        self.plan.as_ref().ok_or(Error::MissingPlan)
    }

    /// Status of a task by id, if the plan has it.
    pub fn task_status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.plan.as_ref()?.task(id).map(|t| t.status)
    }

    /// Record-level checks applied when a project is loaded from storage.
    /// Graph shape (cycles, dangling edges) is checked by `TaskGraph`.
    pub fn validate_record(&self) -> Result<()> {
        if self.budget.total < 0.0 {
            return Err(Error::Validation("budget total is negative".to_string()));
        }
        let Some(plan) = &self.plan else {
            return Ok(());
        };
        let mut seen = std::collections::HashSet::new();
        for task in &plan.tasks {
            if !seen.insert(&task.id) {
                return Err(Error::DuplicateTask(task.id.clone()));
            }
            if task.name.trim().is_empty() {
                return Err(Error::Validation(format!("task {} has no name", task.id)));
            }
            if task.progress > 100 {
                return Err(Error::Validation(format!(
                    "task {} progress {} exceeds 100",
                    task.id, task.progress
                )));
            }
            if task.estimated_hours < 0.0 || task.estimated_cost < 0.0 {
                return Err(Error::Validation(format!(
                    "task {} has a negative estimate",
                    task.id
                )));
            }
        }
        Ok(())
    }
}
