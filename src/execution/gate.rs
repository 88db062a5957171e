//! Gate evaluation: budget, timeline and approval checks.
//!
//! Everything here is a pure function of its inputs. The evaluator reports
//! pass/fail and whether a human decision is needed; the coordinator decides
//! what to do about it (halt, ask, or override in approve-all mode).

use chrono::{DateTime, Utc};
use std::collections::HashSet;

use crate::config::ApprovalPolicy;
use crate::core::plan::TaskPlan;
use crate::core::project::{ApprovalType, Project};
use crate::core::task::{Priority, Task, TaskStatus};

const DAY_MS: f64 = 86_400_000.0;

/// Result of comparing planned spend against the budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetCheck {
    pub ok: bool,
    pub limit: f64,
    pub required: f64,
    /// How far `required` exceeds `limit`; 0 when within budget.
    pub overrun_amount: f64,
}

impl BudgetCheck {
    fn compare(required: f64, limit: f64) -> Self {
        let overrun = (required - limit).max(0.0);
        Self {
            ok: overrun <= 0.0,
            limit,
            required,
            overrun_amount: overrun,
        }
    }
}

/// Result of comparing remaining work against the time left.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimelineCheck {
    pub ok: bool,
    pub remaining_hours: f64,
    pub required_days: i64,
    /// `None` when the project has no target end date.
    pub available_days: Option<i64>,
}

/// Why a task needs sign-off before dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalRequirement {
    pub approval_type: ApprovalType,
    pub reasons: Vec<String>,
    pub amount: Option<f64>,
}

impl ApprovalRequirement {
    pub fn reason(&self) -> String {
        self.reasons.join("; ")
    }
}

/// Tracks which run-level approval points already fired in the current run.
#[derive(Debug, Clone, Default)]
pub struct PointTracker {
    fired: HashSet<ApprovalType>,
    evaluations: usize,
}

impl PointTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_fired(&self, point: ApprovalType) -> bool {
        self.fired.contains(&point)
    }

    pub fn mark_fired(&mut self, point: ApprovalType) {
        self.fired.insert(point);
    }

    /// True until the first readiness evaluation has been recorded.
    pub fn is_first_evaluation(&self) -> bool {
        self.evaluations == 0
    }

    pub fn record_evaluation(&mut self) {
        self.evaluations += 1;
    }
}

/// Pure gate functions parameterized by policy.
#[derive(Debug, Clone)]
pub struct GateEvaluator {
    policy: ApprovalPolicy,
    hours_per_day: f64,
}

impl GateEvaluator {
    pub fn new(policy: ApprovalPolicy, hours_per_day: f64) -> Self {
        Self {
            policy,
            hours_per_day,
        }
    }

    pub fn policy(&self) -> &ApprovalPolicy {
        &self.policy
    }

    /// Compare the plan's total estimated cost to the project budget.
    pub fn check_budget(&self, plan: &TaskPlan, project: &Project) -> BudgetCheck {
        BudgetCheck::compare(plan.total_cost(), project.budget.total)
    }

    /// Incremental check before dispatching `task`: spend already committed
    /// (completed plus in flight) plus this task against `limit`.
    pub fn check_task_budget(&self, committed: f64, task: &Task, limit: f64) -> BudgetCheck {
        BudgetCheck::compare(committed + task.estimated_cost, limit)
    }

    /// `required_days = ceil(remaining_hours / hours_per_day)` against
    /// `available_days = ceil((target_end - now) / 1 day)`.
    pub fn check_timeline(
        &self,
        plan: &TaskPlan,
        project: &Project,
        now: DateTime<Utc>,
    ) -> TimelineCheck {
        let remaining_hours: f64 = plan
            .tasks
            .iter()
            .filter(|t| !matches!(t.status, TaskStatus::Completed | TaskStatus::Cancelled))
            .map(|t| t.estimated_hours)
            .sum();
        let required_days = (remaining_hours / self.hours_per_day).ceil() as i64;

        let available_days = project
            .timeline
            .target_end_date
            .map(|end| ((end - now).num_milliseconds() as f64 / DAY_MS).ceil() as i64);

        let ok = match available_days {
            None => true,
            Some(_) if remaining_hours <= 0.0 => true,
            Some(available) => required_days <= available,
        };

        TimelineCheck {
            ok,
            remaining_hours,
            required_days,
            available_days,
        }
    }

    /// Carries the specialized marker or a specialized trade skill.
    pub fn is_specialized(&self, task: &Task) -> bool {
        let marker = &self.policy.specialized_marker;
        let marked = !marker.is_empty() && task.skills.iter().any(|s| s.eq_ignore_ascii_case(marker));
        marked || task.has_any_skill(&self.policy.specialized_skills)
    }

    /// Per-task approval requirement, if any.
    pub fn task_approval(&self, task: &Task) -> Option<ApprovalRequirement> {
        let mut reasons = Vec::new();
        let mut approval_type = None;

        if self.is_specialized(task) {
            reasons.push(format!("specialized work ({})", task.skills.join(", ")));
            approval_type.get_or_insert(ApprovalType::Safety);
        }
        if task.estimated_cost > self.policy.high_cost_threshold {
            reasons.push(format!(
                "estimated cost {:.2} exceeds {:.2}",
                task.estimated_cost, self.policy.high_cost_threshold
            ));
            approval_type.get_or_insert(ApprovalType::Purchase);
        }
        if self.policy.require_critical && task.priority == Priority::Critical {
            reasons.push("critical priority".to_string());
            approval_type.get_or_insert(ApprovalType::Safety);
        }

        approval_type.map(|approval_type| ApprovalRequirement {
            approval_type,
            reasons,
            amount: (task.estimated_cost > 0.0).then_some(task.estimated_cost),
        })
    }

    pub fn requires_approval(&self, task: &Task) -> bool {
        self.task_approval(task).is_some()
    }

    /// Whether a policy-declared approval point is newly reached.
    ///
    /// `pending` is the set of tasks not yet dispatched. Each point fires at
    /// most once per run.
    pub fn trigger_approval_point(
        &self,
        point: ApprovalType,
        pending: &[&Task],
        tracker: &PointTracker,
    ) -> bool {
        if !self.policy.points.contains(&point) || tracker.has_fired(point) {
            return false;
        }
        match point {
            ApprovalType::Plan => tracker.is_first_evaluation(),
            ApprovalType::LaborHire => pending
                .iter()
                .any(|t| t.has_any_skill(&self.policy.labor_skills)),
            ApprovalType::Permit => pending
                .iter()
                .any(|t| t.has_any_skill(&self.policy.permit_skills)),
            ApprovalType::Safety => pending.iter().any(|t| self.is_specialized(t)),
            ApprovalType::Purchase => pending
                .iter()
                .any(|t| t.estimated_cost > self.policy.high_cost_threshold),
        }
    }
}
