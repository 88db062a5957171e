//! Execution coordinator.
//!
//! The coordinator drives one project from `PLAN` to a terminal phase. It
//! validates the task graph, runs the pre-flight gates, then loops in rounds:
//! compute the ready set, clear approval points and per-task gates, dispatch,
//! and wait for every dispatched task to settle before looking again.
//!
//! The coordinator is the only writer of task and execution state during a
//! run. Side-effect adapters see a snapshot and return receipts; humans are
//! reached through a [`DecisionProvider`] and never block the engine directly.

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::dag::TaskGraph;
use crate::core::project::{Approval, ApprovalType, Project, ProjectPhase};
use crate::core::task::{Task, TaskId, TaskStatus};
use crate::execution::decision::{Choice, DecisionProvider, GateKind, Prompt};
use crate::execution::gate::{GateEvaluator, PointTracker};
use crate::execution::journal::{ExecutionLogEntry, LogAction, Projection};
use crate::execution::side_effect::{SideEffect, TaskReceipt};
use crate::util::with_optional_timeout;
use crate::{klog, klog_debug, klog_warn, Error, Result};

/// Recorded as `requestedBy` on approvals raised by the engine.
const REQUESTER: &str = "keystone";

/// How ready tasks are picked for dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Every ready task runs concurrently, one round at a time.
    #[default]
    Batch,
    /// The human picks one ready task per iteration.
    Interactive,
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub dispatch: DispatchMode,
    /// Auto-satisfy every gate that would otherwise need a human.
    pub approve_all: bool,
    /// Walk the plan without invoking any side effect.
    pub dry_run: bool,
    /// Offer plan edits after each settled round.
    pub modify: bool,
}

/// Terminal result of one `execute` call.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed,
    Failed { reason: String },
    Cancelled,
    HaltedOnCycle { task_id: TaskId },
    HaltedOnNoProgress { stuck: Vec<TaskId> },
}

impl ExecutionOutcome {
    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            ExecutionOutcome::Completed => 0,
            ExecutionOutcome::Failed { .. } => 1,
            ExecutionOutcome::Cancelled => 2,
            ExecutionOutcome::HaltedOnCycle { .. } => 3,
            ExecutionOutcome::HaltedOnNoProgress { .. } => 4,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, ExecutionOutcome::Completed)
    }

    fn from_error(err: Error) -> Self {
        match err {
            Error::CyclicDependency { task_id } => ExecutionOutcome::HaltedOnCycle { task_id },
            Error::NoProgress { stuck } => ExecutionOutcome::HaltedOnNoProgress { stuck },
            other => ExecutionOutcome::Failed {
                reason: other.to_string(),
            },
        }
    }

    fn terminal_phase(&self) -> ProjectPhase {
        match self {
            ExecutionOutcome::Completed => ProjectPhase::Completed,
            ExecutionOutcome::Cancelled => ProjectPhase::Cancelled,
            _ => ProjectPhase::Failed,
        }
    }
}

impl std::fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionOutcome::Completed => write!(f, "completed"),
            ExecutionOutcome::Failed { reason } => write!(f, "failed: {}", reason),
            ExecutionOutcome::Cancelled => write!(f, "cancelled"),
            ExecutionOutcome::HaltedOnCycle { task_id } => {
                write!(f, "halted: dependency cycle through {}", task_id)
            }
            ExecutionOutcome::HaltedOnNoProgress { stuck } => {
                let ids: Vec<&str> = stuck.iter().map(TaskId::as_str).collect();
                write!(f, "halted: no progress possible for {}", ids.join(", "))
            }
        }
    }
}

/// Everything a caller needs after a run: the terminal signal and the
/// persistable project, whatever happened.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub outcome: ExecutionOutcome,
    pub project: Project,
    /// Policy overrides and aborted decisions.
    pub warnings: Vec<String>,
    /// Pending tasks stranded behind a failed, blocked or cancelled task.
    pub unreachable: Vec<TaskId>,
    /// Log entries appended by this run.
    pub entries: Vec<ExecutionLogEntry>,
}

impl ExecutionReport {
    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }

    fn unchanged(outcome: ExecutionOutcome, project: Project) -> Self {
        Self {
            outcome,
            project,
            warnings: Vec::new(),
            unreachable: Vec::new(),
            entries: Vec::new(),
        }
    }
}

/// Drives project execution. One run at a time per instance.
pub struct Coordinator {
    side_effect: Arc<dyn SideEffect>,
    decisions: Arc<dyn DecisionProvider>,
    config: Config,
    gate: GateEvaluator,
    cancel: CancellationToken,
    running: AtomicBool,
}

/// Clears the running flag even if the run future is dropped.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Coordinator {
    pub fn new(
        side_effect: Arc<dyn SideEffect>,
        decisions: Arc<dyn DecisionProvider>,
        config: Config,
    ) -> Self {
        let gate = GateEvaluator::new(config.approval.clone(), config.engine.hours_per_day);
        Self {
            side_effect,
            decisions,
            config,
            gate,
            cancel: CancellationToken::new(),
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Token that stops this coordinator. Cancelling it ends the current run
    /// at the next round boundary or pending decision, and every later run
    /// immediately.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Execute a project's plan to a terminal outcome.
    ///
    /// Never fails: validation errors, halts and cancellations all come back
    /// as an [`ExecutionOutcome`] alongside the mutated project.
    pub async fn execute(&self, project: Project, options: &ExecuteOptions) -> ExecutionReport {
        if self.running.swap(true, Ordering::SeqCst) {
            return ExecutionReport::unchanged(
                ExecutionOutcome::Failed {
                    reason: "coordinator is already running a project".to_string(),
                },
                project,
            );
        }
        let _guard = RunningGuard(&self.running);

        let graph = match Self::prepare(&project) {
            Ok(graph) => graph,
            Err(e) => {
                klog_warn!("project {} rejected before execution: {}", project.id, e);
                return ExecutionReport::unchanged(ExecutionOutcome::from_error(e), project);
            }
        };

        klog!(
            "execute project={} tasks={} mode={:?} approve_all={} dry_run={} modify={}",
            project.id,
            graph.task_count(),
            options.dispatch,
            options.approve_all,
            options.dry_run,
            options.modify
        );

        let mut run = Run::new(self, options, project, graph);
        let outcome = match run.drive().await {
            Ok(outcome) => outcome,
            Err(e) => ExecutionOutcome::from_error(e),
        };
        run.finish(outcome)
    }

    /// Build and validate the graph. Nothing is logged if this fails.
    fn prepare(project: &Project) -> Result<TaskGraph> {
        let graph = TaskGraph::from_plan(project.plan()?);
        graph.validate()?;
        Ok(graph)
    }
}

enum Verdict {
    Approved,
    Rejected,
    Aborted,
}

enum TaskGate {
    Clear,
    Blocked,
    Stop(ExecutionOutcome),
}

enum Selection {
    Run(TaskId),
    Skipped,
    Stop(ExecutionOutcome),
}

/// State of a single `execute` call.
struct Run<'a> {
    coordinator: &'a Coordinator,
    options: &'a ExecuteOptions,
    project: Project,
    graph: TaskGraph,
    /// Tasks whose dependents may start.
    completed: HashSet<TaskId>,
    tracker: PointTracker,
    warnings: Vec<String>,
    /// Budget overrun accepted so far, on top of `budget.total`.
    budget_allowance: f64,
    /// Set once the project moved into `execute`; until then `finish`
    /// hands the project back as it came in.
    entered: bool,
    log_start: usize,
    round: usize,
}

impl<'a> Run<'a> {
    fn new(
        coordinator: &'a Coordinator,
        options: &'a ExecuteOptions,
        project: Project,
        graph: TaskGraph,
    ) -> Self {
        let log_start = project.state.execution_log.len();
        Self {
            coordinator,
            options,
            project,
            graph,
            completed: HashSet::new(),
            tracker: PointTracker::new(),
            warnings: Vec::new(),
            budget_allowance: 0.0,
            entered: false,
            log_start,
            round: 0,
        }
    }

    async fn drive(&mut self) -> Result<ExecutionOutcome> {
        self.project.state.transition(ProjectPhase::Execute)?;
        self.entered = true;
        self.resume()?;

        if let Some(outcome) = self.preflight().await? {
            return Ok(outcome);
        }

        loop {
            if self.coordinator.cancel.is_cancelled() {
                klog!("cancellation requested, stopping before round {}", self.round + 1);
                return Ok(ExecutionOutcome::Cancelled);
            }
            self.refresh_projection();

            let mut ready: Vec<TaskId> = self
                .graph
                .ready_tasks(&self.completed)
                .into_iter()
                .map(|t| t.id.clone())
                .collect();

            if ready.is_empty() {
                let unreachable: HashSet<TaskId> = self.graph.unreachable().into_iter().collect();
                let stuck: Vec<TaskId> = self
                    .graph
                    .ids_with_status(TaskStatus::Pending)
                    .into_iter()
                    .filter(|id| !unreachable.contains(id))
                    .collect();
                if stuck.is_empty() {
                    return Ok(self.settled_outcome());
                }
                return Err(Error::NoProgress { stuck });
            }

            if let Some(outcome) = self.approval_points().await? {
                return Ok(outcome);
            }

            let candidates = match self.options.dispatch {
                DispatchMode::Batch => {
                    if let Some(cap) = self.coordinator.config.engine.max_concurrent {
                        ready.truncate(cap);
                    }
                    ready
                }
                DispatchMode::Interactive => match self.select(&ready).await? {
                    Selection::Run(id) => vec![id],
                    Selection::Skipped => continue,
                    Selection::Stop(outcome) => return Ok(outcome),
                },
            };

            let mut committed = self.committed_cost();
            let mut dispatch = Vec::with_capacity(candidates.len());
            for id in candidates {
                match self.clear_task_gates(&id, committed).await? {
                    TaskGate::Clear => {
                        committed += self.graph.get_task(&id).map_or(0.0, |t| t.estimated_cost);
                        dispatch.push(id);
                    }
                    TaskGate::Blocked => {}
                    TaskGate::Stop(outcome) => return Ok(outcome),
                }
            }

            self.round += 1;
            self.dispatch_round(&dispatch).await?;
            self.refresh_projection();

            if self.options.modify && !self.options.dry_run {
                if let Some(outcome) = self.review().await? {
                    return Ok(outcome);
                }
            }
        }
    }

    /// Reset tasks interrupted mid-flight by an earlier run and seed the
    /// completed set.
    fn resume(&mut self) -> Result<()> {
        for id in self.graph.ids_with_status(TaskStatus::InProgress) {
            klog!("resetting interrupted task {} to pending", id);
            self.graph.task_mut(&id)?.set_status(TaskStatus::Pending)?;
        }
        self.completed = self
            .graph
            .ids_with_status(TaskStatus::Completed)
            .into_iter()
            .collect();
        Ok(())
    }

    async fn preflight(&mut self) -> Result<Option<ExecutionOutcome>> {
        let coordinator = self.coordinator;
        let gate = &coordinator.gate;
        let plan = self.project.plan()?;
        let budget = gate.check_budget(plan, &self.project);
        let timeline = gate.check_timeline(plan, &self.project, Utc::now());

        if !budget.ok {
            let message = format!(
                "planned cost {:.2} exceeds budget {:.2} by {:.2} {}",
                budget.required, budget.limit, budget.overrun_amount, self.project.budget.currency
            );
            if !self.accept_overrun(GateKind::Budget, message).await {
                return Ok(Some(ExecutionOutcome::Cancelled));
            }
            self.budget_allowance = budget.overrun_amount;
        }

        if !timeline.ok {
            let message = format!(
                "{:.1} remaining hours need {} day(s), {} available",
                timeline.remaining_hours,
                timeline.required_days,
                timeline.available_days.unwrap_or_default()
            );
            if !self.accept_overrun(GateKind::Timeline, message).await {
                return Ok(Some(ExecutionOutcome::Cancelled));
            }
        }
        Ok(None)
    }

    async fn accept_overrun(&mut self, gate: GateKind, message: String) -> bool {
        if self.options.approve_all {
            klog_warn!("{} overrun accepted (approve-all): {}", gate, message);
            self.warnings
                .push(format!("{} overrun accepted by approve-all: {}", gate, message));
            return true;
        }
        let prompt = Prompt::Overrun {
            gate,
            message: message.clone(),
        };
        match self.decide(&prompt).await {
            Choice::Approve => {
                self.warnings.push(format!(
                    "{} overrun accepted by {}: {}",
                    gate,
                    self.coordinator.decisions.name(),
                    message
                ));
                true
            }
            choice => {
                klog!("{} overrun not accepted ({:?}), cancelling run", gate, choice);
                false
            }
        }
    }

    async fn approval_points(&mut self) -> Result<Option<ExecutionOutcome>> {
        let coordinator = self.coordinator;
        let gate = &coordinator.gate;
        for point in gate.policy().points.clone() {
            let pending: Vec<&Task> = self.graph.tasks().filter(|t| t.is_pending()).collect();
            if !gate.trigger_approval_point(point, &pending, &self.tracker) {
                continue;
            }
            let (description, amount) = self.describe_point(point, &pending);
            self.tracker.mark_fired(point);

            match self.request_approval(point, None, description, amount).await {
                Verdict::Approved => klog_debug!("approval point {} cleared", point),
                Verdict::Rejected | Verdict::Aborted => {
                    klog!("approval point {} not cleared, cancelling run", point);
                    return Ok(Some(ExecutionOutcome::Cancelled));
                }
            }
        }
        self.tracker.record_evaluation();
        Ok(None)
    }

    fn describe_point(&self, point: ApprovalType, pending: &[&Task]) -> (String, Option<f64>) {
        let gate = &self.coordinator.gate;
        let policy = gate.policy();
        let names = |keep: &dyn Fn(&Task) -> bool| -> String {
            pending
                .iter()
                .filter(|t| keep(**t))
                .map(|t| t.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };
        match point {
            ApprovalType::Plan => {
                let cost: f64 = pending.iter().map(|t| t.estimated_cost).sum();
                (
                    format!(
                        "execute {} task(s) of {} for {:.2} {}",
                        pending.len(),
                        self.project.name,
                        cost,
                        self.project.budget.currency
                    ),
                    Some(cost),
                )
            }
            ApprovalType::LaborHire => (
                format!(
                    "hire labor for: {}",
                    names(&|t: &Task| t.has_any_skill(&policy.labor_skills))
                ),
                None,
            ),
            ApprovalType::Permit => (
                format!(
                    "permits needed for: {}",
                    names(&|t: &Task| t.has_any_skill(&policy.permit_skills))
                ),
                None,
            ),
            ApprovalType::Safety => (
                format!(
                    "specialized work ahead: {}",
                    names(&|t: &Task| gate.is_specialized(t))
                ),
                None,
            ),
            ApprovalType::Purchase => (
                format!(
                    "purchases above {:.2}: {}",
                    policy.high_cost_threshold,
                    names(&|t: &Task| t.estimated_cost > policy.high_cost_threshold)
                ),
                None,
            ),
        }
    }

    /// Settle an approval, recording it on the project unless this is a dry run.
    async fn request_approval(
        &mut self,
        approval_type: ApprovalType,
        task_id: Option<TaskId>,
        description: String,
        amount: Option<f64>,
    ) -> Verdict {
        let (verdict, by) = if self.options.approve_all {
            (Verdict::Approved, "approve-all".to_string())
        } else {
            let prompt = Prompt::Approval {
                approval_type,
                task_id: task_id.clone(),
                description: description.clone(),
                amount,
            };
            let verdict = match self.decide(&prompt).await {
                Choice::Approve => Verdict::Approved,
                Choice::Cancel => Verdict::Aborted,
                _ => Verdict::Rejected,
            };
            (verdict, self.coordinator.decisions.name().to_string())
        };

        if matches!(verdict, Verdict::Aborted) {
            return verdict;
        }
        if self.options.dry_run {
            // Nothing is recorded, so the report is the only trace.
            if self.options.approve_all {
                let subject = task_id.map(|id| format!(" for {}", id)).unwrap_or_default();
                klog_debug!("{} approval{} auto-approved in dry run", approval_type, subject);
                self.warnings.push(format!(
                    "{} approval{} auto-approved by approve-all (dry run): {}",
                    approval_type, subject, description
                ));
            }
            return verdict;
        }
        let mut approval = Approval::request(approval_type, task_id, &description, amount, REQUESTER);
        match approval.resolve(matches!(verdict, Verdict::Approved), &by) {
            Ok(()) => self.project.state.approvals.push(approval),
            Err(e) => klog_warn!("could not record approval: {}", e),
        }
        verdict
    }

    /// Ask the decision provider, honoring cancellation and the decision
    /// timeout. Anything that prevents an answer is treated as `Cancel`.
    async fn decide(&mut self, prompt: &Prompt) -> Choice {
        let coordinator = self.coordinator;
        klog_debug!("decision requested: {}", prompt.summary());
        let answer = tokio::select! {
            _ = coordinator.cancel.cancelled() => {
                Err(Error::DecisionUnavailable("run cancelled".to_string()))
            }
            answer = with_optional_timeout(
                coordinator.config.engine.decision_timeout(),
                coordinator.decisions.decide(prompt),
            ) => answer,
        };
        match answer {
            Ok(choice) => choice,
            Err(e) => {
                klog_warn!("decision aborted: {}", e);
                self.warnings
                    .push(format!("decision aborted ({}): {}", prompt.summary(), e));
                Choice::Cancel
            }
        }
    }

    async fn select(&mut self, ready: &[TaskId]) -> Result<Selection> {
        let tasks: Vec<Task> = ready
            .iter()
            .filter_map(|id| self.graph.get_task(id).cloned())
            .collect();
        match self.decide(&Prompt::SelectTask { ready: tasks }).await {
            Choice::Select(id) if ready.contains(&id) => Ok(Selection::Run(id)),
            Choice::Skip(id) if ready.contains(&id) => {
                self.withhold(&id, TaskStatus::Cancelled, "skipped by operator")?;
                Ok(Selection::Skipped)
            }
            Choice::Cancel => Ok(Selection::Stop(ExecutionOutcome::Cancelled)),
            Choice::Select(id) | Choice::Skip(id) => {
                Err(Error::Validation(format!("task {} is not ready", id)))
            }
            other => Err(Error::Validation(format!(
                "unexpected answer to task selection: {:?}",
                other
            ))),
        }
    }

    /// Incremental budget check, then per-task approval.
    async fn clear_task_gates(&mut self, id: &TaskId, committed: f64) -> Result<TaskGate> {
        let task = self
            .graph
            .get_task(id)
            .cloned()
            .ok_or_else(|| Error::TaskNotFound(id.clone()))?;
        let coordinator = self.coordinator;
        let gate = &coordinator.gate;

        // Widened only once the task clears every gate below.
        let mut allowance = 0.0;
        let limit = self.project.budget.total + self.budget_allowance;
        let budget = gate.check_task_budget(committed, &task, limit);
        if !budget.ok {
            let reason = format!(
                "committed cost would reach {:.2}, over {:.2} by {:.2}",
                budget.required, budget.limit, budget.overrun_amount
            );
            match self
                .gate_task(&task, ApprovalType::Purchase, reason.clone(), Some(task.estimated_cost))
                .await?
            {
                TaskGate::Clear => {
                    if self.options.approve_all {
                        self.warnings.push(format!(
                            "budget overrun accepted by approve-all for {}: {}",
                            task.id, reason
                        ));
                    }
                    allowance = budget.overrun_amount;
                }
                other => return Ok(other),
            }
        }

        if let Some(requirement) = gate.task_approval(&task) {
            match self
                .gate_task(
                    &task,
                    requirement.approval_type,
                    requirement.reason(),
                    requirement.amount,
                )
                .await?
            {
                TaskGate::Clear => {}
                other => return Ok(other),
            }
        }
        self.budget_allowance += allowance;
        Ok(TaskGate::Clear)
    }

    /// Hold a task for a decision. The log shows `paused` while a human
    /// decides and `resumed` once they approve.
    async fn gate_task(
        &mut self,
        task: &Task,
        approval_type: ApprovalType,
        reason: String,
        amount: Option<f64>,
    ) -> Result<TaskGate> {
        let asks_human = !self.options.approve_all;
        if asks_human {
            self.append(ExecutionLogEntry::new(
                &task.id,
                LogAction::Paused,
                &format!("Awaiting {} approval: {}", approval_type, reason),
            ));
        }

        match self
            .request_approval(approval_type, Some(task.id.clone()), reason, amount)
            .await
        {
            Verdict::Approved => {
                if asks_human {
                    self.append(ExecutionLogEntry::new(
                        &task.id,
                        LogAction::Resumed,
                        &format!("{} approval granted", approval_type),
                    ));
                }
                Ok(TaskGate::Clear)
            }
            Verdict::Rejected => {
                klog!("task {} blocked: {} approval rejected", task.id, approval_type);
                self.withhold(
                    &task.id,
                    TaskStatus::Blocked,
                    &format!("{} approval rejected", approval_type),
                )?;
                Ok(TaskGate::Blocked)
            }
            Verdict::Aborted => Ok(TaskGate::Stop(ExecutionOutcome::Cancelled)),
        }
    }

    /// Take a pending task out of the run without dispatching it.
    fn withhold(&mut self, id: &TaskId, status: TaskStatus, reason: &str) -> Result<()> {
        let dry_run = self.options.dry_run;
        let task = self.graph.task_mut(id)?;
        if dry_run {
            return task.set_status(status);
        }
        match status {
            TaskStatus::Blocked => task.block(reason),
            _ => {
                task.cancel()?;
                task.notes.push(format!("cancelled: {}", reason));
                Ok(())
            }
        }
    }

    async fn dispatch_round(&mut self, ids: &[TaskId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        klog_debug!("round {}: dispatching {} task(s)", self.round, ids.len());

        let now = Utc::now();
        let mut snapshots = Vec::with_capacity(ids.len());
        for id in ids {
            let task = self.graph.task_mut(id)?;
            if self.options.dry_run {
                task.set_status(TaskStatus::InProgress)?;
            } else {
                task.start(now)?;
            }
            snapshots.push(task.clone());
            let description = format!("Started {}", task.name);
            self.append(ExecutionLogEntry::new(id, LogAction::Started, &description).at(now));
            self.project.state.current_task = Some(id.clone());
        }

        if self.options.dry_run {
            for task in snapshots {
                self.graph.task_mut(&task.id)?.set_status(TaskStatus::Completed)?;
                self.completed.insert(task.id.clone());
                self.append(ExecutionLogEntry::new(
                    &task.id,
                    LogAction::Completed,
                    &format!("Completed {} (dry run)", task.name),
                ));
            }
        } else {
            let context = Arc::new(self.project.clone());
            let timeout = self.coordinator.config.engine.task_timeout();
            let mut in_flight: FuturesUnordered<_> = snapshots
                .into_iter()
                .map(|task| {
                    let side_effect = Arc::clone(&self.coordinator.side_effect);
                    let context = Arc::clone(&context);
                    async move {
                        let id = task.id.clone();
                        let mut handle =
                            tokio::spawn(async move { side_effect.perform(task, context).await });
                        let result = match tokio::time::timeout(timeout, &mut handle).await {
                            Ok(Ok(result)) => result,
                            Ok(Err(join)) => Err(Error::TaskJoin(join.to_string())),
                            Err(_) => {
                                handle.abort();
                                Err(Error::Timeout(timeout))
                            }
                        };
                        (id, result)
                    }
                })
                .collect();

            while let Some((id, result)) = in_flight.next().await {
                self.settle(&id, result)?;
            }
        }

        self.project.state.current_task = None;
        Ok(())
    }

    /// Apply a side-effect result. Failures stay with the task.
    fn settle(&mut self, id: &TaskId, result: Result<TaskReceipt>) -> Result<()> {
        let now = Utc::now();
        let task = self.graph.task_mut(id)?;
        let entry = match result {
            Ok(receipt) => {
                task.complete(now)?;
                if receipt.worker.is_some() {
                    task.assignee = receipt.worker.clone();
                }
                let refs = receipt.evidence.iter().map(|e| e.reference.clone()).collect();
                for evidence in receipt.evidence {
                    task.add_evidence(evidence);
                }
                ExecutionLogEntry::new(id, LogAction::Completed, &format!("Completed {}", task.name))
                    .at(now)
                    .with_worker(receipt.worker)
                    .with_duration(task.actual_hours.unwrap_or(0.0))
                    .with_evidence(refs)
            }
            Err(e) => {
                let reason = e.to_string();
                klog_warn!("task {} failed: {}", id, reason);
                task.fail(now, &reason)?;
                let entry = ExecutionLogEntry::new(
                    id,
                    LogAction::Failed,
                    &format!("{} failed: {}", task.name, reason),
                )
                .at(now);
                match task.start_time {
                    Some(start) => entry.with_duration(hours_between(start, now)),
                    None => entry,
                }
            }
        };

        if entry.action == LogAction::Completed {
            self.completed.insert(id.clone());
        }
        self.append(entry);
        Ok(())
    }

    async fn review(&mut self) -> Result<Option<ExecutionOutcome>> {
        let pending: Vec<Task> = self
            .graph
            .tasks()
            .filter(|t| t.is_pending())
            .cloned()
            .collect();
        if pending.is_empty() {
            return Ok(None);
        }

        let prompt = Prompt::ReviewRound {
            round: self.round,
            pending,
        };
        match self.decide(&prompt).await {
            Choice::Edit(edits) => {
                for edit in &edits {
                    match edit.apply(&mut self.graph) {
                        Ok(true) => klog!("plan edit applied: {}", edit),
                        Ok(false) => klog_debug!("plan edit had no effect: {}", edit),
                        Err(e) => {
                            klog_warn!("plan edit rejected: {}: {}", edit, e);
                            self.warnings.push(format!("plan edit rejected ({}): {}", edit, e));
                        }
                    }
                }
                Ok(None)
            }
            Choice::Cancel => Ok(Some(ExecutionOutcome::Cancelled)),
            Choice::Continue | Choice::Approve => Ok(None),
            other => {
                self.warnings
                    .push(format!("ignored answer to round review: {:?}", other));
                Ok(None)
            }
        }
    }

    /// Estimated cost of everything already completed.
    fn committed_cost(&self) -> f64 {
        self.graph
            .tasks()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.estimated_cost)
            .sum()
    }

    /// Completed iff every task completed or was cancelled.
    fn settled_outcome(&self) -> ExecutionOutcome {
        if self
            .graph
            .tasks()
            .all(|t| matches!(t.status, TaskStatus::Completed | TaskStatus::Cancelled))
        {
            return ExecutionOutcome::Completed;
        }
        let count = |status| self.graph.ids_with_status(status).len();
        ExecutionOutcome::Failed {
            reason: format!(
                "{} failed, {} blocked, {} unreachable",
                count(TaskStatus::Failed),
                count(TaskStatus::Blocked),
                self.graph.unreachable().len()
            ),
        }
    }

    fn refresh_projection(&mut self) {
        let projection = Projection::from_tasks(self.graph.tasks());
        self.project.state.completed_tasks = projection.completed;
        self.project.state.blocked_tasks = projection.blocked;
    }

    fn append(&mut self, entry: ExecutionLogEntry) {
        self.project.state.execution_log.append(entry);
    }

    fn finish(mut self, outcome: ExecutionOutcome) -> ExecutionReport {
        if !self.entered {
            klog!(
                "execute refused project={} phase={} outcome={}",
                self.project.id,
                self.project.phase(),
                outcome
            );
            return ExecutionReport {
                warnings: self.warnings,
                ..ExecutionReport::unchanged(outcome, self.project)
            };
        }

        let unreachable = self.graph.unreachable();
        self.refresh_projection();
        self.project.state.current_task = None;

        if self.project.phase() == ProjectPhase::Execute {
            if let Err(e) = self.project.state.transition(outcome.terminal_phase()) {
                klog_warn!("could not close run: {}", e);
            }
        }

        let dry_run = self.options.dry_run;
        let tasks = self.graph.into_tasks();
        if let Some(plan) = self.project.plan.as_mut() {
            if dry_run {
                let statuses: HashMap<&TaskId, TaskStatus> =
                    tasks.iter().map(|t| (&t.id, t.status)).collect();
                for task in plan.tasks.iter_mut() {
                    if let Some(status) = statuses.get(&task.id) {
                        task.status = *status;
                    }
                }
            } else {
                plan.tasks = tasks;
                self.project.updated_at = Utc::now();
            }
        }

        let entries = self
            .project
            .state
            .execution_log
            .since(self.log_start)
            .to_vec();
        klog!(
            "execute finished project={} outcome={} phase={} entries={} unreachable={}",
            self.project.id,
            outcome,
            self.project.phase(),
            entries.len(),
            unreachable.len()
        );

        ExecutionReport {
            outcome,
            project: self.project,
            warnings: self.warnings,
            unreachable,
            entries,
        }
    }
}

fn hours_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds().max(0) as f64 / 3_600_000.0
}
