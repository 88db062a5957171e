//! Approval gate tests.
//!
//! Per-task approvals pause the task in the log while a human decides;
//! run-level approval points fire once per run.

use keystone::core::plan::TaskPlan;
use keystone::core::project::{ApprovalStatus, ApprovalType, Project, ProjectPhase};
use keystone::core::task::{Priority, Task, TaskStatus};
use keystone::execution::{
    Choice, ExecutionOutcome, LogAction, MockMarketplace, PlanEdit, Prompt, ScriptedDecisions,
};

use crate::fixtures::*;

/// `panel` is critical and gates `circuits`.
fn critical_project() -> Project {
    Project::new("Sub-panel", 2000.0).with_plan(TaskPlan::new(vec![
        Task::new("panel", "Mount sub-panel")
            .with_priority(Priority::Critical)
            .with_estimate(3.0, 200.0),
        Task::new("circuits", "Run circuits")
            .depends_on(&["panel"])
            .with_estimate(5.0, 300.0),
    ]))
}

/// Test: Approved critical task
/// Given a critical task and a human who approves it
/// When executed
/// Then the log shows paused, resumed, started and completed, in that order
#[tokio::test]
async fn test_approved_critical_task_pauses_then_resumes() {
    let harness = Harness::new(
        MockMarketplace::new(),
        ScriptedDecisions::new(vec![Choice::Approve]),
        config_with_points(&[]),
    );
    let report = harness.run(critical_project(), &gated()).await;

    assert!(report.outcome.is_completed());
    assert_eq!(
        actions_for(&report, "panel"),
        vec![
            LogAction::Paused,
            LogAction::Resumed,
            LogAction::Started,
            LogAction::Completed
        ]
    );
    assert_eq!(
        actions_for(&report, "circuits"),
        vec![LogAction::Started, LogAction::Completed]
    );

    let approvals = &report.project.state.approvals;
    assert_eq!(approvals.len(), 1);
    let approval = &approvals[0];
    assert_eq!(approval.approval_type, ApprovalType::Safety);
    assert_eq!(approval.status, ApprovalStatus::Approved);
    assert_eq!(approval.task_id.as_ref().map(|id| id.as_str()), Some("panel"));
    assert_eq!(approval.approved_by.as_deref(), Some("script"));
    assert_eq!(approval.requested_by, "keystone");
    assert!(approval.approved_at.is_some());
}

/// Test: Rejected critical task
/// Given a critical task and a human who rejects it
/// When executed
/// Then the task is blocked, its dependent is unreachable, and the run fails
#[tokio::test]
async fn test_rejected_task_is_blocked() {
    let harness = Harness::new(
        MockMarketplace::new(),
        ScriptedDecisions::new(vec![Choice::Reject]),
        config_with_points(&[]),
    );
    let report = harness.run(critical_project(), &gated()).await;

    assert_eq!(status(&report, "panel"), TaskStatus::Blocked);
    assert_eq!(status(&report, "circuits"), TaskStatus::Pending);
    assert_eq!(report.unreachable, ids(&["circuits"]));
    assert_eq!(report.project.state.blocked_tasks, ids(&["panel"]));
    assert_eq!(
        report.outcome,
        ExecutionOutcome::Failed {
            reason: "0 failed, 1 blocked, 1 unreachable".to_string()
        }
    );
    assert_eq!(report.project.phase(), ProjectPhase::Failed);
    assert!(harness.market.invocations().is_empty());

    // The trailing pause is what marks the task blocked on replay.
    assert_eq!(actions_for(&report, "panel"), vec![LogAction::Paused]);
    let replayed = report.project.state.execution_log.replay();
    assert_eq!(replayed.blocked, ids(&["panel"]));

    let approval = &report.project.state.approvals[0];
    assert_eq!(approval.status, ApprovalStatus::Rejected);
    assert!(task(&report, "panel")
        .notes
        .iter()
        .any(|n| n.contains("safety approval rejected")));
}

/// Test: Approve-all records approvals without pausing
/// Given a plan approval point and a critical task
/// When executed with approve-all
/// Then both approvals are recorded as approve-all and no paused entry exists
#[tokio::test]
async fn test_approve_all_records_without_pausing() {
    let harness = Harness::new(
        MockMarketplace::new(),
        ScriptedDecisions::new(vec![]),
        config_with_points(&[ApprovalType::Plan]),
    );
    let report = harness.run(critical_project(), &approve_all()).await;

    assert!(report.outcome.is_completed());
    assert!(harness.decisions.prompts().is_empty());
    assert!(report.entries.iter().all(|e| e.action != LogAction::Paused));

    let approvals = &report.project.state.approvals;
    let kinds: Vec<ApprovalType> = approvals.iter().map(|a| a.approval_type).collect();
    assert_eq!(kinds, vec![ApprovalType::Plan, ApprovalType::Safety]);
    assert!(approvals
        .iter()
        .all(|a| a.status == ApprovalStatus::Approved
            && a.approved_by.as_deref() == Some("approve-all")));
    assert!(approvals[0].task_id.is_none());
    assert_eq!(approvals[0].amount, Some(500.0));
}

/// Test: Rejected plan approval
/// Given the plan approval point is active
/// When the human rejects it
/// Then the run is cancelled before any task starts
#[tokio::test]
async fn test_rejected_plan_point_cancels() {
    let harness = Harness::new(
        MockMarketplace::new(),
        ScriptedDecisions::new(vec![Choice::Reject]),
        config_with_points(&[ApprovalType::Plan]),
    );
    let report = harness.run(chain_project(1000.0), &gated()).await;

    assert_eq!(report.outcome, ExecutionOutcome::Cancelled);
    assert_eq!(report.project.phase(), ProjectPhase::Cancelled);
    assert!(report.entries.is_empty());

    let prompts = harness.decisions.prompts();
    assert_eq!(prompts.len(), 1);
    assert!(matches!(
        prompts[0],
        Prompt::Approval {
            approval_type: ApprovalType::Plan,
            task_id: None,
            ..
        }
    ));
    assert_eq!(report.project.state.approvals[0].status, ApprovalStatus::Rejected);
}

/// Test: Labor hire fires once
/// Given several tasks needing hired labor across rounds
/// When executed with a single scripted approval
/// Then the labor approval is asked exactly once and the run completes
#[tokio::test]
async fn test_labor_hire_point_fires_once() {
    let project = Project::new("Fence", 2000.0).with_plan(TaskPlan::new(vec![
        Task::new("posts", "Set posts")
            .with_skills(&["carpentry"])
            .with_estimate(4.0, 200.0),
        Task::new("rails", "Hang rails")
            .depends_on(&["posts"])
            .with_skills(&["carpentry"])
            .with_estimate(4.0, 150.0),
        Task::new("paint", "Paint fence")
            .depends_on(&["rails"])
            .with_skills(&["painting"])
            .with_estimate(3.0, 80.0),
    ]));
    let harness = Harness::new(
        MockMarketplace::new(),
        ScriptedDecisions::new(vec![Choice::Approve]),
        config_with_points(&[ApprovalType::LaborHire]),
    );
    let report = harness.run(project, &gated()).await;

    assert!(report.outcome.is_completed());
    assert_eq!(harness.decisions.prompts().len(), 1);
    assert_eq!(harness.decisions.remaining(), 0);
    let approval = &report.project.state.approvals[0];
    assert_eq!(approval.approval_type, ApprovalType::LaborHire);
    assert!(approval.description.contains("Set posts"));
}

/// Test: Incremental budget gate
/// Given a plan exactly at budget and a costly task appended during review
/// When the purchase approval for the new task is rejected
/// Then the new task is blocked while the original plan completes
#[tokio::test]
async fn test_incremental_budget_blocks_appended_task() {
    let edit = PlanEdit::append("Haul debris", 2.0, 400.0);
    let PlanEdit::AppendTask(appended) = &edit else {
        panic!("append builds an AppendTask edit");
    };
    let appended_id = appended.id.clone();

    let harness = Harness::new(
        MockMarketplace::new(),
        ScriptedDecisions::new(vec![Choice::Edit(vec![edit.clone()]), Choice::Reject])
            .with_fallback(Choice::Continue),
        permissive_config(),
    );
    let report = harness.run(chain_project(450.0), &modify()).await;

    assert_eq!(status(&report, "a"), TaskStatus::Completed);
    assert_eq!(status(&report, "b"), TaskStatus::Completed);
    assert_eq!(status(&report, "c"), TaskStatus::Completed);
    assert_eq!(
        report.project.task_status(&appended_id),
        Some(TaskStatus::Blocked)
    );
    assert!(matches!(report.outcome, ExecutionOutcome::Failed { .. }));

    let gated = report
        .project
        .state
        .approvals
        .iter()
        .find(|a| a.task_id.as_ref() == Some(&appended_id))
        .expect("purchase approval for appended task");
    assert_eq!(gated.approval_type, ApprovalType::Purchase);
    assert_eq!(gated.amount, Some(400.0));
    assert_eq!(gated.status, ApprovalStatus::Rejected);

    let paused: Vec<_> = report
        .entries
        .iter()
        .filter(|e| e.task_id == appended_id)
        .map(|e| e.action)
        .collect();
    assert_eq!(paused, vec![LogAction::Paused]);
}

/// Test: Rejected task keeps the budget closed
/// Given a plan near budget and two costly tasks appended during review
/// When the first one's budget overrun is approved but its purchase
///      approval is rejected
/// Then the second is still held at the budget gate instead of running
///      on the overrun granted to the first
#[tokio::test]
async fn test_rejected_task_does_not_widen_budget() {
    let project = Project::new("Shed", 1000.0).with_plan(TaskPlan::new(vec![
        Task::new("a", "Pour slab").with_estimate(6.0, 900.0),
        Task::new("b", "Cure slab")
            .depends_on(&["a"])
            .with_estimate(1.0, 0.0),
    ]));
    let frame = PlanEdit::append("Frame walls", 8.0, 1200.0);
    let roof = PlanEdit::append("Roof", 6.0, 1000.0);
    let id_of = |edit: &PlanEdit| match edit {
        PlanEdit::AppendTask(task) => task.id.clone(),
        _ => panic!("append builds an AppendTask edit"),
    };
    let (frame_id, roof_id) = (id_of(&frame), id_of(&roof));

    let mut config = permissive_config();
    config.approval.high_cost_threshold = 1100.0;
    let harness = Harness::new(
        MockMarketplace::new(),
        ScriptedDecisions::new(vec![
            Choice::Edit(vec![frame, roof]),
            Choice::Approve,
            Choice::Reject,
            Choice::Reject,
        ])
        .with_fallback(Choice::Continue),
        config,
    );
    let report = harness.run(project, &modify()).await;

    assert_eq!(harness.market.invocations(), ids(&["a", "b"]));
    assert_eq!(report.project.task_status(&frame_id), Some(TaskStatus::Blocked));
    assert_eq!(report.project.task_status(&roof_id), Some(TaskStatus::Blocked));
    assert_eq!(
        report.outcome,
        ExecutionOutcome::Failed {
            reason: "0 failed, 2 blocked, 0 unreachable".to_string()
        }
    );

    let asked: Vec<_> = harness
        .decisions
        .prompts()
        .into_iter()
        .filter_map(|p| match p {
            Prompt::Approval {
                approval_type,
                task_id: Some(id),
                ..
            } => Some((approval_type, id)),
            _ => None,
        })
        .collect();
    assert_eq!(
        asked,
        vec![
            (ApprovalType::Purchase, frame_id.clone()),
            (ApprovalType::Purchase, frame_id),
            (ApprovalType::Purchase, roof_id),
        ]
    );
    assert_eq!(harness.decisions.remaining(), 0);
}

/// Options for human-gated runs: batch dispatch, nothing auto-approved.
fn gated() -> keystone::ExecuteOptions {
    keystone::ExecuteOptions::default()
}
