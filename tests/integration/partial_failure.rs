//! Partial failure and ordering tests.
//!
//! A failed task must never take down independent branches, and no task
//! may start before all of its dependencies have finished.

use std::time::Duration;

use keystone::config::Config;
use keystone::core::plan::TaskPlan;
use keystone::core::project::{Project, ProjectPhase};
use keystone::core::task::{Task, TaskStatus};
use keystone::execution::{
    ExecutionOutcome, LogAction, MockMarketplace, ScriptedDecisions,
};

use crate::fixtures::*;

fn harness_with(market: MockMarketplace) -> Harness {
    Harness::new(market, ScriptedDecisions::new(vec![]), permissive_config())
}

/// Test: Failure isolation
/// Given the diamond plan where b fails
/// When executed
/// Then c and e still complete, d is unreachable, and the run fails
#[tokio::test]
async fn test_failed_branch_does_not_stop_independent_work() {
    let harness = harness_with(MockMarketplace::new().with_failures(&["b"]));
    let report = harness.run(diamond_project(), &approve_all()).await;

    assert_eq!(status(&report, "a"), TaskStatus::Completed);
    assert_eq!(status(&report, "b"), TaskStatus::Failed);
    assert_eq!(status(&report, "c"), TaskStatus::Completed);
    assert_eq!(status(&report, "e"), TaskStatus::Completed);
    assert_eq!(status(&report, "d"), TaskStatus::Pending);

    assert_eq!(report.unreachable, ids(&["d"]));
    assert!(matches!(report.outcome, ExecutionOutcome::Failed { .. }));
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.project.phase(), ProjectPhase::Failed);

    // No retry and no dispatch of the stranded dependent.
    let calls = harness.market.invocations();
    assert_eq!(calls.iter().filter(|id| id.as_str() == "b").count(), 1);
    assert!(!calls.iter().any(|id| id.as_str() == "d"));
}

/// Test: Failure bookkeeping
/// Given a task that fails in the marketplace
/// When executed
/// Then the failure is logged with a duration and noted on the task
#[tokio::test]
async fn test_failure_is_logged_and_noted() {
    let harness = harness_with(MockMarketplace::new().with_failures(&["c"]));
    let report = harness.run(chain_project(1000.0), &approve_all()).await;

    assert_eq!(actions_for(&report, "c"), vec![LogAction::Started, LogAction::Failed]);
    let failed = report
        .entries
        .iter()
        .find(|e| e.action == LogAction::Failed)
        .expect("failed entry");
    assert!(failed.description.contains("no bids"));
    assert!(failed.duration.is_some());

    let c = task(&report, "c");
    assert!(c.end_time.is_some());
    assert!(c.notes.iter().any(|n| n.starts_with("failed:")));
    assert!(report.unreachable.is_empty());
}

/// Test: Failed and blocked tasks are not done
/// Given a plan where only a failure remains
/// When the run settles
/// Then the projection lists completed tasks only, in plan order
#[tokio::test]
async fn test_projection_after_failure() {
    let harness = harness_with(MockMarketplace::new().with_failures(&["a"]));
    let report = harness.run(diamond_project(), &approve_all()).await;

    assert_eq!(report.project.state.completed_tasks, ids(&["e"]));
    assert!(report.project.state.blocked_tasks.is_empty());
    assert_eq!(report.unreachable, ids(&["b", "c", "d"]));

    let replayed = report.project.state.execution_log.replay();
    assert_eq!(replayed.completed, ids(&["e"]));
    assert_eq!(replayed.failed, ids(&["a"]));
}

/// Test: Dependency timing
/// Given d depends on b and c, with b and c taking different times
/// When executed for real
/// Then d starts no earlier than both b and c ended
#[tokio::test]
async fn test_no_task_starts_before_dependencies_end() {
    let market = MockMarketplace::new()
        .with_task_delay("b", Duration::from_millis(120))
        .with_task_delay("c", Duration::from_millis(20));
    let report = harness_with(market)
        .run(diamond_project(), &approve_all())
        .await;
    assert!(report.outcome.is_completed());

    let plan = report.project.plan().unwrap();
    for t in &plan.tasks {
        let start = t.start_time.expect("start time");
        for dep in &t.depends_on {
            let dep_end = plan.task(dep).and_then(|d| d.end_time).expect("dep end time");
            assert!(start >= dep_end, "{} started before {} ended", t.id, dep);
        }
    }
}

/// Test: Completion order inside a round
/// Given two independent tasks where the first is slower
/// When both run in one round
/// Then they start in plan order and complete in true completion order
#[tokio::test]
async fn test_log_preserves_completion_order() {
    let project = Project::new("Yard", 500.0).with_plan(TaskPlan::new(vec![
        Task::new("slow", "Mow"),
        Task::new("fast", "Rake"),
    ]));
    let market = MockMarketplace::new()
        .with_task_delay("slow", Duration::from_millis(150))
        .with_task_delay("fast", Duration::from_millis(5));
    let report = harness_with(market).run(project, &approve_all()).await;

    assert_eq!(
        log_pairs(&report),
        vec![
            ("slow".to_string(), LogAction::Started),
            ("fast".to_string(), LogAction::Started),
            ("fast".to_string(), LogAction::Completed),
            ("slow".to_string(), LogAction::Completed),
        ]
    );
}

/// Test: Rounds run concurrently
/// Given three independent tasks that each take 200ms
/// When executed in one round
/// Then the round takes far less than the serial total
#[tokio::test]
async fn test_round_dispatch_is_concurrent() {
    let project = Project::new("Windows", 900.0).with_plan(TaskPlan::new(vec![
        Task::new("w1", "Window 1"),
        Task::new("w2", "Window 2"),
        Task::new("w3", "Window 3"),
    ]));
    let market = MockMarketplace::new().with_delay(Duration::from_millis(200));
    let harness = Harness::new(market, ScriptedDecisions::new(vec![]), Config::default());

    let started = std::time::Instant::now();
    let report = harness.run(project, &approve_all()).await;
    let elapsed = started.elapsed();

    assert!(report.outcome.is_completed());
    assert!(
        elapsed < Duration::from_millis(550),
        "round took {:?}, expected concurrent dispatch",
        elapsed
    );
}
