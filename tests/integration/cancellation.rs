//! Cancellation and timeout tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use keystone::core::project::{Project, ProjectPhase};
use keystone::core::task::{Task, TaskStatus};
use keystone::execution::{
    Choice, Coordinator, DecisionProvider, ExecuteOptions, ExecutionOutcome, LogAction,
    MockMarketplace, NoopSideEffect, Prompt, ScriptedDecisions, SideEffect, TaskReceipt,
};
use keystone::Result;

use crate::fixtures::*;

/// Completes every task, cancelling the run from inside the first one.
#[derive(Default)]
struct CancelOnFirstTask {
    token: Mutex<Option<CancellationToken>>,
}

#[async_trait]
impl SideEffect for CancelOnFirstTask {
    async fn perform(&self, _task: Task, _context: Arc<Project>) -> Result<TaskReceipt> {
        if let Some(token) = self.token.lock().unwrap().take() {
            token.cancel();
        }
        Ok(TaskReceipt::default())
    }

    fn name(&self) -> &str {
        "cancel-on-first"
    }
}

/// Never answers.
struct Silent;

#[async_trait]
impl DecisionProvider for Silent {
    async fn decide(&self, _prompt: &Prompt) -> Result<Choice> {
        std::future::pending::<Result<Choice>>().await
    }
}

/// Test: Cancellation between rounds
/// Given a chain a -> b -> c
/// When the run is cancelled while a is in flight
/// Then a finishes, the run stops before b, and the outcome is Cancelled
#[tokio::test]
async fn test_cancel_lets_in_flight_task_finish() {
    let side_effect = Arc::new(CancelOnFirstTask::default());
    let coordinator = Coordinator::new(
        Arc::clone(&side_effect) as Arc<dyn SideEffect>,
        Arc::new(ScriptedDecisions::new(vec![])),
        permissive_config(),
    );
    *side_effect.token.lock().unwrap() = Some(coordinator.cancellation_token());

    let report = coordinator
        .execute(chain_project(1000.0), &approve_all())
        .await;

    assert_eq!(report.outcome, ExecutionOutcome::Cancelled);
    assert_eq!(report.exit_code(), 2);
    assert_eq!(report.project.phase(), ProjectPhase::Cancelled);
    assert_eq!(status(&report, "a"), TaskStatus::Completed);
    assert_eq!(status(&report, "b"), TaskStatus::Pending);
    assert_eq!(status(&report, "c"), TaskStatus::Pending);
    assert_eq!(
        log_pairs(&report),
        vec![
            ("a".to_string(), LogAction::Started),
            ("a".to_string(), LogAction::Completed),
        ]
    );
    assert!(!coordinator.is_running());
}

/// Test: Cancelled before start
/// Given a coordinator whose token is already cancelled
/// When a project is executed
/// Then nothing is dispatched
#[tokio::test]
async fn test_cancel_before_first_round() {
    let harness = Harness::permissive();
    harness.coordinator.cancel();

    let report = harness.run(diamond_project(), &approve_all()).await;

    assert_eq!(report.outcome, ExecutionOutcome::Cancelled);
    assert!(report.entries.is_empty());
    assert!(harness.market.invocations().is_empty());
}

/// Test: Per-task timeout
/// Given a task timeout of 1s and a marketplace that takes 5s
/// When executed
/// Then the task fails with a timeout and its dependent is unreachable
#[tokio::test(start_paused = true)]
async fn test_task_timeout_fails_task() {
    let mut config = permissive_config();
    config.engine.task_timeout_secs = 1;
    let harness = Harness::new(
        MockMarketplace::new().with_delay(Duration::from_secs(5)),
        ScriptedDecisions::new(vec![]),
        config,
    );

    let report = harness.run(chain_project(1000.0), &approve_all()).await;

    assert_eq!(status(&report, "a"), TaskStatus::Failed);
    assert_eq!(report.unreachable, ids(&["b", "c"]));
    assert!(task(&report, "a")
        .notes
        .iter()
        .any(|n| n.contains("timed out")));
    assert_eq!(actions_for(&report, "a"), vec![LogAction::Started, LogAction::Failed]);
    assert!(matches!(report.outcome, ExecutionOutcome::Failed { .. }));
}

/// Test: Decision timeout
/// Given a decision provider that never answers and a 1s decision timeout
/// When a budget overrun needs a decision
/// Then the run is cancelled with a warning
#[tokio::test(start_paused = true)]
async fn test_unanswered_decision_cancels() {
    let mut config = permissive_config();
    config.engine.decision_timeout_secs = 1;
    let coordinator = Coordinator::new(Arc::new(NoopSideEffect), Arc::new(Silent), config);

    let report = coordinator
        .execute(chain_project(100.0), &ExecuteOptions::default())
        .await;

    assert_eq!(report.outcome, ExecutionOutcome::Cancelled);
    assert!(report.entries.is_empty());
    assert!(report
        .warnings
        .iter()
        .any(|w| w.starts_with("decision aborted")));
}

/// Test: Cancellation while a human decides
/// Given a decision provider that never answers and no decision timeout
/// When the run is cancelled during the question
/// Then the question is abandoned and the run is cancelled
#[tokio::test]
async fn test_cancel_interrupts_pending_decision() {
    let coordinator = Coordinator::new(
        Arc::new(NoopSideEffect),
        Arc::new(Silent),
        permissive_config(),
    );
    let token = coordinator.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
    });

    let report = coordinator
        .execute(chain_project(100.0), &ExecuteOptions::default())
        .await;

    assert_eq!(report.outcome, ExecutionOutcome::Cancelled);
    assert_eq!(report.project.phase(), ProjectPhase::Cancelled);
}

/// Test: One run at a time
/// Given a coordinator running a slow project
/// When a second execute is attempted on the same coordinator
/// Then the second call is refused and leaves its project untouched
#[tokio::test]
async fn test_busy_coordinator_refuses_second_run() {
    let harness = Harness::new(
        MockMarketplace::new().with_delay(Duration::from_millis(200)),
        ScriptedDecisions::new(vec![]),
        permissive_config(),
    );

    let first_approvals = approve_all();
    let first = harness.run(chain_project(1000.0), &first_approvals);
    let second = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        harness.run(diamond_project(), &approve_all()).await
    };
    let (first, second) = tokio::join!(first, second);

    assert!(first.outcome.is_completed());
    match &second.outcome {
        ExecutionOutcome::Failed { reason } => assert!(reason.contains("already running")),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(second.project.phase(), ProjectPhase::Plan);
    assert!(second.entries.is_empty());
}
