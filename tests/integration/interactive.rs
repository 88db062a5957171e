//! Interactive dispatch and round review tests.

use keystone::core::project::ProjectPhase;
use keystone::core::task::{TaskId, TaskStatus};
use keystone::execution::{
    Choice, ExecuteOptions, ExecutionOutcome, LogAction, PlanEdit, Prompt,
};

use crate::fixtures::*;

fn started_order(report: &keystone::ExecutionReport) -> Vec<String> {
    report
        .entries
        .iter()
        .filter(|e| e.action == LogAction::Started)
        .map(|e| e.task_id.to_string())
        .collect()
}

fn select(id: &str) -> Choice {
    Choice::Select(TaskId::from(id))
}

/// Test: Operator picks the order
/// Given the diamond plan in interactive mode
/// When the operator selects e, a, c, b, d
/// Then tasks run one at a time in exactly that order
#[tokio::test]
async fn test_interactive_runs_selected_order() {
    let harness = Harness::scripted(vec![
        select("e"),
        select("a"),
        select("c"),
        select("b"),
        select("d"),
    ]);
    let report = harness.run(diamond_project(), &interactive()).await;

    assert!(report.outcome.is_completed());
    assert_eq!(started_order(&report), vec!["e", "a", "c", "b", "d"]);

    let prompts = harness.decisions.prompts();
    assert_eq!(prompts.len(), 5);
    match &prompts[0] {
        Prompt::SelectTask { ready } => {
            let offered: Vec<&str> = ready.iter().map(|t| t.id.as_str()).collect();
            assert_eq!(offered, vec!["a", "e"]);
        }
        other => panic!("unexpected prompt {:?}", other),
    }

    // One task per iteration: every start is followed by its own completion.
    let pairs = log_pairs(&report);
    for chunk in pairs.chunks(2) {
        assert_eq!(chunk[0].0, chunk[1].0);
        assert_eq!(chunk[0].1, LogAction::Started);
        assert_eq!(chunk[1].1, LogAction::Completed);
    }
}

/// Test: Skipping a task
/// Given a chain a -> b -> c in interactive mode
/// When the operator skips a
/// Then a is cancelled, b and c are unreachable, and nothing runs
#[tokio::test]
async fn test_skip_cancels_task_and_strands_dependents() {
    let harness = Harness::scripted(vec![Choice::Skip(TaskId::from("a"))]);
    let report = harness.run(chain_project(1000.0), &interactive()).await;

    assert_eq!(status(&report, "a"), TaskStatus::Cancelled);
    assert!(task(&report, "a").notes.iter().any(|n| n.contains("skipped")));
    assert_eq!(report.unreachable, ids(&["b", "c"]));
    assert!(report.entries.is_empty());
    assert!(harness.market.invocations().is_empty());
    assert!(matches!(report.outcome, ExecutionOutcome::Failed { .. }));
    assert_eq!(harness.decisions.prompts().len(), 1);
}

/// Test: Skipping an independent task
/// Given the diamond plan in interactive mode
/// When the operator skips e and runs the rest
/// Then the run completes because cancelled tasks count as done
#[tokio::test]
async fn test_skip_independent_task_still_completes() {
    let harness = Harness::scripted(vec![
        Choice::Skip(TaskId::from("e")),
        select("a"),
        select("b"),
        select("c"),
        select("d"),
    ]);
    let report = harness.run(diamond_project(), &interactive()).await;

    assert_eq!(report.outcome, ExecutionOutcome::Completed);
    assert_eq!(status(&report, "e"), TaskStatus::Cancelled);
    assert_eq!(report.project.phase(), ProjectPhase::Completed);
    assert_eq!(started_order(&report), vec!["a", "b", "c", "d"]);
}

/// Test: Selecting a task that is not ready
/// Given the diamond plan in interactive mode
/// When the operator selects d before its dependencies ran
/// Then the run fails without dispatching anything
#[tokio::test]
async fn test_selecting_unready_task_fails() {
    let harness = Harness::scripted(vec![select("d")]);
    let report = harness.run(diamond_project(), &interactive()).await;

    match &report.outcome {
        ExecutionOutcome::Failed { reason } => assert!(reason.contains("not ready")),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(report.project.phase(), ProjectPhase::Failed);
    assert!(report.entries.is_empty());
    assert_eq!(status(&report, "d"), TaskStatus::Pending);
}

/// Test: Quitting from the selection prompt
/// Given interactive mode
/// When the operator quits at the first prompt
/// Then the run is cancelled
#[tokio::test]
async fn test_cancel_at_selection() {
    let harness = Harness::scripted(vec![Choice::Cancel]);
    let report = harness.run(chain_project(1000.0), &interactive()).await;

    assert_eq!(report.outcome, ExecutionOutcome::Cancelled);
    assert_eq!(report.exit_code(), 2);
    assert_eq!(report.project.phase(), ProjectPhase::Cancelled);
}

/// Test: Editing the plan between rounds
/// Given a chain a -> b -> c with round review enabled
/// When the review after round one re-estimates b, cancels c and appends a task
/// Then later rounds see the edited plan and the run completes
#[tokio::test]
async fn test_review_edits_apply_to_later_rounds() {
    let appended = PlanEdit::append("Seal pavers", 1.0, 20.0);
    let appended_id = match &appended {
        PlanEdit::AppendTask(t) => t.id.clone(),
        other => panic!("unexpected edit {:?}", other),
    };
    let edits = vec![
        PlanEdit::SetEstimatedHours {
            task_id: TaskId::from("b"),
            hours: 6.0,
        },
        PlanEdit::CancelTask(TaskId::from("c")),
        appended,
        PlanEdit::CancelTask(TaskId::from("gazebo")),
    ];
    let harness = Harness::scripted(vec![Choice::Edit(edits)]);
    let report = harness.run(chain_project(1000.0), &modify()).await;

    assert_eq!(report.outcome, ExecutionOutcome::Completed);
    assert_eq!(task(&report, "b").estimated_hours, 6.0);
    assert_eq!(status(&report, "b"), TaskStatus::Completed);
    assert_eq!(status(&report, "c"), TaskStatus::Cancelled);
    assert_eq!(
        report.project.task_status(&appended_id),
        Some(TaskStatus::Completed)
    );

    // The unknown id is reported, not fatal.
    assert!(report
        .warnings
        .iter()
        .any(|w| w.contains("plan edit rejected") && w.contains("gazebo")));

    // Only the first round left pending work to review.
    let prompts = harness.decisions.prompts();
    assert_eq!(prompts.len(), 1);
    assert!(matches!(prompts[0], Prompt::ReviewRound { round: 1, .. }));
}

/// Test: Review is skipped on dry run
/// Given round review enabled together with dry-run and approve-all
/// When executed
/// Then no review prompt is asked
#[tokio::test]
async fn test_dry_run_skips_review() {
    let harness = Harness::scripted(vec![]);
    let options = ExecuteOptions {
        modify: true,
        ..dry_run_approve_all()
    };
    let report = harness.run(chain_project(1000.0), &options).await;

    assert!(report.outcome.is_completed());
    assert!(harness.decisions.prompts().is_empty());
}
