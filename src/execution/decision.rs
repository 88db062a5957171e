//! Human-decision boundary.
//!
//! The coordinator never blocks on a terminal itself. Whenever a gate or the
//! interactive mode needs a human, it builds a [`Prompt`] and awaits a
//! [`Choice`] from a [`DecisionProvider`]. The CLI answers from stdin, tests
//! answer from a script, and approve-all answers everything with yes.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::core::project::ApprovalType;
use crate::core::task::{Task, TaskId};
use crate::execution::edit::PlanEdit;
use crate::{Error, Result};

/// Which pre-flight check a run-level overrun prompt is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateKind {
    Budget,
    Timeline,
}

impl std::fmt::Display for GateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateKind::Budget => write!(f, "budget"),
            GateKind::Timeline => write!(f, "timeline"),
        }
    }
}

/// A question put to the human.
#[derive(Debug, Clone, PartialEq)]
pub enum Prompt {
    /// Sign-off on an approval point (`task_id` is `None`) or on one task.
    Approval {
        approval_type: ApprovalType,
        task_id: Option<TaskId>,
        description: String,
        amount: Option<f64>,
    },
    /// A budget or timeline check failed; accept the overrun or stop.
    Overrun { gate: GateKind, message: String },
    /// Interactive mode: pick the next task to dispatch.
    SelectTask { ready: Vec<Task> },
    /// Modify mode: a round has settled, edit the remaining plan or continue.
    ReviewRound { round: usize, pending: Vec<Task> },
}

impl Prompt {
    /// One-line summary, used for diagnostics and the terminal prompt.
    pub fn summary(&self) -> String {
        match self {
            Prompt::Approval {
                approval_type,
                task_id: Some(id),
                description,
                ..
            } => format!("{} approval for {}: {}", approval_type, id, description),
            Prompt::Approval {
                approval_type,
                task_id: None,
                description,
                ..
            } => format!("{} approval: {}", approval_type, description),
            Prompt::Overrun { gate, message } => format!("{} overrun: {}", gate, message),
            Prompt::SelectTask { ready } => format!("select one of {} ready task(s)", ready.len()),
            Prompt::ReviewRound { round, pending } => {
                format!("round {} settled, {} task(s) pending", round, pending.len())
            }
        }
    }
}

/// An answer from the human.
#[derive(Debug, Clone, PartialEq)]
pub enum Choice {
    Approve,
    Reject,
    /// Dispatch this ready task next.
    Select(TaskId),
    /// Cancel this ready task instead of running it.
    Skip(TaskId),
    /// Apply these edits to the remaining plan.
    Edit(Vec<PlanEdit>),
    /// Carry on without changes.
    Continue,
    /// Stop the run.
    Cancel,
}

#[async_trait]
pub trait DecisionProvider: Send + Sync {
    async fn decide(&self, prompt: &Prompt) -> Result<Choice>;

    /// Recorded as `approvedBy` on approvals this provider settles.
    fn name(&self) -> &str {
        "human"
    }
}

/// Answers every prompt without asking anyone.
///
/// Approvals and overruns are approved, the first ready task is selected,
/// and review rounds continue unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApproveAll;

#[async_trait]
impl DecisionProvider for ApproveAll {
    async fn decide(&self, prompt: &Prompt) -> Result<Choice> {
        Ok(match prompt {
            Prompt::Approval { .. } | Prompt::Overrun { .. } => Choice::Approve,
            Prompt::SelectTask { ready } => match ready.first() {
                Some(task) => Choice::Select(task.id.clone()),
                None => Choice::Continue,
            },
            Prompt::ReviewRound { .. } => Choice::Continue,
        })
    }

    fn name(&self) -> &str {
        "approve-all"
    }
}

/// Replays a fixed queue of choices, then falls back to a default.
///
/// Every prompt received is recorded so tests can assert on what was asked.
pub struct ScriptedDecisions {
    script: Mutex<VecDeque<Choice>>,
    fallback: Option<Choice>,
    seen: Mutex<Vec<Prompt>>,
}

impl ScriptedDecisions {
    /// Once `choices` is exhausted every prompt fails with
    /// `DecisionUnavailable`.
    pub fn new(choices: Vec<Choice>) -> Self {
        Self {
            script: Mutex::new(choices.into()),
            fallback: None,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn with_fallback(mut self, choice: Choice) -> Self {
        self.fallback = Some(choice);
        self
    }

    /// Prompts received so far, oldest first.
    pub fn prompts(&self) -> Vec<Prompt> {
        self.seen.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl DecisionProvider for ScriptedDecisions {
    async fn decide(&self, prompt: &Prompt) -> Result<Choice> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(prompt.clone());
        }
        let next = self
            .script
            .lock()
            .map_err(|_| Error::DecisionUnavailable("script lock poisoned".to_string()))?
            .pop_front();
        next.or_else(|| self.fallback.clone()).ok_or_else(|| {
            Error::DecisionUnavailable(format!("no scripted answer for: {}", prompt.summary()))
        })
    }

    fn name(&self) -> &str {
        "script"
    }
}
