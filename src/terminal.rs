//! Terminal answers for the human-decision boundary.

use async_trait::async_trait;
use std::io::{self, BufRead, Write};

use crate::core::task::{Task, TaskId};
use crate::execution::decision::{Choice, DecisionProvider, Prompt};
use crate::execution::edit::PlanEdit;
use crate::util::blocking;
use crate::{klog_debug, Error, Result};

const MAX_ATTEMPTS: usize = 3;

/// Asks on stdout, reads the answer from stdin on a blocking thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalDecisions;

#[async_trait]
impl DecisionProvider for TerminalDecisions {
    async fn decide(&self, prompt: &Prompt) -> Result<Choice> {
        let prompt = prompt.clone();
        blocking(move || {
            let stdin = io::stdin();
            let mut input = stdin.lock();
            for _ in 0..MAX_ATTEMPTS {
                print!("{}", render(&prompt));
                io::stdout().flush()?;

                let mut line = String::new();
                if input.read_line(&mut line)? == 0 {
                    return Err(Error::DecisionUnavailable("stdin closed".to_string()));
                }
                match parse_answer(&prompt, &line) {
                    Some(choice) => {
                        klog_debug!("terminal answer: {:?}", choice);
                        return Ok(choice);
                    }
                    None => println!("Unrecognized answer: {}", line.trim()),
                }
            }
            Err(Error::DecisionUnavailable(format!(
                "no valid answer after {} attempts",
                MAX_ATTEMPTS
            )))
        })
        .await
    }

    fn name(&self) -> &str {
        "operator"
    }
}

fn task_line(index: usize, task: &Task) -> String {
    format!(
        "  {}. {} [{}] {:.1}h {:.2}\n",
        index + 1,
        task.name,
        task.id,
        task.estimated_hours,
        task.estimated_cost
    )
}

/// Question text shown for a prompt.
pub fn render(prompt: &Prompt) -> String {
    match prompt {
        Prompt::Approval { amount, .. } => {
            let amount = amount.map(|a| format!(" ({:.2})", a)).unwrap_or_default();
            format!("\n{}{}\nApprove? [y]es / [n]o / [q]uit: ", prompt.summary(), amount)
        }
        Prompt::Overrun { .. } => {
            format!("\n{}\nProceed anyway? [y]es / [n]o: ", prompt.summary())
        }
        Prompt::SelectTask { ready } => {
            let mut out = String::from("\nReady tasks:\n");
            for (i, task) in ready.iter().enumerate() {
                out.push_str(&task_line(i, task));
            }
            out.push_str("Run which? <number|id>, s <number|id> to skip, q to quit: ");
            out
        }
        Prompt::ReviewRound { round, pending } => {
            let mut out = format!("\nRound {} done. Pending tasks:\n", round);
            for (i, task) in pending.iter().enumerate() {
                out.push_str(&task_line(i, task));
            }
            out.push_str(
                "Edits separated by ';' (cancel <id> | hours <id> <h> | add <hours> <cost> <name>), \
                 Enter to continue, q to quit: ",
            );
            out
        }
    }
}

/// Map one line of input to a choice. `None` means ask again.
pub fn parse_answer(prompt: &Prompt, line: &str) -> Option<Choice> {
    let answer = line.trim();
    if matches!(answer, "q" | "quit") {
        return Some(Choice::Cancel);
    }
    match prompt {
        Prompt::Approval { .. } | Prompt::Overrun { .. } => match answer.to_lowercase().as_str() {
            "y" | "yes" => Some(Choice::Approve),
            "n" | "no" => Some(Choice::Reject),
            _ => None,
        },
        Prompt::SelectTask { ready } => {
            if let Some(rest) = answer.strip_prefix("s ") {
                return pick(ready, rest.trim()).map(Choice::Skip);
            }
            pick(ready, answer).map(Choice::Select)
        }
        Prompt::ReviewRound { .. } => {
            if answer.is_empty() || matches!(answer, "c" | "continue") {
                return Some(Choice::Continue);
            }
            answer
                .split(';')
                .map(|part| parse_edit(part.trim()))
                .collect::<Option<Vec<_>>>()
                .map(Choice::Edit)
        }
    }
}

/// A 1-based number into `ready`, or a task id.
fn pick(ready: &[Task], answer: &str) -> Option<TaskId> {
    if let Ok(n) = answer.parse::<usize>() {
        return ready.get(n.checked_sub(1)?).map(|t| t.id.clone());
    }
    ready
        .iter()
        .find(|t| t.id.as_str() == answer)
        .map(|t| t.id.clone())
}

fn parse_edit(text: &str) -> Option<PlanEdit> {
    let mut words = text.split_whitespace();
    match words.next()? {
        "cancel" => Some(PlanEdit::CancelTask(TaskId::from(words.next()?))),
        "hours" => {
            let task_id = TaskId::from(words.next()?);
            let hours = words.next()?.parse().ok()?;
            Some(PlanEdit::SetEstimatedHours { task_id, hours })
        }
        "add" => {
            let hours = words.next()?.parse().ok()?;
            let cost = words.next()?.parse().ok()?;
            let name = words.collect::<Vec<_>>().join(" ");
            (!name.is_empty()).then(|| PlanEdit::append(&name, hours, cost))
        }
        _ => None,
    }
}
