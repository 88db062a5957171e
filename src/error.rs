use thiserror::Error;

use crate::core::task::TaskId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Cyclic dependency detected at task {task_id}")]
    CyclicDependency { task_id: TaskId },

    #[error("Dependency {from} -> {to} references a task that does not exist")]
    DanglingReference { from: TaskId, to: TaskId },

    #[error("Duplicate task id: {0}")]
    DuplicateTask(TaskId),

    #[error("No task can make progress ({} pending)", stuck.len())]
    NoProgress { stuck: Vec<TaskId> },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Invalid transition for task {task_id} from {from} to {to}")]
    InvalidTaskTransition {
        task_id: TaskId,
        from: String,
        to: String,
    },

    #[error("Invalid phase transition from {from} to {to}")]
    InvalidPhaseTransition { from: String, to: String },

    #[error("Side effect failed: {0}")]
    SideEffect(String),

    #[error("Decision unavailable: {0}")]
    DecisionUnavailable(String),

    #[error("Project has no task plan")]
    MissingPlan,
}

pub type Result<T> = std::result::Result<T, Error>;
