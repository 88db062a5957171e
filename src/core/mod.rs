//! Core domain models: tasks, plans, projects and the task graph.

pub mod dag;
pub mod plan;
pub mod project;
pub mod task;

pub use dag::{DependencyEdge, TaskGraph};
pub use plan::{Dependency, DependencyType, TaskPlan};
pub use project::{
    Approval, ApprovalStatus, ApprovalType, Budget, ExecutionState, Project, ProjectPhase, Stage,
    Timeline,
};
pub use task::{Evidence, Priority, Task, TaskId, TaskStatus};
