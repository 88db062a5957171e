//! Task execution: gates, the coordinator, and its two external seams.

pub mod coordinator;
pub mod decision;
pub mod edit;
pub mod gate;
pub mod journal;
pub mod side_effect;

pub use coordinator::{
    Coordinator, DispatchMode, ExecuteOptions, ExecutionOutcome, ExecutionReport,
};
pub use decision::{ApproveAll, Choice, DecisionProvider, GateKind, Prompt, ScriptedDecisions};
pub use edit::PlanEdit;
pub use gate::{ApprovalRequirement, BudgetCheck, GateEvaluator, PointTracker, TimelineCheck};
pub use journal::{ExecutionLog, ExecutionLogEntry, LogAction, Projection};
pub use side_effect::{MockMarketplace, NoopSideEffect, SideEffect, TaskReceipt};
