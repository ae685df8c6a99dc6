use skillpipe_sandbox::DispatchError;
use thiserror::Error;

use crate::types::{TaskId, TaskStatus};

#[derive(Debug, Error)]
pub enum PipelineError {
    /// No decomposition satisfies the request.
    #[error("Plan infeasible: {0}")]
    PlanInfeasible(String),

    #[error("Task graph has a dependency cycle through: {}", .0.join(" -> "))]
    CyclicDependency(Vec<TaskId>),

    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("Duplicate task id '{0}'")]
    DuplicateTask(TaskId),

    #[error("Unknown task '{0}'")]
    UnknownTask(TaskId),

    #[error("Task '{task}' has unresolved required slots: {}", .slots.join(", "))]
    SlotUnresolved { task: TaskId, slots: Vec<String> },

    #[error("Task '{task}' cannot move from {from} to {to}")]
    InvalidTransition {
        task: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("No tool available for task '{0}'")]
    NoTool(TaskId),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}
