use crate::task::TaskStatus;
use thiserror::Error;
use uuid::Uuid;

/// A convenience `Result` alias using [`SwarmdeckError`].
pub type SwarmdeckResult<T> = Result<T, SwarmdeckError>;

/// Top-level error type for Swarmdeck.
///
/// Rejections (bad transitions, permission failures, validation) are raised
/// before any mutation happens, so callers can retry or report without
/// cleaning up partial state.
#[derive(Error, Debug)]
pub enum SwarmdeckError {
    /// A referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind (e.g. `task`, `agent`).
        entity: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// A task status change that the state machine does not allow.
    #[error("Invalid transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        /// Task being transitioned.
        task: Uuid,
        /// Current status.
        from: TaskStatus,
        /// Requested status.
        to: TaskStatus,
    },

    /// A task was started while some of its dependencies are not completed.
    #[error("Task {task} has {} unfinished dependencies", pending.len())]
    DependenciesNotMet {
        /// Task that was about to start.
        task: Uuid,
        /// Dependencies that are not yet completed.
        pending: Vec<Uuid>,
    },

    /// Submitting the task would introduce a dependency cycle.
    #[error("Dependency cycle detected involving task {0}")]
    DependencyCycle(Uuid),

    /// The calling agent lacks permission on a shared resource.
    #[error("Access denied: agent {agent} may not {action} resource '{key}'")]
    AccessDenied {
        /// Caller.
        agent: Uuid,
        /// Attempted action (`read`, `write`, `delete`).
        action: &'static str,
        /// Resource key.
        key: String,
    },

    /// Input failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Error from the persistence collaborator.
    #[error("Store error: {0}")]
    Store(String),

    /// Error raised by the execution collaborator.
    #[error("Execution error: {0}")]
    Execution(String),

    /// Error raised by the action collaborator.
    #[error("Action error: {0}")]
    Action(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SwarmdeckError {
    /// Shorthand for [`SwarmdeckError::NotFound`].
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let id = Uuid::new_v4();
        let err = SwarmdeckError::InvalidTransition {
            task: id,
            from: TaskStatus::Completed,
            to: TaskStatus::Pending,
        };
        assert_eq!(
            err.to_string(),
            format!("Invalid transition for task {id}: completed -> pending")
        );

        let err = SwarmdeckError::DependenciesNotMet {
            task: id,
            pending: vec![Uuid::new_v4(), Uuid::new_v4()],
        };
        assert!(err.to_string().contains("2 unfinished dependencies"));

        let err = SwarmdeckError::not_found("agent", id);
        assert_eq!(err.to_string(), format!("agent not found: {id}"));
    }
}
