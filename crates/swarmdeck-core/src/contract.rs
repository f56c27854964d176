//! Contracts for the external collaborators the orchestrator calls out to.
//!
//! These live in `swarmdeck-core` so that embedders (the CLI, tests, a web
//! dashboard) can implement them without depending on the orchestrator.

use crate::agent::Agent;
use crate::collab::CollaborationMessage;
use crate::metrics::ResourceUsage;
use crate::monitoring::{Alert, AlertAction};
use crate::task::Task;
use crate::SwarmdeckResult;
use async_trait::async_trait;
use tracing::info;

/// Why a task execution failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ExecutionFailure {
    pub message: String,
    /// The agent itself is at fault (crashed, misconfigured) rather than
    /// the task input. Faulted agents are parked in `error` status.
    pub agent_fault: bool,
}

impl ExecutionFailure {
    /// The task failed; the agent can keep working.
    pub fn task(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            agent_fault: false,
        }
    }

    /// The agent failed and should not receive more work until remediated.
    pub fn agent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            agent_fault: true,
        }
    }
}

/// Performs a task's actual work on behalf of an agent.
///
/// Implementations may run for an unbounded time; the dispatcher applies a
/// timeout only when one is configured.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, agent: &Agent, task: &Task)
        -> Result<serde_json::Value, ExecutionFailure>;
}

/// Carries out an alert remediation action by name.
///
/// Returns a short human-readable detail recorded in the alert's action log.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, action: &AlertAction, alert: &Alert) -> SwarmdeckResult<String>;
}

/// Action executor that performs nothing and only logs. Used when no
/// executor is injected.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingActionExecutor;

#[async_trait]
impl ActionExecutor for LoggingActionExecutor {
    async fn execute(&self, action: &AlertAction, alert: &Alert) -> SwarmdeckResult<String> {
        info!(
            action = %action.action_type,
            alert_id = %alert.id,
            rule = %alert.rule_name,
            "No action executor configured, action logged only"
        );
        Ok(format!("{} logged", action.action_type))
    }
}

/// Samples CPU and memory usage attributed to an agent.
pub trait ResourceProbe: Send + Sync {
    fn sample(&self, agent: &Agent) -> ResourceUsage;
}

/// Synchronous receiver for urgent messages addressed to an agent.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &CollaborationMessage) -> SwarmdeckResult<()>;
}
