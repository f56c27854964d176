use crate::config::MatchPolicy;
use crate::registry::AgentRegistry;
use crate::task_store::TaskStore;
use crate::tick::{TickGuard, TickOutcome};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use swarmdeck_core::{
    Agent, ExecutionFailure, SwarmdeckError, SwarmdeckResult, Task, TaskExecutor,
};
use tokio::task::{AbortHandle, JoinError};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A task handed to an agent during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub task_id: Uuid,
    pub agent_id: Uuid,
}

/// A task whose dispatch failed during a tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchError {
    pub task_id: Uuid,
    pub error: String,
}

/// What one scheduling tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub started: Vec<Assignment>,
    /// Eligible tasks left pending because no suitable agent was idle.
    pub deferred: Vec<Uuid>,
    pub errors: Vec<DispatchError>,
}

/// Pulls eligible tasks, matches them to idle agents, and starts them.
///
/// Executions run detached on a [`TaskTracker`]; their outcome is written
/// back to the task store and the agent is released when they finish.
pub struct Dispatcher {
    tasks: Arc<TaskStore>,
    agents: Arc<AgentRegistry>,
    executor: Arc<dyn TaskExecutor>,
    policy: MatchPolicy,
    timeout: Option<Duration>,
    guard: TickGuard,
    tracker: TaskTracker,
    running: Arc<Mutex<HashMap<Uuid, AbortHandle>>>,
}

impl Dispatcher {
    pub fn new(
        tasks: Arc<TaskStore>,
        agents: Arc<AgentRegistry>,
        executor: Arc<dyn TaskExecutor>,
        policy: MatchPolicy,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            tasks,
            agents,
            executor,
            policy,
            timeout,
            guard: TickGuard::new(),
            tracker: TaskTracker::new(),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run one scheduling pass.
    ///
    /// Each eligible task is dispatched in isolation: a failure is recorded in
    /// the report and the pass moves on to the next task. Agents picked during
    /// the pass are excluded for the rest of it.
    pub async fn tick(&self) -> SwarmdeckResult<TickOutcome<TickReport>> {
        let Some(_permit) = self.guard.try_acquire() else {
            debug!("Dispatcher tick still running, skipping");
            return Ok(TickOutcome::Skipped);
        };

        let eligible = self.tasks.eligible().await?;
        let mut report = TickReport::default();
        let mut reserved = HashSet::new();

        for task in eligible {
            let task_id = task.id;
            match self.dispatch(task, &mut reserved).await {
                Ok(Some(agent_id)) => report.started.push(Assignment { task_id, agent_id }),
                Ok(None) => report.deferred.push(task_id),
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "Dispatch failed");
                    report.errors.push(DispatchError {
                        task_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        if !report.started.is_empty() || !report.errors.is_empty() {
            info!(
                started = report.started.len(),
                deferred = report.deferred.len(),
                errors = report.errors.len(),
                "Dispatcher tick complete"
            );
        }
        Ok(TickOutcome::Completed(report))
    }

    /// Cancel a task. A running execution is aborted; its agent is released
    /// when the execution winds down.
    pub async fn cancel(&self, task_id: Uuid, reason: Option<String>) -> SwarmdeckResult<Task> {
        let task = self.tasks.cancel(task_id, reason).await?;
        if let Some(handle) = self.running.lock().remove(&task_id) {
            handle.abort();
        }
        Ok(task)
    }

    /// Number of executions still in flight.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Wait until every in-flight execution has finished.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Wait for in-flight executions, aborting them after `grace`.
    pub async fn drain(&self, grace: Duration) {
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            let handles: Vec<AbortHandle> = self.running.lock().drain().map(|(_, h)| h).collect();
            warn!(aborted = handles.len(), "Aborting executions still running at shutdown");
            for handle in handles {
                handle.abort();
            }
            self.tracker.wait().await;
        }
    }

    async fn dispatch(
        &self,
        task: Task,
        reserved: &mut HashSet<Uuid>,
    ) -> SwarmdeckResult<Option<Uuid>> {
        let Some(agent) = self
            .agents
            .select_for(&task.task_type, self.policy, reserved)
            .await?
        else {
            return Ok(None);
        };
        reserved.insert(agent.id);

        self.tasks.assign(task.id, agent.id).await?;
        if let Err(e) = self.agents.mark_assigned(agent.id).await {
            self.abandon(task.id, false, &e).await;
            return Err(e);
        }

        let task = match self.tasks.start(task.id).await {
            Ok(task) => task,
            Err(e) => {
                self.abandon(task.id, false, &e).await;
                if let Err(e) = self.agents.unassign(agent.id).await {
                    warn!(agent_id = %agent.id, error = %e, "Failed to release assignment");
                }
                return Err(e);
            }
        };
        let agent = match self.agents.mark_started(agent.id).await {
            Ok(agent) => agent,
            Err(e) => {
                self.abandon(task.id, true, &e).await;
                return Err(e);
            }
        };

        info!(
            task_id = %task.id,
            agent_id = %agent.id,
            task_type = %task.task_type,
            priority = %task.priority,
            "Task started"
        );
        let agent_id = agent.id;
        self.spawn_execution(agent, task);
        Ok(Some(agent_id))
    }

    /// Take a half-dispatched task out of circulation.
    async fn abandon(&self, task_id: Uuid, started: bool, cause: &SwarmdeckError) {
        let result = if started {
            self.tasks.fail(task_id, format!("dispatch failed: {cause}")).await
        } else {
            self.tasks
                .cancel(task_id, Some(format!("dispatch failed: {cause}")))
                .await
        };
        if let Err(e) = result {
            error!(task_id = %task_id, error = %e, "Failed to abandon task");
        }
    }

    fn spawn_execution(&self, agent: Agent, task: Task) {
        let executor = self.executor.clone();
        let (exec_agent, exec_task) = (agent.clone(), task.clone());
        let handle = self.tracker.spawn(async move {
            executor.execute(&exec_agent, &exec_task).await
        });
        self.running.lock().insert(task.id, handle.abort_handle());

        let tasks = self.tasks.clone();
        let agents = self.agents.clone();
        let running = self.running.clone();
        let limit = self.timeout;
        self.tracker.spawn(async move {
            let started = Instant::now();
            let outcome = await_execution(handle, limit).await;
            running.lock().remove(&task.id);
            let elapsed_ms = started.elapsed().as_millis() as u64;
            finish(&tasks, &agents, &agent, &task, outcome, elapsed_ms).await;
        });
    }
}

async fn await_execution(
    mut handle: tokio::task::JoinHandle<Result<serde_json::Value, ExecutionFailure>>,
    limit: Option<Duration>,
) -> Result<serde_json::Value, ExecutionFailure> {
    let joined = match limit {
        None => (&mut handle).await,
        Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                handle.abort();
                return Err(ExecutionFailure::task(format!(
                    "execution timed out after {}s",
                    limit.as_secs()
                )));
            }
        },
    };
    joined.unwrap_or_else(|e| Err(join_failure(e)))
}

fn join_failure(e: JoinError) -> ExecutionFailure {
    if e.is_cancelled() {
        ExecutionFailure::task("execution cancelled")
    } else {
        ExecutionFailure::agent(format!("executor panicked: {e}"))
    }
}

/// Record an execution's outcome and free the agent.
async fn finish(
    tasks: &TaskStore,
    agents: &AgentRegistry,
    agent: &Agent,
    task: &Task,
    outcome: Result<serde_json::Value, ExecutionFailure>,
    elapsed_ms: u64,
) {
    let (success, agent_fault) = match &outcome {
        Ok(_) => (true, false),
        Err(failure) => (false, failure.agent_fault),
    };
    let recorded = match outcome {
        Ok(output) => tasks.complete(task.id, output).await,
        Err(failure) => {
            warn!(
                task_id = %task.id,
                agent_id = %agent.id,
                agent_fault = failure.agent_fault,
                error = %failure,
                "Task failed"
            );
            tasks.fail(task.id, failure.message).await
        }
    };
    let counted = match recorded {
        Ok(task) => {
            info!(task_id = %task.id, agent_id = %agent.id, status = %task.status, "Task finished");
            Some(task.actual_duration_ms.unwrap_or(elapsed_ms))
        }
        // Cancelled while running; the outcome does not count.
        Err(SwarmdeckError::InvalidTransition { from, .. }) => {
            debug!(task_id = %task.id, status = %from, "Discarding outcome of finished task");
            None
        }
        Err(e) => {
            error!(task_id = %task.id, error = %e, "Failed to record task outcome");
            None
        }
    };

    let released = match counted {
        Some(duration_ms) => match agents.release(agent.id, agent_fault).await {
            Ok(_) => agents
                .record_outcome(agent.id, success, Some(duration_ms))
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        },
        None => agents.release(agent.id, false).await.map(|_| ()),
    };
    match released {
        Ok(()) => {}
        Err(SwarmdeckError::NotFound { .. }) => {
            debug!(agent_id = %agent.id, "Agent unregistered during execution");
        }
        Err(e) => error!(agent_id = %agent.id, error = %e, "Failed to release agent"),
    }
}
