use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use swarmdeck_core::{
    EventBus, OrchestratorEvent, SwarmdeckError, SwarmdeckResult, Task, TaskStatus,
};
use swarmdeck_store::{Persistence, PersistenceExt};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Counts of tasks per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub pending: usize,
    pub assigned: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total: usize,
}

/// Owns task records and enforces the task state machine.
///
/// Every transition is a read-validate-write under one lock, so a rejected
/// transition leaves the stored record untouched.
pub struct TaskStore {
    db: Arc<dyn Persistence>,
    events: EventBus,
    lock: Mutex<()>,
}

impl TaskStore {
    pub fn new(db: Arc<dyn Persistence>, events: EventBus) -> Self {
        Self {
            db,
            events,
            lock: Mutex::new(()),
        }
    }

    /// Add a new pending task.
    ///
    /// Rejects tasks that reference unknown dependencies or would close a
    /// dependency cycle.
    pub async fn submit(&self, task: Task) -> SwarmdeckResult<Task> {
        if task.status != TaskStatus::Pending || task.assigned_agent.is_some() {
            return Err(SwarmdeckError::Validation(
                "new tasks must be pending and unassigned".into(),
            ));
        }
        if task.title.trim().is_empty() {
            return Err(SwarmdeckError::Validation("task title must not be empty".into()));
        }
        if task.task_type.trim().is_empty() {
            return Err(SwarmdeckError::Validation("task type must not be empty".into()));
        }
        if task.dependencies.contains(&task.id) {
            return Err(SwarmdeckError::DependencyCycle(task.id));
        }

        let _guard = self.lock.lock().await;
        let graph: HashMap<Uuid, Vec<Uuid>> = self
            .db
            .load_all::<Task>()
            .await?
            .into_iter()
            .map(|t| (t.id, t.dependencies))
            .collect();
        if let Some(missing) = task.dependencies.iter().find(|d| !graph.contains_key(d)) {
            return Err(SwarmdeckError::not_found("dependency task", missing));
        }
        // Only the new task's own ancestry can close a cycle.
        if reaches(&graph, &task.dependencies, task.id) {
            return Err(SwarmdeckError::DependencyCycle(task.id));
        }

        self.db.save_new(&task).await?;
        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            priority = %task.priority,
            deps = task.dependencies.len(),
            "Task submitted"
        );
        self.events.publish(OrchestratorEvent::TaskSubmitted {
            task_id: task.id,
            task_type: task.task_type.clone(),
        });
        Ok(task)
    }

    pub async fn get(&self, id: Uuid) -> SwarmdeckResult<Task> {
        self.db
            .load::<Task>(&id.to_string())
            .await?
            .ok_or_else(|| SwarmdeckError::not_found("task", id))
    }

    /// All tasks in creation order.
    pub async fn list(&self) -> SwarmdeckResult<Vec<Task>> {
        let mut tasks: Vec<Task> = self.db.load_all().await?;
        tasks.sort_by_key(|t| (t.created_at, t.id));
        Ok(tasks)
    }

    pub async fn list_by_status(&self, status: TaskStatus) -> SwarmdeckResult<Vec<Task>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|t| t.status == status)
            .collect())
    }

    /// Assigned or running tasks held by an agent.
    pub async fn in_flight_for(&self, agent_id: Uuid) -> SwarmdeckResult<Vec<Task>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|t| t.assigned_agent == Some(agent_id) && t.status.is_in_flight())
            .collect())
    }

    /// Pending tasks whose dependencies are all completed, highest priority
    /// first and oldest first within a priority.
    pub async fn eligible(&self) -> SwarmdeckResult<Vec<Task>> {
        let tasks = self.list().await?;
        let completed: HashSet<Uuid> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id)
            .collect();
        let mut ready: Vec<Task> = tasks
            .into_iter()
            .filter(|t| t.is_ready(&completed))
            .collect();
        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(ready)
    }

    pub async fn summary(&self) -> SwarmdeckResult<TaskSummary> {
        let mut summary = TaskSummary::default();
        for task in self.db.load_all::<Task>().await? {
            summary.total += 1;
            match task.status {
                TaskStatus::Pending => summary.pending += 1,
                TaskStatus::Assigned => summary.assigned += 1,
                TaskStatus::Running => summary.running += 1,
                TaskStatus::Completed => summary.completed += 1,
                TaskStatus::Failed => summary.failed += 1,
                TaskStatus::Cancelled => summary.cancelled += 1,
            }
        }
        Ok(summary)
    }

    /// `pending -> assigned`.
    pub async fn assign(&self, id: Uuid, agent_id: Uuid) -> SwarmdeckResult<Task> {
        self.transition(id, TaskStatus::Assigned, |task| {
            task.assigned_agent = Some(agent_id);
            task.assigned_at = Some(Utc::now());
        })
        .await
    }

    /// `assigned -> running`. Dependencies are re-checked at this point.
    pub async fn start(&self, id: Uuid) -> SwarmdeckResult<Task> {
        let _guard = self.lock.lock().await;
        let mut task = self.get(id).await?;
        check_transition(&task, TaskStatus::Running)?;

        let mut pending = Vec::new();
        for dep in &task.dependencies {
            let done = self
                .db
                .load::<Task>(&dep.to_string())
                .await?
                .is_some_and(|d| d.status == TaskStatus::Completed);
            if !done {
                pending.push(*dep);
            }
        }
        if !pending.is_empty() {
            return Err(SwarmdeckError::DependenciesNotMet { task: id, pending });
        }

        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        self.commit(task, TaskStatus::Assigned).await
    }

    /// `running -> completed`, recording the output and measured duration.
    pub async fn complete(&self, id: Uuid, output: serde_json::Value) -> SwarmdeckResult<Task> {
        self.transition(id, TaskStatus::Completed, |task| {
            let now = Utc::now();
            task.output = Some(output);
            task.completed_at = Some(now);
            task.actual_duration_ms = task
                .started_at
                .map(|start| (now - start).num_milliseconds().max(0) as u64);
        })
        .await
    }

    /// `running -> failed`, recording the error.
    pub async fn fail(&self, id: Uuid, error: impl Into<String>) -> SwarmdeckResult<Task> {
        let error = error.into();
        self.transition(id, TaskStatus::Failed, |task| {
            let now = Utc::now();
            task.error = Some(error);
            task.completed_at = Some(now);
            task.actual_duration_ms = task
                .started_at
                .map(|start| (now - start).num_milliseconds().max(0) as u64);
        })
        .await
    }

    /// Cancel a pending, assigned, or running task.
    pub async fn cancel(&self, id: Uuid, reason: Option<String>) -> SwarmdeckResult<Task> {
        self.transition(id, TaskStatus::Cancelled, |task| {
            task.completed_at = Some(Utc::now());
            if reason.is_some() {
                task.error = reason;
            }
        })
        .await
    }

    async fn transition<F>(&self, id: Uuid, to: TaskStatus, apply: F) -> SwarmdeckResult<Task>
    where
        F: FnOnce(&mut Task),
    {
        let _guard = self.lock.lock().await;
        let mut task = self.get(id).await?;
        check_transition(&task, to)?;
        let from = task.status;
        task.status = to;
        apply(&mut task);
        self.commit(task, from).await
    }

    /// Persist and announce. Caller holds the lock.
    async fn commit(&self, task: Task, from: TaskStatus) -> SwarmdeckResult<Task> {
        self.db.save(&task).await?;
        debug!(task_id = %task.id, from = %from, to = %task.status, "Task transitioned");
        self.events.publish(OrchestratorEvent::TaskTransitioned {
            task_id: task.id,
            from,
            to: task.status,
            agent_id: task.assigned_agent,
        });
        Ok(task)
    }
}

fn check_transition(task: &Task, to: TaskStatus) -> SwarmdeckResult<()> {
    if task.status.can_transition_to(to) {
        Ok(())
    } else {
        Err(SwarmdeckError::InvalidTransition {
            task: task.id,
            from: task.status,
            to,
        })
    }
}

/// Whether `target` is reachable from `start` along dependency edges
/// (task -> dependencies).
pub fn reaches(graph: &HashMap<Uuid, Vec<Uuid>>, start: &[Uuid], target: Uuid) -> bool {
    let mut seen = HashSet::new();
    let mut stack = start.to_vec();
    while let Some(id) = stack.pop() {
        if id == target {
            return true;
        }
        if seen.insert(id) {
            if let Some(deps) = graph.get(&id) {
                stack.extend(deps.iter().copied());
            }
        }
    }
    false
}
