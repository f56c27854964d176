use crate::config::MatchPolicy;
use crate::task_store::TaskStore;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use swarmdeck_core::{
    Agent, AgentStatus, EventBus, OrchestratorEvent, SwarmdeckError, SwarmdeckResult,
};
use swarmdeck_store::{Persistence, PersistenceExt};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Tracks registered agents, their status, and their workload.
pub struct AgentRegistry {
    db: Arc<dyn Persistence>,
    tasks: Arc<TaskStore>,
    events: EventBus,
    lock: Mutex<()>,
}

impl AgentRegistry {
    pub fn new(db: Arc<dyn Persistence>, tasks: Arc<TaskStore>, events: EventBus) -> Self {
        Self {
            db,
            tasks,
            events,
            lock: Mutex::new(()),
        }
    }

    /// Register a new idle agent with the given capabilities.
    pub async fn register<I, S>(&self, name: &str, capabilities: I) -> SwarmdeckResult<Agent>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.register_agent(Agent::new(name.trim(), capabilities)).await
    }

    /// Register a pre-built agent record (e.g. one restored from config).
    pub async fn register_agent(&self, agent: Agent) -> SwarmdeckResult<Agent> {
        if agent.name.trim().is_empty() {
            return Err(SwarmdeckError::Validation("agent name must not be empty".into()));
        }
        if agent.capabilities.is_empty() {
            return Err(SwarmdeckError::Validation(format!(
                "agent '{}' must declare at least one capability",
                agent.name
            )));
        }
        if agent.capabilities.iter().any(|c| c.trim().is_empty()) {
            return Err(SwarmdeckError::Validation(
                "capability names must not be blank".into(),
            ));
        }

        self.db.save_new(&agent).await?;
        info!(
            agent_id = %agent.id,
            name = %agent.name,
            capabilities = ?agent.capabilities,
            "Agent registered"
        );
        self.events
            .publish(OrchestratorEvent::AgentRegistered { agent_id: agent.id });
        Ok(agent)
    }

    /// Remove an agent, cancelling its assigned and running tasks first.
    ///
    /// Only task records are settled here. Use
    /// [`Orchestrator::unregister_agent`](crate::Orchestrator::unregister_agent)
    /// to also abort executions in flight.
    pub(crate) async fn unregister(&self, agent_id: Uuid) -> SwarmdeckResult<()> {
        let _guard = self.lock.lock().await;
        self.get(agent_id).await?;

        for task in self.tasks.in_flight_for(agent_id).await? {
            match self
                .tasks
                .cancel(task.id, Some(format!("agent {agent_id} unregistered")))
                .await
            {
                Ok(_) => info!(task_id = %task.id, agent_id = %agent_id, "Cancelled task of unregistered agent"),
                // Finished concurrently; nothing to cancel.
                Err(SwarmdeckError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        self.db.delete::<Agent>(&agent_id.to_string()).await?;
        info!(agent_id = %agent_id, "Agent unregistered");
        self.events
            .publish(OrchestratorEvent::AgentUnregistered { agent_id });
        Ok(())
    }

    pub async fn get(&self, agent_id: Uuid) -> SwarmdeckResult<Agent> {
        self.db
            .load::<Agent>(&agent_id.to_string())
            .await?
            .ok_or_else(|| SwarmdeckError::not_found("agent", agent_id))
    }

    /// All agents, oldest registration first.
    pub async fn list(&self) -> SwarmdeckResult<Vec<Agent>> {
        let mut agents: Vec<Agent> = self.db.load_all().await?;
        agents.sort_by_key(|a| (a.created_at, a.id));
        Ok(agents)
    }

    /// Force an agent's status, e.g. pause/resume or a remediation action.
    ///
    /// Asking for `idle` while a task is still executing on the agent sets
    /// `running` instead; the agent goes idle when that task finishes.
    pub async fn set_status(&self, agent_id: Uuid, status: AgentStatus) -> SwarmdeckResult<Agent> {
        self.update(agent_id, |agent| {
            agent.status = if status == AgentStatus::Idle && agent.workload.active > 0 {
                AgentStatus::Running
            } else {
                status
            };
        })
        .await
    }

    /// Stamp the agent's last-activity time.
    pub async fn touch(&self, agent_id: Uuid) -> SwarmdeckResult<Agent> {
        self.update(agent_id, |_| {}).await
    }

    /// Fold a finished task into the agent's performance summary.
    pub async fn record_outcome(
        &self,
        agent_id: Uuid,
        success: bool,
        duration_ms: Option<u64>,
    ) -> SwarmdeckResult<Agent> {
        self.update(agent_id, |agent| agent.performance.record(success, duration_ms))
            .await
    }

    /// A task was assigned to the agent and is queued on it.
    pub async fn mark_assigned(&self, agent_id: Uuid) -> SwarmdeckResult<Agent> {
        self.update(agent_id, |agent| agent.workload.queued += 1).await
    }

    /// The queued task started; the agent is now busy.
    pub async fn mark_started(&self, agent_id: Uuid) -> SwarmdeckResult<Agent> {
        self.update(agent_id, |agent| {
            agent.workload.queued = agent.workload.queued.saturating_sub(1);
            agent.workload.active += 1;
            agent.status = AgentStatus::Running;
        })
        .await
    }

    /// An assignment was abandoned before it started.
    pub async fn unassign(&self, agent_id: Uuid) -> SwarmdeckResult<Agent> {
        self.update(agent_id, |agent| {
            agent.workload.queued = agent.workload.queued.saturating_sub(1);
        })
        .await
    }

    /// The agent's running task finished.
    ///
    /// A running agent goes back to `idle`, or to `error` when the failure
    /// was the agent's own. An agent whose status was changed while it ran
    /// (paused, stopped) keeps that status.
    pub async fn release(&self, agent_id: Uuid, agent_fault: bool) -> SwarmdeckResult<Agent> {
        self.update(agent_id, |agent| {
            agent.workload.active = agent.workload.active.saturating_sub(1);
            if agent.status == AgentStatus::Running {
                agent.status = if agent_fault {
                    AgentStatus::Error
                } else {
                    AgentStatus::Idle
                };
            }
        })
        .await
    }

    /// Zero the agent's workload after a restart; a `running` agent goes
    /// back to `idle`.
    pub async fn reset_workload(&self, agent_id: Uuid) -> SwarmdeckResult<Agent> {
        self.update(agent_id, |agent| {
            agent.workload = Default::default();
            if agent.status == AgentStatus::Running {
                agent.status = AgentStatus::Idle;
            }
        })
        .await
    }

    /// Pick the idle agent best suited for `task_type`.
    ///
    /// Only agents with no assigned or running task are considered. Agents
    /// declaring the capability win; among them the lowest workload, then
    /// the oldest registration. Under [`MatchPolicy::AnyIdleFallback`]
    /// any idle agent is used when no capable one is available.
    pub async fn select_for(
        &self,
        task_type: &str,
        policy: MatchPolicy,
        exclude: &HashSet<Uuid>,
    ) -> SwarmdeckResult<Option<Agent>> {
        let idle: Vec<Agent> = self
            .list()
            .await?
            .into_iter()
            .filter(|a| a.is_available() && !exclude.contains(&a.id))
            .collect();

        let least_loaded = |candidates: Vec<&Agent>| {
            candidates
                .into_iter()
                .min_by_key(|a| (a.workload.total(), a.created_at, a.id))
                .cloned()
        };

        let capable: Vec<&Agent> = idle.iter().filter(|a| a.has_capability(task_type)).collect();
        if let Some(agent) = least_loaded(capable) {
            return Ok(Some(agent));
        }
        match policy {
            MatchPolicy::Strict => Ok(None),
            MatchPolicy::AnyIdleFallback => {
                let fallback = least_loaded(idle.iter().collect());
                if let Some(agent) = &fallback {
                    warn!(
                        agent_id = %agent.id,
                        task_type,
                        "No capable agent, falling back to any idle agent"
                    );
                }
                Ok(fallback)
            }
        }
    }

    async fn update<F>(&self, agent_id: Uuid, apply: F) -> SwarmdeckResult<Agent>
    where
        F: FnOnce(&mut Agent),
    {
        let _guard = self.lock.lock().await;
        let mut agent = self.get(agent_id).await?;
        let before = agent.status;
        apply(&mut agent);
        agent.last_activity = Some(Utc::now());
        self.db.save(&agent).await?;
        if agent.status != before {
            info!(agent_id = %agent_id, from = %before, to = %agent.status, "Agent status changed");
            self.events.publish(OrchestratorEvent::AgentStatusChanged {
                agent_id,
                from: before,
                to: agent.status,
            });
        }
        Ok(agent)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use swarmdeck_core::{Task, TaskStatus};
    use swarmdeck_store::MemoryStore;

    fn setup() -> (AgentRegistry, Arc<TaskStore>) {
        let db: Arc<dyn Persistence> = Arc::new(MemoryStore::new());
        let events = EventBus::new(64);
        let tasks = Arc::new(TaskStore::new(db.clone(), events.clone()));
        (AgentRegistry::new(db, tasks.clone(), events), tasks)
    }

    #[tokio::test]
    async fn test_register_validates_capabilities() {
        let (registry, _) = setup();
        let empty: [&str; 0] = [];
        assert!(registry.register("nobody", empty).await.is_err());
        assert!(registry.register("blank", ["  "]).await.is_err());
        assert!(registry.register("", ["lint"]).await.is_err());

        let agent = registry.register("reviewer", [" code-review ", "code-review"]).await.unwrap();
        assert_eq!(agent.capabilities.len(), 1);
        assert!(agent.has_capability("code-review"));
        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_select_prefers_capability_then_age() {
        let (registry, _) = setup();
        let generalist = registry.register("generalist", ["docs"]).await.unwrap();
        let mut older = Agent::new("older", ["code-review"]);
        older.created_at -= chrono::Duration::minutes(5);
        let older = registry.register_agent(older).await.unwrap();
        let newer = registry.register("newer", ["code-review"]).await.unwrap();

        let none = HashSet::new();
        let picked = registry
            .select_for("code-review", MatchPolicy::Strict, &none)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(picked.id, older.id);

        let excluded: HashSet<Uuid> = [older.id].into_iter().collect();
        let picked = registry
            .select_for("code-review", MatchPolicy::Strict, &excluded)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(picked.id, newer.id);
        assert_ne!(picked.id, generalist.id);
    }

    #[tokio::test]
    async fn test_queued_agent_not_selected() {
        let (registry, _) = setup();
        let agent = registry.register("a", ["x"]).await.unwrap();
        registry.mark_assigned(agent.id).await.unwrap();
        assert_eq!(registry.get(agent.id).await.unwrap().status, AgentStatus::Idle);
        let picked = registry
            .select_for("x", MatchPolicy::Strict, &HashSet::new())
            .await
            .unwrap();
        assert!(picked.is_none());
    }

    #[tokio::test]
    async fn test_resume_while_executing_keeps_agent_busy() {
        let (registry, _) = setup();
        let agent = registry.register("a", ["x"]).await.unwrap();
        registry.mark_assigned(agent.id).await.unwrap();
        registry.mark_started(agent.id).await.unwrap();
        registry.set_status(agent.id, AgentStatus::Paused).await.unwrap();

        let resumed = registry.set_status(agent.id, AgentStatus::Idle).await.unwrap();
        assert_eq!(resumed.status, AgentStatus::Running);
        let picked = registry
            .select_for("x", MatchPolicy::AnyIdleFallback, &HashSet::new())
            .await
            .unwrap();
        assert!(picked.is_none());

        let released = registry.release(agent.id, false).await.unwrap();
        assert_eq!(released.status, AgentStatus::Idle);
        assert!(released.is_available());
    }

    #[tokio::test]
    async fn test_fallback_policy() {
        let (registry, _) = setup();
        let docs = registry.register("docs", ["docs"]).await.unwrap();
        let none = HashSet::new();

        let strict = registry
            .select_for("security-scan", MatchPolicy::Strict, &none)
            .await
            .unwrap();
        assert!(strict.is_none());

        let fallback = registry
            .select_for("security-scan", MatchPolicy::AnyIdleFallback, &none)
            .await
            .unwrap();
        assert_eq!(fallback.unwrap().id, docs.id);
    }

    #[tokio::test]
    async fn test_busy_agents_not_selected() {
        let (registry, _) = setup();
        let agent = registry.register("a", ["x"]).await.unwrap();
        registry.mark_assigned(agent.id).await.unwrap();
        registry.mark_started(agent.id).await.unwrap();
        let picked = registry
            .select_for("x", MatchPolicy::AnyIdleFallback, &HashSet::new())
            .await
            .unwrap();
        assert!(picked.is_none());
    }

    #[tokio::test]
    async fn test_release_statuses() {
        let (registry, _) = setup();
        let agent = registry.register("a", ["x"]).await.unwrap();

        registry.mark_assigned(agent.id).await.unwrap();
        let running = registry.mark_started(agent.id).await.unwrap();
        assert_eq!(running.status, AgentStatus::Running);
        assert_eq!(running.workload.active, 1);
        assert_eq!(running.workload.queued, 0);

        let idle = registry.release(agent.id, false).await.unwrap();
        assert_eq!(idle.status, AgentStatus::Idle);
        assert_eq!(idle.workload.total(), 0);
        let idle = registry.record_outcome(agent.id, true, Some(40)).await.unwrap();
        assert_eq!(idle.performance.tasks_completed, 1);

        registry.mark_assigned(agent.id).await.unwrap();
        registry.mark_started(agent.id).await.unwrap();
        let errored = registry.release(agent.id, true).await.unwrap();
        assert_eq!(errored.status, AgentStatus::Error);
    }

    #[tokio::test]
    async fn test_release_keeps_external_status() {
        let (registry, _) = setup();
        let agent = registry.register("a", ["x"]).await.unwrap();
        registry.mark_assigned(agent.id).await.unwrap();
        registry.mark_started(agent.id).await.unwrap();
        registry.set_status(agent.id, AgentStatus::Paused).await.unwrap();
        let released = registry.release(agent.id, false).await.unwrap();
        assert_eq!(released.status, AgentStatus::Paused);
    }

    #[tokio::test]
    async fn test_unregister_cancels_in_flight_tasks() {
        let (registry, tasks) = setup();
        let agent = registry.register("a", ["x"]).await.unwrap();
        let running = tasks.submit(Task::new("running", "x")).await.unwrap();
        let queued = tasks.submit(Task::new("queued", "x")).await.unwrap();
        let untouched = tasks.submit(Task::new("other", "x")).await.unwrap();

        tasks.assign(running.id, agent.id).await.unwrap();
        tasks.start(running.id).await.unwrap();
        tasks.assign(queued.id, agent.id).await.unwrap();

        registry.unregister(agent.id).await.unwrap();
        assert!(registry.get(agent.id).await.is_err());
        assert_eq!(tasks.get(running.id).await.unwrap().status, TaskStatus::Cancelled);
        assert_eq!(tasks.get(queued.id).await.unwrap().status, TaskStatus::Cancelled);
        assert_eq!(tasks.get(untouched.id).await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_unregister_unknown_agent() {
        let (registry, _) = setup();
        let err = registry.unregister(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, SwarmdeckError::NotFound { .. }));
    }
}
