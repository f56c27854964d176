use crate::registry::AgentRegistry;
use crate::task_store::TaskStore;
use crate::tick::{TickGuard, TickOutcome};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use swarmdeck_core::{
    metrics::rates, Agent, AgentMetrics, AgentStatus, EventBus, HealthStatus, MetricScope,
    MetricsRecord, OrchestratorEvent, ResourceProbe, ResourceUsage, SwarmdeckResult,
    SystemMetrics, Task, TaskStatus,
};
use swarmdeck_store::{Persistence, PersistenceExt};
use tracing::{debug, warn};
use uuid::Uuid;

/// Metric names available on a per-agent scope.
pub const AGENT_METRICS: &[&str] = &[
    "tasks_completed",
    "tasks_failed",
    "avg_execution_time_ms",
    "success_rate",
    "error_rate",
    "workload",
    "cpu_usage",
    "memory_usage",
];

/// Metric names available on the system scope.
pub const SYSTEM_METRICS: &[&str] = &[
    "total_agents",
    "active_agents",
    "idle_agents",
    "error_agents",
    "pending_tasks",
    "running_tasks",
    "tasks_completed",
    "tasks_failed",
    "throughput_per_hour",
    "avg_execution_time_ms",
    "success_rate",
    "error_rate",
    "cpu_usage",
    "memory_usage",
];

/// Whether `name` can be evaluated on the given scope.
pub fn is_known_metric(name: &str, agent_scoped: bool) -> bool {
    if agent_scoped {
        AGENT_METRICS.contains(&name)
    } else {
        SYSTEM_METRICS.contains(&name)
    }
}

#[derive(Default)]
struct MetricsCache {
    agents: HashMap<Uuid, AgentMetrics>,
    system: Option<SystemMetrics>,
}

/// Periodically samples per-agent and system metrics.
///
/// The latest sample lives in an in-memory cache read by the alert engine;
/// every sample is also persisted as history, trimmed per scope.
pub struct MetricsCollector {
    db: Arc<dyn Persistence>,
    agents: Arc<AgentRegistry>,
    tasks: Arc<TaskStore>,
    probe: Option<Arc<dyn ResourceProbe>>,
    events: EventBus,
    window: Duration,
    retention: usize,
    cache: RwLock<MetricsCache>,
    guard: TickGuard,
}

impl MetricsCollector {
    pub fn new(
        db: Arc<dyn Persistence>,
        agents: Arc<AgentRegistry>,
        tasks: Arc<TaskStore>,
        probe: Option<Arc<dyn ResourceProbe>>,
        events: EventBus,
        window: Duration,
        retention: usize,
    ) -> Self {
        Self {
            db,
            agents,
            tasks,
            probe,
            events,
            window,
            retention: retention.max(1),
            cache: RwLock::new(MetricsCache::default()),
            guard: TickGuard::new(),
        }
    }

    /// Sample every agent and the system, refresh the cache, and append to
    /// history.
    pub async fn collect(&self) -> SwarmdeckResult<TickOutcome<SystemMetrics>> {
        let Some(_permit) = self.guard.try_acquire() else {
            debug!("Metrics collection still running, skipping");
            return Ok(TickOutcome::Skipped);
        };

        let now = Utc::now();
        let since = now - self.window;
        let agents = self.agents.list().await?;
        let tasks = self.tasks.list().await?;

        let per_agent: Vec<AgentMetrics> = agents
            .iter()
            .map(|agent| self.sample_agent(agent, &tasks, since, now))
            .collect();
        let system = self.sample_system(&agents, &tasks, &per_agent, since, now);

        {
            let mut cache = self.cache.write();
            cache.agents = per_agent
                .iter()
                .map(|m| (m.agent_id, m.clone()))
                .collect();
            cache.system = Some(system.clone());
        }

        for metrics in &per_agent {
            self.db.save_new(&MetricsRecord::agent(metrics.clone())).await?;
        }
        self.db.save_new(&MetricsRecord::system(system.clone())).await?;
        self.prune_history().await?;

        debug!(
            agents = per_agent.len(),
            success_rate = system.success_rate,
            throughput = system.throughput_per_hour,
            "Metrics collected"
        );
        self.events.publish(OrchestratorEvent::MetricsCollected {
            agents: per_agent.len(),
            at: now,
        });
        Ok(TickOutcome::Completed(system))
    }

    /// Latest cached sample for an agent.
    pub fn agent_metrics(&self, agent_id: Uuid) -> Option<AgentMetrics> {
        self.cache.read().agents.get(&agent_id).cloned()
    }

    /// Latest cached system sample.
    pub fn system_metrics(&self) -> Option<SystemMetrics> {
        self.cache.read().system.clone()
    }

    pub fn agent_health(&self, agent_id: Uuid) -> Option<HealthStatus> {
        self.cache.read().agents.get(&agent_id).map(|m| m.health)
    }

    /// Current value of a metric, from the agent's sample when `agent_id` is
    /// set and from the system sample otherwise.
    pub fn metric_value(&self, agent_id: Option<Uuid>, name: &str) -> Option<f64> {
        let cache = self.cache.read();
        match agent_id {
            Some(id) => cache.agents.get(&id).and_then(|m| m.metric(name)),
            None => cache.system.as_ref().and_then(|m| m.metric(name)),
        }
    }

    /// Persisted snapshots for a scope, newest first.
    pub async fn history(
        &self,
        scope: MetricScope,
        limit: usize,
    ) -> SwarmdeckResult<Vec<MetricsRecord>> {
        let mut records: Vec<MetricsRecord> = self
            .db
            .load_all::<MetricsRecord>()
            .await?
            .into_iter()
            .filter(|r| r.scope == scope)
            .collect();
        records.sort_by(|a, b| b.collected_at.cmp(&a.collected_at).then(b.id.cmp(&a.id)));
        records.truncate(limit);
        Ok(records)
    }

    fn sample_agent(
        &self,
        agent: &Agent,
        tasks: &[Task],
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AgentMetrics {
        let finished: Vec<&Task> = tasks
            .iter()
            .filter(|t| t.assigned_agent == Some(agent.id))
            .filter(|t| finished_between(t, since, now))
            .collect();
        let (completed, failed, avg) = outcome_stats(&finished);
        let resources = self
            .probe
            .as_ref()
            .map(|probe| probe.sample(agent))
            .unwrap_or_default();
        AgentMetrics::new(
            agent.id,
            completed,
            failed,
            avg,
            agent.workload.total(),
            resources,
        )
    }

    fn sample_system(
        &self,
        agents: &[Agent],
        tasks: &[Task],
        per_agent: &[AgentMetrics],
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SystemMetrics {
        let count_agents =
            |status: AgentStatus| agents.iter().filter(|a| a.status == status).count() as u32;
        let count_tasks =
            |status: TaskStatus| tasks.iter().filter(|t| t.status == status).count() as u32;

        let finished: Vec<&Task> = tasks
            .iter()
            .filter(|t| finished_between(t, since, now))
            .collect();
        let (completed, failed, avg) = outcome_stats(&finished);
        let (success_rate, error_rate) = rates(completed, failed);
        let hours = (self.window.num_seconds() as f64 / 3600.0).max(f64::EPSILON);

        let resources = if per_agent.is_empty() {
            ResourceUsage::default()
        } else {
            let n = per_agent.len() as f64;
            ResourceUsage {
                cpu_percent: per_agent.iter().map(|m| m.resources.cpu_percent).sum::<f64>() / n,
                memory_percent: per_agent
                    .iter()
                    .map(|m| m.resources.memory_percent)
                    .sum::<f64>()
                    / n,
            }
        };

        SystemMetrics {
            total_agents: agents.len() as u32,
            active_agents: count_agents(AgentStatus::Running),
            idle_agents: count_agents(AgentStatus::Idle),
            error_agents: count_agents(AgentStatus::Error),
            pending_tasks: count_tasks(TaskStatus::Pending),
            running_tasks: count_tasks(TaskStatus::Running),
            tasks_completed: completed,
            tasks_failed: failed,
            throughput_per_hour: completed as f64 / hours,
            avg_execution_time_ms: avg,
            success_rate,
            error_rate,
            resources,
            collected_at: now,
        }
    }

    /// Keep the newest `retention` snapshots per scope.
    async fn prune_history(&self) -> SwarmdeckResult<()> {
        let mut by_scope: HashMap<MetricScope, Vec<MetricsRecord>> = HashMap::new();
        for record in self.db.load_all::<MetricsRecord>().await? {
            by_scope.entry(record.scope).or_default().push(record);
        }
        for (scope, mut records) in by_scope {
            if records.len() <= self.retention {
                continue;
            }
            records.sort_by(|a, b| b.collected_at.cmp(&a.collected_at).then(b.id.cmp(&a.id)));
            for stale in &records[self.retention..] {
                if let Err(e) = self.db.delete::<MetricsRecord>(&stale.id.to_string()).await {
                    warn!(scope = %scope, error = %e, "Failed to prune metrics history");
                }
            }
        }
        Ok(())
    }
}

fn finished_between(task: &Task, since: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    matches!(task.status, TaskStatus::Completed | TaskStatus::Failed)
        && task.completed_at.is_some_and(|at| at >= since && at <= now)
}

/// `(completed, failed, avg completed duration in ms)`.
fn outcome_stats(finished: &[&Task]) -> (u64, u64, f64) {
    let completed: Vec<&&Task> = finished
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .collect();
    let failed = (finished.len() - completed.len()) as u64;
    let durations: Vec<u64> = completed.iter().filter_map(|t| t.actual_duration_ms).collect();
    let avg = if durations.is_empty() {
        0.0
    } else {
        durations.iter().sum::<u64>() as f64 / durations.len() as f64
    };
    (completed.len() as u64, failed, avg)
}
