//! Metric snapshots and the health classification derived from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Derived health classification of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    Offline,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
            HealthStatus::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// Resource usage of an agent, in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

/// Per-agent sample over the trailing window. Rates are percentages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub agent_id: Uuid,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub avg_execution_time_ms: f64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub workload: u32,
    pub resources: ResourceUsage,
    pub health: HealthStatus,
    pub collected_at: DateTime<Utc>,
}

impl AgentMetrics {
    /// Build a sample; the health field is derived from the other values.
    pub fn new(
        agent_id: Uuid,
        tasks_completed: u64,
        tasks_failed: u64,
        avg_execution_time_ms: f64,
        workload: u32,
        resources: ResourceUsage,
    ) -> Self {
        let (success_rate, error_rate) = rates(tasks_completed, tasks_failed);
        let mut metrics = Self {
            agent_id,
            tasks_completed,
            tasks_failed,
            avg_execution_time_ms,
            success_rate,
            error_rate,
            workload,
            resources,
            health: HealthStatus::Offline,
            collected_at: Utc::now(),
        };
        metrics.health = classify_health(&metrics);
        metrics
    }

    pub fn has_activity(&self) -> bool {
        self.tasks_completed + self.tasks_failed > 0 || self.workload > 0
    }

    /// Look up a metric by the name rules refer to it with.
    pub fn metric(&self, name: &str) -> Option<f64> {
        let value = match name {
            "tasks_completed" => self.tasks_completed as f64,
            "tasks_failed" => self.tasks_failed as f64,
            "avg_execution_time_ms" => self.avg_execution_time_ms,
            "success_rate" => self.success_rate,
            "error_rate" => self.error_rate,
            "workload" => self.workload as f64,
            "cpu_usage" => self.resources.cpu_percent,
            "memory_usage" => self.resources.memory_percent,
            _ => return None,
        };
        Some(value)
    }
}

/// System-wide sample over the trailing window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub total_agents: u32,
    pub active_agents: u32,
    pub idle_agents: u32,
    pub error_agents: u32,
    pub pending_tasks: u32,
    pub running_tasks: u32,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub throughput_per_hour: f64,
    pub avg_execution_time_ms: f64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub resources: ResourceUsage,
    pub collected_at: DateTime<Utc>,
}

impl SystemMetrics {
    pub fn metric(&self, name: &str) -> Option<f64> {
        let value = match name {
            "total_agents" => self.total_agents as f64,
            "active_agents" => self.active_agents as f64,
            "idle_agents" => self.idle_agents as f64,
            "error_agents" => self.error_agents as f64,
            "pending_tasks" => self.pending_tasks as f64,
            "running_tasks" => self.running_tasks as f64,
            "tasks_completed" => self.tasks_completed as f64,
            "tasks_failed" => self.tasks_failed as f64,
            "throughput_per_hour" => self.throughput_per_hour,
            "avg_execution_time_ms" => self.avg_execution_time_ms,
            "success_rate" => self.success_rate,
            "error_rate" => self.error_rate,
            "cpu_usage" => self.resources.cpu_percent,
            "memory_usage" => self.resources.memory_percent,
            _ => return None,
        };
        Some(value)
    }
}

/// Which entity a persisted snapshot describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope", content = "agent_id")]
pub enum MetricScope {
    System,
    Agent(Uuid),
}

impl fmt::Display for MetricScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricScope::System => f.write_str("system"),
            MetricScope::Agent(id) => write!(f, "agent:{id}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricsSnapshot {
    Agent(AgentMetrics),
    System(SystemMetrics),
}

/// A snapshot persisted to metrics history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub id: Uuid,
    pub scope: MetricScope,
    pub collected_at: DateTime<Utc>,
    pub snapshot: MetricsSnapshot,
}

impl MetricsRecord {
    pub fn agent(metrics: AgentMetrics) -> Self {
        Self {
            id: Uuid::new_v4(),
            scope: MetricScope::Agent(metrics.agent_id),
            collected_at: metrics.collected_at,
            snapshot: MetricsSnapshot::Agent(metrics),
        }
    }

    pub fn system(metrics: SystemMetrics) -> Self {
        Self {
            id: Uuid::new_v4(),
            scope: MetricScope::System,
            collected_at: metrics.collected_at,
            snapshot: MetricsSnapshot::System(metrics),
        }
    }
}

/// `(success_rate, error_rate)` in percent. With no outcomes both rates
/// report a clean record (100, 0).
pub fn rates(completed: u64, failed: u64) -> (f64, f64) {
    let total = completed + failed;
    if total == 0 {
        return (100.0, 0.0);
    }
    let success = completed as f64 / total as f64 * 100.0;
    (success, 100.0 - success)
}

/// Classify an agent's health from its snapshot.
///
/// - `offline`: no finished tasks in the window and nothing in flight
/// - `critical`: error rate above 50% or CPU/memory above 90%
/// - `warning`: error rate above 20%, success rate below 80%, or CPU/memory above 70%
/// - `healthy`: otherwise
pub fn classify_health(metrics: &AgentMetrics) -> HealthStatus {
    if !metrics.has_activity() {
        return HealthStatus::Offline;
    }
    let peak = metrics
        .resources
        .cpu_percent
        .max(metrics.resources.memory_percent);
    if metrics.error_rate > 50.0 || peak > 90.0 {
        HealthStatus::Critical
    } else if metrics.error_rate > 20.0 || metrics.success_rate < 80.0 || peak > 70.0 {
        HealthStatus::Warning
    } else {
        HealthStatus::Healthy
    }
}
