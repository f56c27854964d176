use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Operational status of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Running,
    Paused,
    Error,
    Stopped,
    Offline,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Running => "running",
            AgentStatus::Paused => "paused",
            AgentStatus::Error => "error",
            AgentStatus::Stopped => "stopped",
            AgentStatus::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// Work attributed to an agent, used for least-loaded tie-breaking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub active: u32,
    pub queued: u32,
}

impl Workload {
    pub fn total(&self) -> u32 {
        self.active + self.queued
    }
}

/// Lifetime performance counters for an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub avg_execution_ms: f64,
    /// Percentage in `0.0..=100.0`; 100 until the first outcome arrives.
    pub success_rate: f64,
}

impl PerformanceSummary {
    /// Fold a finished task into the running averages.
    pub fn record(&mut self, success: bool, duration_ms: Option<u64>) {
        if success {
            self.tasks_completed += 1;
            if let Some(ms) = duration_ms {
                let n = self.tasks_completed as f64;
                self.avg_execution_ms += (ms as f64 - self.avg_execution_ms) / n;
            }
        } else {
            self.tasks_failed += 1;
        }
        let total = self.tasks_completed + self.tasks_failed;
        self.success_rate = self.tasks_completed as f64 / total as f64 * 100.0;
    }
}

/// A registered worker that performs tasks matching its capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub capabilities: BTreeSet<String>,
    pub status: AgentStatus,
    #[serde(default)]
    pub workload: Workload,
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(default)]
    pub performance: PerformanceSummary,
    pub created_at: DateTime<Utc>,
}

impl Agent {
    /// Build an idle agent. Capability names are trimmed and deduplicated;
    /// blank names are dropped. Validation happens at registration.
    pub fn new<I, S>(name: impl Into<String>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            capabilities: capabilities
                .into_iter()
                .map(|c| c.as_ref().trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
            status: AgentStatus::Idle,
            workload: Workload::default(),
            last_activity: None,
            performance: PerformanceSummary {
                success_rate: 100.0,
                ..PerformanceSummary::default()
            },
            created_at: Utc::now(),
        }
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Idle with nothing assigned or running. An agent holds at most one
    /// task at a time.
    pub fn is_available(&self) -> bool {
        self.status == AgentStatus::Idle && self.workload.total() == 0
    }
}
