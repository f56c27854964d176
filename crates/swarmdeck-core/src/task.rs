use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Scheduling priority of a task. Ordering follows urgency, so `Critical`
/// compares greater than `Low`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskPriority::Low => write!(f, "low"),
            TaskPriority::Medium => write!(f, "medium"),
            TaskPriority::High => write!(f, "high"),
            TaskPriority::Critical => write!(f, "critical"),
        }
    }
}

impl FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(TaskPriority::Low),
            "medium" => Ok(TaskPriority::Medium),
            "high" => Ok(TaskPriority::High),
            "critical" => Ok(TaskPriority::Critical),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

/// Lifecycle status of a task.
///
/// ```text
/// pending -> assigned -> running -> completed | failed | cancelled
/// pending | assigned -> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Assigned)
                | (Pending, Cancelled)
                | (Assigned, Running)
                | (Assigned, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    /// Completed, failed, and cancelled tasks never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Assigned or running.
    pub fn is_in_flight(self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "assigned" => Ok(TaskStatus::Assigned),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// A unit of work routed to an agent by capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    /// Matched against agent capabilities.
    pub task_type: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub assigned_agent: Option<Uuid>,
    /// Ordered, duplicate-free.
    pub dependencies: Vec<Uuid>,
    #[serde(default)]
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Human or workflow that submitted the task.
    #[serde(default)]
    pub requested_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub estimated_duration_ms: Option<u64>,
    pub actual_duration_ms: Option<u64>,
}

impl Task {
    pub fn new(title: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            task_type: task_type.into(),
            priority: TaskPriority::default(),
            status: TaskStatus::Pending,
            assigned_agent: None,
            dependencies: Vec::new(),
            input: serde_json::Value::Null,
            output: None,
            error: None,
            requested_by: None,
            created_at: Utc::now(),
            assigned_at: None,
            started_at: None,
            completed_at: None,
            estimated_duration_ms: None,
            actual_duration_ms: None,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set dependencies, dropping duplicates while keeping first-seen order.
    pub fn with_dependencies(mut self, deps: Vec<Uuid>) -> Self {
        let mut seen = HashSet::new();
        self.dependencies = deps.into_iter().filter(|d| seen.insert(*d)).collect();
        self
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_estimate_ms(mut self, estimate: u64) -> Self {
        self.estimated_duration_ms = Some(estimate);
        self
    }

    pub fn requested_by(mut self, requester: impl Into<String>) -> Self {
        self.requested_by = Some(requester.into());
        self
    }

    /// Pending and every dependency is in `completed`.
    pub fn is_ready(&self, completed: &HashSet<Uuid>) -> bool {
        self.status == TaskStatus::Pending
            && self.dependencies.iter().all(|dep| completed.contains(dep))
    }

    /// Dependencies not present in `completed`.
    pub fn unmet_dependencies(&self, completed: &HashSet<Uuid>) -> Vec<Uuid> {
        self.dependencies
            .iter()
            .filter(|dep| !completed.contains(dep))
            .copied()
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_task_creation() {
        let task = Task::new("Review PR 12", "code-review");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, TaskPriority::Medium);
        assert!(task.dependencies.is_empty());
        assert!(task.assigned_agent.is_none());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Medium);
        assert!(TaskPriority::Medium > TaskPriority::Low);
        assert_eq!("CRITICAL".parse::<TaskPriority>(), Ok(TaskPriority::Critical));
        assert!("urgent".parse::<TaskPriority>().is_err());
    }

    #[test]
    fn test_legal_transitions() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Assigned));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Assigned.can_transition_to(Running));
        assert!(Assigned.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
    }

    #[test]
    fn test_illegal_transitions() {
        use TaskStatus::*;
        for from in [Assigned, Running, Completed, Failed, Cancelled] {
            assert!(!from.can_transition_to(Pending), "{from} -> pending");
        }
        assert!(!Pending.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Cancelled.can_transition_to(Assigned));
    }

    #[test]
    fn test_dependencies_deduplicated() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let task = Task::new("t", "x").with_dependencies(vec![a, b, a]);
        assert_eq!(task.dependencies, vec![a, b]);
    }

    #[test]
    fn test_is_ready_with_deps() {
        let dep = Uuid::new_v4();
        let task = Task::new("t", "x").with_dependencies(vec![dep]);
        let mut done = HashSet::new();
        assert!(!task.is_ready(&done));
        assert_eq!(task.unmet_dependencies(&done), vec![dep]);
        done.insert(dep);
        assert!(task.is_ready(&done));
    }

    #[test]
    fn test_task_status_serialization() {
        let json = serde_json::to_string(&TaskStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
        let parsed: TaskStatus = serde_json::from_str("\"running\"").unwrap();
        assert_eq!(parsed, TaskStatus::Running);
        assert_eq!("Failed".parse::<TaskStatus>(), Ok(TaskStatus::Failed));
        assert!("done".parse::<TaskStatus>().is_err());
    }
}
