//! Typed change events fanned out to metrics, alerting, and dashboard observers.

use crate::agent::AgentStatus;
use crate::monitoring::Severity;
use crate::task::TaskStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    TaskSubmitted {
        task_id: Uuid,
        task_type: String,
    },
    TaskTransitioned {
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        agent_id: Option<Uuid>,
    },
    AgentRegistered {
        agent_id: Uuid,
    },
    AgentUnregistered {
        agent_id: Uuid,
    },
    AgentStatusChanged {
        agent_id: Uuid,
        from: AgentStatus,
        to: AgentStatus,
    },
    MessageSent {
        message_id: Uuid,
        sender: Uuid,
        recipient: Option<Uuid>,
    },
    ResourceChanged {
        key: String,
        version: u64,
        deleted: bool,
    },
    MetricsCollected {
        agents: usize,
        at: DateTime<Utc>,
    },
    AlertOpened {
        alert_id: Uuid,
        rule_id: Uuid,
        agent_id: Option<Uuid>,
        severity: Severity,
    },
    AlertAcknowledged {
        alert_id: Uuid,
    },
    AlertResolved {
        alert_id: Uuid,
        rule_id: Uuid,
    },
}

/// Broadcast publisher for [`OrchestratorEvent`]s.
///
/// Cloning shares the underlying channel. Slow subscribers observe
/// `RecvError::Lagged` rather than blocking producers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is fine.
    pub fn publish(&self, event: OrchestratorEvent) {
        trace!(?event, "publish");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::new(8);
        bus.publish(OrchestratorEvent::AgentRegistered {
            agent_id: Uuid::new_v4(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_receives_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let task_id = Uuid::new_v4();
        bus.publish(OrchestratorEvent::TaskTransitioned {
            task_id,
            from: TaskStatus::Pending,
            to: TaskStatus::Assigned,
            agent_id: None,
        });
        match rx.recv().await.unwrap() {
            OrchestratorEvent::TaskTransitioned { task_id: id, to, .. } => {
                assert_eq!(id, task_id);
                assert_eq!(to, TaskStatus::Assigned);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_event_serialization_tag() {
        let json = serde_json::to_value(OrchestratorEvent::AlertAcknowledged {
            alert_id: Uuid::nil(),
        })
        .unwrap();
        assert_eq!(json["event"], "alert_acknowledged");
    }
}
