use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use swarmdeck_core::{
    Agent, Alert, CollaborationMessage, MetricsRecord, MonitoringRule, SharedResource, Task,
};
use tokio::sync::broadcast;

/// Entity tables exposed by the persistence collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    Agents,
    Tasks,
    Messages,
    Resources,
    Rules,
    Alerts,
    Metrics,
}

impl Table {
    pub const ALL: [Table; 7] = [
        Table::Agents,
        Table::Tasks,
        Table::Messages,
        Table::Resources,
        Table::Rules,
        Table::Alerts,
        Table::Metrics,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Table::Agents => "agents",
            Table::Tasks => "tasks",
            Table::Messages => "messages",
            Table::Resources => "resources",
            Table::Rules => "rules",
            Table::Alerts => "alerts",
            Table::Metrics => "metrics",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An entity stored in one [`Table`] under a stable key.
pub trait Record: Serialize + DeserializeOwned + Send + Sync {
    const TABLE: Table;
    fn key(&self) -> String;
}

impl Record for Agent {
    const TABLE: Table = Table::Agents;
    fn key(&self) -> String {
        self.id.to_string()
    }
}

impl Record for Task {
    const TABLE: Table = Table::Tasks;
    fn key(&self) -> String {
        self.id.to_string()
    }
}

impl Record for CollaborationMessage {
    const TABLE: Table = Table::Messages;
    fn key(&self) -> String {
        self.id.to_string()
    }
}

impl Record for SharedResource {
    const TABLE: Table = Table::Resources;
    fn key(&self) -> String {
        self.key.clone()
    }
}

impl Record for MonitoringRule {
    const TABLE: Table = Table::Rules;
    fn key(&self) -> String {
        self.id.to_string()
    }
}

impl Record for Alert {
    const TABLE: Table = Table::Alerts;
    fn key(&self) -> String {
        self.id.to_string()
    }
}

impl Record for MetricsRecord {
    const TABLE: Table = Table::Metrics;
    fn key(&self) -> String {
        self.id.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Inserted,
    Updated,
    Deleted,
}

/// A row-level change notification. `record` is absent for deletes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: Table,
    pub key: String,
    pub kind: ChangeKind,
    pub record: Option<serde_json::Value>,
    pub at: DateTime<Utc>,
}

/// One broadcast channel per table.
#[derive(Debug)]
pub struct ChangeFeed {
    senders: HashMap<Table, broadcast::Sender<ChangeEvent>>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let senders = Table::ALL
            .iter()
            .map(|t| (*t, broadcast::channel(capacity.max(1)).0))
            .collect();
        Self { senders }
    }

    pub fn subscribe(&self, table: Table) -> broadcast::Receiver<ChangeEvent> {
        match self.senders.get(&table) {
            Some(tx) => tx.subscribe(),
            // Every table gets a sender in `new`; this arm is unreachable in practice.
            None => broadcast::channel(1).1,
        }
    }

    pub fn emit(
        &self,
        table: Table,
        key: &str,
        kind: ChangeKind,
        record: Option<serde_json::Value>,
    ) {
        if let Some(tx) = self.senders.get(&table) {
            let _ = tx.send(ChangeEvent {
                table,
                key: key.to_string(),
                kind,
                record,
                at: Utc::now(),
            });
        }
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_record_keys() {
        let task = Task::new("t", "x");
        assert_eq!(task.key(), task.id.to_string());
        assert_eq!(<Task as Record>::TABLE, Table::Tasks);
        let res = SharedResource::new("plan/v1", uuid::Uuid::new_v4(), serde_json::Value::Null);
        assert_eq!(res.key(), "plan/v1");
    }

    #[tokio::test]
    async fn test_feed_is_per_table() {
        let feed = ChangeFeed::new(8);
        let mut tasks = feed.subscribe(Table::Tasks);
        let mut agents = feed.subscribe(Table::Agents);
        feed.emit(Table::Tasks, "k", ChangeKind::Inserted, None);
        let event = tasks.recv().await.unwrap();
        assert_eq!(event.key, "k");
        assert_eq!(event.kind, ChangeKind::Inserted);
        assert!(agents.try_recv().is_err());
    }
}
