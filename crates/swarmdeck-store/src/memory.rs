use crate::store::Persistence;
use crate::table::{ChangeEvent, ChangeFeed, ChangeKind, Table};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use swarmdeck_core::{SwarmdeckError, SwarmdeckResult};
use tokio::sync::broadcast;

/// In-process store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<Table, BTreeMap<String, serde_json::Value>>>,
    feed: ChangeFeed,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in a table.
    pub fn len(&self, table: Table) -> usize {
        self.tables.read().get(&table).map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, table: Table) -> bool {
        self.len(table) == 0
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn insert(
        &self,
        table: Table,
        key: &str,
        value: serde_json::Value,
    ) -> SwarmdeckResult<()> {
        {
            let mut tables = self.tables.write();
            let rows = tables.entry(table).or_default();
            if rows.contains_key(key) {
                return Err(SwarmdeckError::Store(format!(
                    "{table} record '{key}' already exists"
                )));
            }
            rows.insert(key.to_string(), value.clone());
        }
        self.feed.emit(table, key, ChangeKind::Inserted, Some(value));
        Ok(())
    }

    async fn upsert(
        &self,
        table: Table,
        key: &str,
        value: serde_json::Value,
    ) -> SwarmdeckResult<()> {
        let existed = self
            .tables
            .write()
            .entry(table)
            .or_default()
            .insert(key.to_string(), value.clone())
            .is_some();
        let kind = if existed {
            ChangeKind::Updated
        } else {
            ChangeKind::Inserted
        };
        self.feed.emit(table, key, kind, Some(value));
        Ok(())
    }

    async fn fetch(&self, table: Table, key: &str) -> SwarmdeckResult<Option<serde_json::Value>> {
        Ok(self
            .tables
            .read()
            .get(&table)
            .and_then(|rows| rows.get(key).cloned()))
    }

    async fn remove(&self, table: Table, key: &str) -> SwarmdeckResult<bool> {
        let removed = self
            .tables
            .write()
            .get_mut(&table)
            .and_then(|rows| rows.remove(key))
            .is_some();
        if removed {
            self.feed.emit(table, key, ChangeKind::Deleted, None);
        }
        Ok(removed)
    }

    async fn scan(&self, table: Table) -> SwarmdeckResult<Vec<serde_json::Value>> {
        Ok(self
            .tables
            .read()
            .get(&table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    fn subscribe(&self, table: Table) -> broadcast::Receiver<ChangeEvent> {
        self.feed.subscribe(table)
    }
}
