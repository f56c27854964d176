use crate::table::{ChangeEvent, Record, Table};
use async_trait::async_trait;
use swarmdeck_core::SwarmdeckResult;
use tokio::sync::broadcast;

/// Durable CRUD over entity tables plus a per-table change feed.
///
/// Values are stored as JSON so that implementations stay schema-agnostic;
/// [`PersistenceExt`] adds typed access for [`Record`]s.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Store a new record. Fails if the key already exists.
    async fn insert(&self, table: Table, key: &str, value: serde_json::Value)
        -> SwarmdeckResult<()>;

    /// Create or replace a record.
    async fn upsert(&self, table: Table, key: &str, value: serde_json::Value)
        -> SwarmdeckResult<()>;

    async fn fetch(&self, table: Table, key: &str) -> SwarmdeckResult<Option<serde_json::Value>>;

    /// Delete a record. Returns whether it existed.
    async fn remove(&self, table: Table, key: &str) -> SwarmdeckResult<bool>;

    async fn scan(&self, table: Table) -> SwarmdeckResult<Vec<serde_json::Value>>;

    fn subscribe(&self, table: Table) -> broadcast::Receiver<ChangeEvent>;
}

/// Typed helpers over [`Persistence`].
#[async_trait]
pub trait PersistenceExt: Persistence {
    async fn save_new<R: Record>(&self, record: &R) -> SwarmdeckResult<()> {
        let value = serde_json::to_value(record)?;
        self.insert(R::TABLE, &record.key(), value).await
    }

    async fn save<R: Record>(&self, record: &R) -> SwarmdeckResult<()> {
        let value = serde_json::to_value(record)?;
        self.upsert(R::TABLE, &record.key(), value).await
    }

    async fn load<R: Record>(&self, key: &str) -> SwarmdeckResult<Option<R>> {
        match self.fetch(R::TABLE, key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn load_all<R: Record>(&self) -> SwarmdeckResult<Vec<R>> {
        self.scan(R::TABLE)
            .await?
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(Into::into))
            .collect()
    }

    async fn delete<R: Record>(&self, key: &str) -> SwarmdeckResult<bool> {
        self.remove(R::TABLE, key).await
    }
}

impl<P: Persistence + ?Sized> PersistenceExt for P {}
