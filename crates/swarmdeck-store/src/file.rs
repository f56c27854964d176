use crate::store::Persistence;
use crate::table::{ChangeEvent, ChangeFeed, ChangeKind, Table};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use swarmdeck_core::{SwarmdeckError, SwarmdeckResult};
use tokio::sync::{broadcast, Mutex};
use tracing::warn;

/// File-backed store: one pretty-printed JSON file per record under
/// `<dir>/<table>/<key>.json`.
///
/// Writes go to a temporary file first and are renamed into place, so a
/// crash never leaves a half-written record behind.
pub struct FileStore {
    dir: PathBuf,
    /// Serialises writers so insert's existence check and the write are atomic.
    write_lock: Mutex<()>,
    feed: ChangeFeed,
}

impl FileStore {
    pub async fn new(dir: impl Into<PathBuf>) -> SwarmdeckResult<Self> {
        let dir = dir.into();
        for table in Table::ALL {
            tokio::fs::create_dir_all(dir.join(table.as_str())).await?;
        }
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
            feed: ChangeFeed::default(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, table: Table, key: &str) -> PathBuf {
        self.dir
            .join(table.as_str())
            .join(format!("{}.json", file_stem(key)))
    }

    async fn write_record(&self, path: &Path, value: &serde_json::Value) -> SwarmdeckResult<()> {
        let json = serde_json::to_string_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

/// Longest escaped stem used verbatim; leaves room for `.json.tmp` under
/// the usual 255-byte file name limit.
const MAX_STEM: usize = 200;

/// Escape characters that are not safe in file names. Keys are mostly
/// UUIDs; resource keys may contain anything.
///
/// Keys whose escaped form is too long are stored under `~<sha256>`. The
/// escaped form never starts with `~`, and the record itself keeps its key.
fn file_stem(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    if out.len() > MAX_STEM {
        return format!("~{}", hex::encode(Sha256::digest(key.as_bytes())));
    }
    out
}

#[async_trait]
impl Persistence for FileStore {
    async fn insert(
        &self,
        table: Table,
        key: &str,
        value: serde_json::Value,
    ) -> SwarmdeckResult<()> {
        let path = self.record_path(table, key);
        {
            let _guard = self.write_lock.lock().await;
            if tokio::fs::try_exists(&path).await? {
                return Err(SwarmdeckError::Store(format!(
                    "{table} record '{key}' already exists"
                )));
            }
            self.write_record(&path, &value).await?;
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
        let path = self.record_path(table, key);
        let existed = {
            let _guard = self.write_lock.lock().await;
            let existed = tokio::fs::try_exists(&path).await?;
            self.write_record(&path, &value).await?;
            existed
        };
        let kind = if existed {
            ChangeKind::Updated
        } else {
            ChangeKind::Inserted
        };
        self.feed.emit(table, key, kind, Some(value));
        Ok(())
    }

    async fn fetch(&self, table: Table, key: &str) -> SwarmdeckResult<Option<serde_json::Value>> {
        let path = self.record_path(table, key);
        match tokio::fs::read_to_string(&path).await {
            Ok(data) => {
                let value = serde_json::from_str(&data).map_err(|e| {
                    SwarmdeckError::Store(format!("Failed to parse {}: {e}", path.display()))
                })?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, table: Table, key: &str) -> SwarmdeckResult<bool> {
        let path = self.record_path(table, key);
        let removed = {
            let _guard = self.write_lock.lock().await;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
                Err(e) => return Err(e.into()),
            }
        };
        if removed {
            self.feed.emit(table, key, ChangeKind::Deleted, None);
        }
        Ok(removed)
    }

    async fn scan(&self, table: Table) -> SwarmdeckResult<Vec<serde_json::Value>> {
        let mut entries = tokio::fs::read_dir(self.dir.join(table.as_str())).await?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut values = Vec::with_capacity(paths.len());
        for path in paths {
            let data = match tokio::fs::read_to_string(&path).await {
                Ok(data) => data,
                // Removed between listing and reading.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            match serde_json::from_str(&data) {
                Ok(value) => values.push(value),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable record"),
            }
        }
        Ok(values)
    }

    fn subscribe(&self, table: Table) -> broadcast::Receiver<ChangeEvent> {
        self.feed.subscribe(table)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::PersistenceExt;
    use swarmdeck_core::{Agent, SharedResource, Task, TaskStatus};
    use tempfile::TempDir;
    use uuid::Uuid;

    #[test]
    fn test_file_stem_escaping() {
        assert_eq!(file_stem("abc-DEF_1"), "abc-DEF_1");
        assert_eq!(file_stem("plan/v1"), "plan%2Fv1");
        assert_eq!(file_stem("a.b"), "a%2Eb");
    }

    #[test]
    fn test_long_keys_are_hashed() {
        let long = "é".repeat(100);
        let stem = file_stem(&long);
        assert!(stem.starts_with('~'));
        assert_eq!(stem.len(), 65);
        assert_eq!(stem, file_stem(&long));
        assert_ne!(stem, file_stem(&"é".repeat(101)));
        assert_eq!(file_stem(&"a".repeat(MAX_STEM)), "a".repeat(MAX_STEM));
    }

    #[tokio::test]
    async fn test_long_resource_key_round_trips() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path()).await.unwrap();
        let key = format!("reports/{}", "nightly build summary ".repeat(12));
        let res = SharedResource::new(key.clone(), Uuid::new_v4(), serde_json::json!("ok"));
        store.save_new(&res).await.unwrap();

        let loaded: SharedResource = store.load(&key).await.unwrap().unwrap();
        assert_eq!(loaded.key, key);
        let all: Vec<SharedResource> = store.load_all().await.unwrap();
        assert_eq!(all[0].key, key);
        assert!(store.delete::<SharedResource>(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path()).await.unwrap();
        let mut task = Task::new("Persist me", "code-review");
        store.save_new(&task).await.unwrap();
        assert!(store.save_new(&task).await.is_err());

        task.status = TaskStatus::Assigned;
        store.save(&task).await.unwrap();

        let loaded: Task = store.load(&task.id.to_string()).await.unwrap().unwrap();
        assert_eq!(loaded.title, "Persist me");
        assert_eq!(loaded.status, TaskStatus::Assigned);
    }

    #[tokio::test]
    async fn test_missing_record_is_none() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path()).await.unwrap();
        let loaded: Option<Agent> = store.load(&Uuid::new_v4().to_string()).await.unwrap();
        assert!(loaded.is_none());
        assert!(!store.delete::<Agent>("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_resource_keys_with_slashes() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path()).await.unwrap();
        let res = SharedResource::new("team/plan", Uuid::new_v4(), serde_json::json!([1, 2]));
        store.save_new(&res).await.unwrap();
        let loaded: SharedResource = store.load("team/plan").await.unwrap().unwrap();
        assert_eq!(loaded.value, serde_json::json!([1, 2]));
        let all: Vec<SharedResource> = store.load_all().await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_persistence_across_instances() {
        let tmp = TempDir::new().unwrap();
        let agent = Agent::new("worker", ["lint"]);
        {
            let store = FileStore::new(tmp.path()).await.unwrap();
            store.save_new(&agent).await.unwrap();
        }
        let store = FileStore::new(tmp.path()).await.unwrap();
        let agents: Vec<Agent> = store.load_all().await.unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].id, agent.id);
    }
}
