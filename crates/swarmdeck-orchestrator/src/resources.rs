use chrono::{Duration, Utc};
use std::sync::Arc;
use swarmdeck_core::{
    Access, EventBus, OrchestratorEvent, ResourcePermissions, SharedResource, SwarmdeckError,
    SwarmdeckResult,
};
use swarmdeck_store::{Persistence, PersistenceExt};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Permissioned key/value store shared between agents.
///
/// Every access is checked against the caller's agent id; the owner is
/// always allowed. Expired entries are purged on the first access after
/// their expiry rather than by a sweep.
pub struct SharedResourceStore {
    db: Arc<dyn Persistence>,
    events: EventBus,
    lock: Mutex<()>,
}

impl SharedResourceStore {
    pub fn new(db: Arc<dyn Persistence>, events: EventBus) -> Self {
        Self {
            db,
            events,
            lock: Mutex::new(()),
        }
    }

    /// Create a resource owned by `owner`. Fails if the key is live.
    pub async fn create(
        &self,
        owner: Uuid,
        key: &str,
        value: serde_json::Value,
        permissions: ResourcePermissions,
        ttl: Option<Duration>,
    ) -> SwarmdeckResult<SharedResource> {
        if key.trim().is_empty() {
            return Err(SwarmdeckError::Validation("resource key must not be empty".into()));
        }
        let _guard = self.lock.lock().await;
        if self.load_live(key).await?.is_some() {
            return Err(SwarmdeckError::Validation(format!(
                "resource '{key}' already exists"
            )));
        }

        let mut resource = SharedResource::new(key, owner, value);
        resource.permissions = permissions;
        resource.expires_at = ttl.map(|ttl| resource.created_at + ttl);
        self.db.save_new(&resource).await?;
        info!(key, owner = %owner, "Shared resource created");
        self.publish(&resource, false);
        Ok(resource)
    }

    pub async fn read(&self, agent: Uuid, key: &str) -> SwarmdeckResult<SharedResource> {
        let _guard = self.lock.lock().await;
        let resource = self.require(key).await?;
        check(&resource, agent, Access::Read)?;
        Ok(resource)
    }

    /// Replace the value and bump the version.
    ///
    /// With `expected_version` set the write only succeeds if nobody else
    /// wrote since the caller's read.
    pub async fn write(
        &self,
        agent: Uuid,
        key: &str,
        value: serde_json::Value,
        expected_version: Option<u64>,
    ) -> SwarmdeckResult<SharedResource> {
        let _guard = self.lock.lock().await;
        let mut resource = self.require(key).await?;
        check(&resource, agent, Access::Write)?;
        if let Some(expected) = expected_version {
            if expected != resource.version {
                return Err(SwarmdeckError::Validation(format!(
                    "stale write to '{key}': expected version {expected}, found {}",
                    resource.version
                )));
            }
        }

        resource.value = value;
        resource.version += 1;
        resource.updated_at = Utc::now();
        self.db.save(&resource).await?;
        debug!(key, agent = %agent, version = resource.version, "Shared resource written");
        self.publish(&resource, false);
        Ok(resource)
    }

    pub async fn delete(&self, agent: Uuid, key: &str) -> SwarmdeckResult<()> {
        let _guard = self.lock.lock().await;
        let resource = self.require(key).await?;
        check(&resource, agent, Access::Delete)?;
        self.db.delete::<SharedResource>(key).await?;
        info!(key, agent = %agent, "Shared resource deleted");
        self.publish(&resource, true);
        Ok(())
    }

    /// Add `grantee` to one of the permission lists. Owner only.
    pub async fn grant(
        &self,
        owner: Uuid,
        key: &str,
        access: Access,
        grantee: Uuid,
    ) -> SwarmdeckResult<SharedResource> {
        self.change_permissions(owner, key, access, |list| {
            list.insert(grantee);
        })
        .await
    }

    /// Remove `grantee` from one of the permission lists. Owner only.
    pub async fn revoke(
        &self,
        owner: Uuid,
        key: &str,
        access: Access,
        grantee: Uuid,
    ) -> SwarmdeckResult<SharedResource> {
        self.change_permissions(owner, key, access, |list| {
            list.remove(&grantee);
        })
        .await
    }

    /// Keys of live resources `agent` may read.
    pub async fn readable_by(&self, agent: Uuid) -> SwarmdeckResult<Vec<String>> {
        let now = Utc::now();
        let mut keys: Vec<String> = self
            .db
            .load_all::<SharedResource>()
            .await?
            .into_iter()
            .filter(|r| !r.is_expired(now) && r.allows(agent, Access::Read))
            .map(|r| r.key)
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn change_permissions<F>(
        &self,
        owner: Uuid,
        key: &str,
        access: Access,
        apply: F,
    ) -> SwarmdeckResult<SharedResource>
    where
        F: FnOnce(&mut std::collections::BTreeSet<Uuid>),
    {
        let _guard = self.lock.lock().await;
        let mut resource = self.require(key).await?;
        if resource.owner != owner {
            return Err(SwarmdeckError::AccessDenied {
                agent: owner,
                action: "change permissions of",
                key: key.to_string(),
            });
        }
        apply(resource.permissions.list_mut(access));
        resource.updated_at = Utc::now();
        self.db.save(&resource).await?;
        debug!(key, access = access.as_str(), "Shared resource permissions changed");
        Ok(resource)
    }

    async fn require(&self, key: &str) -> SwarmdeckResult<SharedResource> {
        self.load_live(key)
            .await?
            .ok_or_else(|| SwarmdeckError::not_found("resource", key))
    }

    /// Load a resource, deleting it instead if it has expired.
    async fn load_live(&self, key: &str) -> SwarmdeckResult<Option<SharedResource>> {
        let Some(resource) = self.db.load::<SharedResource>(key).await? else {
            return Ok(None);
        };
        if resource.is_expired(Utc::now()) {
            self.db.delete::<SharedResource>(key).await?;
            info!(key, "Expired shared resource purged");
            self.publish(&resource, true);
            return Ok(None);
        }
        Ok(Some(resource))
    }

    fn publish(&self, resource: &SharedResource, deleted: bool) {
        self.events.publish(OrchestratorEvent::ResourceChanged {
            key: resource.key.clone(),
            version: resource.version,
            deleted,
        });
    }
}

fn check(resource: &SharedResource, agent: Uuid, access: Access) -> SwarmdeckResult<()> {
    if resource.allows(agent, access) {
        Ok(())
    } else {
        Err(SwarmdeckError::AccessDenied {
            agent,
            action: access.as_str(),
            key: resource.key.clone(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use swarmdeck_store::MemoryStore;

    fn store() -> (SharedResourceStore, Arc<MemoryStore>) {
        let db = Arc::new(MemoryStore::new());
        (SharedResourceStore::new(db.clone(), EventBus::new(64)), db)
    }

    #[tokio::test]
    async fn test_owner_has_full_access() {
        let (store, _) = store();
        let owner = Uuid::new_v4();
        store
            .create(owner, "plan", serde_json::json!(1), ResourcePermissions::default(), None)
            .await
            .unwrap();
        assert_eq!(store.read(owner, "plan").await.unwrap().version, 1);
        let written = store.write(owner, "plan", serde_json::json!(2), None).await.unwrap();
        assert_eq!(written.version, 2);
        store.delete(owner, "plan").await.unwrap();
        assert!(matches!(
            store.read(owner, "plan").await,
            Err(SwarmdeckError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_write_without_permission_is_denied() {
        let (store, _) = store();
        let owner = Uuid::new_v4();
        let reader = Uuid::new_v4();
        let mut perms = ResourcePermissions::default();
        perms.read.insert(reader);
        store
            .create(owner, "plan", serde_json::json!("v1"), perms, None)
            .await
            .unwrap();

        assert!(store.read(reader, "plan").await.is_ok());
        let err = store
            .write(reader, "plan", serde_json::json!("hijack"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SwarmdeckError::AccessDenied { .. }));

        let current = store.read(owner, "plan").await.unwrap();
        assert_eq!(current.version, 1);
        assert_eq!(current.value, serde_json::json!("v1"));
        assert!(store.delete(reader, "plan").await.is_err());
    }

    #[tokio::test]
    async fn test_grant_and_revoke() {
        let (store, _) = store();
        let owner = Uuid::new_v4();
        let peer = Uuid::new_v4();
        store
            .create(owner, "k", serde_json::json!(0), ResourcePermissions::default(), None)
            .await
            .unwrap();

        assert!(store.grant(peer, "k", Access::Write, peer).await.is_err());
        store.grant(owner, "k", Access::Write, peer).await.unwrap();
        assert_eq!(
            store.write(peer, "k", serde_json::json!(1), None).await.unwrap().version,
            2
        );
        store.revoke(owner, "k", Access::Write, peer).await.unwrap();
        assert!(store.write(peer, "k", serde_json::json!(2), None).await.is_err());
    }

    #[tokio::test]
    async fn test_readable_by_lists_granted_live_keys() {
        let (store, _) = store();
        let owner = Uuid::new_v4();
        let peer = Uuid::new_v4();
        for key in ["plan", "notes", "secret"] {
            store
                .create(owner, key, serde_json::json!(0), ResourcePermissions::default(), None)
                .await
                .unwrap();
        }
        store
            .create(
                owner,
                "stale",
                serde_json::json!(0),
                ResourcePermissions::default(),
                Some(Duration::milliseconds(-1)),
            )
            .await
            .unwrap();
        store.grant(owner, "plan", Access::Read, peer).await.unwrap();
        store.grant(owner, "notes", Access::Read, peer).await.unwrap();
        store.grant(owner, "stale", Access::Read, peer).await.unwrap_err();

        assert_eq!(store.readable_by(peer).await.unwrap(), vec!["notes", "plan"]);
        assert_eq!(
            store.readable_by(owner).await.unwrap(),
            vec!["notes", "plan", "secret"]
        );
        store.revoke(owner, "notes", Access::Read, peer).await.unwrap();
        assert_eq!(store.readable_by(peer).await.unwrap(), vec!["plan"]);
    }

    #[tokio::test]
    async fn test_stale_write_rejected() {
        let (store, _) = store();
        let owner = Uuid::new_v4();
        store
            .create(owner, "k", serde_json::json!(0), ResourcePermissions::default(), None)
            .await
            .unwrap();
        store.write(owner, "k", serde_json::json!(1), Some(1)).await.unwrap();
        let err = store
            .write(owner, "k", serde_json::json!(2), Some(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("stale"));
        assert_eq!(store.read(owner, "k").await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_expired_resource_purged_on_access() {
        let (store, db) = store();
        let owner = Uuid::new_v4();
        store
            .create(
                owner,
                "tmp",
                serde_json::json!(0),
                ResourcePermissions::default(),
                Some(Duration::milliseconds(-1)),
            )
            .await
            .unwrap();
        assert_eq!(db.len(swarmdeck_store::Table::Resources), 1);

        assert!(matches!(
            store.read(owner, "tmp").await,
            Err(SwarmdeckError::NotFound { .. })
        ));
        assert!(db.is_empty(swarmdeck_store::Table::Resources));

        // The key is free again.
        store
            .create(owner, "tmp", serde_json::json!(1), ResourcePermissions::default(), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected() {
        let (store, _) = store();
        let owner = Uuid::new_v4();
        store
            .create(owner, "k", serde_json::json!(0), ResourcePermissions::default(), None)
            .await
            .unwrap();
        assert!(store
            .create(Uuid::new_v4(), "k", serde_json::json!(0), ResourcePermissions::default(), None)
            .await
            .is_err());
    }
}
