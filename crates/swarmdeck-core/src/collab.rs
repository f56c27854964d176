//! Inter-agent messages and shared key/value resources.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Sender id used for messages originating from the orchestrator itself
/// (alert notifications, system broadcasts).
pub const SYSTEM_SENDER: Uuid = Uuid::nil();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Response,
    Notification,
    Broadcast,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// A message between agents. A missing recipient means broadcast.
///
/// Only the read stamps and `responded_at` change after creation. A direct
/// message is read once, by its recipient (`read_at`); a broadcast keeps one
/// read stamp per recipient (`read_by`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaborationMessage {
    pub id: Uuid,
    pub sender: Uuid,
    pub recipient: Option<Uuid>,
    pub kind: MessageKind,
    pub payload: serde_json::Value,
    pub priority: MessagePriority,
    #[serde(default)]
    pub requires_response: bool,
    pub correlation_id: Option<Uuid>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub read_by: BTreeMap<Uuid, DateTime<Utc>>,
    pub responded_at: Option<DateTime<Utc>>,
}

impl CollaborationMessage {
    /// A point-to-point message.
    pub fn direct(
        sender: Uuid,
        recipient: Uuid,
        kind: MessageKind,
        payload: serde_json::Value,
    ) -> Self {
        Self::build(sender, Some(recipient), kind, payload)
    }

    /// A message delivered to every agent.
    pub fn broadcast(sender: Uuid, payload: serde_json::Value) -> Self {
        Self::build(sender, None, MessageKind::Broadcast, payload)
    }

    fn build(
        sender: Uuid,
        recipient: Option<Uuid>,
        kind: MessageKind,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
            recipient,
            kind,
            payload,
            priority: MessagePriority::default(),
            requires_response: false,
            correlation_id: None,
            expires_at: None,
            created_at: Utc::now(),
            read_at: None,
            read_by: BTreeMap::new(),
            responded_at: None,
        }
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Mark as expecting a reply. A correlation id is generated if absent.
    pub fn expecting_response(mut self) -> Self {
        self.requires_response = true;
        if self.correlation_id.is_none() {
            self.correlation_id = Some(Uuid::new_v4());
        }
        self
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn expires_in(mut self, ttl: Duration) -> Self {
        self.expires_at = Some(self.created_at + ttl);
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient.is_none()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }

    /// Whether `agent` should see this message in its inbox.
    pub fn is_for(&self, agent: Uuid) -> bool {
        match self.recipient {
            Some(r) => r == agent,
            None => self.sender != agent,
        }
    }

    /// Whether `agent` has read this message.
    pub fn is_read_by(&self, agent: Uuid) -> bool {
        if self.is_broadcast() {
            self.read_by.contains_key(&agent)
        } else {
            self.recipient == Some(agent) && self.read_at.is_some()
        }
    }

    /// Stamp `agent`'s read. Returns false when it had already read it.
    pub fn mark_read_by(&mut self, agent: Uuid, at: DateTime<Utc>) -> bool {
        if self.is_read_by(agent) {
            return false;
        }
        if self.is_broadcast() {
            self.read_by.insert(agent, at);
        } else {
            self.read_at = Some(at);
        }
        true
    }
}

/// Kind of access checked against a [`SharedResource`]'s permission lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    Read,
    Write,
    Delete,
}

impl Access {
    pub fn as_str(self) -> &'static str {
        match self {
            Access::Read => "read",
            Access::Write => "write",
            Access::Delete => "delete",
        }
    }
}

/// Per-key permission lists. The owner is implicitly granted everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePermissions {
    #[serde(default)]
    pub read: BTreeSet<Uuid>,
    #[serde(default)]
    pub write: BTreeSet<Uuid>,
    #[serde(default)]
    pub delete: BTreeSet<Uuid>,
}

impl ResourcePermissions {
    pub fn list(&self, access: Access) -> &BTreeSet<Uuid> {
        match access {
            Access::Read => &self.read,
            Access::Write => &self.write,
            Access::Delete => &self.delete,
        }
    }

    pub fn list_mut(&mut self, access: Access) -> &mut BTreeSet<Uuid> {
        match access {
            Access::Read => &mut self.read,
            Access::Write => &mut self.write,
            Access::Delete => &mut self.delete,
        }
    }
}

/// A versioned value shared between agents under a string key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedResource {
    pub key: String,
    pub owner: Uuid,
    pub value: serde_json::Value,
    #[serde(default)]
    pub permissions: ResourcePermissions,
    /// Starts at 1 and increments on every successful write.
    pub version: u64,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SharedResource {
    pub fn new(key: impl Into<String>, owner: Uuid, value: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            owner,
            value,
            permissions: ResourcePermissions::default(),
            version: 1,
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn allows(&self, agent: Uuid, access: Access) -> bool {
        agent == self.owner || self.permissions.list(access).contains(&agent)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_visibility() {
        let sender = Uuid::new_v4();
        let other = Uuid::new_v4();
        let msg = CollaborationMessage::broadcast(sender, serde_json::json!({"hello": 1}));
        assert!(msg.is_broadcast());
        assert!(msg.is_for(other));
        assert!(!msg.is_for(sender));
    }

    #[test]
    fn test_broadcast_read_state_is_per_recipient() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut msg = CollaborationMessage::broadcast(SYSTEM_SENDER, serde_json::json!("deploy"));
        assert!(msg.mark_read_by(a, Utc::now()));
        assert!(!msg.mark_read_by(a, Utc::now()));
        assert!(msg.is_read_by(a));
        assert!(!msg.is_read_by(b));
        assert!(msg.read_at.is_none());
    }

    #[test]
    fn test_expecting_response_sets_correlation() {
        let msg = CollaborationMessage::direct(
            Uuid::new_v4(),
            Uuid::new_v4(),
            MessageKind::Request,
            serde_json::Value::Null,
        )
        .expecting_response();
        assert!(msg.requires_response);
        assert!(msg.correlation_id.is_some());
    }

    #[test]
    fn test_message_expiry() {
        let msg = CollaborationMessage::broadcast(Uuid::new_v4(), serde_json::Value::Null)
            .expires_in(Duration::seconds(10));
        assert!(!msg.is_expired(Utc::now()));
        assert!(msg.is_expired(Utc::now() + Duration::seconds(11)));
    }

    #[test]
    fn test_owner_always_allowed() {
        let owner = Uuid::new_v4();
        let reader = Uuid::new_v4();
        let mut res = SharedResource::new("plan", owner, serde_json::json!("v1"));
        res.permissions.read.insert(reader);
        assert!(res.allows(owner, Access::Delete));
        assert!(res.allows(reader, Access::Read));
        assert!(!res.allows(reader, Access::Write));
    }
}
