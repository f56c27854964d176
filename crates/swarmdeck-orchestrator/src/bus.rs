use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use swarmdeck_core::{
    Agent, CollaborationMessage, EventBus, MessageHandler, MessageKind, MessagePriority,
    OrchestratorEvent, SwarmdeckError, SwarmdeckResult, SYSTEM_SENDER,
};
use swarmdeck_store::{Persistence, PersistenceExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Point-to-point and broadcast messaging between agents.
///
/// Delivery is store-and-fetch: messages are persisted and read through
/// [`CollaborationBus::inbox`]. Urgent messages are additionally handed to
/// the recipient's registered [`MessageHandler`], if any.
pub struct CollaborationBus {
    db: Arc<dyn Persistence>,
    events: EventBus,
    handlers: RwLock<HashMap<Uuid, Arc<dyn MessageHandler>>>,
    lock: Mutex<()>,
}

impl CollaborationBus {
    pub fn new(db: Arc<dyn Persistence>, events: EventBus) -> Self {
        Self {
            db,
            events,
            handlers: RwLock::new(HashMap::new()),
            lock: Mutex::new(()),
        }
    }

    /// Register the synchronous handler for an agent's urgent messages,
    /// replacing any previous one.
    pub fn register_handler(&self, agent_id: Uuid, handler: Arc<dyn MessageHandler>) {
        self.handlers.write().insert(agent_id, handler);
    }

    pub fn unregister_handler(&self, agent_id: Uuid) -> bool {
        self.handlers.write().remove(&agent_id).is_some()
    }

    /// Send a message. Direct messages must address a registered agent.
    pub async fn send(&self, message: CollaborationMessage) -> SwarmdeckResult<CollaborationMessage> {
        if let Some(recipient) = message.recipient {
            if self.db.load::<Agent>(&recipient.to_string()).await?.is_none() {
                return Err(SwarmdeckError::not_found("recipient agent", recipient));
            }
        }
        if message.kind == MessageKind::Response && message.correlation_id.is_none() {
            return Err(SwarmdeckError::Validation(
                "response messages must carry a correlation id".into(),
            ));
        }

        self.db.save_new(&message).await?;
        debug!(
            message_id = %message.id,
            sender = %message.sender,
            recipient = ?message.recipient,
            kind = ?message.kind,
            "Message sent"
        );
        self.events.publish(OrchestratorEvent::MessageSent {
            message_id: message.id,
            sender: message.sender,
            recipient: message.recipient,
        });

        if message.priority == MessagePriority::Urgent {
            self.deliver_urgent(&message).await;
        }
        Ok(message)
    }

    /// Broadcast a notification to every agent but the sender.
    pub async fn broadcast(
        &self,
        sender: Uuid,
        payload: serde_json::Value,
    ) -> SwarmdeckResult<CollaborationMessage> {
        self.send(CollaborationMessage::broadcast(sender, payload)).await
    }

    /// Messages visible to an agent: direct ones addressed to it plus
    /// broadcasts from others. Expired messages are skipped. Highest priority
    /// first, oldest first within a priority.
    pub async fn inbox(
        &self,
        agent_id: Uuid,
        unread_only: bool,
    ) -> SwarmdeckResult<Vec<CollaborationMessage>> {
        let now = Utc::now();
        let mut messages: Vec<CollaborationMessage> = self
            .db
            .load_all::<CollaborationMessage>()
            .await?
            .into_iter()
            .filter(|m| m.is_for(agent_id) && !m.is_expired(now))
            .filter(|m| !unread_only || !m.is_read_by(agent_id))
            .collect();
        messages.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(messages)
    }

    pub async fn get(&self, message_id: Uuid) -> SwarmdeckResult<CollaborationMessage> {
        self.db
            .load::<CollaborationMessage>(&message_id.to_string())
            .await?
            .ok_or_else(|| SwarmdeckError::not_found("message", message_id))
    }

    /// Mark a message read for `reader`. Only an addressee may do so;
    /// marking twice keeps the first timestamp. Broadcasts are tracked per
    /// reader, so one agent reading does not hide it from the others.
    pub async fn mark_read(
        &self,
        message_id: Uuid,
        reader: Uuid,
    ) -> SwarmdeckResult<CollaborationMessage> {
        let _guard = self.lock.lock().await;
        let mut message = self.get(message_id).await?;
        if !message.is_for(reader) {
            return Err(SwarmdeckError::Validation(format!(
                "message {message_id} is not addressed to agent {reader}"
            )));
        }
        if message.mark_read_by(reader, Utc::now()) {
            self.db.save(&message).await?;
        }
        Ok(message)
    }

    /// Answer a message that asked for a response.
    ///
    /// The response goes back to the original sender under the original
    /// correlation id, and the original is stamped as responded.
    pub async fn respond(
        &self,
        original_id: Uuid,
        responder: Uuid,
        payload: serde_json::Value,
    ) -> SwarmdeckResult<CollaborationMessage> {
        let (response, original) = {
            let _guard = self.lock.lock().await;
            let mut original = self.get(original_id).await?;
            if !original.requires_response {
                return Err(SwarmdeckError::Validation(format!(
                    "message {original_id} does not expect a response"
                )));
            }
            if original.recipient != Some(responder) {
                return Err(SwarmdeckError::Validation(format!(
                    "agent {responder} is not the recipient of message {original_id}"
                )));
            }
            if original.responded_at.is_some() {
                return Err(SwarmdeckError::Validation(format!(
                    "message {original_id} was already answered"
                )));
            }

            let correlation = original.correlation_id.unwrap_or(original.id);
            let response = CollaborationMessage::direct(
                responder,
                original.sender,
                MessageKind::Response,
                payload,
            )
            .with_priority(original.priority)
            .with_correlation(correlation);

            let now = Utc::now();
            original.responded_at = Some(now);
            original.read_at.get_or_insert(now);
            self.db.save(&original).await?;
            (response, original)
        };

        // The system sender is not a registered agent; its requests are
        // answered without a recipient check.
        if original.sender == SYSTEM_SENDER {
            self.db.save_new(&response).await?;
            self.events.publish(OrchestratorEvent::MessageSent {
                message_id: response.id,
                sender: response.sender,
                recipient: response.recipient,
            });
            return Ok(response);
        }
        self.send(response).await
    }

    /// Every message sharing a correlation id, oldest first.
    pub async fn conversation(
        &self,
        correlation_id: Uuid,
    ) -> SwarmdeckResult<Vec<CollaborationMessage>> {
        let mut messages: Vec<CollaborationMessage> = self
            .db
            .load_all::<CollaborationMessage>()
            .await?
            .into_iter()
            .filter(|m| m.correlation_id == Some(correlation_id) || m.id == correlation_id)
            .collect();
        messages.sort_by_key(|m| (m.created_at, m.id));
        Ok(messages)
    }

    async fn deliver_urgent(&self, message: &CollaborationMessage) {
        let targets: Vec<(Uuid, Arc<dyn MessageHandler>)> = {
            let handlers = self.handlers.read();
            match message.recipient {
                Some(recipient) => handlers
                    .get(&recipient)
                    .map(|h| vec![(recipient, h.clone())])
                    .unwrap_or_default(),
                None => handlers
                    .iter()
                    .filter(|(id, _)| **id != message.sender)
                    .map(|(id, h)| (*id, h.clone()))
                    .collect(),
            }
        };
        for (agent_id, handler) in targets {
            match handler.handle(message).await {
                Ok(()) => info!(message_id = %message.id, agent_id = %agent_id, "Urgent message handled"),
                Err(e) => warn!(
                    message_id = %message.id,
                    agent_id = %agent_id,
                    error = %e,
                    "Urgent message handler failed"
                ),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use swarmdeck_store::MemoryStore;

    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for CountingHandler {
        async fn handle(&self, _message: &CollaborationMessage) -> SwarmdeckResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl MessageHandler for FailingHandler {
        async fn handle(&self, _message: &CollaborationMessage) -> SwarmdeckResult<()> {
            Err(SwarmdeckError::Execution("handler down".into()))
        }
    }

    async fn setup() -> (CollaborationBus, Agent, Agent) {
        let db: Arc<dyn Persistence> = Arc::new(MemoryStore::new());
        let alice = Agent::new("alice", ["plan"]);
        let bob = Agent::new("bob", ["code"]);
        db.save_new(&alice).await.unwrap();
        db.save_new(&bob).await.unwrap();
        (CollaborationBus::new(db, EventBus::new(64)), alice, bob)
    }

    fn request(from: Uuid, to: Uuid) -> CollaborationMessage {
        CollaborationMessage::direct(from, to, MessageKind::Request, serde_json::json!({"q": 1}))
    }

    #[tokio::test]
    async fn test_send_to_unknown_agent_fails() {
        let (bus, alice, _) = setup().await;
        let err = bus.send(request(alice.id, Uuid::new_v4())).await.unwrap_err();
        assert!(matches!(err, SwarmdeckError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_inbox_includes_broadcasts_from_others() {
        let (bus, alice, bob) = setup().await;
        bus.send(request(alice.id, bob.id)).await.unwrap();
        bus.broadcast(alice.id, serde_json::json!("standup")).await.unwrap();

        assert_eq!(bus.inbox(bob.id, false).await.unwrap().len(), 2);
        // Senders do not see their own broadcasts.
        assert!(bus.inbox(alice.id, false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_inbox_orders_by_priority() {
        let (bus, alice, bob) = setup().await;
        let low = bus
            .send(request(alice.id, bob.id).with_priority(MessagePriority::Low))
            .await
            .unwrap();
        let high = bus
            .send(request(alice.id, bob.id).with_priority(MessagePriority::High))
            .await
            .unwrap();
        let inbox = bus.inbox(bob.id, false).await.unwrap();
        assert_eq!(inbox[0].id, high.id);
        assert_eq!(inbox[1].id, low.id);
    }

    #[tokio::test]
    async fn test_expired_messages_hidden() {
        let (bus, alice, bob) = setup().await;
        bus.send(request(alice.id, bob.id).expires_in(chrono::Duration::seconds(-1)))
            .await
            .unwrap();
        assert!(bus.inbox(bob.id, false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_read_filters_unread() {
        let (bus, alice, bob) = setup().await;
        let msg = bus.send(request(alice.id, bob.id)).await.unwrap();
        assert!(bus.mark_read(msg.id, alice.id).await.is_err());

        let read = bus.mark_read(msg.id, bob.id).await.unwrap();
        assert!(read.read_at.is_some());
        assert!(bus.inbox(bob.id, true).await.unwrap().is_empty());
        assert_eq!(bus.inbox(bob.id, false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_stays_unread_for_other_agents() {
        let (bus, alice, bob) = setup().await;
        let notice = bus
            .broadcast(SYSTEM_SENDER, serde_json::json!({"alert": "cpu"}))
            .await
            .unwrap();

        bus.mark_read(notice.id, alice.id).await.unwrap();
        assert!(bus.inbox(alice.id, true).await.unwrap().is_empty());
        let unread = bus.inbox(bob.id, true).await.unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].id, notice.id);

        bus.mark_read(notice.id, bob.id).await.unwrap();
        assert!(bus.inbox(bob.id, true).await.unwrap().is_empty());
        assert_eq!(bus.get(notice.id).await.unwrap().read_by.len(), 2);
    }

    #[tokio::test]
    async fn test_request_response_conversation() {
        let (bus, alice, bob) = setup().await;
        let req = bus
            .send(request(alice.id, bob.id).expecting_response())
            .await
            .unwrap();
        let correlation = req.correlation_id.unwrap();

        let resp = bus
            .respond(req.id, bob.id, serde_json::json!({"a": 2}))
            .await
            .unwrap();
        assert_eq!(resp.kind, MessageKind::Response);
        assert_eq!(resp.recipient, Some(alice.id));
        assert_eq!(resp.correlation_id, Some(correlation));

        let original = bus.get(req.id).await.unwrap();
        assert!(original.responded_at.is_some());
        assert!(bus.respond(req.id, bob.id, serde_json::json!(null)).await.is_err());

        let thread = bus.conversation(correlation).await.unwrap();
        assert_eq!(thread.len(), 2);
        assert_eq!(thread[0].id, req.id);
        assert_eq!(thread[1].id, resp.id);
    }

    #[tokio::test]
    async fn test_respond_requires_request_and_recipient() {
        let (bus, alice, bob) = setup().await;
        let plain = bus.send(request(alice.id, bob.id)).await.unwrap();
        assert!(bus.respond(plain.id, bob.id, serde_json::json!(1)).await.is_err());

        let req = bus
            .send(request(alice.id, bob.id).expecting_response())
            .await
            .unwrap();
        assert!(bus.respond(req.id, alice.id, serde_json::json!(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_urgent_messages_invoke_handler() {
        let (bus, alice, bob) = setup().await;
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
        });
        bus.register_handler(bob.id, handler.clone());

        bus.send(request(alice.id, bob.id)).await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);

        let urgent = bus
            .send(request(alice.id, bob.id).with_priority(MessagePriority::Urgent))
            .await
            .unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        // Asynchronous delivery still happens.
        assert!(bus
            .inbox(bob.id, false)
            .await
            .unwrap()
            .iter()
            .any(|m| m.id == urgent.id));
    }

    #[tokio::test]
    async fn test_handler_failure_does_not_fail_send() {
        let (bus, alice, bob) = setup().await;
        bus.register_handler(bob.id, Arc::new(FailingHandler));
        let sent = bus
            .send(request(alice.id, bob.id).with_priority(MessagePriority::Urgent))
            .await;
        assert!(sent.is_ok());
        assert!(bus.unregister_handler(bob.id));
    }
}
