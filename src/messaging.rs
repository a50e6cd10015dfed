// messaging.rs - Messaging Client Interface
//
//! Consumed interface to the messaging backends, plus an in-process
//! reference backend.
//!
//! Agents address each other through `Recipient` keys scoped to a shard.
//! Every posted message must carry an expiration time; expired messages are
//! dropped at delivery. Backends expose connect/disconnect signals which the
//! agency fans out to its agents.

use std::collections::HashMap;
use std::sync::Arc;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::common::{ConnectionTracker, ConnectivityCallback};

/// Messaging errors
#[derive(Debug, Clone, Error)]
pub enum MessagingError {
    #[error("Message has no expiration time")]
    MissingExpiration,

    #[error("Messaging not connected")]
    NotConnected,

    #[error("Unknown binding: {0}")]
    UnknownBinding(Uuid),

    #[error("Unknown external route backend: {0}")]
    UnknownRoute(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Addressing kind of a recipient key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecipientKind {
    /// Point-to-point delivery to one agent's queue
    Agent,
    /// Fan-out to every binding on the key within the shard
    Broadcast,
}

/// A messaging address: key within a shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Recipient {
    pub key: String,
    pub shard: String,
    pub kind: RecipientKind,
}

impl Recipient {
    pub fn agent(key: impl Into<String>, shard: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            shard: shard.into(),
            kind: RecipientKind::Agent,
        }
    }

    pub fn broadcast(key: impl Into<String>, shard: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            shard: shard.into(),
            kind: RecipientKind::Broadcast,
        }
    }
}

/// A protocol message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: Uuid,

    /// Protocol family, e.g. "Request" or "Notification"
    pub protocol_type: String,

    /// Concrete protocol within the family
    pub protocol_id: String,

    /// Conversation this message belongs to; equals the protocol guid on
    /// both sides of a dialog
    pub conversation_id: Option<Uuid>,

    pub sender: Option<Recipient>,

    pub receivers: Vec<Recipient>,

    pub reply_to: Option<Recipient>,

    /// Hard delivery deadline; messages without one are rejected at post
    pub expiration_time: Option<DateTime<Utc>>,

    pub payload: Value,
}

impl Message {
    pub fn new(
        protocol_type: impl Into<String>,
        protocol_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            protocol_type: protocol_type.into(),
            protocol_id: protocol_id.into(),
            conversation_id: None,
            sender: None,
            receivers: Vec::new(),
            reply_to: None,
            expiration_time: None,
            payload,
        }
    }

    pub fn with_conversation(mut self, conversation_id: Uuid) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }

    pub fn with_sender(mut self, sender: Recipient) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn with_receivers(mut self, receivers: Vec<Recipient>) -> Self {
        self.receivers = receivers;
        self
    }

    pub fn expiring_in(mut self, seconds: i64) -> Self {
        self.expiration_time = Some(Utc::now() + ChronoDuration::seconds(seconds));
        self
    }

    pub fn is_expired(&self) -> bool {
        match self.expiration_time {
            Some(deadline) => Utc::now() > deadline,
            None => false,
        }
    }

    /// Build a reply addressed back to the original sender, keeping the
    /// conversation and protocol identity.
    pub fn reply(original: &Message, payload: Value) -> Self {
        let mut reply = Message::new(
            original.protocol_type.clone(),
            original.protocol_id.clone(),
            payload,
        );
        reply.conversation_id = original.conversation_id;
        reply.receivers = original
            .reply_to
            .clone()
            .or_else(|| original.sender.clone())
            .into_iter()
            .collect();
        reply.expiration_time = original.expiration_time;
        reply
    }
}

/// Handle to one passive subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingHandle {
    pub id: Uuid,
    pub recipient: Recipient,
}

/// Options for dynamic transports.
pub type RouteOptions = HashMap<String, String>;

/// Callback receiving inbound messages on a connection.
pub type MessageConsumer = Arc<dyn Fn(Message) + Send + Sync>;

/// One agent's messaging connection.
#[async_trait]
pub trait Messaging: Send + Sync {
    /// Subscribe to messages addressed to `recipient`.
    async fn create_binding(&self, recipient: Recipient) -> Result<BindingHandle, MessagingError>;

    async fn revoke_binding(&self, handle: &BindingHandle) -> Result<(), MessagingError>;

    /// Post a message to the given recipients. The message must carry an
    /// expiration time.
    async fn post(&self, recipients: &[Recipient], message: Message)
        -> Result<(), MessagingError>;

    /// Bindings owned by this connection within a shard.
    fn bindings(&self, shard: &str) -> Vec<BindingHandle>;

    /// Register a dynamic transport (e.g. a tunnel) under `backend_id`.
    async fn create_external_route(
        &self,
        backend_id: &str,
        options: RouteOptions,
    ) -> Result<(), MessagingError>;

    async fn remove_external_route(
        &self,
        backend_id: &str,
        options: RouteOptions,
    ) -> Result<(), MessagingError>;

    fn is_connected(&self) -> bool;

    /// Release the connection: revoke every binding owned by it.
    async fn release(&self);
}

/// Factory handing out per-agent connections, shared by an agency.
#[async_trait]
pub trait MessagingFactory: Send + Sync {
    async fn get_connection(
        &self,
        consumer: MessageConsumer,
    ) -> Result<Arc<dyn Messaging>, MessagingError>;

    fn is_connected(&self) -> bool;

    /// True when no messages are waiting in any queue.
    fn is_idle(&self) -> bool;

    fn add_disconnected_callback(&self, cb: ConnectivityCallback);

    fn add_reconnected_callback(&self, cb: ConnectivityCallback);

    async fn disconnect(&self);
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

struct BindingEntry {
    recipient: Recipient,
    session: Uuid,
}

struct Hub {
    bindings: DashMap<Uuid, BindingEntry>,
    consumers: DashMap<Uuid, MessageConsumer>,
    routes: Mutex<HashMap<String, RouteOptions>>,
    connected: watch::Sender<bool>,
    tracker: ConnectionTracker,
}

/// In-process messaging hub used by tests and the demo node.
#[derive(Clone)]
pub struct MemoryMessaging {
    hub: Arc<Hub>,
}

impl MemoryMessaging {
    pub fn new() -> Self {
        let (connected, _) = watch::channel(true);
        let hub = Arc::new(Hub {
            bindings: DashMap::new(),
            consumers: DashMap::new(),
            routes: Mutex::new(HashMap::new()),
            connected,
            tracker: ConnectionTracker::new(),
        });
        hub.tracker.on_connected();
        Self { hub }
    }

    /// Force the simulated connectivity state; used by tests.
    pub fn set_connected(&self, connected: bool) {
        let _ = self.hub.connected.send(connected);
        if connected {
            self.hub.tracker.on_connected();
        } else {
            self.hub.tracker.on_disconnected();
        }
    }

    /// True when an external route is registered for `backend_id`.
    pub fn has_route(&self, backend_id: &str) -> bool {
        self.hub.routes.lock().contains_key(backend_id)
    }
}

impl Default for MemoryMessaging {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessagingFactory for MemoryMessaging {
    async fn get_connection(
        &self,
        consumer: MessageConsumer,
    ) -> Result<Arc<dyn Messaging>, MessagingError> {
        let session = Uuid::new_v4();
        self.hub.consumers.insert(session, consumer);
        Ok(Arc::new(MemoryChannel {
            session,
            hub: self.hub.clone(),
        }))
    }

    fn is_connected(&self) -> bool {
        *self.hub.connected.borrow()
    }

    fn is_idle(&self) -> bool {
        // Delivery is synchronous, so the hub never holds queued messages.
        true
    }

    fn add_disconnected_callback(&self, cb: ConnectivityCallback) {
        self.hub.tracker.add_disconnected_callback(cb);
    }

    fn add_reconnected_callback(&self, cb: ConnectivityCallback) {
        self.hub.tracker.add_connected_callback(cb);
    }

    async fn disconnect(&self) {
        self.set_connected(false);
    }
}

struct MemoryChannel {
    session: Uuid,
    hub: Arc<Hub>,
}

impl MemoryChannel {
    fn ensure_connected(&self) -> Result<(), MessagingError> {
        if *self.hub.connected.borrow() {
            Ok(())
        } else {
            Err(MessagingError::NotConnected)
        }
    }

    fn deliver(&self, recipient: &Recipient, message: &Message) {
        let targets: Vec<Uuid> = self
            .hub
            .bindings
            .iter()
            .filter(|entry| {
                entry.recipient.key == recipient.key && entry.recipient.shard == recipient.shard
            })
            .map(|entry| entry.session)
            .collect();

        if targets.is_empty() {
            debug!(key = %recipient.key, shard = %recipient.shard, "no binding for recipient");
            return;
        }

        for session in targets {
            if let Some(consumer) = self.hub.consumers.get(&session) {
                consumer(message.clone());
            }
        }
    }
}

#[async_trait]
impl Messaging for MemoryChannel {
    async fn create_binding(&self, recipient: Recipient) -> Result<BindingHandle, MessagingError> {
        self.ensure_connected()?;
        let handle = BindingHandle {
            id: Uuid::new_v4(),
            recipient: recipient.clone(),
        };
        self.hub.bindings.insert(
            handle.id,
            BindingEntry {
                recipient,
                session: self.session,
            },
        );
        Ok(handle)
    }

    async fn revoke_binding(&self, handle: &BindingHandle) -> Result<(), MessagingError> {
        self.hub
            .bindings
            .remove(&handle.id)
            .map(|_| ())
            .ok_or(MessagingError::UnknownBinding(handle.id))
    }

    async fn post(
        &self,
        recipients: &[Recipient],
        message: Message,
    ) -> Result<(), MessagingError> {
        self.ensure_connected()?;
        if message.expiration_time.is_none() {
            return Err(MessagingError::MissingExpiration);
        }
        if message.is_expired() {
            warn!(message_id = %message.message_id, "dropping expired message at post");
            return Ok(());
        }
        for recipient in recipients {
            self.deliver(recipient, &message);
        }
        Ok(())
    }

    fn bindings(&self, shard: &str) -> Vec<BindingHandle> {
        self.hub
            .bindings
            .iter()
            .filter(|entry| entry.session == self.session && entry.recipient.shard == shard)
            .map(|entry| BindingHandle {
                id: *entry.key(),
                recipient: entry.recipient.clone(),
            })
            .collect()
    }

    async fn create_external_route(
        &self,
        backend_id: &str,
        options: RouteOptions,
    ) -> Result<(), MessagingError> {
        self.hub
            .routes
            .lock()
            .insert(backend_id.to_string(), options);
        Ok(())
    }

    async fn remove_external_route(
        &self,
        backend_id: &str,
        _options: RouteOptions,
    ) -> Result<(), MessagingError> {
        self.hub
            .routes
            .lock()
            .remove(backend_id)
            .map(|_| ())
            .ok_or_else(|| MessagingError::UnknownRoute(backend_id.to_string()))
    }

    fn is_connected(&self) -> bool {
        *self.hub.connected.borrow()
    }

    async fn release(&self) {
        self.hub
            .bindings
            .retain(|_, entry| entry.session != self.session);
        self.hub.consumers.remove(&self.session);
    }
}
