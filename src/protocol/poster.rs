// protocol/poster.rs - One-Way Notification Poster
//
//! Fire-and-forget notifications to a fixed recipient set. A poster owns no
//! conversation state; every `notify` stamps a fresh expiring message and
//! posts it through the medium.

use std::sync::Arc;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::messaging::{Message, Recipient};
use super::{ProtocolError, ProtocolMedium};

/// Protocol family used by posted notifications.
pub const NOTIFICATION_TYPE: &str = "Notification";

/// Default notification lifetime in seconds.
const DEFAULT_EXPIRATION_SECS: i64 = 30;

pub struct Poster {
    protocol_id: String,
    recipients: Vec<Recipient>,
    medium: Arc<dyn ProtocolMedium>,
    expiration_secs: i64,
}

impl Poster {
    pub fn new(
        protocol_id: impl Into<String>,
        recipients: Vec<Recipient>,
        medium: Arc<dyn ProtocolMedium>,
    ) -> Self {
        Self {
            protocol_id: protocol_id.into(),
            recipients,
            medium,
            expiration_secs: DEFAULT_EXPIRATION_SECS,
        }
    }

    pub fn with_expiration(mut self, seconds: i64) -> Self {
        self.expiration_secs = seconds;
        self
    }

    pub fn protocol_id(&self) -> &str {
        &self.protocol_id
    }

    /// Post one notification to every recipient. No reply is expected.
    pub async fn notify(&self, payload: Value) -> Result<(), ProtocolError> {
        let message = Message::new(NOTIFICATION_TYPE, self.protocol_id.clone(), payload)
            .with_conversation(Uuid::new_v4())
            .with_sender(self.medium.agent_address())
            .with_receivers(self.recipients.clone())
            .expiring_in(self.expiration_secs);

        debug!(
            protocol_id = %self.protocol_id,
            recipients = self.recipients.len(),
            "posting notification"
        );
        self.medium.post(&self.recipients, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testkit::DummyMedium;
    use serde_json::json;

    #[tokio::test]
    async fn notify_posts_an_expiring_message() {
        let medium = DummyMedium::new();
        let poster = Poster::new(
            "heartbeat",
            vec![Recipient::broadcast("monitors", "lobby")],
            medium.clone(),
        );

        poster.notify(json!({"beat": 1})).await.unwrap();
        poster.notify(json!({"beat": 2})).await.unwrap();

        let sent = medium.sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].protocol_type, NOTIFICATION_TYPE);
        assert_eq!(sent[0].protocol_id, "heartbeat");
        assert!(sent[0].expiration_time.is_some());
        assert_ne!(sent[0].conversation_id, sent[1].conversation_id);
    }
}
