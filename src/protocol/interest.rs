// protocol/interest.rs - Passive Protocol Endpoints
//
//! An interest waits for inbound conversations of one
//! `(protocol_type, protocol_id)`. The owning agent materializes a protocol
//! instance from the first matching message; the interest only owns the
//! messaging bindings and tracks its spawned instances so `revoke` can
//! drain them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::common::InFlight;
use crate::messaging::{BindingHandle, Messaging, Recipient};
use super::{FinishWaiter, InterestFactory, ProtocolError};

pub struct Interest {
    factory: Arc<dyn InterestFactory>,
    bindings: Mutex<Vec<BindingHandle>>,
    in_flight: InFlight,
    revoked: AtomicBool,
}

impl Interest {
    pub fn new(factory: Arc<dyn InterestFactory>) -> Arc<Self> {
        Arc::new(Self {
            factory,
            bindings: Mutex::new(Vec::new()),
            in_flight: InFlight::new(),
            revoked: AtomicBool::new(false),
        })
    }

    pub fn factory(&self) -> Arc<dyn InterestFactory> {
        self.factory.clone()
    }

    /// Registry key of this interest.
    pub fn key(&self) -> (String, String) {
        (
            self.factory.protocol_type().to_string(),
            self.factory.protocol_id().to_string(),
        )
    }

    /// Create the binding this interest owns within a joined shard. Private
    /// interests ride on the agent's own queue and bind nothing.
    pub async fn bind(
        &self,
        messaging: &Arc<dyn Messaging>,
        shard: &str,
    ) -> Result<(), ProtocolError> {
        let Some(key) = self.factory.public_binding_key() else {
            return Ok(());
        };
        let handle = messaging
            .create_binding(Recipient::broadcast(key, shard))
            .await
            .map_err(|e| ProtocolError::Messaging(e.to_string()))?;
        debug!(
            protocol_type = self.factory.protocol_type(),
            protocol_id = self.factory.protocol_id(),
            %shard,
            "interest bound"
        );
        self.bindings.lock().push(handle);
        Ok(())
    }

    /// True while the interest accepts new conversations.
    pub fn accepting(&self) -> bool {
        !self.revoked.load(Ordering::SeqCst)
    }

    /// No spawned instance is still running.
    pub fn is_idle(&self) -> bool {
        self.in_flight.count() == 0
    }

    /// Count a spawned instance until it finishes.
    pub fn track(&self, waiter: FinishWaiter) {
        self.in_flight.increment();
        let in_flight = self.in_flight.clone();
        tokio::spawn(async move {
            let _ = waiter.wait().await;
            in_flight.decrement();
        });
    }

    /// Suspend until every spawned conversation has finished.
    pub async fn wait_finished(&self) {
        self.in_flight.drained().await;
    }

    /// Close the bindings and wait for in-flight invocations to finish.
    pub async fn revoke(&self, messaging: &Arc<dyn Messaging>) {
        if self.revoked.swap(true, Ordering::SeqCst) {
            return;
        }
        let bindings: Vec<BindingHandle> = self.bindings.lock().drain(..).collect();
        for handle in bindings {
            if let Err(err) = messaging.revoke_binding(&handle).await {
                warn!(%err, "failed revoking interest binding");
            }
        }
        self.in_flight.drained().await;
    }

    /// Used by tests.
    pub fn binding_count(&self) -> usize {
        self.bindings.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{MemoryMessaging, Message, MessagingFactory};
    use crate::protocol::{
        Completion, FinishNotifier, ProcessResult, Protocol, ProtocolContext,
    };
    use async_trait::async_trait;

    struct Sink;

    #[async_trait]
    impl Protocol for Sink {
        async fn initiate(
            &mut self,
            _ctx: &ProtocolContext,
        ) -> Result<ProcessResult, ProtocolError> {
            Ok(ProcessResult::Complete(Completion::default()))
        }

        async fn on_message(
            &mut self,
            _ctx: &ProtocolContext,
            _message: Message,
        ) -> Result<ProcessResult, ProtocolError> {
            Ok(ProcessResult::Continue)
        }
    }

    struct SinkFactory {
        public_key: Option<String>,
    }

    impl InterestFactory for SinkFactory {
        fn protocol_type(&self) -> &str {
            "Notification"
        }

        fn protocol_id(&self) -> &str {
            "sink"
        }

        fn public_binding_key(&self) -> Option<String> {
            self.public_key.clone()
        }

        fn build(&self, _first_message: &Message) -> Box<dyn Protocol> {
            Box::new(Sink)
        }
    }

    #[tokio::test]
    async fn public_interest_binds_and_revokes() {
        let hub = MemoryMessaging::new();
        let messaging = hub.get_connection(Arc::new(|_m| {})).await.unwrap();

        let interest = Interest::new(Arc::new(SinkFactory {
            public_key: Some("alerts".into()),
        }));
        interest.bind(&messaging, "lobby").await.unwrap();
        assert_eq!(interest.binding_count(), 1);
        assert_eq!(messaging.bindings("lobby").len(), 1);

        interest.revoke(&messaging).await;
        assert!(!interest.accepting());
        assert!(messaging.bindings("lobby").is_empty());
    }

    #[tokio::test]
    async fn private_interest_owns_no_binding() {
        let hub = MemoryMessaging::new();
        let messaging = hub.get_connection(Arc::new(|_m| {})).await.unwrap();

        let interest = Interest::new(Arc::new(SinkFactory { public_key: None }));
        interest.bind(&messaging, "lobby").await.unwrap();
        assert_eq!(interest.binding_count(), 0);
    }

    #[tokio::test]
    async fn revoke_waits_for_in_flight_instances() {
        let hub = MemoryMessaging::new();
        let messaging = hub.get_connection(Arc::new(|_m| {})).await.unwrap();

        let interest = Interest::new(Arc::new(SinkFactory { public_key: None }));
        let notifier = FinishNotifier::new();
        interest.track(notifier.waiter());
        assert!(!interest.is_idle());

        let revoker = interest.clone();
        let revoking = tokio::spawn(async move { revoker.revoke(&messaging).await });
        notifier.resolve(Completion::default());
        revoking.await.unwrap();
        assert!(interest.is_idle());
    }
}
