// agency/agent.rs - The Per-Agent Medium
//
//! `AgencyAgent` is the runtime home of one agent: it owns the agent
//! exclusively and mediates everything the agent does, from messaging and
//! database access to protocols, delayed calls, journaling and lifecycle.
//!
//! The medium moves through
//! `NotInitiated → Initiating → Initiated → StartingUp → Ready ⇄
//! Disconnected → Terminating → Terminated`; `Terminating` is reachable
//! from every state except `Terminated`. A change notification on the
//! descriptor that is not our own write means another instance has taken
//! over, and this one hard-terminates.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agent::{Agent, AgentFactory};
use crate::common::StateMachine;
use crate::database::{Database, DatabaseError, Document, DocumentChange};
use crate::descriptor::{Allocation, Descriptor};
use crate::journal::{SnapshotRecord, AGENCY_RECORDER, AGENT_RECORDER};
use crate::messaging::{Message, MessageConsumer, Messaging, Recipient, RouteOptions};
use crate::observability::{
    record_agent_started, record_agent_terminated, record_descriptor_update,
    record_journal_entry, record_journal_snapshot, record_message_expired,
    record_message_posted, record_protocol_initiated,
};
use crate::protocol::{
    Interest, InterestFactory, InitiatorFactory, PeriodicProtocol, ProtocolDealer,
    ProtocolError, ProtocolInstance, ProtocolKind, ProtocolMedium, ProtocolRunner,
    RetryConfig, RetryingProtocol,
};
use crate::time::{CallHandle, Scheduler};
use super::{Agency, AgencyError, MIN_ENTRIES_PER_SNAPSHOT};

/// Lifecycle states of a medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgencyAgentState {
    NotInitiated,
    Initiating,
    Initiated,
    StartingUp,
    Ready,
    Disconnected,
    Terminating,
    Terminated,
}

/// Which termination body to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationMode {
    /// Run the agent's shutdown hook and delete the descriptor.
    Gentle,
    /// Run the kill hook; the descriptor survives for a future restart.
    Hard,
}

impl TerminationMode {
    fn label(self) -> &'static str {
        match self {
            TerminationMode::Gentle => "gentle",
            TerminationMode::Hard => "hard",
        }
    }
}

/// Idempotent handle to a running termination.
pub type TerminationFuture = Shared<BoxFuture<'static, ()>>;

/// How long an unconfirmed preallocation holds its capacity.
const DEFAULT_PREALLOCATION_TIMEOUT: Duration = Duration::from_secs(10);

struct DelayedCall {
    busy: bool,
    handle: CallHandle,
}

struct PendingUpdate {
    apply: Box<dyn FnOnce(&mut Descriptor) + Send>,
    done: oneshot::Sender<Result<(), AgencyError>>,
}

struct AgentShared {
    agency: Agency,
    scheduler: Scheduler,
    descriptor: RwLock<Descriptor>,
    instance_id: u64,
    agent: AsyncMutex<Box<dyn Agent>>,
    state: StateMachine<AgencyAgentState>,

    messaging: std::sync::OnceLock<Arc<dyn Messaging>>,
    database: std::sync::OnceLock<Arc<dyn Database>>,
    configuration: Mutex<Option<Document>>,

    protocols: Mutex<HashMap<Uuid, Arc<dyn ProtocolInstance>>>,
    interests: Mutex<HashMap<(String, String), Arc<Interest>>>,
    long_running: Mutex<Vec<Arc<dyn ProtocolInstance>>>,
    delayed_calls: DashMap<Uuid, DelayedCall>,

    update_queue: Mutex<VecDeque<PendingUpdate>>,
    updating: AtomicBool,

    preallocation_timers: Mutex<HashMap<String, Uuid>>,

    entries_since_snapshot: AtomicU64,
    termination: Mutex<Option<TerminationFuture>>,
    split_brain_fired: AtomicBool,
}

/// The per-agent medium. Cheap to clone; all clones are the same agent.
#[derive(Clone)]
pub struct AgencyAgent {
    shared: Arc<AgentShared>,
}

impl AgencyAgent {
    pub(crate) fn new(
        agency: Agency,
        factory: Arc<dyn AgentFactory>,
        descriptor: Descriptor,
    ) -> Self {
        // The instance id is fixed now and written to the descriptor during
        // initiation, before any agent-side code runs.
        let instance_id = descriptor.instance_id + 1;
        let agent = factory.build();
        let scheduler = agency.scheduler();
        Self {
            shared: Arc::new(AgentShared {
                agency,
                scheduler,
                descriptor: RwLock::new(descriptor),
                instance_id,
                agent: AsyncMutex::new(agent),
                state: StateMachine::new(AgencyAgentState::NotInitiated),
                messaging: std::sync::OnceLock::new(),
                database: std::sync::OnceLock::new(),
                configuration: Mutex::new(None),
                protocols: Mutex::new(HashMap::new()),
                interests: Mutex::new(HashMap::new()),
                long_running: Mutex::new(Vec::new()),
                delayed_calls: DashMap::new(),
                update_queue: Mutex::new(VecDeque::new()),
                updating: AtomicBool::new(false),
                preallocation_timers: Mutex::new(HashMap::new()),
                entries_since_snapshot: AtomicU64::new(0),
                termination: Mutex::new(None),
                split_brain_fired: AtomicBool::new(false),
            }),
        }
    }

    // -- identity ----------------------------------------------------------

    pub fn agent_id(&self) -> String {
        self.shared.descriptor.read().doc_id.clone()
    }

    pub fn instance_id(&self) -> u64 {
        self.shared.instance_id
    }

    pub fn full_id(&self) -> String {
        format!("{}/{}", self.agent_id(), self.shared.instance_id)
    }

    pub fn shard(&self) -> String {
        self.shared.descriptor.read().shard.clone()
    }

    pub fn agent_type(&self) -> String {
        self.shared.descriptor.read().document_type.clone()
    }

    /// Deep copy of the current descriptor.
    pub fn get_descriptor(&self) -> Descriptor {
        self.shared.descriptor.read().clone()
    }

    /// Deep copy of the loaded configuration document.
    pub fn get_configuration(&self) -> Result<Document, AgencyError> {
        self.shared
            .configuration
            .lock()
            .clone()
            .ok_or_else(|| AgencyError::ConfigurationMissing(self.agent_id()))
    }

    pub fn state(&self) -> AgencyAgentState {
        self.shared.state.get()
    }

    pub fn is_ready(&self) -> bool {
        self.shared.state.is(AgencyAgentState::Ready)
    }

    pub async fn wait_for_state(&self, state: AgencyAgentState) {
        self.shared.state.wait_for(state).await;
    }

    pub fn agency(&self) -> Agency {
        self.shared.agency.clone()
    }

    /// Identity check: do both handles point at the same medium?
    pub fn same_as(&self, other: &AgencyAgent) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn scheduler(&self) -> Scheduler {
        self.shared.scheduler
    }

    pub fn is_connected(&self) -> bool {
        self.shared.agency.is_connected()
    }

    // -- staged initiation -------------------------------------------------

    /// Wire the medium up and bring the agent to `Ready`. Failures log and
    /// schedule a gentle termination.
    pub async fn initiate(&self, payload: Value, run_startup: bool) -> Result<(), AgencyError> {
        match self.initiate_stages(payload, run_startup).await {
            Ok(()) => Ok(()),
            Err(err) => {
                error!(
                    agent_id = %self.agent_id(),
                    state = ?self.state(),
                    %err,
                    "agent failed while starting up and will be terminated"
                );
                let me = self.clone();
                self.shared.scheduler.call_next(async move {
                    me.terminate().await;
                });
                Err(err)
            }
        }
    }

    async fn initiate_stages(&self, payload: Value, run_startup: bool) -> Result<(), AgencyError> {
        // 1. messaging connection
        let consumer: MessageConsumer = {
            let me = self.clone();
            Arc::new(move |message| me.dispatch_message(message))
        };
        let messaging = self.shared.agency.messaging_connection(consumer).await?;
        let _ = self.shared.messaging.set(messaging);

        // 2. database connection
        let database = self.shared.agency.database_connection().await?;
        let _ = self.shared.database.set(database.clone());

        // 3. reload our descriptor
        let current = self.shared.descriptor.read().to_document()?;
        let reloaded = database.reload(&current).await?;
        *self.shared.descriptor.write() = Descriptor::from_document(&reloaded)?;

        // 4. watch our own document
        let doc_id = self.agent_id();
        {
            let me = self.clone();
            database.changes_listener(
                &[doc_id.clone()],
                Arc::new(move |change| me.on_descriptor_change(change)),
            );
        }

        // 5. fence off any other instance of this agent
        let instance_id = self.shared.instance_id;
        self.update_descriptor(move |desc| {
            desc.instance_id = instance_id;
            desc.under_restart = false;
        })
        .await?;

        // 6. optional configuration document
        let config_doc_id = {
            let agent = self.shared.agent.lock().await;
            agent.configuration_doc_id()
        };
        if let Some(config_id) = config_doc_id {
            match database.get(&config_id).await {
                Ok(doc) => {
                    *self.shared.configuration.lock() = Some(doc);
                    let me = self.clone();
                    database.changes_listener(
                        &[config_id.clone()],
                        Arc::new(move |change| me.on_configuration_change(change)),
                    );
                }
                Err(DatabaseError::NotFound(_)) => {
                    warn!(
                        doc_id = %config_id,
                        "agent configuration not found in database"
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }

        // 7. join our shard
        let shard = self.shard();
        self.join_shard(&shard).await?;

        // 8. journal the agent's birth
        if let Err(err) =
            self.shared
                .agency
                .register_recorder(&doc_id, instance_id, AGENT_RECORDER)
        {
            error!(%err, "recorder registration failed");
        }
        self.journal_agency_entry(
            "agent_created",
            json!({"document_type": self.agent_type()}),
        );

        // 9. initiate agent-side code
        self.shared.state.set(AgencyAgentState::Initiating);
        {
            let me = self.clone();
            let mut agent = self.shared.agent.lock().await;
            agent.initiate_agent(&me, &payload).await?;
        }
        self.shared.state.set(AgencyAgentState::Initiated);

        // 10. startup off this stack
        let me = self.clone();
        self.shared.scheduler.call_next(async move {
            me.call_startup(run_startup).await;
        });

        Ok(())
    }

    async fn call_startup(&self, run_startup: bool) {
        self.shared.state.set(AgencyAgentState::StartingUp);
        let result = if run_startup {
            let me = self.clone();
            let mut agent = self.shared.agent.lock().await;
            agent.startup_agent(&me).await
        } else {
            Ok(())
        };

        match result {
            Ok(()) => {
                self.shared.state.set(AgencyAgentState::Ready);
                record_agent_started(&self.agent_type());
                info!(agent_id = %self.agent_id(), "agent ready");
            }
            Err(err) => {
                error!(
                    agent_id = %self.agent_id(),
                    %err,
                    "agent failed while starting up and will be terminated"
                );
                let me = self.clone();
                self.shared.scheduler.call_next(async move {
                    me.terminate().await;
                });
            }
        }
    }

    // -- change notifications ---------------------------------------------

    fn on_descriptor_change(&self, change: DocumentChange) {
        if change.own_change {
            debug!(
                doc_id = %change.doc_id,
                rev = %change.rev,
                "ignoring own descriptor change"
            );
            return;
        }
        warn!(
            agent_id = %self.agent_id(),
            rev = %change.rev,
            "another database session changed our descriptor; this instance \
             has been restarted elsewhere and terminates now"
        );
        if !self.shared.split_brain_fired.swap(true, Ordering::SeqCst) {
            let me = self.clone();
            self.shared.scheduler.call_next(async move {
                me.terminate_hard().await;
            });
        }
    }

    fn on_configuration_change(&self, change: DocumentChange) {
        debug!(doc_id = %change.doc_id, "agent configuration changed, reloading");
        let me = self.clone();
        self.shared.scheduler.call_next(async move {
            let Ok(database) = me.database() else { return };
            match database.get(&change.doc_id).await {
                Ok(doc) => {
                    *me.shared.configuration.lock() = Some(doc.clone());
                    let medium = me.clone();
                    let mut agent = me.shared.agent.lock().await;
                    agent.on_agent_configuration_change(&medium, &doc).await;
                }
                Err(err) => {
                    warn!(%err, "failed reloading changed configuration document");
                }
            }
        });
    }

    pub(crate) fn on_disconnect(&self) {
        if self.shared.state.is(AgencyAgentState::Ready) {
            self.shared.state.set(AgencyAgentState::Disconnected);
            let me = self.clone();
            self.shared.scheduler.call_next(async move {
                let medium = me.clone();
                let mut agent = me.shared.agent.lock().await;
                agent.on_agent_disconnect(&medium).await;
            });
        }
    }

    pub(crate) fn on_reconnect(&self) {
        if self.shared.state.is(AgencyAgentState::Disconnected) {
            self.shared.state.set(AgencyAgentState::Ready);
            let me = self.clone();
            self.shared.scheduler.call_next(async move {
                let medium = me.clone();
                let mut agent = me.shared.agent.lock().await;
                agent.on_agent_reconnect(&medium).await;
            });
        }
    }

    // -- descriptor update queue ------------------------------------------

    /// Enqueue a serialized descriptor mutation. The slot in the queue is
    /// taken at call time; mutations are applied in submission order, one
    /// save in flight at a time, and the returned future resolves with the
    /// mutator's result once its save succeeded.
    pub fn update_descriptor<T, F>(
        &self,
        mutator: F,
    ) -> impl Future<Output = Result<T, AgencyError>> + Send + 'static
    where
        F: FnOnce(&mut Descriptor) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (value_tx, value_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        self.shared.update_queue.lock().push_back(PendingUpdate {
            apply: Box::new(move |desc| {
                let _ = value_tx.send(mutator(desc));
            }),
            done: done_tx,
        });
        self.kick_update_queue();

        async move {
            match done_rx.await {
                Ok(outcome) => outcome?,
                Err(_) => return Err(AgencyError::Terminated),
            }
            value_rx.await.map_err(|_| AgencyError::Terminated)
        }
    }

    fn kick_update_queue(&self) {
        let me = self.clone();
        self.shared.scheduler.call_next(async move {
            me.drain_update_queue().await;
        });
    }

    async fn drain_update_queue(&self) {
        if self.shared.updating.swap(true, Ordering::SeqCst) {
            return;
        }
        let pending = self.shared.update_queue.lock().pop_front();
        let Some(pending) = pending else {
            self.shared.updating.store(false, Ordering::SeqCst);
            return;
        };

        let agent_type = self.agent_type();
        match self.apply_update(pending.apply).await {
            Ok(()) => {
                record_descriptor_update(&agent_type, "saved");
                let _ = pending.done.send(Ok(()));
            }
            Err(err) => {
                if matches!(&err, AgencyError::Database(DatabaseError::Conflict(_))) {
                    warn!(
                        agent_id = %self.agent_id(),
                        "descriptor update conflict, the agent has been usurped"
                    );
                    record_descriptor_update(&agent_type, "conflict");
                    let me = self.clone();
                    self.shared.scheduler.call_next(async move {
                        me.terminate_hard().await;
                    });
                } else {
                    error!(%err, "failed updating descriptor");
                    record_descriptor_update(&agent_type, "error");
                }
                let _ = pending.done.send(Err(err));
            }
        }

        self.shared.updating.store(false, Ordering::SeqCst);
        let more = !self.shared.update_queue.lock().is_empty();
        if more {
            self.kick_update_queue();
        }
    }

    async fn apply_update(
        &self,
        apply: Box<dyn FnOnce(&mut Descriptor) + Send>,
    ) -> Result<(), AgencyError> {
        let mut draft = self.shared.descriptor.read().clone();
        apply(&mut draft);

        let database = self.database()?;
        let saved = database.save(draft.to_document()?).await?;
        *self.shared.descriptor.write() = Descriptor::from_document(&saved)?;
        Ok(())
    }

    // -- resource allocations ----------------------------------------------

    /// Reserve resource capacity for a pending negotiation. Unless
    /// confirmed within `timeout` the reservation expires on its own and
    /// hands its capacity back.
    pub async fn preallocate_resource(
        &self,
        resource: &str,
        value: u64,
        capacity: u64,
        timeout: Option<Duration>,
    ) -> Result<Allocation, AgencyError> {
        let timeout = timeout.unwrap_or(DEFAULT_PREALLOCATION_TIMEOUT);
        let expires_at = Utc::now().timestamp_millis() + timeout.as_millis() as i64;

        let resource = resource.to_string();
        let allocation = self
            .update_descriptor(move |desc| {
                desc.preallocate(&resource, value, capacity, Some(expires_at))
            })
            .await??;

        let me = self.clone();
        let expire_id = allocation.id.clone();
        let timer = self.call_later_ex(timeout, false, async move {
            me.shared.preallocation_timers.lock().remove(&expire_id);
            let mutate_id = expire_id.clone();
            match me
                .update_descriptor(move |desc| desc.expire(&mutate_id))
                .await
            {
                Ok(Ok(_)) => {
                    debug!(allocation_id = %expire_id, "preallocation expired");
                }
                // Confirmed or released in the meantime.
                Ok(Err(_)) => {}
                Err(err) => warn!(%err, "failed expiring preallocation"),
            }
        });
        self.shared
            .preallocation_timers
            .lock()
            .insert(allocation.id.clone(), timer);
        Ok(allocation)
    }

    /// Directly record a confirmed allocation.
    pub async fn allocate_resource(
        &self,
        resource: &str,
        value: u64,
        capacity: u64,
    ) -> Result<Allocation, AgencyError> {
        let resource = resource.to_string();
        Ok(self
            .update_descriptor(move |desc| desc.allocate(&resource, value, capacity))
            .await??)
    }

    /// Promote a preallocation into a confirmed allocation and disarm its
    /// expiry timer.
    pub async fn confirm_allocation(&self, allocation_id: &str) -> Result<(), AgencyError> {
        if let Some(timer) = self
            .shared
            .preallocation_timers
            .lock()
            .remove(allocation_id)
        {
            self.cancel_delayed_call(timer);
        }
        let id = allocation_id.to_string();
        self.update_descriptor(move |desc| desc.confirm(&id)).await??;
        Ok(())
    }

    /// Release an allocation in any live state.
    pub async fn release_allocation(
        &self,
        allocation_id: &str,
    ) -> Result<Allocation, AgencyError> {
        if let Some(timer) = self
            .shared
            .preallocation_timers
            .lock()
            .remove(allocation_id)
        {
            self.cancel_delayed_call(timer);
        }
        let id = allocation_id.to_string();
        Ok(self
            .update_descriptor(move |desc| desc.release(&id))
            .await??)
    }

    // -- messaging ---------------------------------------------------------

    fn messaging(&self) -> Result<Arc<dyn Messaging>, AgencyError> {
        self.shared
            .messaging
            .get()
            .cloned()
            .ok_or(AgencyError::NotWired("messaging"))
    }

    fn database(&self) -> Result<Arc<dyn Database>, AgencyError> {
        self.shared
            .database
            .get()
            .cloned()
            .ok_or(AgencyError::NotWired("database"))
    }

    /// Post a message; it must carry an expiration time.
    pub async fn send(
        &self,
        recipients: &[Recipient],
        message: Message,
    ) -> Result<(), AgencyError> {
        if message.expiration_time.is_none() {
            return Err(AgencyError::Messaging(
                crate::messaging::MessagingError::MissingExpiration,
            ));
        }
        record_message_posted(&message.protocol_type);
        self.messaging()?
            .post(recipients, message)
            .await
            .map_err(Into::into)
    }

    /// Bind the agent's own queue and every interest within `shard`.
    pub async fn join_shard(&self, shard: &str) -> Result<(), AgencyError> {
        debug!(agent_id = %self.agent_id(), %shard, "joining shard");
        let messaging = self.messaging()?;
        messaging
            .create_binding(Recipient::agent(self.agent_id(), shard))
            .await?;

        let interests: Vec<Arc<Interest>> =
            self.shared.interests.lock().values().cloned().collect();
        for interest in interests {
            interest.bind(&messaging, shard).await?;
        }
        Ok(())
    }

    /// Revoke every binding this agent holds within `shard`.
    pub async fn leave_shard(&self, shard: &str) -> Result<(), AgencyError> {
        debug!(agent_id = %self.agent_id(), %shard, "leaving shard");
        let messaging = self.messaging()?;
        for handle in messaging.bindings(shard) {
            messaging.revoke_binding(&handle).await?;
        }
        Ok(())
    }

    pub async fn create_external_route(
        &self,
        backend_id: &str,
        options: RouteOptions,
    ) -> Result<(), AgencyError> {
        self.messaging()?
            .create_external_route(backend_id, options)
            .await
            .map_err(Into::into)
    }

    pub async fn remove_external_route(
        &self,
        backend_id: &str,
        options: RouteOptions,
    ) -> Result<(), AgencyError> {
        self.messaging()?
            .remove_external_route(backend_id, options)
            .await
            .map_err(Into::into)
    }

    // -- document passthrough ---------------------------------------------

    pub async fn get_document(&self, doc_id: &str) -> Result<Document, AgencyError> {
        Ok(self.database()?.get(doc_id).await?)
    }

    pub async fn save_document(&self, doc: Document) -> Result<Document, AgencyError> {
        Ok(self.database()?.save(doc).await?)
    }

    pub async fn delete_document(&self, doc: &Document) -> Result<(), AgencyError> {
        Ok(self.database()?.delete(doc).await?)
    }

    pub async fn query_view(
        &self,
        view: &str,
        options: crate::database::QueryOptions,
    ) -> Result<Vec<Document>, AgencyError> {
        Ok(self.database()?.query_view(view, options).await?)
    }

    // -- inbound dispatch --------------------------------------------------

    fn dispatch_message(&self, message: Message) {
        if message.is_expired() {
            record_message_expired(&message.protocol_type);
            debug!(message_id = %message.message_id, "dropping expired message");
            return;
        }

        if let Some(conversation_id) = message.conversation_id {
            let target = self.shared.protocols.lock().get(&conversation_id).cloned();
            if let Some(instance) = target {
                instance.deliver(message);
                return;
            }
        }

        let key = (message.protocol_type.clone(), message.protocol_id.clone());
        let interest = self.shared.interests.lock().get(&key).cloned();
        match interest {
            Some(interest) if interest.accepting() => {
                self.spawn_interest_instance(&interest, message);
            }
            _ => {
                debug!(
                    protocol_type = %key.0,
                    protocol_id = %key.1,
                    "no interest for inbound message"
                );
            }
        }
    }

    fn spawn_interest_instance(&self, interest: &Arc<Interest>, message: Message) {
        let factory = interest.factory();
        let guid = message.conversation_id.unwrap_or_else(Uuid::new_v4);
        let logic = factory.build(&message);
        let runner = ProtocolRunner::spawn(
            guid,
            ProtocolKind::InterestSpawned,
            factory.protocol_type(),
            factory.protocol_id(),
            logic,
            Arc::new(self.clone()),
            Some(message),
        );
        interest.track(runner.notify_finish());
        self.register_protocol(runner);
    }

    // -- interests ---------------------------------------------------------

    /// Register a passive acceptor. The factory must be able to build its
    /// logic from a first inbound message; registering the same
    /// `(type, id)` twice is an error.
    pub async fn register_interest(
        &self,
        factory: Arc<dyn InterestFactory>,
    ) -> Result<(), AgencyError> {
        if !factory.accepts_first_message() {
            return Err(ProtocolError::NotFirstMessage {
                protocol_type: factory.protocol_type().to_string(),
                protocol_id: factory.protocol_id().to_string(),
            }
            .into());
        }

        let key = (
            factory.protocol_type().to_string(),
            factory.protocol_id().to_string(),
        );
        {
            let mut interests = self.shared.interests.lock();
            if interests.contains_key(&key) {
                error!(
                    protocol_type = %key.0,
                    protocol_id = %key.1,
                    "already interested in this protocol"
                );
                return Err(ProtocolError::DuplicateInterest {
                    protocol_type: key.0,
                    protocol_id: key.1,
                }
                .into());
            }
            interests.insert(key.clone(), Interest::new(factory));
        }

        // Bind within our shard right away; join_shard covers later joins.
        let interest = self.shared.interests.lock().get(&key).cloned();
        if let (Some(interest), Ok(messaging)) = (interest, self.messaging()) {
            interest.bind(&messaging, &self.shard()).await?;
        }
        debug!(
            protocol_type = %key.0,
            protocol_id = %key.1,
            "registered interest"
        );
        Ok(())
    }

    /// Revoke a registered interest, draining its in-flight conversations.
    pub async fn revoke_interest(
        &self,
        protocol_type: &str,
        protocol_id: &str,
    ) -> Result<(), AgencyError> {
        let key = (protocol_type.to_string(), protocol_id.to_string());
        let interest = self.shared.interests.lock().remove(&key);
        let Some(interest) = interest else {
            error!(
                protocol_type,
                protocol_id, "requested to revoke an unknown interest"
            );
            return Err(ProtocolError::ValidationFailed(format!(
                "not interested in {protocol_type}.{protocol_id}"
            ))
            .into());
        };
        if let Ok(messaging) = self.messaging() {
            interest.revoke(&messaging).await;
        }
        Ok(())
    }

    pub fn has_interest(&self, protocol_type: &str, protocol_id: &str) -> bool {
        self.shared
            .interests
            .lock()
            .contains_key(&(protocol_type.to_string(), protocol_id.to_string()))
    }

    // -- protocols ---------------------------------------------------------

    /// Start an initiator; the returned instance reports completion through
    /// `notify_finish`.
    pub fn start_protocol(
        &self,
        factory: Arc<dyn InitiatorFactory>,
    ) -> Arc<dyn ProtocolInstance> {
        let guid = Uuid::new_v4();
        let logic = factory.build();
        let runner = ProtocolRunner::spawn(
            guid,
            ProtocolKind::Initiator,
            factory.protocol_type(),
            factory.protocol_id(),
            logic,
            Arc::new(self.clone()),
            None,
        );
        self.register_protocol(runner.clone());
        runner
    }

    /// Wrap `factory` in exponential-backoff re-initiation.
    pub fn retrying_protocol(
        &self,
        factory: Arc<dyn InitiatorFactory>,
        config: RetryConfig,
    ) -> Arc<RetryingProtocol> {
        let dealer: Arc<dyn ProtocolDealer> = Arc::new(self.clone());
        let instance = RetryingProtocol::new(dealer, factory, config);
        self.register_long_running(instance.clone());
        instance.initiate()
    }

    /// Run `factory` repeatedly with single-flight semantics.
    pub fn periodic_protocol(
        &self,
        factory: Arc<dyn InitiatorFactory>,
        period: Duration,
    ) -> Arc<PeriodicProtocol> {
        let dealer: Arc<dyn ProtocolDealer> = Arc::new(self.clone());
        let instance = PeriodicProtocol::new(dealer, factory, period);
        self.register_long_running(instance.clone());
        instance.initiate()
    }

    fn register_long_running<P>(&self, instance: Arc<P>)
    where
        P: ProtocolInstance + 'static,
    {
        self.shared.long_running.lock().push(instance.clone());
        self.register_protocol(instance);
    }

    fn register_protocol<P>(&self, instance: Arc<P>)
    where
        P: ProtocolInstance + 'static,
    {
        let instance: Arc<dyn ProtocolInstance> = instance;
        let guid = instance.guid();
        {
            let mut protocols = self.shared.protocols.lock();
            // Guid collisions are a bug, never a runtime condition.
            assert!(
                !protocols.contains_key(&guid),
                "duplicate protocol guid {guid}"
            );
            protocols.insert(guid, instance.clone());
        }
        debug!(agent_id = %self.agent_id(), %guid, "registered protocol");
        record_protocol_initiated(
            &instance.protocol_type(),
            match instance.kind() {
                ProtocolKind::Initiator => "initiator",
                ProtocolKind::InterestSpawned => "interest",
                ProtocolKind::Task => "task",
                ProtocolKind::Retrying => "retrying",
                ProtocolKind::Periodic => "periodic",
            },
        );
        self.journal_agency_entry(
            "protocol_created",
            json!({
                "guid": guid,
                "protocol_type": instance.protocol_type(),
                "protocol_id": instance.protocol_id(),
            }),
        );

        let me = self.clone();
        let waiter = instance.notify_finish();
        tokio::spawn(async move {
            let _ = waiter.wait().await;
            me.unregister_protocol(guid);
        });
    }

    fn unregister_protocol(&self, guid: Uuid) {
        let removed = self.shared.protocols.lock().remove(&guid);
        if removed.is_some() {
            debug!(agent_id = %self.agent_id(), %guid, "unregistered protocol");
            self.shared
                .long_running
                .lock()
                .retain(|p| p.guid() != guid);
            self.journal_agency_entry("protocol_deleted", json!({"guid": guid}));
        } else {
            error!(%guid, "tried to unregister an unknown protocol");
        }
    }

    pub fn protocol_count(&self) -> usize {
        self.shared.protocols.lock().len()
    }

    /// Wait for every live protocol and interest conversation to finish.
    pub async fn wait_for_protocols_finish(&self) {
        let waiters: Vec<_> = self
            .shared
            .protocols
            .lock()
            .values()
            .map(|p| p.notify_finish())
            .collect();
        futures::future::join_all(waiters.into_iter().map(|waiter| async move {
            let _ = waiter.wait().await;
        }))
        .await;

        let interests: Vec<Arc<Interest>> =
            self.shared.interests.lock().values().cloned().collect();
        for interest in interests {
            interest.wait_finished().await;
        }
    }

    // -- delayed calls -----------------------------------------------------

    /// Schedule `work` after `delay`. `busy` marks calls whose pending
    /// completion keeps the agent from reporting idle.
    pub fn call_later_ex<F>(&self, delay: Duration, busy: bool, work: F) -> Uuid
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let call_id = Uuid::new_v4();
        let shared = self.shared.clone();
        let handle = self.shared.scheduler.call_later(delay, async move {
            work.await;
            shared.delayed_calls.remove(&call_id);
        });
        let fired = !handle.active();
        self.shared
            .delayed_calls
            .insert(call_id, DelayedCall { busy, handle });
        if fired {
            self.shared.delayed_calls.remove(&call_id);
        }
        call_id
    }

    pub fn call_later<F>(&self, delay: Duration, work: F) -> Uuid
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.call_later_ex(delay, true, work)
    }

    pub fn call_next<F>(&self, work: F) -> Uuid
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.call_later_ex(Duration::ZERO, true, work)
    }

    /// Cancel a delayed call; unknown ids are logged and ignored.
    pub fn cancel_delayed_call(&self, call_id: Uuid) {
        match self.shared.delayed_calls.remove(&call_id) {
            Some((_, call)) => call.handle.cancel(),
            None => {
                warn!(%call_id, "tried to cancel a nonexistent delayed call");
            }
        }
    }

    fn cancel_all_delayed_calls(&self) {
        for entry in self.shared.delayed_calls.iter() {
            debug!(
                call_id = %entry.key(),
                active = entry.value().handle.active(),
                "cancelling delayed call"
            );
            entry.value().handle.cancel();
        }
        self.shared.delayed_calls.clear();
        self.shared.preallocation_timers.lock().clear();
    }

    // -- journal -----------------------------------------------------------

    /// Apply a mutation to the agent and journal it durably.
    pub async fn record_mutation(
        &self,
        function_id: &str,
        payload: Value,
    ) -> Result<Value, AgencyError> {
        let result = {
            let mut agent = self.shared.agent.lock().await;
            agent.apply_mutation(function_id, &payload)?
        };
        self.journal_mutation(function_id, payload, result.clone())
            .await?;
        Ok(result)
    }

    /// Journal an already-applied mutation; used by lifecycle hooks which
    /// hold the agent exclusively.
    pub async fn journal_mutation(
        &self,
        function_id: &str,
        payload: Value,
        result: Value,
    ) -> Result<(), AgencyError> {
        let Some(journaler) = self.shared.agency.journaler() else {
            return Ok(());
        };
        self.shared
            .entries_since_snapshot
            .fetch_add(1, Ordering::SeqCst);
        record_journal_entry(AGENT_RECORDER);
        let mut builder = journaler.new_entry(
            self.agent_id(),
            self.shared.instance_id,
            AGENT_RECORDER,
            function_id,
            payload,
            Value::Null,
        );
        builder.set_result(result);
        builder.commit().await?;
        Ok(())
    }

    fn journal_agency_entry(&self, function_id: &str, args: Value) {
        let Some(journaler) = self.shared.agency.journaler() else {
            return;
        };
        record_journal_entry(AGENCY_RECORDER);
        let mut builder = journaler.new_entry(
            self.agent_id(),
            self.shared.instance_id,
            AGENCY_RECORDER,
            function_id,
            args,
            Value::Null,
        );
        builder.set_fiber_context(Uuid::new_v4(), 0);
        builder.set_result(Value::Null);
        builder.commit_detached();
    }

    pub fn entries_since_snapshot(&self) -> u64 {
        self.shared.entries_since_snapshot.load(Ordering::SeqCst)
    }

    /// Emit a snapshot of the agent and every live protocol's agent-side
    /// view; resets the entry counter.
    pub async fn journal_snapshot(&self) {
        self.shared
            .entries_since_snapshot
            .store(0, Ordering::SeqCst);
        let agent_state = {
            let agent = self.shared.agent.lock().await;
            agent.snapshot()
        };
        let protocols: Vec<Value> = self
            .shared
            .protocols
            .lock()
            .values()
            .map(|p| p.agent_snapshot())
            .collect();

        if let Some(journaler) = self.shared.agency.journaler() {
            let record = SnapshotRecord {
                agent_id: self.agent_id(),
                instance_id: self.shared.instance_id,
                agent_state,
                protocols,
                timestamp: Utc::now().timestamp_millis(),
            };
            if let Err(err) = journaler.snapshot(record).await {
                error!(%err, "failed storing agent snapshot");
            }
            record_journal_snapshot(&self.agent_type());
        }
    }

    /// Snapshot when forced or when enough entries accumulated.
    pub async fn check_if_should_snapshot(&self, force: bool) {
        let entries = self.entries_since_snapshot();
        if force || entries > MIN_ENTRIES_PER_SNAPSHOT {
            self.journal_snapshot().await;
        } else {
            debug!(
                entries,
                threshold = MIN_ENTRIES_PER_SNAPSHOT,
                "skipping snapshot, not enough entries"
            );
        }
    }

    // -- agency passthrough ------------------------------------------------

    pub async fn start_agent(
        &self,
        descriptor: Descriptor,
        payload: Value,
    ) -> Result<AgencyAgent, AgencyError> {
        self.shared.agency.start_agent(descriptor, payload).await
    }

    pub fn check_if_hosted(&self, agent_id: &str) -> bool {
        self.shared.agency.find_agent(agent_id).is_some()
    }

    pub fn upgrade_agency(&self, upgrade_cmd: &str) {
        self.shared.agency.upgrade(upgrade_cmd);
    }

    // -- idleness ----------------------------------------------------------

    pub fn is_idle(&self) -> bool {
        self.is_ready()
            && self.has_empty_protocols()
            && self.has_all_interests_idle()
            && !self.has_busy_calls()
            && self.has_all_long_running_idle()
    }

    pub fn has_empty_protocols(&self) -> bool {
        self.shared
            .protocols
            .lock()
            .values()
            .all(|p| p.is_idle())
    }

    pub fn has_busy_calls(&self) -> bool {
        self.shared
            .delayed_calls
            .iter()
            .any(|entry| entry.value().busy && entry.value().handle.active())
    }

    pub fn has_all_interests_idle(&self) -> bool {
        self.shared
            .interests
            .lock()
            .values()
            .all(|i| i.is_idle())
    }

    pub fn has_all_long_running_idle(&self) -> bool {
        self.shared.long_running.lock().iter().all(|p| p.is_idle())
    }

    // -- termination -------------------------------------------------------

    /// Gentle termination: shutdown hook, wait for protocols, delete the
    /// descriptor. Idempotent; concurrent calls share one future.
    pub fn terminate(&self) -> TerminationFuture {
        self.termination_future(TerminationMode::Gentle)
    }

    /// Hard termination: kill hook, keep the descriptor.
    pub fn terminate_hard(&self) -> TerminationFuture {
        self.termination_future(TerminationMode::Hard)
    }

    /// SIGTERM path; equivalent to a hard termination.
    pub fn on_killed(&self) -> TerminationFuture {
        self.termination_future(TerminationMode::Hard)
    }

    fn termination_future(&self, mode: TerminationMode) -> TerminationFuture {
        let mut guard = self.shared.termination.lock();
        if let Some(existing) = guard.as_ref() {
            return existing.clone();
        }
        let me = self.clone();
        let future: TerminationFuture = async move {
            me.run_termination(mode).await;
        }
        .boxed()
        .shared();
        *guard = Some(future.clone());
        tokio::spawn(future.clone());
        future
    }

    async fn run_termination(&self, mode: TerminationMode) {
        info!(
            agent_id = %self.agent_id(),
            mode = mode.label(),
            "beginning termination procedure"
        );
        self.shared.state.set(AgencyAgentState::Terminating);

        // Final snapshot.
        self.check_if_should_snapshot(true).await;

        // Revoke every interest.
        let interests: Vec<Arc<Interest>> = {
            let mut map = self.shared.interests.lock();
            map.drain().map(|(_, interest)| interest).collect()
        };
        if let Ok(messaging) = self.messaging() {
            for interest in interests {
                interest.revoke(&messaging).await;
            }
        }

        // Cancel long-running protocols.
        let long_running: Vec<Arc<dyn ProtocolInstance>> = {
            let mut list = self.shared.long_running.lock();
            list.drain(..).collect()
        };
        for protocol in long_running {
            protocol.cleanup().await;
        }

        // Cancel delayed calls.
        self.cancel_all_delayed_calls();

        // Kill every live protocol.
        let protocols: Vec<Arc<dyn ProtocolInstance>> =
            self.shared.protocols.lock().values().cloned().collect();
        for protocol in protocols {
            protocol.cleanup().await;
        }

        // Late schedules, once more.
        self.cancel_all_delayed_calls();

        // Mode-specific body.
        match mode {
            TerminationMode::Gentle => {
                let hook = {
                    let medium = self.clone();
                    let mut agent = self.shared.agent.lock().await;
                    agent.shutdown_agent(&medium).await
                };
                if let Err(err) = hook {
                    warn!(%err, "shutdown hook failed");
                }
                self.wait_for_protocols_finish().await;

                match self.database() {
                    Ok(database) => {
                        let doc = self.shared.descriptor.read().to_document();
                        match doc {
                            Ok(doc) => {
                                if let Err(err) = database.delete(&doc).await {
                                    warn!(%err, "failed deleting descriptor");
                                }
                            }
                            Err(err) => warn!(%err, "descriptor not serializable"),
                        }
                    }
                    Err(_) => warn!("agent has no database reference"),
                }
            }
            TerminationMode::Hard => {
                let hook = {
                    let medium = self.clone();
                    let mut agent = self.shared.agent.lock().await;
                    agent.on_agent_killed(&medium).await
                };
                if let Err(err) = hook {
                    warn!(%err, "kill hook failed");
                }
                self.wait_for_protocols_finish().await;
            }
        }

        // Tell the agency we are no more.
        self.journal_agency_entry("agent_deleted", Value::Null);
        self.shared.agency.unregister_agent(self);

        if let Ok(messaging) = self.messaging() {
            messaging.release().await;
        } else {
            warn!("agent has no messaging reference");
        }
        if let Ok(database) = self.database() {
            database.disconnect().await;
        }

        record_agent_terminated(&self.agent_type(), mode.label());
        self.shared.state.set(AgencyAgentState::Terminated);
    }
}

// ---------------------------------------------------------------------------
// Protocol seams
// ---------------------------------------------------------------------------

#[async_trait]
impl ProtocolMedium for AgencyAgent {
    fn agent_address(&self) -> Recipient {
        self.shared.descriptor.read().recipient()
    }

    fn scheduler(&self) -> Scheduler {
        self.shared.scheduler
    }

    async fn post(
        &self,
        recipients: &[Recipient],
        message: Message,
    ) -> Result<(), ProtocolError> {
        self.send(recipients, message)
            .await
            .map_err(|e| ProtocolError::Messaging(e.to_string()))
    }
}

#[async_trait]
impl ProtocolDealer for AgencyAgent {
    fn scheduler(&self) -> Scheduler {
        self.shared.scheduler
    }

    async fn initiate_protocol(
        &self,
        factory: Arc<dyn InitiatorFactory>,
    ) -> Result<Arc<dyn ProtocolInstance>, ProtocolError> {
        Ok(self.start_protocol(factory))
    }
}
