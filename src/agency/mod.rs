// agency/mod.rs - The Agency
//
//! Process-level container hosting agents.
//!
//! The agency owns the shared backends (messaging, database, journal), the
//! registry of live `AgencyAgent` media, the arena of journal recorders, a
//! spawning queue mediated by the machine's host agent, and the staged
//! startup/shutdown procedures. Backend connectivity is tracked centrally
//! and fanned out to every medium as ready ⇄ disconnected transitions.

mod agent;
mod procedure;

pub use agent::{AgencyAgent, AgencyAgentState, TerminationFuture, TerminationMode};
pub use procedure::{
    ShutdownOptions, ShutdownOutcome, ShutdownStage, StartupConfig, StartupStage,
};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::database::{Database, DatabaseError, DatabaseFactory};
use crate::descriptor::{Descriptor, DescriptorError};
use crate::journal::{JournalError, JournalTarget, Journaler};
use crate::messaging::{MessageConsumer, Messaging, MessagingError, MessagingFactory};
use crate::protocol::ProtocolError;
use crate::serialization::{
    AgentRegistry, DescriptorRegistry, SerializationError, TypeRegistry,
};
use crate::time::Scheduler;

/// Entries accumulated between two snapshots before the next sweep emits one.
pub const MIN_ENTRIES_PER_SNAPSHOT: u64 = 600;

/// Document type of the per-machine host agent.
pub const HOST_AGENT_TYPE: &str = "host_agent";

/// Shard the host agent's fresh descriptor is created in.
pub const HOST_AGENT_SHARD: &str = "lobby";

const HOST_RESTART_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Agency errors
#[derive(Debug, Error)]
pub enum AgencyError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Descriptor error: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error("Unknown agent type: {0}")]
    UnknownAgentType(String),

    #[error("Unknown mutation: {0}")]
    UnknownMutation(String),

    #[error("Recorder already registered: {0}")]
    DuplicateRecorder(String),

    #[error("Agent configuration not found for {0}")]
    ConfigurationMissing(String),

    #[error("Agency has no {0} attached")]
    NotWired(&'static str),

    #[error("Host agent descriptor already exists for {0}; restart not enabled")]
    HostRestartForbidden(String),

    #[error("Agent terminated")]
    Terminated,

    #[error("Agent error: {0}")]
    Agent(String),
}

/// What to spawn through the host agent.
#[derive(Clone)]
pub enum SpawnTarget {
    /// A fully materialized descriptor
    Descriptor(Box<Descriptor>),
    /// An agent type resolved through the descriptor registry
    Type(String),
}

struct SpawnRequest {
    target: SpawnTarget,
    payload: Value,
    done: oneshot::Sender<Result<String, AgencyError>>,
}

type RecorderKey = (String, u64, String);
type ShutdownFuture = Shared<BoxFuture<'static, ShutdownOutcome>>;

struct AgencyShared {
    agency_id: String,
    hostname: String,
    ip: String,
    scheduler: Scheduler,

    agents: RwLock<Vec<AgencyAgent>>,
    recorders: Mutex<HashMap<RecorderKey, ()>>,

    journaler: Mutex<Option<Journaler>>,
    messaging: Mutex<Option<Arc<dyn MessagingFactory>>>,
    database: Mutex<Option<Arc<dyn DatabaseFactory>>>,

    agent_registry: AgentRegistry,
    descriptor_registry: DescriptorRegistry,
    type_registry: TypeRegistry,

    connection: crate::common::ConnectionTracker,

    shutdown: Mutex<Option<ShutdownFuture>>,
    startup_running: AtomicBool,

    start_host_agent: AtomicBool,
    force_host_restart: AtomicBool,
    starting_host: AtomicBool,
    host_payload: Mutex<Value>,

    to_spawn: Mutex<VecDeque<SpawnRequest>>,
    spawn_sem: tokio::sync::Semaphore,

    upgrade_cmd: Mutex<Option<String>>,
}

/// Process-level container for agents. Cheap to clone.
#[derive(Clone)]
pub struct Agency {
    shared: Arc<AgencyShared>,
}

impl Agency {
    pub fn new() -> Self {
        let agency = Self {
            shared: Arc::new(AgencyShared {
                agency_id: Uuid::new_v4().to_string(),
                hostname: detect_hostname(),
                ip: "127.0.0.1".to_string(),
                scheduler: Scheduler::new(),
                agents: RwLock::new(Vec::new()),
                recorders: Mutex::new(HashMap::new()),
                journaler: Mutex::new(None),
                messaging: Mutex::new(None),
                database: Mutex::new(None),
                agent_registry: AgentRegistry::new(),
                descriptor_registry: DescriptorRegistry::new(),
                type_registry: TypeRegistry::new(),
                connection: crate::common::ConnectionTracker::new(),
                shutdown: Mutex::new(None),
                startup_running: AtomicBool::new(false),
                start_host_agent: AtomicBool::new(false),
                force_host_restart: AtomicBool::new(false),
                starting_host: AtomicBool::new(false),
                host_payload: Mutex::new(Value::Null),
                to_spawn: Mutex::new(VecDeque::new()),
                spawn_sem: tokio::sync::Semaphore::new(1),
                upgrade_cmd: Mutex::new(None),
            }),
        };

        let on_down = agency.clone();
        agency
            .shared
            .connection
            .add_disconnected_callback(Arc::new(move || {
                on_down.notify_agents_disconnected();
            }));
        let on_up = agency.clone();
        agency
            .shared
            .connection
            .add_connected_callback(Arc::new(move || {
                on_up.notify_agents_reconnected();
            }));

        agency
    }

    // -- identity ----------------------------------------------------------

    pub fn agency_id(&self) -> &str {
        &self.shared.agency_id
    }

    pub fn hostname(&self) -> String {
        self.shared.hostname.clone()
    }

    pub fn ip(&self) -> String {
        self.shared.ip.clone()
    }

    pub fn scheduler(&self) -> Scheduler {
        self.shared.scheduler
    }

    pub fn agent_registry(&self) -> AgentRegistry {
        self.shared.agent_registry.clone()
    }

    pub fn descriptor_registry(&self) -> DescriptorRegistry {
        self.shared.descriptor_registry.clone()
    }

    pub fn type_registry(&self) -> TypeRegistry {
        self.shared.type_registry.clone()
    }

    // -- lifecycle ---------------------------------------------------------

    /// Run the staged startup procedure. Must complete before the agency is
    /// used for anything.
    pub async fn initiate(&self, config: StartupConfig) -> Result<(), AgencyError> {
        self.shared.startup_running.store(true, Ordering::SeqCst);
        let result = procedure::run_startup(self, config).await;
        self.shared.startup_running.store(false, Ordering::SeqCst);
        result
    }

    /// Gentle shutdown of every agent and the backends.
    pub async fn shutdown(&self) -> ShutdownOutcome {
        self.shutdown_future(ShutdownOptions {
            gentle: true,
            stop_process: false,
        })
        .await
    }

    /// Violent shutdown; agents get their kill hook, descriptors survive.
    pub async fn kill(&self) -> ShutdownOutcome {
        self.shutdown_future(ShutdownOptions {
            gentle: false,
            stop_process: false,
        })
        .await
    }

    /// SIGTERM path: the process is going away.
    pub async fn on_killed(&self) -> ShutdownOutcome {
        self.shutdown_future(ShutdownOptions {
            gentle: false,
            stop_process: true,
        })
        .await
    }

    /// Cluster-ordered shutdown, optionally stopping the process.
    pub async fn full_shutdown(&self, stop_process: bool) -> ShutdownOutcome {
        self.shutdown_future(ShutdownOptions {
            gentle: true,
            stop_process,
        })
        .await
    }

    /// Record the upgrade command and wind the agency down; the command is
    /// spawned by the final shutdown stage.
    pub fn upgrade(&self, upgrade_cmd: &str) {
        *self.shared.upgrade_cmd.lock() = Some(upgrade_cmd.to_string());
        let me = self.clone();
        tokio::spawn(async move {
            me.full_shutdown(true).await;
        });
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.lock().is_some()
    }

    fn shutdown_future(&self, options: ShutdownOptions) -> ShutdownFuture {
        let mut guard = self.shared.shutdown.lock();
        if let Some(existing) = guard.as_ref() {
            return existing.clone();
        }
        let me = self.clone();
        let future: ShutdownFuture = async move {
            procedure::run_shutdown(&me, options).await
        }
        .boxed()
        .shared();
        *guard = Some(future.clone());
        tokio::spawn(future.clone());
        future
    }

    // -- agent registry ----------------------------------------------------

    /// Build a medium for `descriptor` and bring it up.
    pub async fn start_agent(
        &self,
        descriptor: Descriptor,
        payload: Value,
    ) -> Result<AgencyAgent, AgencyError> {
        let factory = self
            .shared
            .agent_registry
            .lookup(&descriptor.document_type)
            .ok_or_else(|| AgencyError::UnknownAgentType(descriptor.document_type.clone()))?;
        info!(
            agent_id = %descriptor.doc_id,
            agent_type = %descriptor.document_type,
            "starting agent"
        );

        let medium = AgencyAgent::new(self.clone(), factory, descriptor);
        self.register_agent(&medium);

        if let Some(database) = self.database_factory_opt() {
            database.wait_connected().await;
        }
        medium.initiate(payload, true).await?;
        Ok(medium)
    }

    pub fn register_agent(&self, medium: &AgencyAgent) {
        self.shared.agents.write().push(medium.clone());
    }

    pub fn unregister_agent(&self, medium: &AgencyAgent) {
        let agent_id = medium.agent_id();
        debug!(%agent_id, "unregistering agent");
        self.shared
            .agents
            .write()
            .retain(|existing| !existing.same_as(medium));
        // Recorder entries are cleared explicitly; the arena holds them
        // until the owning agent is gone.
        self.remove_agent_recorders(&agent_id);
    }

    pub fn find_agent(&self, agent_id: &str) -> Option<AgencyAgent> {
        self.shared
            .agents
            .read()
            .iter()
            .find(|medium| medium.agent_id() == agent_id)
            .cloned()
    }

    pub fn agents(&self) -> Vec<AgencyAgent> {
        self.shared.agents.read().clone()
    }

    pub fn agent_count(&self) -> usize {
        self.shared.agents.read().len()
    }

    pub fn is_idle(&self) -> bool {
        let agents_idle = self.shared.agents.read().iter().all(|a| a.is_idle());
        let messaging_idle = self
            .shared
            .messaging
            .lock()
            .as_ref()
            .map(|m| m.is_idle())
            .unwrap_or(true);
        agents_idle && messaging_idle
    }

    /// Ask every medium to snapshot if due; `force` overrides the entry
    /// threshold.
    pub async fn snapshot_agents(&self, force: bool) {
        for medium in self.agents() {
            medium.check_if_should_snapshot(force).await;
        }
    }

    // -- journal registry --------------------------------------------------

    pub fn journaler(&self) -> Option<Journaler> {
        self.shared.journaler.lock().clone()
    }

    pub(crate) fn attach_journal(&self, target: Arc<dyn JournalTarget>) {
        let journaler = Journaler::new(target);
        journaler.log(
            "agency",
            "info",
            &format!("journal attached to agency {}", self.shared.agency_id),
        );
        *self.shared.journaler.lock() = Some(journaler);
    }

    /// Claim a recorder slot in the arena; the same key can only be taken
    /// once per agent instance.
    pub fn register_recorder(
        &self,
        agent_id: &str,
        instance_id: u64,
        recorder_id: &str,
    ) -> Result<(), AgencyError> {
        let key = (
            agent_id.to_string(),
            instance_id,
            recorder_id.to_string(),
        );
        let mut recorders = self.shared.recorders.lock();
        if recorders.contains_key(&key) {
            return Err(AgencyError::DuplicateRecorder(format!(
                "{agent_id}/{instance_id}/{recorder_id}"
            )));
        }
        debug!(%agent_id, instance_id, recorder_id, "registered recorder");
        recorders.insert(key, ());
        Ok(())
    }

    fn remove_agent_recorders(&self, agent_id: &str) {
        self.shared
            .recorders
            .lock()
            .retain(|(owner, _, _), _| owner.as_str() != agent_id);
    }

    pub fn recorder_count(&self) -> usize {
        self.shared.recorders.lock().len()
    }

    // -- backends ----------------------------------------------------------

    pub(crate) fn set_messaging(&self, factory: Arc<dyn MessagingFactory>) {
        *self.shared.messaging.lock() = Some(factory);
    }

    pub(crate) fn set_database(&self, factory: Arc<dyn DatabaseFactory>) {
        *self.shared.database.lock() = Some(factory);
    }

    pub fn messaging_factory(&self) -> Result<Arc<dyn MessagingFactory>, AgencyError> {
        self.shared
            .messaging
            .lock()
            .clone()
            .ok_or(AgencyError::NotWired("messaging backend"))
    }

    pub fn database_factory_opt(&self) -> Option<Arc<dyn DatabaseFactory>> {
        self.shared.database.lock().clone()
    }

    pub fn database_factory(&self) -> Result<Arc<dyn DatabaseFactory>, AgencyError> {
        self.database_factory_opt()
            .ok_or(AgencyError::NotWired("database backend"))
    }

    pub(crate) async fn messaging_connection(
        &self,
        consumer: MessageConsumer,
    ) -> Result<Arc<dyn Messaging>, AgencyError> {
        let factory = self.messaging_factory()?;
        Ok(factory.get_connection(consumer).await?)
    }

    pub(crate) async fn database_connection(&self) -> Result<Arc<dyn Database>, AgencyError> {
        let factory = self.database_factory()?;
        Ok(factory.connection().await?)
    }

    // -- connectivity ------------------------------------------------------

    pub fn is_connected(&self) -> bool {
        self.shared.connection.is_connected()
    }

    pub(crate) fn on_backend_disconnected(&self) {
        self.shared.connection.on_disconnected();
    }

    /// Recompute the combined backend state and fan the edge out.
    pub fn check_backend_state(&self) {
        let messaging_ok = self
            .shared
            .messaging
            .lock()
            .as_ref()
            .map(|m| m.is_connected())
            .unwrap_or(false);
        let database_ok = self
            .shared
            .database
            .lock()
            .as_ref()
            .map(|d| d.is_connected())
            .unwrap_or(true);

        if messaging_ok && database_ok {
            self.shared.connection.on_connected();
        } else {
            self.shared.connection.on_disconnected();
        }
    }

    fn notify_agents_disconnected(&self) {
        for medium in self.agents() {
            medium.on_disconnect();
        }
    }

    fn notify_agents_reconnected(&self) {
        for medium in self.agents() {
            medium.on_reconnect();
        }
    }

    // -- host agent --------------------------------------------------------

    pub(crate) fn set_host_options(&self, start: bool, force_restart: bool, payload: Value) {
        self.shared.start_host_agent.store(start, Ordering::SeqCst);
        self.shared
            .force_host_restart
            .store(force_restart, Ordering::SeqCst);
        *self.shared.host_payload.lock() = payload;
    }

    pub(crate) fn host_agent_enabled(&self) -> bool {
        self.shared.start_host_agent.load(Ordering::SeqCst)
    }

    /// Medium of the host agent, when one runs here.
    pub fn host_medium(&self) -> Option<AgencyAgent> {
        self.shared
            .agents
            .read()
            .iter()
            .find(|medium| medium.agent_type() == HOST_AGENT_TYPE)
            .cloned()
    }

    fn can_start_host_agent(&self, startup: bool) -> bool {
        if self.shared.startup_running.load(Ordering::SeqCst) && !startup {
            debug!("not starting host agent, the startup procedure spawns it");
            return false;
        }
        if self.is_shutting_down() {
            debug!("not starting host agent, the agency is terminating");
            return false;
        }
        if self.host_medium().is_some() {
            debug!("not starting host agent, we already have one");
            return false;
        }
        if self.shared.starting_host.load(Ordering::SeqCst) {
            debug!("not starting host agent, already starting one");
            return false;
        }
        true
    }

    /// Read the well-known host descriptor and run the host agent,
    /// retrying every few seconds on failure.
    pub(crate) fn start_host_agent(&self, startup: bool) {
        if !self.can_start_host_agent(startup) {
            return;
        }
        self.shared.starting_host.store(true, Ordering::SeqCst);
        info!("starting host agent");

        let me = self.clone();
        tokio::spawn(async move {
            let result = me.host_start_body().await;
            me.shared.starting_host.store(false, Ordering::SeqCst);
            match result {
                Ok(()) => me.flush_spawn_queue(),
                Err(err) => {
                    error!(
                        %err,
                        retry_secs = HOST_RESTART_RETRY_INTERVAL.as_secs(),
                        "host agent start failed, will retry"
                    );
                    let retry = me.clone();
                    me.shared
                        .scheduler
                        .call_later(HOST_RESTART_RETRY_INTERVAL, async move {
                            retry.start_host_agent(false);
                        });
                }
            }
        });
    }

    async fn host_start_body(&self) -> Result<(), AgencyError> {
        let database = self.database_factory()?;
        database.wait_connected().await;
        let connection = database.connection().await?;

        let doc_id = self.hostname();
        let descriptor = match connection.get(&doc_id).await {
            Ok(doc) => {
                if !self.shared.force_host_restart.load(Ordering::SeqCst) {
                    error!(
                        hostname = %doc_id,
                        "host agent descriptor found in database; this should \
                         not happen on a first run, refusing to restart \
                         without the force-host-restart option"
                    );
                    let me = self.clone();
                    tokio::spawn(async move {
                        me.full_shutdown(true).await;
                    });
                    return Err(AgencyError::HostRestartForbidden(doc_id));
                }
                debug!("host agent descriptor found in database, will restart");
                Descriptor::from_document(&doc)?
            }
            Err(DatabaseError::NotFound(_)) => {
                debug!("host agent descriptor not found, creating a brand new instance");
                let fresh = Descriptor::new(HOST_AGENT_TYPE, doc_id.clone(), HOST_AGENT_SHARD);
                let saved = connection.save(fresh.to_document()?).await?;
                Descriptor::from_document(&saved)?
            }
            Err(err) => return Err(err.into()),
        };

        let payload = self.shared.host_payload.lock().clone();
        self.start_agent(descriptor, payload).await?;
        Ok(())
    }

    // -- spawning queue ----------------------------------------------------

    /// Ask the host agent to spawn an agent; resolves with the new agent's
    /// id once it is running.
    pub fn spawn_agent(
        &self,
        target: SpawnTarget,
        payload: Value,
    ) -> impl Future<Output = Result<String, AgencyError>> + Send + 'static {
        let (done, done_rx) = oneshot::channel();
        self.shared.to_spawn.lock().push_back(SpawnRequest {
            target,
            payload,
            done,
        });
        self.flush_spawn_queue();
        async move {
            done_rx
                .await
                .unwrap_or(Err(AgencyError::Terminated))
        }
    }

    pub(crate) fn flush_spawn_queue(&self) {
        let me = self.clone();
        tokio::spawn(async move {
            me.flush_spawn_body().await;
        });
    }

    async fn flush_spawn_body(&self) {
        let Ok(_permit) = self.shared.spawn_sem.acquire().await else {
            return;
        };
        let Some(host) = self.host_medium() else {
            debug!("host agent not ready yet, agents will be spawned later");
            return;
        };
        host.wait_for_state(AgencyAgentState::Ready).await;

        loop {
            let request = self.shared.to_spawn.lock().pop_front();
            let Some(request) = request else { break };
            let result = self.spawn_one(request.target, request.payload, &host).await;
            if let Err(err) = &result {
                warn!(%err, "spawn request failed");
            }
            let _ = request.done.send(result);
        }
    }

    async fn spawn_one(
        &self,
        target: SpawnTarget,
        payload: Value,
        host: &AgencyAgent,
    ) -> Result<String, AgencyError> {
        let descriptor = match target {
            SpawnTarget::Descriptor(descriptor) => *descriptor,
            SpawnTarget::Type(agent_type) => self
                .shared
                .descriptor_registry
                .materialize(&agent_type)
                .ok_or(AgencyError::UnknownAgentType(agent_type))?,
        };

        let connection = self.database_connection().await?;
        let saved = connection.save(descriptor.to_document()?).await?;
        let descriptor = Descriptor::from_document(&saved)?;

        let medium = host.start_agent(descriptor, payload).await?;
        Ok(medium.agent_id())
    }

    pub(crate) fn take_upgrade_cmd(&self) -> Option<String> {
        self.shared.upgrade_cmd.lock().take()
    }
}

impl Default for Agency {
    fn default() -> Self {
        Self::new()
    }
}

fn detect_hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|hostname| !hostname.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
