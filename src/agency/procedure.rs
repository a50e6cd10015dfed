// agency/procedure.rs - Staged Startup and Shutdown
//
//! The agency boots and winds down through named stages run in order.
//! Startup aborts on the first failing stage; shutdown isolates each
//! stage's failure and always walks the full list.

use std::sync::Arc;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::database::DatabaseFactory;
use crate::journal::JournalTarget;
use crate::messaging::{MemoryMessaging, MessagingFactory};
use super::{Agency, AgencyError};

/// Startup stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupStage {
    Initiated,
    Configure,
    Messaging,
    Database,
    Journaler,
    Private,
    HostAgent,
    Finish,
}

impl StartupStage {
    pub const ALL: [StartupStage; 8] = [
        StartupStage::Initiated,
        StartupStage::Configure,
        StartupStage::Messaging,
        StartupStage::Database,
        StartupStage::Journaler,
        StartupStage::Private,
        StartupStage::HostAgent,
        StartupStage::Finish,
    ];
}

/// Shutdown stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStage {
    Initiated,
    Slaves,
    Agents,
    Internals,
    Process,
}

impl ShutdownStage {
    pub const ALL: [ShutdownStage; 5] = [
        ShutdownStage::Initiated,
        ShutdownStage::Slaves,
        ShutdownStage::Agents,
        ShutdownStage::Internals,
        ShutdownStage::Process,
    ];
}

/// What the agency is booted with.
#[derive(Clone, Default)]
pub struct StartupConfig {
    /// Messaging backend; an in-process hub is used when absent.
    pub messaging: Option<Arc<dyn MessagingFactory>>,

    pub database: Option<Arc<dyn DatabaseFactory>>,

    /// Journal write target to attach.
    pub journal: Option<Arc<dyn JournalTarget>>,

    /// Promote a host agent on this machine.
    pub start_host_agent: bool,

    /// Allow resuming an existing host-agent descriptor.
    pub force_host_restart: bool,

    /// Payload handed to the host agent's initiation.
    pub host_payload: Value,
}

/// How to shut down.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownOptions {
    pub gentle: bool,
    pub stop_process: bool,
}

/// What the shutdown concluded.
#[derive(Debug, Clone, Default)]
pub struct ShutdownOutcome {
    pub stop_process: bool,
    pub upgrade_error: Option<String>,
}

pub(super) async fn run_startup(
    agency: &Agency,
    config: StartupConfig,
) -> Result<(), AgencyError> {
    for stage in StartupStage::ALL {
        debug!(?stage, "startup stage");
        match stage {
            StartupStage::Initiated => {
                info!(agency_id = %agency.agency_id(), "starting agency");
            }
            StartupStage::Configure => {
                let messaging = config
                    .messaging
                    .clone()
                    .unwrap_or_else(|| Arc::new(MemoryMessaging::new()));
                agency.set_messaging(messaging);
                if let Some(database) = config.database.clone() {
                    agency.set_database(database);
                }
                agency.set_host_options(
                    config.start_host_agent,
                    config.force_host_restart,
                    config.host_payload.clone(),
                );
            }
            StartupStage::Messaging => {
                let factory = agency.messaging_factory()?;
                let on_down = agency.clone();
                factory.add_disconnected_callback(Arc::new(move || {
                    on_down.on_backend_disconnected();
                }));
                let on_up = agency.clone();
                factory.add_reconnected_callback(Arc::new(move || {
                    on_up.check_backend_state();
                }));
            }
            StartupStage::Database => {
                if let Some(factory) = agency.database_factory_opt() {
                    let on_down = agency.clone();
                    factory.add_disconnected_callback(Arc::new(move || {
                        on_down.on_backend_disconnected();
                    }));
                    let on_up = agency.clone();
                    factory.add_reconnected_callback(Arc::new(move || {
                        on_up.check_backend_state();
                    }));
                }
            }
            StartupStage::Journaler => {
                if let Some(target) = config.journal.clone() {
                    agency.attach_journal(target);
                }
            }
            StartupStage::Private => {
                agency.check_backend_state();
            }
            StartupStage::HostAgent => {
                if agency.host_agent_enabled() {
                    agency.start_host_agent(true);
                }
            }
            StartupStage::Finish => {}
        }
    }
    Ok(())
}

pub(super) async fn run_shutdown(agency: &Agency, options: ShutdownOptions) -> ShutdownOutcome {
    let mut outcome = ShutdownOutcome {
        stop_process: options.stop_process,
        upgrade_error: None,
    };

    for stage in ShutdownStage::ALL {
        debug!(?stage, "shutdown stage");
        match stage {
            ShutdownStage::Initiated => {
                info!(
                    agency_id = %agency.agency_id(),
                    gentle = options.gentle,
                    "beginning agency shutdown"
                );
            }
            ShutdownStage::Slaves => {
                debug!("no slave agencies attached to this process");
            }
            ShutdownStage::Agents => {
                let agents = agency.agents();
                let terminations: Vec<_> = agents
                    .iter()
                    .map(|medium| {
                        if options.gentle {
                            medium.terminate()
                        } else {
                            medium.on_killed()
                        }
                    })
                    .collect();
                futures::future::join_all(terminations).await;
            }
            ShutdownStage::Internals => {
                if let Ok(messaging) = agency.messaging_factory() {
                    messaging.disconnect().await;
                }
                if let Some(database) = agency.database_factory_opt() {
                    database.disconnect().await;
                }
                if let Some(journaler) = agency.journaler() {
                    journaler.log("agency", "info", "agency shut down");
                    journaler.flush().await;
                }
            }
            ShutdownStage::Process => {
                if let Some(cmd) = agency.take_upgrade_cmd() {
                    info!(%cmd, "spawning upgrade command");
                    match tokio::process::Command::new("sh").arg("-c").arg(&cmd).spawn() {
                        Ok(_child) => {}
                        Err(err) => {
                            error!(%err, "upgrade command failed to spawn");
                            outcome.upgrade_error = Some(err.to_string());
                        }
                    }
                }
            }
        }
    }

    outcome
}
