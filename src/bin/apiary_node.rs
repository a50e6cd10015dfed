// bin/apiary_node.rs - Agency Node Binary
//
// Boots one agency with the in-process reference backends, promotes the
// host agent when asked to, and runs until a shutdown signal arrives.
// SIGUSR1 orders a full gentle shutdown with process stop; SIGTERM a hard
// one.

use std::path::PathBuf;
use std::sync::Arc;
use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use apiary::config::EnvConfig;
use apiary::journal::{FileJournal, JournalTarget, MemoryJournal};
use apiary::observability::{describe_metrics, init_tracing, TracingConfig};
use apiary::{Agency, MemoryDatabase, MemoryMessaging, StartupConfig};

/// Agency node
#[derive(Parser, Debug)]
#[command(name = "apiary-node")]
#[command(version)]
#[command(about = "Distributed autonomous-agent agency node", long_about = None)]
struct Args {
    /// Promote the host agent on this machine
    #[arg(long)]
    host_agent: bool,

    /// Resume an existing host-agent descriptor
    #[arg(long)]
    force_host_restart: bool,

    /// Journal file; in-memory when omitted
    #[arg(short, long)]
    journal: Option<PathBuf>,

    /// Base log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit JSON log lines
    #[arg(long)]
    log_json: bool,

    /// Trace protocol conversations across the engine and the glue
    #[arg(long)]
    trace_conversations: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut tracing_config = if args.log_json {
        TracingConfig::production()
    } else if args.trace_conversations {
        TracingConfig::tracing_conversations()
    } else {
        TracingConfig::default()
    };
    tracing_config.base = args.log_level.clone();
    init_tracing(tracing_config);
    describe_metrics();

    let env = EnvConfig::from_env().context("reading FEAT_* environment")?;
    let force_host_restart =
        args.force_host_restart || env.agency.force_host_restart.unwrap_or(false);
    let journal_path = args
        .journal
        .or_else(|| env.agency.journal.clone().map(PathBuf::from));

    let journal: Arc<dyn JournalTarget> = match &journal_path {
        Some(path) => Arc::new(FileJournal::new(path.clone())),
        None => Arc::new(MemoryJournal::new()),
    };
    info!(?journal_path, host_agent = args.host_agent, "agency node booting");

    // The reference backends live in-process; real AMQP/CouchDB backends
    // attach through the same factory traits.
    let messaging = MemoryMessaging::new();
    let database = MemoryDatabase::new();

    let agency = Agency::new();
    agency
        .initiate(StartupConfig {
            messaging: Some(Arc::new(messaging)),
            database: Some(Arc::new(database)),
            journal: Some(journal),
            start_host_agent: args.host_agent,
            force_host_restart,
            host_payload: serde_json::Value::Null,
        })
        .await
        .context("agency startup failed")?;
    info!(agency_id = %agency.agency_id(), hostname = %agency.hostname(), "agency running");

    let mut sigusr1 = signal(SignalKind::user_defined1()).context("installing SIGUSR1")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT")?;

    let outcome = tokio::select! {
        _ = sigusr1.recv() => {
            info!("SIGUSR1 received, full cluster shutdown");
            agency.full_shutdown(true).await
        }
        _ = sigterm.recv() => {
            warn!("SIGTERM received, hard shutdown");
            agency.on_killed().await
        }
        _ = sigint.recv() => {
            info!("interrupted, gentle shutdown");
            agency.shutdown().await
        }
    };

    if let Some(err) = outcome.upgrade_error {
        bail!("upgrade command failed: {err}");
    }
    info!(stop_process = outcome.stop_process, "agency stopped");
    Ok(())
}
