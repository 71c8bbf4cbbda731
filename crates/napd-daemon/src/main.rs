//! napd - Network Access Policy Daemon binary.
//!
//! Thin bootstrap: option parsing, log setup, configuration, construction
//! of the engine and service, and signal handling. The platform bus
//! integration plugs in through [`napd_daemon::bus::PolicyBus`]; until it
//! is wired, the daemon runs with the offline transport, which still
//! validates the policy files at startup and serves the explicit resync
//! trigger (SIGUSR2).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use napd_core::config::DaemonConfig;
use napd_daemon::bus::OfflineBus;
use napd_daemon::orchestrator::PolicyEngine;
use napd_daemon::service::PolicyService;
use napd_daemon::storage::PolicyStorage;
use napd_daemon::store::PolicyStore;
use napd_daemon::sync::HttpPolicySource;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "napd", about = "Network access policy daemon")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Send debug output to the terminal.
    #[arg(short, long)]
    debug: bool,
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    info!("starting network access policy daemon");

    let config = match &cli.config {
        Some(path) => DaemonConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => DaemonConfig::default(),
    };

    let storage = PolicyStorage::new(&config.storage);
    storage
        .ensure_policy_dir()
        .context("creating policy directory")?;

    // Missing default or self policy is fatal: the daemon cannot answer
    // anything without its fallbacks.
    let store = PolicyStore::load(&storage).context("loading policy files")?;
    info!(policies = store.len(), "policies loaded");

    let engine = Arc::new(PolicyEngine::new(
        Arc::new(OfflineBus::new()),
        Arc::new(HttpPolicySource::new(&config.sync)),
        Arc::new(napd_daemon::identity::SystemAccounts),
        storage,
        config.sync.staleness(),
        store,
    ));
    let service = PolicyService::new(engine);

    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    let mut sigusr2 = signal(SignalKind::user_defined2()).context("installing SIGUSR2 handler")?;

    info!("entering main loop");
    loop {
        tokio::select! {
            _ = sigint.recv() => break,
            _ = sigterm.recv() => break,
            _ = sighup.recv() => break,
            _ = sigusr2.recv() => {
                info!("received SIGUSR2, policy update from server triggered");
                service.trigger_resync().await;
            }
        }
    }

    info!("exiting network access policy daemon");
    Ok(())
}
