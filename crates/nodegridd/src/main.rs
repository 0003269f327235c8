//! nodegridd — the nodegrid daemon.
//!
//! Single binary that assembles the capacity controllers:
//! - Node registry (redb)
//! - Capacity backend (fake cloud or fixed inventory)
//! - Leader election over a registry lease
//! - Allocation, consolidation and termination controllers
//! - REST API
//!
//! Only the lease holder reconciles. Losing the lease stops the process so
//! a restarted replica rejoins the election from a clean slate.
//!
//! # Usage
//!
//! ```text
//! nodegridd run --config nodegrid.toml --data-dir /var/lib/nodegrid --port 8080
//! nodegridd check-config --config nodegrid.toml
//! ```

mod controllers;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use nodegrid_backend::CapacityBackend;
use nodegrid_core::NodegridConfig;
use nodegrid_runtime::{Clock, ControllerContext, LeaderElector};
use nodegrid_state::NodeRegistry;

use crate::controllers::{Queues, spawn_controllers};

const DEFAULT_LOG_FILTER: &str = "info,nodegridd=debug,nodegrid=debug";

#[derive(Parser)]
#[command(name = "nodegridd", about = "nodegrid cluster capacity daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controllers and the API.
    Run {
        /// Configuration file.
        #[arg(long)]
        config: PathBuf,

        /// Data directory for the node registry.
        #[arg(long, default_value = "/var/lib/nodegrid", conflicts_with = "in_memory")]
        data_dir: PathBuf,

        /// Keep the registry in memory (nothing survives a restart).
        #[arg(long)]
        in_memory: bool,

        /// Port to listen on.
        #[arg(long, default_value = "8080")]
        port: u16,

        #[arg(long, value_enum, default_value_t = LogFormat::Text)]
        log_format: LogFormat,

        /// Leader election identity. Defaults to `nodegridd-<pid>`.
        #[arg(long)]
        identity: Option<String>,
    },
    /// Parse a configuration file and print the effective settings.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            in_memory,
            port,
            log_format,
            identity,
        } => {
            init_tracing(log_format);
            let registry_path = (!in_memory).then(|| data_dir.join("nodegrid.redb"));
            let identity = identity.unwrap_or_else(|| format!("nodegridd-{}", std::process::id()));
            run(&config, registry_path, port, &identity).await
        }
        Command::CheckConfig { config } => {
            let config = load_config(&config)?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

fn load_config(path: &Path) -> anyhow::Result<NodegridConfig> {
    let config = NodegridConfig::from_file(path)
        .with_context(|| format!("loading {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

/// Write configured provisioners and budgets into the registry. Objects
/// created through the API are left alone.
fn seed_registry(registry: &NodeRegistry, config: &NodegridConfig) -> anyhow::Result<()> {
    for provisioner in &config.provisioners {
        registry.put_provisioner(provisioner)?;
    }
    for budget in &config.disruption_budgets {
        registry.put_budget(budget)?;
    }
    info!(
        provisioners = config.provisioners.len(),
        budgets = config.disruption_budgets.len(),
        "registry seeded"
    );
    Ok(())
}

async fn run(
    config_path: &Path,
    registry_path: Option<PathBuf>,
    port: u16,
    identity: &str,
) -> anyhow::Result<()> {
    info!(%identity, "nodegrid daemon starting");

    // ── Initialize subsystems ──────────────────────────────────

    let config = load_config(config_path)?;

    let registry = match &registry_path {
        Some(path) => {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            NodeRegistry::open(path)?
        }
        None => NodeRegistry::open_in_memory()?,
    };
    info!(path = ?registry_path, "node registry opened");
    seed_registry(&registry, &config)?;

    let backend = nodegrid_backend::from_config(&config.backend);
    info!(backend = backend.name(), "capacity backend selected");

    let clock = Clock::system();
    let ctx = ControllerContext::new(registry.clone(), backend, config, clock.clone());

    // ── Leader election ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let (leading_tx, mut leading_rx) = watch::channel(false);

    let elector = LeaderElector::new(registry.clone(), &ctx.config.leader, identity, clock.clone());
    let elector_handle = tokio::spawn(elector.run(leading_tx, shutdown_rx.clone()));

    info!(lease = %ctx.config.leader.lease_name, "waiting for leadership");
    let leading = tokio::select! {
        acquired = wait_for_leadership(&mut leading_rx) => acquired,
        _ = tokio::signal::ctrl_c() => false,
    };
    if !leading {
        info!("stopped before acquiring leadership");
        let _ = shutdown_tx.send(true);
        let _ = elector_handle.await;
        return Ok(());
    }

    // ── Start controllers ──────────────────────────────────────

    let queues = Queues::new(&ctx);
    let handles = spawn_controllers(&ctx, &queues, shutdown_rx.clone());

    // ── Start API server ───────────────────────────────────────

    let api_state = nodegrid_api::ApiState::new(registry, clock)
        .with_queues(queues.allocation.clone(), queues.termination.clone());
    let router = nodegrid_api::build_router(api_state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C or lease loss.
    let server_shutdown = Arc::clone(&shutdown_tx);
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "failed to listen for shutdown signal");
                }
                info!("shutdown signal received");
            }
            _ = leadership_lost(leading_rx) => {
                warn!("leadership lost, shutting down");
            }
        }
        let _ = server_shutdown.send(true);
    });

    let served = server.await;
    let _ = shutdown_tx.send(true);

    // Wait for background tasks.
    for handle in handles {
        let _ = handle.await;
    }
    let _ = elector_handle.await;

    served?;
    info!("nodegrid daemon stopped");
    Ok(())
}

/// Resolves to true once this replica leads, or false if the elector stopped.
async fn wait_for_leadership(leading: &mut watch::Receiver<bool>) -> bool {
    loop {
        if *leading.borrow_and_update() {
            return true;
        }
        if leading.changed().await.is_err() {
            return false;
        }
    }
}

async fn leadership_lost(mut leading: watch::Receiver<bool>) {
    loop {
        if leading.changed().await.is_err() || !*leading.borrow() {
            return;
        }
    }
}
