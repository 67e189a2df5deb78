//! Headless sync node.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use the_small_sync_lib::config::SETTINGS_CATEGORY;
use the_small_sync_lib::storage::{self, CredentialUpdate};
use the_small_sync_lib::{db, logging, NodeArgs, NodeConfig, SyncNode, LONG_VERSION};

#[derive(Parser, Debug)]
#[command(name = "the-small-sync", version, long_version = LONG_VERSION, about = "Order orchestration and sync node")]
struct Cli {
    #[command(flatten)]
    node: NodeArgs,

    /// One JSON object per console log line.
    #[arg(long, env = "SMALL_SYNC_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the node until Ctrl-C (default).
    Run {
        /// Read inbound orders as NDJSON from stdin.
        #[arg(long)]
        stdin_orders: bool,
    },
    /// Store tenant id, API key and URLs from the node flags in the OS keyring.
    Provision,
    /// Delete stored credentials and node settings.
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let data_dir = cli.node.resolved_data_dir();
    let _log_guard = logging::init(&logging::log_dir(&data_dir), cli.log_json);
    info!("Starting The Small Sync v{LONG_VERSION}");

    match cli.command {
        None => run(&cli.node, false).await,
        Some(Command::Run { stdin_orders }) => run(&cli.node, stdin_orders).await,
        Some(Command::Provision) => provision(&cli.node),
        Some(Command::Reset) => reset(&cli.node),
    }
}

async fn run(args: &NodeArgs, stdin_orders: bool) -> Result<()> {
    let environment = args.environment();
    let db = if environment.has_local_persistence {
        db::init(&args.resolved_data_dir()).context("open database")?
    } else {
        db::open_in_memory().context("open in-memory database")?
    };
    let db = Arc::new(db);

    let config = {
        let conn = db.lock()?;
        NodeConfig::resolve(args, &conn, storage::get_credential)?
    };
    let node = Arc::new(SyncNode::new(config, db)?);
    node.start().await?;

    if stdin_orders {
        tokio::spawn(ingest_stdin(node.clone()));
    }

    shutdown_signal().await;
    node.shutdown().await;
    Ok(())
}

async fn ingest_stdin(node: Arc<SyncNode>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => {
                if let Err(e) = node.ingest_json(&line) {
                    warn!(error = %e, "Inbound order rejected");
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Reading stdin failed");
                break;
            }
        }
    }
    info!("Stdin order feed closed");
}

fn provision(args: &NodeArgs) -> Result<()> {
    let Some(api_key) = args.api_key.clone() else {
        bail!("--api-key is required to provision");
    };
    let update = CredentialUpdate {
        tenant_id: args.tenant_id.clone(),
        api_key,
        admin_url: args.admin_url.clone(),
        coordinator_url: args.coordinator_url.clone(),
    };
    let resolved = storage::store_credentials(&update).map_err(anyhow::Error::msg)?;
    info!(tenant_id = %resolved.tenant_id, "Node provisioned");
    Ok(())
}

fn reset(args: &NodeArgs) -> Result<()> {
    storage::factory_reset().map_err(anyhow::Error::msg)?;
    if args.environment().has_local_persistence {
        let db = db::init(&args.resolved_data_dir()).context("open database")?;
        let conn = db.lock()?;
        db::delete_all_settings(&conn, SETTINGS_CATEGORY)?;
    }
    info!("Node reset");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Ctrl-C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
