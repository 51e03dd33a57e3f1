use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use nosql_session::{AttributeCodec, IdRegistry, NoopListener, SessionManager, SessionPurger};
use nosql_session_core::adapters::InMemoryDocumentStore;
use nosql_session_core::config::get_default_config_file;
use nosql_session_core::{DocumentStoreRef, SessionConfig};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "session-node", about = "Session store node: scavenger, purger and context manager")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Context path served by this node
    #[arg(long)]
    context_path: Option<String>,

    /// Virtual host for the context (repeatable)
    #[arg(long = "vhost")]
    virtual_hosts: Vec<String>,

    /// Worker name appended to node-local session ids
    #[arg(short, long)]
    worker: Option<String>,

    /// Run the purger on this node
    #[arg(long)]
    purge: bool,

    /// Log filter, overridden by RUST_LOG
    #[arg(long)]
    log_level: Option<String>,
}

fn load_config(args: &Args) -> anyhow::Result<SessionConfig> {
    let path = match &args.config {
        Some(path) => path.clone(),
        None => get_default_config_file("session-node")?,
    };
    let mut config = SessionConfig::load_from_file(&path)
        .map_err(|e| anyhow::anyhow!("Configuration error in {}: {}", path.display(), e))?;

    if let Some(context_path) = &args.context_path {
        config.context.context_path = context_path.clone();
    }
    if !args.virtual_hosts.is_empty() {
        config.context.virtual_hosts = args.virtual_hosts.clone();
    }
    if args.worker.is_some() {
        config.session.worker_name = args.worker.clone();
    }
    if args.purge {
        config.purger.enabled = true;
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting session node");

    let documents: DocumentStoreRef = Arc::new(InMemoryDocumentStore::new());

    let worker_name = config.session.worker_name.clone();
    let registry = if config.scavenger.enabled {
        let registry =
            IdRegistry::from_config(documents.clone(), worker_name, &config.scavenger).await?;
        registry.start()?;
        registry
    } else {
        info!("Scavenger disabled");
        IdRegistry::new(documents.clone(), worker_name).await?
    };

    let manager = SessionManager::new(
        documents.clone(),
        registry.clone(),
        &config,
        Arc::new(AttributeCodec::new()),
        Arc::new(NoopListener),
    );
    manager.start()?;
    info!(context = %manager.context_id(), "Serving session context");

    let purger = if config.purger.enabled {
        let purger = SessionPurger::from_config(documents.clone(), &config.purger).await?;
        purger.start()?;
        Some(purger)
    } else {
        None
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutting down session node");

    manager.stop().await;
    registry.stop().await;
    if let Some(purger) = purger {
        purger.stop().await;
    }

    info!("Session node stopped");
    Ok(())
}
