//! Brook ledger node binary.
//!
//! Opens the ledger under the data directory, ingests the built-in genesis
//! block on first start, optionally rolls back to the last checkpoint and
//! then runs the node event loop until Ctrl+C.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use brook_node_lib::{Node, NodeConfig, NullBroadcaster, StandardRules};

#[derive(Parser, Debug)]
#[command(name = "brook-node", version, about = "Brook ledger node with SQLite storage")]
struct Args {
    /// TOML config file, layered under BROOK_* environment variables
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory for the ledger database, checkpoints and node state
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format ("text" or "json")
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Hex hash of the genesis block to accept
    #[arg(long)]
    genesis_hash: Option<String>,

    /// Roll the ledger back to the last complete checkpoint before starting
    #[arg(long)]
    from_checkpoint: bool,
}

impl Args {
    /// Command line flags win over the config file and environment.
    fn apply(&self, config: &mut NodeConfig) {
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if let Some(hash) = &self.genesis_hash {
            config.genesis_hash = Some(hash.clone());
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let mut config = match NodeConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            process::exit(1);
        }
    };
    args.apply(&mut config);

    init_logging(&config.log_level, &args.log_format);

    info!("Brook Node v{}", env!("CARGO_PKG_VERSION"));
    info!("data_dir: {:?}", config.data_dir);

    let node = match Node::open(config, Arc::new(StandardRules::default()), Arc::new(NullBroadcaster)).await {
        Ok(node) => node,
        Err(e) => {
            error!("failed to open node: {}", e);
            process::exit(1);
        }
    };

    if args.from_checkpoint {
        match node.load_checkpoint().await {
            Ok(Some(slot)) => info!(slot, "restored checkpoint"),
            Ok(None) => warn!("no complete checkpoint to restore"),
            Err(e) => {
                error!("failed to restore checkpoint: {}", e);
                process::exit(1);
            }
        }
    }

    match node.ledger().master_branch(0).await {
        Ok(master) => info!(
            branch_id = master.id,
            length = master.length,
            tip = %master.last_block_hash.short(),
            "master branch"
        ),
        Err(e) => warn!("could not read master branch: {}", e),
    }

    info!("Brook node running (Ctrl+C to stop)");

    let runner = {
        let node = Arc::clone(&node);
        tokio::spawn(async move { node.run().await })
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("failed to listen for Ctrl+C: {}", e);
            }
            info!("received Ctrl+C, shutting down...");
        }
        _ = node.fatal().halted() => {}
    }

    node.termination().request();
    node.termination().drained().await;

    let code = match runner.await {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            error!("node stopped: {}", e);
            1
        }
        Err(e) => {
            error!("node task panicked: {}", e);
            1
        }
    };
    info!("Brook node shutdown complete");
    process::exit(code);
}

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` overrides `level`. `format = "json"` selects structured JSON
/// lines, anything else human-readable text.
fn init_logging(level: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if format == "json" {
        tracing_subscriber::registry().with(filter).with(fmt::layer().json()).init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
