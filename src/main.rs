use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use trellis::{Address, FlatRouter, MemoryBlocks, Overlay, Router, Synchronizer, TreeRouter};

#[derive(Parser, Debug)]
#[command(name = "trellis")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Overlay endpoint of this node.
    #[arg(short, long, default_value = "http://127.0.0.1:2000")]
    bind: Address,

    /// Known peers of the overlay.
    #[arg(short, long = "peer", value_name = "ADDR")]
    peers: Vec<Address>,

    /// Routing tree height; 0 selects the flat strategy.
    #[arg(long, default_value = "0")]
    height: u32,

    /// Number of seed blocks in the in-memory chain.
    #[arg(long, default_value = "0")]
    blocks: u64,

    /// Orchestrate a synchronization round against the peers and exit.
    #[arg(long)]
    sync: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logging is opt-in through LLVL; unset keeps the node silent.
    let filter = EnvFilter::try_from_env("LLVL").unwrap_or_else(|_| EnvFilter::new("off"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let router: Arc<dyn Router> = if args.height > 0 {
        Arc::new(TreeRouter::new(args.height))
    } else {
        Arc::new(FlatRouter)
    };

    let overlay = Overlay::bind(args.bind.clone(), router).await?;
    info!(addr = %args.bind, "node up");

    let chain = Arc::new(MemoryBlocks::with_count(args.blocks));
    let synchronizer = Synchronizer::new(&overlay, chain.clone(), chain)?;

    if args.sync {
        if args.peers.is_empty() {
            anyhow::bail!("--sync requires at least one --peer");
        }

        let mut events = synchronizer.sync(args.peers.clone());
        while events.changed().await.is_ok() {
            let event = events.borrow().clone();
            info!(
                soft = event.soft,
                hard = event.hard,
                errors = event.errors.len(),
                "synchronization progress"
            );

            if !event.errors.is_empty() {
                for error in &event.errors {
                    warn!(error = %error, "player failed to synchronize");
                }
            }
        }

        info!("synchronization round finished");
        overlay.close().await;
        return Ok(());
    }

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal, exiting gracefully");
    overlay.close().await;

    Ok(())
}
