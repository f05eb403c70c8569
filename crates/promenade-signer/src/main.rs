//! Signer daemon entry point.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use promenade_common::{Relay, WsPool};
use promenade_signer::{run_acceptor, run_signer, AcceptorConfig, ShardStore};

#[derive(Parser)]
#[command(name = "promenade-signer", about = "FROST signer daemon", version)]
struct Cli {
    /// Directory holding the signer's identity and shards
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Relay URLs to accept new shards on
    #[arg(long = "accept-relay")]
    accept_relays: Vec<String>,

    /// Minimum committed proof-of-work on shard events
    #[arg(long, default_value_t = 20)]
    min_pow: u32,

    /// Stop accepting after this many new key groups
    #[arg(long)]
    accept_max: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if cli.min_pow > 256 {
        anyhow::bail!("--min-pow must be between 0 and 256");
    }

    let dir = match cli.dir {
        Some(dir) => dir,
        None => {
            let home = std::env::var("HOME").map_err(|_| {
                anyhow::anyhow!("no --dir given and $HOME is unset")
            })?;
            PathBuf::from(home).join(".config/promenade-signer")
        }
    };

    let store = Arc::new(ShardStore::open(dir)?);
    tracing::info!(pubkey = %store.keys().public_key(), "running as");

    let relay: Arc<dyn Relay> = Arc::new(WsPool::new(Some(store.keys())));
    let (restart_tx, restart_rx) = watch::channel(0u64);
    let mut keep_restart = Some(restart_tx);

    if !cli.accept_relays.is_empty() {
        let restart_tx = keep_restart.take().expect("restart sender set above");
        let config = AcceptorConfig {
            accept_relays: cli.accept_relays,
            min_pow: cli.min_pow,
            accept_max: cli.accept_max,
            ..AcceptorConfig::default()
        };
        let relay = relay.clone();
        let store = store.clone();
        tokio::spawn(async move {
            if let Err(e) = run_acceptor(relay, store, config, restart_tx).await {
                tracing::error!(error = %e, "acceptor stopped");
            }
        });
    }

    let _keep_restart = keep_restart;
    run_signer(relay, store, restart_rx).await?;
    Ok(())
}
