//! Dealer command line: `promenade create --sec ... --coordinator ...
//! --signer ... --threshold n` prints a bunker URL on success.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use promenade_cli::{create, CreateOptions};
use promenade_common::{Relay, WsPool};

#[derive(Parser)]
#[command(name = "promenade", about = "Promenade account tools", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Split a secret key among signers and register with a coordinator
    Create {
        /// Secret key to be split, hex
        #[arg(long)]
        sec: String,

        /// Relay chosen to act as coordinator
        #[arg(long)]
        coordinator: String,

        /// Permanent pubkeys of the chosen signers (repeatable)
        #[arg(long = "signer")]
        signers: Vec<String>,

        /// Minimum number of signers required per signature
        #[arg(long)]
        threshold: u16,
    },
}

#[tokio::main]
async fn main() {
    // progress goes to stderr; stdout carries only the result
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Create {
            sec,
            coordinator,
            signers,
            threshold,
        } => {
            let keys = promenade_common::Keys::parse(&sec).ok();
            let relay: Arc<dyn Relay> = Arc::new(WsPool::new(keys));
            let options = CreateOptions::new(&sec, &coordinator, signers, threshold);
            match create(relay, options).await {
                Ok(url) => println!("{url}"),
                Err(e) => {
                    eprintln!("error: {e}");
                    std::process::exit(1);
                }
            }
        }
    }
}
