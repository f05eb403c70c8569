//! Coordinator daemon entry point.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use promenade_coordinator::{ratelimit, server, Coordinator, Settings, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings = Settings::from_env()?;
    let store = Store::open(settings.db_path.clone())?;
    let coordinator = Coordinator::new(settings.secret_key.clone(), settings.url(), store);

    tokio::spawn(ratelimit::run_refill(Arc::clone(&coordinator)));

    server::serve(coordinator, settings.port).await
}
