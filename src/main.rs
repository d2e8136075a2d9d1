//! landmark-retrieval - Entry point for the retrieval command-line tool

use clap::Parser;
use landmark_retrieval::app::{App, Cli};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins over --log-level
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("Starting landmark-retrieval");

    if let Err(e) = App::new(cli).run().await {
        tracing::error!("Application error: {:#}", e);
        std::process::exit(1);
    }
}
