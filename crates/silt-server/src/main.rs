//! `siltd` entry point.

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use silt_server::{shutdown_signal, Args, Node};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let node = match Node::build(args).await {
        Ok(node) => node,
        Err(err) => {
            error!(error = %err, "startup failed");
            std::process::exit(1);
        }
    };

    let handle = node.shutdown_handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        handle.shutdown();
    });

    if let Err(err) = node.run().await {
        error!(error = %err, "node failed");
        std::process::exit(1);
    }
}
