use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lanshare::{Cli, Server, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lanshare=info")),
        )
        .with_target(false)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        os = std::env::consts::OS,
        arch = std::env::consts::ARCH,
        "lanshare starting"
    );

    let settings = Settings::load(&cli)?;
    let server = Server::bind(settings).await?;
    info!(addr = %server.local_addr()?, "server listening");

    server.run(shutdown_signal()).await
}

/// Resolves on the first Ctrl+C; a second one exits immediately.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for Ctrl+C, running until killed");
        std::future::pending::<()>().await;
    }
    info!("gracefully exiting, press Ctrl+C again to force exit");

    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("forced exit");
            std::process::exit(1);
        }
    });
}
