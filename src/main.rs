//! device-mock: a stand-in for a network-attached device
//!
//! Lets a tester drive a companion app by hand:
//! - Lines typed on the console are queued as the current device message
//! - The app polls `GET /messages` and answers via `POST /response`
//! - Apps find the device with a UDP broadcast probe on port 12345
//!
//! Configuration via CLI arguments or TOML file.

mod config;
mod console;
mod discovery;
mod error;
mod http;
mod server;
mod slot;

use config::Config;
use console::Console;
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging; stdout belongs to the operator console
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        discovery_port = config.discovery_port,
        "Starting device mock"
    );

    // Single-threaded event loop; the console reader gets its own OS thread
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::new(config, Console::stdout()).bind().await?;

    let input = std::io::BufReader::new(std::io::stdin());
    server
        .run(input, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    Ok(())
}
