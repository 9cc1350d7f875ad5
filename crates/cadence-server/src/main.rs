use anyhow::{Context, Result};
use cadence_server::config::ServerConfig;
use cadence_server::handlers::builtin_registry;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration from the environment and optional config file
    let config = ServerConfig::load().context("Failed to load configuration")?;

    cadence_server::init_logging(&config);

    let registry = builtin_registry();
    tracing::info!("Registered task handlers: {:?}", registry.names());

    cadence_server::run(config, registry).await.context("Server error")?;

    Ok(())
}
