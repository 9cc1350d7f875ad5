//!
//! Cadence Server - HTTP admission and background task execution
//!
//! This module exports all the components of the Cadence server.

/// API module
pub mod api;

/// Configuration module
pub mod config;

/// Error module
pub mod error;

/// Built-in task handlers
pub mod handlers;

/// Server module
pub mod server;

// Re-export key types
pub use config::{LogFormat, ServerConfig, StoreBackend};
pub use error::{ServerError, ServerResult};
pub use server::CadenceServer;

use cadence_core::tasks::HandlerRegistry;

/// Build the server from `config` and run it until shutdown
pub async fn run(config: ServerConfig, registry: HandlerRegistry) -> ServerResult<()> {
    let server = CadenceServer::from_config(config, registry)?;
    server.run().await
}

/// Initialize logging
///
/// `RUST_LOG` wins over the configured level. Calling this twice is harmless.
pub fn init_logging(config: &ServerConfig) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let result = match config.log_format {
        LogFormat::Json => fmt().json().with_env_filter(filter).with_target(true).try_init(),
        LogFormat::Pretty => fmt().with_env_filter(filter).with_target(true).try_init(),
    };

    if result.is_err() {
        tracing::debug!("Logging was already initialized");
    }
}
