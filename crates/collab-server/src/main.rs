//! # Collab Server
//!
//! Session broker for collaborative project editing.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! collabd
//!
//! # Run with a specific config file
//! COLLAB_CONFIG=/path/to/collab.toml collabd
//!
//! # Run with environment variables
//! COLLAB_PORT=7420 COLLAB_HOST=0.0.0.0 collabd
//! ```

mod admin;
mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "collab_server=debug,collab_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting collab server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
