//! # Aurora Server
//!
//! Direct-messaging server: authenticated WebSocket connections, live push
//! to online users and durable per-user mailboxes for everyone else.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (reads ./aurora.toml if present)
//! aurora
//!
//! # Run with environment variables
//! AURORA_PORT=8080 AURORA_HOST=0.0.0.0 aurora
//! ```

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
                .unwrap_or_else(|_| "aurora=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Aurora server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
