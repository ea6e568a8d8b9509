//! # Parley Server
//!
//! WebSocket signaling relay for chat messages, presence and calls.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (in-memory store)
//! parley
//!
//! # Run against PostgreSQL with a real token secret
//! DATABASE_URL=postgres://parley@localhost/parley PARLEY_JWT_SECRET=... parley
//!
//! # Run with environment variables
//! PARLEY_PORT=8080 PARLEY_HOST=0.0.0.0 parley
//! ```

mod config;
mod handlers;
mod identity;
mod metrics;
mod pg_store;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Parley server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
