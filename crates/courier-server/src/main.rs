//! # Courier Server
//!
//! Long-polling message bus server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! courier
//!
//! # Run with environment variables
//! COURIER_PORT=8080 COURIER_HOST=0.0.0.0 courier
//!
//! # Wait for messages on a channel
//! curl -X POST localhost:8080/message-bus/abc/poll -d '{"/chat": 0}' \
//!     -H 'content-type: application/json'
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
                .unwrap_or_else(|_| "courier_server=debug,courier_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!(
        site = ?config.bus.site_id,
        "Starting courier server on {}:{}",
        config.host,
        config.port
    );

    metrics::init_metrics();
    handlers::run_server(config).await?;

    Ok(())
}
