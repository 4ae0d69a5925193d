//! Surround - Room Coordination Server
//!
//! Keeps the authoritative playback and spatial state of every room and
//! broadcasts time-stamped actions that all devices execute together.
//! Comes with a terminal dashboard.
//!
//! Usage:
//!   cargo run --release
//!   cargo run --release -- --no-dashboard  # Plain logging mode

mod config;
mod coordinator;
mod dashboard;
mod metrics;
mod network;
mod registry;
mod spatial;

use std::sync::Arc;
use parking_lot::RwLock;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args: Vec<String> = std::env::args().collect();
    let config = config::ServerConfig::from_env(&args);

    // Shared metrics state
    let metrics = Arc::new(RwLock::new(metrics::Metrics::new(
        config.port,
        config.schedule_lead.as_millis() as u64,
    )));

    if config.use_dashboard {
        // Run with TUI dashboard
        dashboard::run(config, metrics).await
    } else {
        // Run with plain logging
        network::run_with_logging(config, metrics).await
    }
}
