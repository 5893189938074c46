//! echo-reactor: a TCP/UDP echo daemon
//!
//! A single reactor thread multiplexes one TCP listener, every accepted
//! TCP connection and one UDP socket on the same port, and hands the work
//! to a fixed pool of worker threads.
//!
//! Features:
//! - Newline-delimited TCP echo, one datagram per reply over UDP
//! - `/time`, `/stats` and `/shutdown[ <token>]` commands
//! - Configuration via CLI arguments or TOML file

mod config;
mod protocol;
mod runtime;
mod state;

use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        threads = config.worker_count(),
        "Starting echo-reactor"
    );

    runtime::run(config)?;
    Ok(())
}
