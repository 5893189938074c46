//! Reactor runtime.
//!
//! One reactor thread waits on mio (epoll on Linux, kqueue on macOS) and
//! hands every readiness event to a fixed worker pool:
//! - `WorkerPool`: persistent worker threads over a FIFO task queue
//! - `ConnectionTable`: live TCP connections keyed by poll token
//! - `SingleFlight`: at most one in-flight task per descriptor
//! - `Role`: poll token layout

mod connection;
mod event_loop;
mod pool;
mod schedule;
mod token;

#[cfg(test)]
mod tests;

pub use event_loop::Server;

use crate::config::Config;

/// Bind the configured port and serve until shutdown.
pub fn run(config: Config) -> std::io::Result<()> {
    Server::bind(&config)?.run()
}
