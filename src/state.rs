//! Process-wide server state shared by the reactor and every worker.
//!
//! Holds:
//! - TCP accept counters and the set of distinct UDP senders
//! - The shutdown flag, its optional secret, and the reactor waker
//! - The local clock used by `/time`

use chrono::Local;
use mio::Waker;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};

/// Format used by `/time` replies.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Current local date-time rendered with [`TIME_FORMAT`].
pub fn now() -> String {
    Local::now().format(TIME_FORMAT).to_string()
}

/// Aggregate connection statistics.
#[derive(Debug, Default)]
pub struct Stats {
    /// TCP connections accepted over the server lifetime
    tcp_total: AtomicU64,
    /// TCP connections accepted and not yet closed
    tcp_current: AtomicU64,
    /// Distinct UDP sender identities (membership only grows)
    udp_peers: Mutex<HashSet<SocketAddr>>,
}

impl Stats {
    /// Record an accepted TCP connection.
    pub fn tcp_opened(&self) {
        self.tcp_total.fetch_add(1, Ordering::SeqCst);
        self.tcp_current.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a closed TCP connection.
    pub fn tcp_closed(&self) {
        // Saturate instead of wrapping if a caller ever closes twice
        if self
            .tcp_current
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_err()
        {
            warn!("TCP close recorded with no open connections");
        }
    }

    /// Record a UDP sender. Returns true the first time a sender is seen.
    pub fn udp_seen(&self, peer: SocketAddr) -> bool {
        self.udp_peers.lock().insert(peer)
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tcp_total: self.tcp_total.load(Ordering::SeqCst),
            tcp_current: self.tcp_current.load(Ordering::SeqCst),
            udp_unique: self.udp_peers.lock().len(),
        }
    }
}

/// Values reported by `/stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub tcp_total: u64,
    pub tcp_current: u64,
    pub udp_unique: usize,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TCP total={} current={} UDP unique={}",
            self.tcp_total, self.tcp_current, self.udp_unique
        )
    }
}

/// Result of a shutdown request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Flag raised (or already raised); the reactor is stopping.
    Accepted,
    /// Secret did not match; nothing changed.
    InvalidToken,
}

/// One-way shutdown latch.
///
/// Once raised it never resets; the reactor polls it at the top of every
/// wait and the waker (when installed) cuts that wait short.
#[derive(Debug, Default)]
pub struct Shutdown {
    flag: AtomicBool,
    token: Option<String>,
    waker: OnceLock<Arc<Waker>>,
}

impl Shutdown {
    /// Create a latch guarded by an optional secret.
    pub fn new(token: Option<String>) -> Self {
        Self {
            flag: AtomicBool::new(false),
            token,
            waker: OnceLock::new(),
        }
    }

    /// Install the waker used to interrupt the reactor's poll.
    pub fn set_waker(&self, waker: Arc<Waker>) {
        let _ = self.waker.set(waker);
    }

    /// Whether a secret is required.
    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// Check `provided` against the configured secret and raise the flag on
    /// success. Without a configured secret every request succeeds.
    pub fn request(&self, provided: &[u8]) -> ShutdownOutcome {
        if let Some(expected) = &self.token {
            if provided != expected.as_bytes() {
                warn!("Shutdown rejected: invalid token");
                return ShutdownOutcome::InvalidToken;
            }
        }
        self.trigger();
        ShutdownOutcome::Accepted
    }

    /// Raise the flag unconditionally.
    pub fn trigger(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            info!("Shutdown requested");
        }
        if let Some(waker) = self.waker.get() {
            if let Err(e) = waker.wake() {
                warn!(error = %e, "Failed to wake reactor");
            }
        }
    }

    /// Whether the flag has been raised.
    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Everything the protocol handler needs from the server.
#[derive(Debug, Default)]
pub struct ServerState {
    pub stats: Stats,
    pub shutdown: Shutdown,
}

impl ServerState {
    pub fn new(shutdown_token: Option<String>) -> Self {
        Self {
            stats: Stats::default(),
            shutdown: Shutdown::new(shutdown_token),
        }
    }
}
