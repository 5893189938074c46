//! Line protocol shared by the TCP and UDP paths.
//!
//! Every message (one TCP line or one UDP datagram) is classified once:
//! - `/time`, `/stats`, `/shutdown[ <token>]` are commands
//! - any other `/`-prefixed message is an unknown command
//! - everything else is echoed back verbatim
//!
//! Replies are produced without a terminator; the TCP path appends `\n`.

use crate::state::{now, ServerState, ShutdownOutcome};
use bytes::Bytes;

/// Character that introduces a command.
pub const COMMAND_PREFIX: u8 = b'/';

const TIME: &[u8] = b"/time";
const STATS: &[u8] = b"/stats";
const SHUTDOWN: &[u8] = b"/shutdown";

pub const UNKNOWN_COMMAND: &str = "Unknown command";
pub const SHUTTING_DOWN: &str = "Server shutting down";
pub const INVALID_TOKEN: &str = "Invalid token";

/// Where a message arrived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

/// Parsed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    /// Current local date-time.
    Time,
    /// Connection statistics.
    Stats,
    /// Stop the server; carries the provided secret (possibly empty).
    Shutdown { token: &'a [u8] },
    /// Prefixed with `/` but not a known command.
    Unknown,
    /// Plain payload to send back.
    Echo(&'a [u8]),
}

impl<'a> Command<'a> {
    /// Classify a message. Returns `None` for empty input.
    pub fn parse(msg: &'a [u8]) -> Option<Self> {
        if msg.is_empty() {
            return None;
        }
        if msg[0] != COMMAND_PREFIX {
            return Some(Command::Echo(msg));
        }

        // Telnet-style clients terminate lines with \r\n
        let line = msg.strip_suffix(b"\r").unwrap_or(msg);

        if command_args(line, TIME).is_some() {
            Some(Command::Time)
        } else if command_args(line, STATS).is_some() {
            Some(Command::Stats)
        } else if let Some(token) = command_args(line, SHUTDOWN) {
            Some(Command::Shutdown { token })
        } else {
            Some(Command::Unknown)
        }
    }
}

/// Match `line` against a command name followed by end of input or a space.
/// Returns the argument text with exactly one leading space removed.
fn command_args<'a>(line: &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    let rest = line.strip_prefix(name)?;
    match rest.first() {
        None => Some(rest),
        Some(b' ') => Some(&rest[1..]),
        Some(_) => None,
    }
}

/// Produce the reply body for one message, or `None` when nothing is sent.
pub fn respond(msg: &[u8], transport: Transport, state: &ServerState) -> Option<Bytes> {
    let reply = match Command::parse(msg)? {
        Command::Time => Bytes::from(now()),
        Command::Stats => Bytes::from(state.stats.snapshot().to_string()),
        Command::Shutdown { token } if transport == Transport::Tcp => {
            match state.shutdown.request(token) {
                ShutdownOutcome::Accepted => Bytes::from_static(SHUTTING_DOWN.as_bytes()),
                ShutdownOutcome::InvalidToken => Bytes::from_static(INVALID_TOKEN.as_bytes()),
            }
        }
        Command::Shutdown { .. } | Command::Unknown => {
            Bytes::from_static(UNKNOWN_COMMAND.as_bytes())
        }
        Command::Echo(payload) => Bytes::copy_from_slice(payload),
    };
    Some(reply)
}
