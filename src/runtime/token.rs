//! Poll token layout.
//!
//! The top of the token space is reserved for the server's own sources;
//! every other token is a connection id handed out by the connection
//! table's slab.

use mio::Token;

/// TCP listening socket.
pub const LISTENER: Token = Token(usize::MAX);
/// UDP socket.
pub const DATAGRAM: Token = Token(usize::MAX - 1);
/// Reactor waker used by shutdown requests.
pub const WAKER: Token = Token(usize::MAX - 2);

/// What a readiness event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Pending connections on the listener.
    Accept,
    /// Pending datagrams on the UDP socket.
    Datagram,
    /// The reactor was woken explicitly.
    Wake,
    /// Readable TCP connection.
    Stream {
        /// Connection identifier in the table.
        conn_id: usize,
    },
}

impl Role {
    /// Resolve the role of a token.
    pub fn of(token: Token) -> Self {
        match token {
            LISTENER => Role::Accept,
            DATAGRAM => Role::Datagram,
            WAKER => Role::Wake,
            Token(conn_id) => Role::Stream { conn_id },
        }
    }
}
