//! Connection table for accepted TCP streams.
//!
//! Each connection tracks its peer, its inbound byte buffer and the
//! single-flight gate that serialises its read tasks. The table maps
//! connection ids (which double as mio tokens) to shared connections.
//!
//! Closing is owned by whoever takes the stream out of the connection:
//! a second close, or a read after close, finds `None` and does nothing.

use crate::runtime::schedule::SingleFlight;
use bytes::{Bytes, BytesMut};
use mio::net::TcpStream;
use parking_lot::{Mutex, MutexGuard};
use slab::Slab;
use std::net::SocketAddr;
use std::sync::Arc;

/// Mutable per-connection state, guarded by the connection's mutex.
#[derive(Debug)]
pub struct ConnInner {
    /// Socket; `None` once the connection has been closed.
    pub stream: Option<TcpStream>,
    /// Bytes received but not yet terminated by `\n`.
    pub inbound: BytesMut,
}

/// A single accepted TCP stream.
#[derive(Debug)]
pub struct Connection {
    /// Identifier in the table and mio token.
    id: usize,
    /// Remote address, fixed at accept.
    peer: SocketAddr,
    /// Serialises read tasks for this connection.
    gate: SingleFlight,
    inner: Mutex<ConnInner>,
}

impl Connection {
    pub fn new(id: usize, peer: SocketAddr, stream: TcpStream) -> Self {
        Self {
            id,
            peer,
            gate: SingleFlight::new(),
            inner: Mutex::new(ConnInner {
                stream: Some(stream),
                inbound: BytesMut::new(),
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn gate(&self) -> &SingleFlight {
        &self.gate
    }

    /// Lock the stream and buffer.
    pub fn lock(&self) -> MutexGuard<'_, ConnInner> {
        self.inner.lock()
    }
}

/// Registry of live connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations. The lock is only
/// held for table membership changes, never across socket reads.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    connections: Mutex<Slab<Arc<Connection>>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection built from the id it will be stored under.
    ///
    /// `build` runs with the table locked, so the id is reserved while the
    /// stream is registered with the poller. If `build` fails nothing is
    /// inserted.
    pub fn insert_with<F, E>(&self, build: F) -> Result<Arc<Connection>, E>
    where
        F: FnOnce(usize) -> Result<Connection, E>,
    {
        let mut connections = self.connections.lock();
        let entry = connections.vacant_entry();
        let conn = Arc::new(build(entry.key())?);
        entry.insert(Arc::clone(&conn));
        Ok(conn)
    }

    /// Look up a connection by id.
    pub fn get(&self, id: usize) -> Option<Arc<Connection>> {
        self.connections.lock().get(id).cloned()
    }

    /// Remove `conn` if it is still the entry stored under its id.
    pub fn remove(&self, conn: &Connection) -> bool {
        let mut connections = self.connections.lock();
        match connections.get(conn.id) {
            Some(current) if std::ptr::eq(Arc::as_ptr(current), conn) => {
                connections.remove(conn.id);
                true
            }
            _ => false,
        }
    }

    /// Empty the table, returning every connection it held.
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().drain().collect()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    /// Check if there are no connections.
    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }
}

/// Strip one `\n`-terminated line from the front of `buf`.
///
/// The terminator is consumed but not returned. Returns `None` when no
/// complete line is buffered.
pub fn take_line(buf: &mut BytesMut) -> Option<Bytes> {
    let pos = buf.iter().position(|&b| b == b'\n')?;
    let mut line = buf.split_to(pos + 1);
    line.truncate(pos);
    Some(line.freeze())
}
