//! mio reactor implementation.
//!
//! Readiness-based model: one reactor thread waits on the poller and turns
//! every readiness event into a task for the worker pool; workers perform
//! the non-blocking accept/read/recv syscalls.
//! Uses epoll on Linux, kqueue on macOS. Registrations are edge-triggered,
//! so every task drains its socket until `WouldBlock`.
//!
//! ## Per-descriptor ordering
//!
//! The listener, the UDP socket and every connection own a `SingleFlight`
//! gate. The reactor submits a task only when the gate goes idle, so two
//! workers never touch the same descriptor at once; events for one
//! descriptor are handled strictly in order.

use crate::config::Config;
use crate::protocol::{respond, Transport, SHUTTING_DOWN};
use crate::runtime::connection::{take_line, ConnInner, Connection, ConnectionTable};
use crate::runtime::pool::WorkerPool;
use crate::runtime::schedule::SingleFlight;
use crate::runtime::token::{self, Role};
use crate::state::ServerState;
use bytes::{BufMut, BytesMut};
use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// State shared between the reactor and the tasks it submits.
struct Shared {
    registry: Registry,
    listener: TcpListener,
    udp: UdpSocket,
    connections: ConnectionTable,
    state: Arc<ServerState>,
    accept_gate: SingleFlight,
    datagram_gate: SingleFlight,
    read_chunk: usize,
    udp_buffer: usize,
}

/// Outcome of draining a stream.
enum Drain {
    /// Everything available was read; the peer is still connected.
    Open,
    /// The peer closed its side.
    Eof,
    /// The read failed.
    Failed(io::Error),
}

/// The reactor: poller, sockets, connection table and worker pool.
pub struct Server {
    poll: Poll,
    shared: Arc<Shared>,
    pool: WorkerPool,
    local_addr: SocketAddr,
    poll_timeout: Duration,
    max_events: usize,
}

impl Server {
    /// Create the sockets, the poller and the worker pool.
    ///
    /// Any failure here is fatal: nothing has been served yet.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let ip: IpAddr = config
            .host
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let addr = SocketAddr::new(ip, config.port);

        let mut listener = TcpListener::from_std(create_listener(addr)?);
        let local_addr = listener.local_addr()?;

        // Port 0 only occurs in tests; UDP follows the port TCP was given
        let mut udp = UdpSocket::from_std(create_datagram(local_addr)?);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, token::LISTENER, Interest::READABLE)?;
        poll.registry()
            .register(&mut udp, token::DATAGRAM, Interest::READABLE)?;

        let state = Arc::new(ServerState::new(config.shutdown_token.clone()));
        let waker = Waker::new(poll.registry(), token::WAKER)?;
        state.shutdown.set_waker(Arc::new(waker));

        let shared = Arc::new(Shared {
            registry: poll.registry().try_clone()?,
            listener,
            udp,
            connections: ConnectionTable::new(),
            state,
            accept_gate: SingleFlight::new(),
            datagram_gate: SingleFlight::new(),
            read_chunk: config.read_chunk,
            udp_buffer: config.udp_buffer,
        });

        let pool = WorkerPool::new(config.worker_count())?;

        Ok(Self {
            poll,
            shared,
            pool,
            local_addr,
            poll_timeout: config.poll_timeout,
            max_events: config.max_events,
        })
    }

    /// Address shared by the TCP listener and the UDP socket.
    #[cfg(test)]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Server-wide counters and the shutdown latch.
    #[cfg(test)]
    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.shared.state)
    }

    /// Serve until shutdown is requested, then close every connection and
    /// stop the workers.
    pub fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(self.max_events);

        info!(
            addr = %self.local_addr,
            threads = self.pool.size(),
            token_required = self.shared.state.shutdown.has_token(),
            "Server started"
        );

        let result = loop {
            if self.shared.state.shutdown.is_triggered() {
                break Ok(());
            }

            if let Err(e) = self.poll.poll(&mut events, Some(self.poll_timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "Poll failed");
                break Err(e);
            }

            for event in events.iter() {
                trace!(
                    token = event.token().0,
                    readable = event.is_readable(),
                    read_closed = event.is_read_closed(),
                    error = event.is_error(),
                    "Readiness event"
                );
                self.dispatch(event.token());
            }
        };

        info!("Server shutting down");
        let closed = self.shared.close_all();
        self.pool.shutdown();
        // Accept tasks still in flight during the first sweep
        let stragglers = self.shared.close_all();
        info!(connections = closed + stragglers, "Server stopped");

        result
    }

    /// Hand one readiness event to the worker pool.
    fn dispatch(&self, token: Token) {
        match Role::of(token) {
            Role::Wake => {}
            Role::Accept => {
                if self.shared.accept_gate.schedule() {
                    let shared = Arc::clone(&self.shared);
                    self.submit(move || {
                        shared.accept_gate.run(|| {
                            shared.accept_connections();
                            true
                        })
                    });
                }
            }
            Role::Datagram => {
                if self.shared.datagram_gate.schedule() {
                    let shared = Arc::clone(&self.shared);
                    self.submit(move || {
                        shared.datagram_gate.run(|| {
                            shared.recv_datagrams();
                            true
                        })
                    });
                }
            }
            Role::Stream { conn_id } => {
                let Some(conn) = self.shared.connections.get(conn_id) else {
                    trace!(conn_id, "Event for closed connection");
                    return;
                };
                if conn.gate().schedule() {
                    let shared = Arc::clone(&self.shared);
                    self.submit(move || conn.gate().run(|| shared.serve(&conn)));
                }
            }
        }
    }

    fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.pool.submit(task).is_err() {
            error!("Worker pool closed, event dropped");
        }
    }
}

impl Shared {
    /// Accept until the listener would block.
    fn accept_connections(&self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.add_connection(stream, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    /// Register an accepted stream and add it to the table.
    ///
    /// A registration failure drops (closes) the stream; the accept burst
    /// carries on.
    fn add_connection(&self, mut stream: TcpStream, peer: SocketAddr) {
        let registry = &self.registry;
        let stats = &self.state.stats;

        let added = self.connections.insert_with(move |conn_id| {
            registry.register(&mut stream, Token(conn_id), Interest::READABLE)?;
            // Counted while the table is locked so a close can never run first
            stats.tcp_opened();
            Ok::<_, io::Error>(Connection::new(conn_id, peer, stream))
        });

        match added {
            Ok(conn) => info!(
                peer = %peer,
                conn_id = conn.id(),
                open = self.connections.len(),
                "New TCP client"
            ),
            Err(e) => warn!(peer = %peer, error = %e, "Failed to register connection"),
        }
    }

    /// Drain a connection and answer every complete line.
    ///
    /// Returns false once the connection is closed.
    fn serve(&self, conn: &Connection) -> bool {
        let mut inner = conn.lock();
        let ConnInner { stream, inbound } = &mut *inner;
        let Some(sock) = stream.as_mut() else {
            return false;
        };

        match read_available(sock, inbound, self.read_chunk) {
            Drain::Open => {}
            Drain::Eof => {
                self.close(conn, stream, "peer closed");
                return false;
            }
            Drain::Failed(e) => {
                debug!(conn_id = conn.id(), error = %e, "Read error");
                self.close(conn, stream, "read error");
                return false;
            }
        }

        while let Some(line) = take_line(inbound) {
            let Some(reply) = respond(&line, Transport::Tcp, &self.state) else {
                continue;
            };
            let mut out = BytesMut::with_capacity(reply.len() + 1);
            out.put_slice(&reply);
            out.put_u8(b'\n');
            send_reply(sock, conn.peer(), &out);
        }

        true
    }

    /// Deregister, close and forget a connection. Only the caller that
    /// takes the stream out performs the close.
    fn close(&self, conn: &Connection, stream: &mut Option<TcpStream>, reason: &str) {
        let Some(mut sock) = stream.take() else {
            return;
        };
        if let Err(e) = self.registry.deregister(&mut sock) {
            debug!(conn_id = conn.id(), error = %e, "Deregister failed");
        }
        drop(sock);
        self.connections.remove(conn);
        self.state.stats.tcp_closed();
        info!(peer = %conn.peer(), conn_id = conn.id(), reason, "TCP client disconnected");
    }

    /// Receive until the UDP socket would block, answering each datagram.
    fn recv_datagrams(&self) {
        let mut buf = vec![0u8; self.udp_buffer];
        loop {
            match self.udp.recv_from(&mut buf) {
                Ok((0, _)) => continue,
                Ok((n, peer)) => {
                    if self.state.stats.udp_seen(peer) {
                        debug!(peer = %peer, "New UDP peer");
                    }
                    let Some(reply) = respond(&buf[..n], Transport::Udp, &self.state) else {
                        continue;
                    };
                    if let Err(e) = self.udp.send_to(&reply, peer) {
                        debug!(peer = %peer, error = %e, "Failed to send datagram");
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // ICMP errors from an earlier send_to; more datagrams may be queued
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    warn!(error = %e, "UDP receive error");
                    break;
                }
            }
        }
    }

    /// Notify, deregister and close every tracked connection, leaving the
    /// table empty. Returns how many connections were closed.
    fn close_all(&self) -> usize {
        let mut notice = BytesMut::with_capacity(SHUTTING_DOWN.len() + 1);
        notice.put_slice(SHUTTING_DOWN.as_bytes());
        notice.put_u8(b'\n');

        let mut closed = 0;
        for conn in self.connections.drain() {
            // Waits for a worker that is mid-drain on this connection
            let mut inner = conn.lock();
            let Some(mut sock) = inner.stream.take() else {
                continue;
            };
            send_reply(&mut sock, conn.peer(), &notice);
            let _ = self.registry.deregister(&mut sock);
            self.state.stats.tcp_closed();
            closed += 1;
            debug!(peer = %conn.peer(), conn_id = conn.id(), "Closed on shutdown");
        }
        closed
    }
}

/// Read until the stream would block, appending to `inbound`.
fn read_available(stream: &mut TcpStream, inbound: &mut BytesMut, chunk: usize) -> Drain {
    let mut scratch = vec![0u8; chunk];
    loop {
        match stream.read(&mut scratch) {
            Ok(0) => return Drain::Eof,
            Ok(n) => inbound.extend_from_slice(&scratch[..n]),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Drain::Open,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Drain::Failed(e),
        }
    }
}

/// Best-effort write of a reply. Not retried: a peer that stops reading
/// loses the rest of the reply, and write errors surface on the next read.
fn send_reply(stream: &mut TcpStream, peer: SocketAddr, data: &[u8]) {
    let mut written = 0;
    while written < data.len() {
        match stream.write(&data[written..]) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                debug!(peer = %peer, error = %e, "Failed to send reply");
                return;
            }
        }
    }
    if written < data.len() {
        warn!(peer = %peer, dropped = data.len() - written, "Reply truncated");
    }
}

/// Create a non-blocking TCP listener with the platform's maximum backlog.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(libc::SOMAXCONN)?;

    Ok(socket.into())
}

/// Create a non-blocking UDP socket.
fn create_datagram(addr: SocketAddr) -> io::Result<std::net::UdpSocket> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    Ok(socket.into())
}
