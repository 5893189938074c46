//! End-to-end tests: a live server on an ephemeral loopback port driven by
//! blocking std clients.

use super::Server;
use crate::config::Config;
use crate::state::{ServerState, TIME_FORMAT};
use chrono::NaiveDateTime;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    handle: JoinHandle<io::Result<()>>,
}

impl TestServer {
    fn start(threads: usize, token: Option<&str>) -> Self {
        let server = Server::bind(&Config::for_tests(threads, token)).unwrap();
        let addr = server.local_addr();
        let state = server.state();
        let handle = thread::spawn(move || server.run());
        Self {
            addr,
            state,
            handle,
        }
    }

    /// Wait for the reactor to exit on its own.
    fn join(self) {
        self.handle.join().unwrap().unwrap();
    }

    fn stop(self) {
        self.state.shutdown.trigger();
        self.join();
    }
}

struct Client {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Client {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        let writer = stream.try_clone().unwrap();
        Self {
            reader: BufReader::new(stream),
            writer,
        }
    }

    fn send(&mut self, data: &[u8]) {
        self.writer.write_all(data).unwrap();
        self.writer.flush().unwrap();
    }

    fn line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).unwrap();
        line
    }

    fn request(&mut self, data: &str) -> String {
        self.send(data.as_bytes());
        self.line()
    }

    /// True once the server has closed the connection.
    fn at_eof(&mut self) -> bool {
        let mut rest = String::new();
        matches!(self.reader.read_line(&mut rest), Ok(0))
    }
}

fn wait_for<F: FnMut() -> bool>(mut done: F) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

fn udp_client() -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.set_read_timeout(Some(TIMEOUT)).unwrap();
    socket
}

fn udp_request(socket: &UdpSocket, server: SocketAddr, data: &[u8]) -> (Vec<u8>, SocketAddr) {
    socket.send_to(data, server).unwrap();
    let mut buf = [0u8; 2048];
    let (n, from) = socket.recv_from(&mut buf).unwrap();
    (buf[..n].to_vec(), from)
}

#[test]
fn test_tcp_echo() {
    let server = TestServer::start(2, None);
    let mut client = Client::connect(server.addr);

    assert_eq!(client.request("hello\n"), "hello\n");
    assert_eq!(client.request("hello world\r\n"), "hello world\r\n");

    server.stop();
}

#[test]
fn test_tcp_session_with_token() {
    let server = TestServer::start(4, Some("secret"));
    let mut client = Client::connect(server.addr);

    assert_eq!(client.request("hello\n"), "hello\n");
    assert_eq!(
        client.request("/stats\n"),
        "TCP total=1 current=1 UDP unique=0\n"
    );
    assert_eq!(client.request("/shutdown wrongtoken\n"), "Invalid token\n");
    assert_eq!(client.request("/shutdown\n"), "Invalid token\n");

    // Still open after a rejected shutdown
    assert_eq!(client.request("still here\n"), "still here\n");
    assert!(!server.state.shutdown.is_triggered());

    assert_eq!(client.request("/shutdown secret\n"), "Server shutting down\n");
    server.join();

    // Shutdown notice, then the server closes the socket
    assert_eq!(client.line(), "Server shutting down\n");
    assert!(client.at_eof());
}

#[test]
fn test_shutdown_without_token_notifies_everyone() {
    let server = TestServer::start(2, None);
    let mut bystander = Client::connect(server.addr);
    let mut admin = Client::connect(server.addr);

    assert_eq!(bystander.request("ping\n"), "ping\n");
    assert_eq!(admin.request("/shutdown\n"), "Server shutting down\n");
    server.join();

    assert_eq!(bystander.line(), "Server shutting down\n");
    assert!(bystander.at_eof());
}

#[test]
fn test_time_command() {
    let server = TestServer::start(2, None);
    let mut client = Client::connect(server.addr);

    let first = client.request("/time\n");
    thread::sleep(Duration::from_millis(1100));
    let second = client.request("/time\n");

    let first = NaiveDateTime::parse_from_str(first.trim_end(), TIME_FORMAT).unwrap();
    let second = NaiveDateTime::parse_from_str(second.trim_end(), TIME_FORMAT).unwrap();
    assert!(second >= first);

    server.stop();
}

#[test]
fn test_unknown_and_empty_lines() {
    let server = TestServer::start(2, None);
    let mut client = Client::connect(server.addr);

    // Empty lines produce no reply at all
    client.send(b"\n\n/nope\n\n/timestamp\n");
    assert_eq!(client.line(), "Unknown command\n");
    assert_eq!(client.line(), "Unknown command\n");
    assert_eq!(client.request("after\n"), "after\n");

    server.stop();
}

#[test]
fn test_partial_lines_are_reassembled() {
    let server = TestServer::start(2, None);
    let mut client = Client::connect(server.addr);

    client.send(b"hel");
    thread::sleep(Duration::from_millis(50));
    client.send(b"lo");
    thread::sleep(Duration::from_millis(50));
    client.send(b"\nfirst\nsec");
    assert_eq!(client.line(), "hello\n");
    assert_eq!(client.line(), "first\n");

    client.send(b"ond\n");
    assert_eq!(client.line(), "second\n");

    server.stop();
}

#[test]
fn test_line_longer_than_read_chunk() {
    let server = TestServer::start(2, None);
    let mut client = Client::connect(server.addr);

    let payload: String = (0..20_000).map(|i| (b'a' + (i % 26) as u8) as char).collect();
    let reply = client.request(&format!("{payload}\n"));
    assert_eq!(reply.len(), payload.len() + 1);
    assert_eq!(reply.trim_end_matches('\n'), payload);

    server.stop();
}

#[test]
fn test_current_count_drops_on_disconnect() {
    let server = TestServer::start(2, None);
    let mut observer = Client::connect(server.addr);
    let mut other = Client::connect(server.addr);

    assert_eq!(other.request("x\n"), "x\n");
    assert_eq!(
        observer.request("/stats\n"),
        "TCP total=2 current=2 UDP unique=0\n"
    );

    drop(other);
    assert!(wait_for(
        || observer.request("/stats\n") == "TCP total=2 current=1 UDP unique=0\n"
    ));

    server.stop();
}

#[test]
fn test_udp_echo_and_commands() {
    let server = TestServer::start(2, None);
    let socket = udp_client();

    let (reply, from) = udp_request(&socket, server.addr, b"ping");
    assert_eq!(reply, b"ping");
    assert_eq!(from.port(), server.addr.port());

    // No terminator added or removed
    let (reply, _) = udp_request(&socket, server.addr, b"line\n");
    assert_eq!(reply, b"line\n");

    let (reply, _) = udp_request(&socket, server.addr, b"/stats");
    assert_eq!(reply, b"TCP total=0 current=0 UDP unique=1");

    let (reply, _) = udp_request(&socket, server.addr, b"/shutdown");
    assert_eq!(reply, b"Unknown command");
    assert!(!server.state.shutdown.is_triggered());

    let (reply, _) = udp_request(&socket, server.addr, b"/time");
    let text = String::from_utf8(reply).unwrap();
    assert!(NaiveDateTime::parse_from_str(&text, TIME_FORMAT).is_ok());

    let second = udp_client();
    let (reply, _) = udp_request(&second, server.addr, b"/stats");
    assert_eq!(reply, b"TCP total=0 current=0 UDP unique=2");

    server.stop();
}

#[test]
fn test_concurrent_clients_keep_lines_intact() {
    let server = TestServer::start(4, None);
    let addr = server.addr;

    let clients: Vec<_> = (0..16)
        .map(|id| {
            thread::spawn(move || {
                let mut client = Client::connect(addr);
                let lines: Vec<String> = (0..200)
                    .map(|seq| format!("client-{id}-line-{seq}-{}", "x".repeat(seq % 37)))
                    .collect();

                // Split every line so the server sees partial reads
                for line in &lines {
                    let (head, tail) = line.split_at(line.len() / 2);
                    client.send(head.as_bytes());
                    client.send(format!("{tail}\n").as_bytes());
                }

                for line in &lines {
                    assert_eq!(client.line(), format!("{line}\n"));
                }
            })
        })
        .collect();

    for client in clients {
        client.join().unwrap();
    }

    let stats = server.state.stats.snapshot();
    assert_eq!(stats.tcp_total, 16);

    server.stop();
}

#[test]
fn test_stop_closes_idle_connections() {
    let server = TestServer::start(1, None);
    let mut client = Client::connect(server.addr);
    assert_eq!(client.request("ready\n"), "ready\n");

    let state = Arc::clone(&server.state);
    server.stop();

    assert_eq!(client.line(), "Server shutting down\n");
    assert!(client.at_eof());
    assert_eq!(state.stats.snapshot().tcp_current, 0);
}
