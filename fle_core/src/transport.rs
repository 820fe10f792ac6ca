use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use fle_runtime::rcon::{decode_packet, Packet, AUTH_FAILED_ID, SERVERDATA_AUTH_RESPONSE};
use parking_lot::Mutex;
use thiserror::Error;

const READ_CHUNK: usize = 8192;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("authentication refused")]
    Auth,
    #[error("transport is closed")]
    Closed,
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Request/response channel to the simulation. One request is in flight at a
/// time; callers serialize access through [`Channel`].
pub trait Transport: Send {
    fn send(&mut self, command: &str, timeout: Duration) -> Result<String, TransportError>;
    fn close(&mut self);
    fn is_closed(&self) -> bool;
}

/// Remote-console client over a blocking TCP stream.
///
/// Replies are matched to requests by id; a reply that arrives after its
/// request timed out is discarded when the next request reads. Bytes of a
/// partially received packet are kept across timeouts. After an I/O failure
/// the next send reconnects and re-authenticates.
pub struct RconClient {
    addr: SocketAddr,
    password: String,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
    pending: Vec<u8>,
    next_id: i32,
    closed: bool,
}

impl RconClient {
    pub fn connect(
        address: &str,
        port: u16,
        password: &str,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let addr = (address, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| TransportError::Protocol(format!("{address}:{port} did not resolve")))?;
        let mut client = Self {
            addr,
            password: password.to_string(),
            connect_timeout,
            stream: None,
            pending: Vec::new(),
            next_id: 1,
            closed: false,
        };
        client.open()?;
        Ok(client)
    }

    pub fn peer(&self) -> SocketAddr {
        self.addr
    }

    fn next_request_id(&mut self) -> i32 {
        let id = self.next_id;
        self.next_id = self.next_id.checked_add(1).unwrap_or(1);
        id
    }

    fn open(&mut self) -> Result<(), TransportError> {
        let stream = TcpStream::connect_timeout(&self.addr, self.connect_timeout)?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        self.pending.clear();

        let id = self.next_request_id();
        let password = self.password.clone();
        self.write_packet(&Packet::auth(id, &password))?;
        let deadline = Instant::now() + self.connect_timeout;
        loop {
            // Some servers send an empty response value ahead of the auth result.
            let packet = self.read_packet(deadline, self.connect_timeout)?;
            if packet.kind != SERVERDATA_AUTH_RESPONSE {
                continue;
            }
            if packet.id == AUTH_FAILED_ID {
                self.drop_stream();
                return Err(TransportError::Auth);
            }
            if packet.id == id {
                break;
            }
        }

        tracing::debug!(target: "fle::transport", peer = %self.addr, "rcon.authenticated");
        Ok(())
    }

    fn drop_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.pending.clear();
    }

    fn write_packet(&mut self, packet: &Packet) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        if let Err(err) = stream.write_all(&packet.encode()) {
            self.drop_stream();
            return Err(err.into());
        }
        Ok(())
    }

    fn read_packet(&mut self, deadline: Instant, budget: Duration) -> Result<Packet, TransportError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match decode_packet(&self.pending) {
                Ok(Some((packet, used))) => {
                    self.pending.drain(..used);
                    return Ok(packet);
                }
                Ok(None) => {}
                Err(err) => {
                    self.drop_stream();
                    return Err(TransportError::Protocol(err.to_string()));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout(budget));
            }
            let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
            stream.set_read_timeout(Some(deadline - now))?;
            match stream.read(&mut chunk) {
                Ok(0) => {
                    self.drop_stream();
                    return Err(TransportError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    )));
                }
                Ok(read) => self.pending.extend_from_slice(&chunk[..read]),
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(err) => {
                    self.drop_stream();
                    return Err(err.into());
                }
            }
        }
    }
}

impl Transport for RconClient {
    fn send(&mut self, command: &str, timeout: Duration) -> Result<String, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if self.stream.is_none() {
            tracing::info!(target: "fle::transport", peer = %self.addr, "rcon.reconnecting");
            self.open()?;
        }

        let id = self.next_request_id();
        self.write_packet(&Packet::exec(id, command))?;
        let deadline = Instant::now() + timeout;
        loop {
            let packet = self.read_packet(deadline, timeout)?;
            if packet.id == id {
                return Ok(packet.body);
            }
            tracing::debug!(
                target: "fle::transport",
                stale_id = packet.id,
                expected_id = id,
                "rcon.stale_reply_discarded"
            );
        }
    }

    fn close(&mut self) {
        self.closed = true;
        self.drop_stream();
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Serialized access to one [`Transport`], shared by every namespace of a
/// session.
pub struct Channel {
    transport: Mutex<Box<dyn Transport>>,
    sends: AtomicU64,
    closing: AtomicBool,
}

impl Channel {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport: Mutex::new(transport),
            sends: AtomicU64::new(0),
            closing: AtomicBool::new(false),
        }
    }

    pub fn send(&self, command: &str, timeout: Duration) -> Result<String, TransportError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let mut transport = self.transport.lock();
        if transport.is_closed() {
            return Err(TransportError::Closed);
        }
        self.sends.fetch_add(1, Ordering::Relaxed);
        transport.send(command, timeout)
    }

    /// Number of commands handed to the transport so far.
    pub fn sends(&self) -> u64 {
        self.sends.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Refuse new sends, wait up to `drain` for the in-flight one, then close
    /// the transport. Returns false when the in-flight send did not finish in
    /// time; the transport is then left to be dropped with the channel.
    pub fn close(&self, drain: Duration) -> bool {
        self.closing.store(true, Ordering::Release);
        match self.transport.try_lock_for(drain) {
            Some(mut transport) => {
                transport.close();
                true
            }
            None => {
                tracing::warn!(
                    target: "fle::transport",
                    drain_ms = drain.as_millis() as u64,
                    "transport.drain_timeout"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fle_runtime::rcon::{SERVERDATA_AUTH, SERVERDATA_RESPONSE_VALUE};
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread;

    fn read_request(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Option<Packet> {
        let mut chunk = [0u8; 1024];
        loop {
            if let Some((packet, used)) = decode_packet(buf).unwrap() {
                buf.drain(..used);
                return Some(packet);
            }
            match stream.read(&mut chunk) {
                Ok(0) | Err(_) => return None,
                Ok(read) => buf.extend_from_slice(&chunk[..read]),
            }
        }
    }

    /// Serves one connection: authenticates with `password`, then answers each
    /// exec through `respond`.
    fn spawn_server<F>(password: &'static str, respond: F) -> SocketAddr
    where
        F: Fn(&Packet, &mut TcpStream) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = Vec::new();
            while let Some(packet) = read_request(&mut stream, &mut buf) {
                if packet.kind == SERVERDATA_AUTH {
                    let id = if packet.body == password {
                        packet.id
                    } else {
                        AUTH_FAILED_ID
                    };
                    let reply = Packet::new(id, SERVERDATA_AUTH_RESPONSE, "");
                    stream.write_all(&reply.encode()).unwrap();
                } else {
                    respond(&packet, &mut stream);
                }
            }
        });
        addr
    }

    fn echo(packet: &Packet, stream: &mut TcpStream) {
        let reply = Packet::new(packet.id, SERVERDATA_RESPONSE_VALUE, packet.body.to_uppercase());
        let _ = stream.write_all(&reply.encode());
    }

    #[test]
    fn refused_password_is_auth_error() {
        let addr = spawn_server("secret", echo);
        let err = RconClient::connect("127.0.0.1", addr.port(), "wrong", Duration::from_secs(2))
            .err()
            .expect("auth should fail");
        assert!(matches!(err, TransportError::Auth));
    }

    #[test]
    fn exec_returns_matching_reply() {
        let addr = spawn_server("secret", echo);
        let mut client =
            RconClient::connect("127.0.0.1", addr.port(), "secret", Duration::from_secs(2)).unwrap();
        assert_eq!(client.send("ping", Duration::from_secs(2)).unwrap(), "PING");
        assert_eq!(client.send("pong", Duration::from_secs(2)).unwrap(), "PONG");
    }

    #[test]
    fn late_reply_is_discarded_after_timeout() {
        let addr = spawn_server("secret", |packet, stream| {
            if packet.body == "slow" {
                thread::sleep(Duration::from_millis(300));
            }
            echo(packet, stream);
        });
        let mut client =
            RconClient::connect("127.0.0.1", addr.port(), "secret", Duration::from_secs(2)).unwrap();
        let err = client
            .send("slow", Duration::from_millis(50))
            .expect_err("should time out");
        assert!(matches!(err, TransportError::Timeout(_)));
        assert_eq!(client.send("fast", Duration::from_secs(2)).unwrap(), "FAST");
    }

    #[test]
    fn split_packets_are_reassembled() {
        let addr = spawn_server("secret", |packet, stream| {
            let frame =
                Packet::new(packet.id, SERVERDATA_RESPONSE_VALUE, "{[\"ok\"] = true}").encode();
            let (head, tail) = frame.split_at(7);
            stream.write_all(head).unwrap();
            stream.flush().unwrap();
            thread::sleep(Duration::from_millis(30));
            stream.write_all(tail).unwrap();
        });
        let mut client =
            RconClient::connect("127.0.0.1", addr.port(), "secret", Duration::from_secs(2)).unwrap();
        assert_eq!(
            client.send("x", Duration::from_secs(2)).unwrap(),
            "{[\"ok\"] = true}"
        );
    }

    struct CountingTransport {
        closed: bool,
    }

    impl Transport for CountingTransport {
        fn send(&mut self, command: &str, _timeout: Duration) -> Result<String, TransportError> {
            Ok(command.len().to_string())
        }

        fn close(&mut self) {
            self.closed = true;
        }

        fn is_closed(&self) -> bool {
            self.closed
        }
    }

    #[test]
    fn channel_counts_sends_and_refuses_after_close() {
        let channel = Channel::new(Box::new(CountingTransport { closed: false }));
        assert_eq!(channel.send("abc", Duration::from_secs(1)).unwrap(), "3");
        assert_eq!(channel.sends(), 1);
        assert!(channel.close(Duration::from_millis(10)));
        assert!(matches!(
            channel.send("abc", Duration::from_secs(1)),
            Err(TransportError::Closed)
        ));
        assert_eq!(channel.sends(), 1);
    }

    #[test]
    fn channel_serializes_concurrent_senders() {
        let channel = Arc::new(Channel::new(Box::new(CountingTransport { closed: false })));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let channel = Arc::clone(&channel);
                thread::spawn(move || {
                    for _ in 0..25 {
                        channel.send("x", Duration::from_secs(1)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(channel.sends(), 100);
    }
}
