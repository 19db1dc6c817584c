//! Socket: owns one TCP descriptor, an optional TLS session and the receive
//! buffer.
//!
//! Lifecycle: created -> connecting -> connected -> closed. `connect` and
//! `accept` run the TLS handshake and the user handshake hook in blocking
//! mode (bounded by the socket timeout) and only then switch the descriptor to
//! non-blocking mode. `read` and `write` are non-blocking attempts driven by
//! `poll(2)` and bounded by the same timeout.
//!
//! A socket is driven by one thread at a time; there is no internal locking.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};

use crate::buffer::Buffer;
use crate::env::{self, Level};
use crate::error::{Error, ErrorCode, Result};
use crate::kvs::Kvs;
use crate::sys::{self, Interest, Readiness};
use crate::tls;
use crate::vws_trace;

/// Timeout used until [`Socket::set_timeout`] is called.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Bytes pulled from the descriptor per receive attempt.
const RECV_CHUNK: usize = 4096;

/// Floor for OS-level socket timeouts, which reject a zero duration.
const MIN_OS_TIMEOUT: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Created,
    Connecting,
    Connected,
    Closed,
}

/// Per-socket callbacks.
pub trait SocketHooks: Send {
    /// Runs once after transport (and TLS) setup, before non-blocking mode.
    /// Returning false aborts the connect.
    fn handshake(&mut self, socket: &mut Socket) -> bool {
        let _ = socket;
        true
    }

    /// Runs on abnormal read/write failure, before the socket closes itself.
    /// The socket may already be closed when this returns; a hook that
    /// escalates (e.g. panics) must call [`Socket::close`] first.
    fn disconnect(&mut self, socket: &mut Socket) {
        let _ = socket;
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl SocketHooks for NoHooks {}

enum Received {
    Data(usize),
    Nothing,
    Closed,
}

pub struct Socket {
    stream: Option<TcpStream>,
    tls: Option<Connection>,
    tls_config: Option<Arc<ClientConfig>>,
    buffer: Buffer,
    timeout: Duration,
    data: Kvs,
    hooks: Box<dyn SocketHooks>,
    flush: bool,
    state: State,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("fd", &self.stream.as_ref().map(|s| s.as_raw_fd()))
            .field("tls", &self.tls.is_some())
            .field("buffered", &self.buffer.len())
            .field("timeout", &self.timeout)
            .field("flush", &self.flush)
            .field("state", &self.state)
            .finish()
    }
}

impl Default for Socket {
    fn default() -> Self {
        Self::new()
    }
}

impl Socket {
    pub fn new() -> Self {
        Self::with_hooks(NoHooks)
    }

    pub fn with_hooks(hooks: impl SocketHooks + 'static) -> Self {
        Self {
            stream: None,
            tls: None,
            tls_config: None,
            buffer: Buffer::new(),
            timeout: DEFAULT_TIMEOUT,
            data: Kvs::new(0, false),
            hooks: Box::new(hooks),
            flush: true,
            state: State::Created,
        }
    }

    pub fn set_hooks(&mut self, hooks: impl SocketHooks + 'static) {
        self.hooks = Box::new(hooks);
    }

    /// Client TLS configuration for later `connect` calls. Defaults to
    /// [`tls::default_client_config`].
    pub fn set_tls_config(&mut self, config: Arc<ClientConfig>) {
        self.tls_config = Some(config);
    }

    pub fn set_timeout(&mut self, secs: u64) {
        self.timeout = Duration::from_secs(secs);
    }

    pub fn set_timeout_ms(&mut self, ms: u64) {
        self.timeout = Duration::from_millis(ms);
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// With flush on (the default) `write` loops until every byte is sent.
    pub fn set_flush(&mut self, flush: bool) {
        self.flush = flush;
    }

    pub fn flush(&self) -> bool {
        self.flush
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Received bytes not yet consumed by the caller.
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut Buffer {
        &mut self.buffer
    }

    /// Connection metadata (case-insensitive keys).
    pub fn data(&self) -> &Kvs {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Kvs {
        &mut self.data
    }

    pub fn peer_addr(&self) -> Option<(String, u16)> {
        let addr = self.stream.as_ref()?.peer_addr().ok()?;
        Some(sys::addr_info(&addr))
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref()?.local_addr().ok()
    }

    /// Connect to `host:port`, optionally over TLS. On any failure the socket
    /// is closed and the error is recorded in the thread environment.
    pub fn connect(&mut self, host: &str, port: u16, use_tls: bool) -> Result<()> {
        self.close();
        self.state = State::Connecting;
        match self.open_client(host, port, use_tls) {
            Ok(()) => {
                env::mark_success();
                vws_trace!(
                    Level::Info,
                    "connected to {}:{}{}",
                    host,
                    port,
                    if use_tls { " (tls)" } else { "" }
                );
                Ok(())
            }
            Err(e) => {
                self.close();
                self.state = State::Closed;
                vws_trace!(Level::Warn, "connect to {}:{} failed: {}", host, port, e);
                Err(e.report())
            }
        }
    }

    /// Take over an accepted stream, optionally running a server-side TLS
    /// handshake. Same hook and non-blocking contract as [`Socket::connect`].
    pub fn accept(&mut self, stream: TcpStream, tls: Option<Arc<ServerConfig>>) -> Result<()> {
        self.close();
        self.state = State::Connecting;
        match self.open_server(stream, tls) {
            Ok(()) => {
                env::mark_success();
                if let Some((host, port)) = self.peer_addr() {
                    vws_trace!(Level::Info, "accepted connection from {}:{}", host, port);
                }
                Ok(())
            }
            Err(e) => {
                self.close();
                self.state = State::Closed;
                vws_trace!(Level::Warn, "accept failed: {}", e);
                Err(e.report())
            }
        }
    }

    fn open_client(&mut self, host: &str, port: u16, use_tls: bool) -> Result<()> {
        let stream = self.connect_tcp(host, port)?;
        self.attach(stream)?;
        if use_tls {
            let config = self
                .tls_config
                .clone()
                .unwrap_or_else(tls::default_client_config);
            let conn = ClientConnection::new(config, tls::server_name(host)?)?;
            self.tls = Some(Connection::Client(conn));
            self.complete_tls_handshake()?;
        }
        self.finish_open()
    }

    fn open_server(&mut self, stream: TcpStream, tls: Option<Arc<ServerConfig>>) -> Result<()> {
        self.attach(stream)?;
        if let Some(config) = tls {
            let conn = ServerConnection::new(config)?;
            self.tls = Some(Connection::Server(conn));
            self.complete_tls_handshake()?;
        }
        self.finish_open()
    }

    fn connect_tcp(&self, host: &str, port: u16) -> Result<TcpStream> {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        let addrs = (bare, port)
            .to_socket_addrs()
            .map_err(|e| Error::sys(format!("resolve {host}"), e))?;
        let timeout = self.timeout.max(MIN_OS_TIMEOUT);
        let mut last = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    vws_trace!(Level::Debug, "connect {} failed: {}", addr, e);
                    last = Some(e);
                }
            }
        }
        let source = last.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no addresses resolved")
        });
        Err(Error::sys(format!("connect {host}:{port}"), source))
    }

    /// Install the stream in blocking mode with OS-level timeouts, for the
    /// handshake phase.
    fn attach(&mut self, stream: TcpStream) -> Result<()> {
        let timeout = Some(self.timeout.max(MIN_OS_TIMEOUT));
        stream
            .set_nonblocking(false)
            .and_then(|_| stream.set_read_timeout(timeout))
            .and_then(|_| stream.set_write_timeout(timeout))
            .and_then(|_| stream.set_nodelay(true))
            .map_err(|e| Error::sys("configure socket", e))?;
        self.stream = Some(stream);
        Ok(())
    }

    fn complete_tls_handshake(&mut self) -> Result<()> {
        let (Some(stream), Some(conn)) = (self.stream.as_mut(), self.tls.as_mut()) else {
            return Ok(());
        };
        while conn.is_handshaking() {
            if let Err(e) = conn.complete_io(stream) {
                return Err(match e.kind() {
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                        Error::Timeout("tls handshake".to_string())
                    }
                    _ => Error::sys("tls handshake", e),
                });
            }
        }
        Ok(())
    }

    fn finish_open(&mut self) -> Result<()> {
        if !self.run_handshake_hook() {
            return Err(Error::Runtime("handshake rejected".to_string()));
        }
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| Error::Disconnected("closed during handshake".to_string()))?;
        stream
            .set_read_timeout(None)
            .and_then(|_| stream.set_write_timeout(None))
            .map_err(|e| Error::sys("configure socket", e))?;
        self.apply_nonblocking(true)?;
        self.state = State::Connected;
        Ok(())
    }

    fn run_handshake_hook(&mut self) -> bool {
        let mut hooks = std::mem::replace(&mut self.hooks, Box::new(NoHooks));
        let ok = hooks.handshake(self);
        self.hooks = hooks;
        ok
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.apply_nonblocking(nonblocking).map_err(Error::report)
    }

    fn apply_nonblocking(&self, nonblocking: bool) -> Result<()> {
        let stream = self.stream.as_ref().ok_or_else(not_connected)?;
        stream
            .set_nonblocking(nonblocking)
            .map_err(|e| Error::sys("set non-blocking", e))
    }

    fn raw_fd(&self) -> Result<RawFd> {
        self.stream
            .as_ref()
            .map(|s| s.as_raw_fd())
            .ok_or_else(not_connected)
    }

    /// Receive into the socket buffer. Returns the number of bytes added, or
    /// `Ok(0)` when the timeout expires with nothing received (the
    /// environment then holds `TIMEOUT`). A peer close or receive error runs
    /// the disconnect hook, closes the socket and returns the error.
    ///
    /// Buffer space is reserved before bytes are taken off the descriptor or
    /// out of the TLS session, so an allocation failure returns
    /// `Err(Memory)` with nothing consumed and the connection intact.
    pub fn read(&mut self) -> Result<usize> {
        let fd = match self.raw_fd() {
            Ok(fd) => fd,
            Err(e) => return Err(e.report()),
        };

        if let Some(conn) = self.tls.as_mut() {
            match drain_plaintext(conn, &mut self.buffer) {
                Ok((n, _)) if n > 0 => return Ok(n),
                Ok((_, true)) => {
                    let e = Error::Disconnected("connection closed by peer".to_string());
                    return Err(self.fail(e));
                }
                Ok(_) => {}
                Err(e) => return Err(self.fail(e)),
            }
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            if let Err(e) = wait_fd(fd, Interest::Read, deadline, "read") {
                return match e {
                    Error::Timeout(_) => {
                        env::submit_error(ErrorCode::TIMEOUT, e.to_string());
                        Ok(0)
                    }
                    e => Err(self.fail(e)),
                };
            }
            match self.recv_once() {
                Ok(Received::Data(n)) => return Ok(n),
                Ok(Received::Nothing) => {}
                Ok(Received::Closed) => {
                    let e = Error::Disconnected("connection closed by peer".to_string());
                    return Err(self.fail(e));
                }
                Err(e) => return Err(self.fail(e)),
            }
        }
    }

    fn recv_once(&mut self) -> Result<Received> {
        let stream = self.stream.as_mut().ok_or_else(not_connected)?;
        match self.tls.as_mut() {
            Some(conn) => recv_tls(stream, conn, &mut self.buffer),
            None => {
                self.buffer.reserve(RECV_CHUNK)?;
                let mut chunk = [0u8; RECV_CHUNK];
                match stream.read(&mut chunk) {
                    Ok(0) => Ok(Received::Closed),
                    Ok(n) => {
                        self.buffer.append(&chunk[..n])?;
                        Ok(Received::Data(n))
                    }
                    Err(e) if is_transient(&e) => Ok(Received::Nothing),
                    Err(e) => Err(Error::Recv(e)),
                }
            }
        }
    }

    /// Send `data`. In flush mode returns `data.len()` or an error. Without
    /// flush, one attempt is made and the count may be short; the caller must
    /// retry the remainder.
    ///
    /// Over TLS without flush, the count is what the session accepted, which
    /// may still sit in queued records after this returns. Those records only
    /// go out on a later `read` or `write`; a flush-mode `write(&[])` pushes
    /// them all.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        let fd = match self.raw_fd() {
            Ok(fd) => fd,
            Err(e) => return Err(e.report()),
        };
        let result = if self.tls.is_some() {
            self.send_tls(fd, data)
        } else {
            self.send_plain(fd, data)
        };
        match result {
            Ok(n) => Ok(n),
            Err(e @ Error::Timeout(_)) => Err(e.report()),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn send_plain(&mut self, fd: RawFd, data: &[u8]) -> Result<usize> {
        let deadline = Instant::now() + self.timeout;
        let stream = self.stream.as_mut().ok_or_else(not_connected)?;
        let mut sent = 0;
        while sent < data.len() {
            match stream.write(&data[sent..]) {
                Ok(0) => {
                    return Err(Error::Disconnected("peer stopped accepting data".to_string()))
                }
                Ok(n) => {
                    sent += n;
                    if !self.flush {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if is_transient(&e) => {
                    if !self.flush {
                        break;
                    }
                    wait_fd(fd, Interest::Write, deadline, "write")?;
                }
                Err(e) => return Err(Error::Send(e)),
            }
        }
        Ok(sent)
    }

    fn send_tls(&mut self, fd: RawFd, data: &[u8]) -> Result<usize> {
        let deadline = Instant::now() + self.timeout;
        let (Some(stream), Some(conn)) = (self.stream.as_mut(), self.tls.as_mut()) else {
            return Err(not_connected());
        };
        let mut accepted = 0;
        loop {
            if accepted < data.len() {
                accepted += conn.writer().write(&data[accepted..]).map_err(Error::Send)?;
            }
            if !conn.wants_write() {
                if accepted == data.len() {
                    return Ok(accepted);
                }
                continue;
            }
            match conn.write_tls(stream) {
                Ok(0) => {
                    return Err(Error::Disconnected("peer stopped accepting data".to_string()))
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if is_transient(&e) => {
                    if !self.flush {
                        return Ok(accepted);
                    }
                    wait_fd(fd, Interest::Write, deadline, "write")?;
                }
                Err(e) => return Err(Error::Send(e)),
            }
        }
    }

    /// Record `err`, run the disconnect hook, then close.
    fn fail(&mut self, err: Error) -> Error {
        // Allocation failures were recorded by the environment already.
        if matches!(err, Error::Memory(_)) {
            return err;
        }
        let err = err.report();
        vws_trace!(Level::Warn, "abnormal disconnect: {}", err);
        let mut hooks = std::mem::replace(&mut self.hooks, Box::new(NoHooks));
        hooks.disconnect(self);
        self.hooks = hooks;
        self.close();
        err
    }

    /// Close the connection. Idempotent. The TLS session goes first
    /// (best-effort close_notify), then the descriptor; the receive buffer is
    /// kept.
    pub fn close(&mut self) {
        let Some(mut stream) = self.stream.take() else {
            self.tls = None;
            return;
        };
        if let Some(mut conn) = self.tls.take() {
            conn.send_close_notify();
            while conn.wants_write() {
                match conn.write_tls(&mut stream) {
                    Ok(n) if n > 0 => {}
                    _ => break,
                }
            }
        }
        let _ = stream.shutdown(Shutdown::Both);
        self.state = State::Closed;
        vws_trace!(Level::Debug, "socket closed");
    }

    pub fn disconnect(&mut self) {
        self.close();
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

fn not_connected() -> Error {
    Error::Disconnected("socket is not connected".to_string())
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// Wait for readiness until `deadline`. Hangups count as ready so the next
/// I/O attempt observes the error.
fn wait_fd(fd: RawFd, interest: Interest, deadline: Instant, what: &str) -> Result<()> {
    // A spent deadline still polls once with zero wait.
    let remaining = deadline.saturating_duration_since(Instant::now());
    match sys::poll_fd(fd, interest, remaining) {
        Ok(Readiness::Ready) | Ok(Readiness::Hangup) => Ok(()),
        Ok(Readiness::TimedOut) => Err(Error::Timeout(format!("{what} timed out"))),
        Err(e) => Err(Error::sys("poll", e)),
    }
}

fn recv_tls(stream: &mut TcpStream, conn: &mut Connection, buffer: &mut Buffer) -> Result<Received> {
    let eof = match conn.read_tls(stream) {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) if is_transient(&e) => return Ok(Received::Nothing),
        Err(e) => return Err(Error::Recv(e)),
    };
    conn.process_new_packets()
        .map_err(|e| Error::Recv(io::Error::new(io::ErrorKind::InvalidData, e)))?;
    while conn.wants_write() {
        match conn.write_tls(stream) {
            Ok(_) => {}
            Err(e) if is_transient(&e) => break,
            Err(e) => return Err(Error::Send(e)),
        }
    }
    let (n, closed) = drain_plaintext(conn, buffer)?;
    if n > 0 {
        Ok(Received::Data(n))
    } else if eof || closed {
        Ok(Received::Closed)
    } else {
        Ok(Received::Nothing)
    }
}

/// Move decrypted bytes into `buffer`. Returns the count and whether the peer
/// sent close_notify.
fn drain_plaintext(conn: &mut Connection, buffer: &mut Buffer) -> Result<(usize, bool)> {
    let mut chunk = [0u8; RECV_CHUNK];
    let mut total = 0;
    loop {
        // Undelivered plaintext stays in the session if this fails.
        buffer.reserve(RECV_CHUNK)?;
        match conn.reader().read(&mut chunk) {
            Ok(0) => return Ok((total, true)),
            Ok(n) => {
                buffer.append(&chunk[..n])?;
                total += n;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok((total, false)),
            Err(_) if total > 0 => return Ok((total, false)),
            Err(e) => return Err(Error::Recv(e)),
        }
    }
}
