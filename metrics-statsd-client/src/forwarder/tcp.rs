//! TCP transport.

use std::{
    io::{self, Write as _},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use thiserror::Error;
use tracing::{debug, error, trace};

use super::{DeliveryFailure, MetricsSender, SendError};

/// None of the candidate local ports could be bound.
#[derive(Debug, Error)]
#[error("none of the local ports {ports:?} are available for connecting over TCP")]
pub struct NoAvailableLocalPort {
    /// The candidate ports that were tried.
    pub ports: Vec<u16>,
}

/// A connected byte stream to the remote server.
///
/// Streams are shared between concurrent senders, so all operations take `&self`.
pub trait Stream: Send + Sync {
    /// Writes the entire payload to the stream.
    ///
    /// # Errors
    ///
    /// If the payload could not be written in full, an error is returned and the stream should consider itself
    /// broken.
    fn write_payload(&self, payload: &[u8]) -> io::Result<()>;

    /// Returns `true` if the stream is still believed to be usable.
    fn is_connected(&self) -> bool;

    /// Releases the stream.
    ///
    /// Must be idempotent.
    fn close(&self);
}

/// Establishes new streams to the remote server.
pub trait Connector: Send + Sync {
    /// Stream type produced by this connector.
    type Stream: Stream;

    /// Opens a new stream.
    ///
    /// # Errors
    ///
    /// If the connection cannot be established, an error is returned.
    fn connect(&self) -> io::Result<Self::Stream>;
}

/// Connector for plain TCP streams.
#[derive(Clone, Debug)]
pub struct StdConnector {
    remote_addr: SocketAddr,
    local_ports: Vec<u16>,
    connect_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl StdConnector {
    /// Creates a new `StdConnector` for the given remote address, using an ephemeral local port.
    pub fn new(remote_addr: SocketAddr) -> Self {
        StdConnector { remote_addr, local_ports: Vec::new(), connect_timeout: None, write_timeout: None }
    }

    /// Sets the candidate local ports.
    ///
    /// When connecting, the first candidate that can be bound is used.
    #[must_use]
    pub fn with_local_ports(mut self, local_ports: Vec<u16>) -> Self {
        self.local_ports = local_ports;
        self
    }

    /// Sets the connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the write timeout applied to every new stream.
    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Returns the remote address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn bind_local_port(&self, socket: &Socket) -> io::Result<()> {
        let local_ip = unspecified_for(&self.remote_addr);
        for port in &self.local_ports {
            let local_addr = SockAddr::from(SocketAddr::new(local_ip, *port));
            match socket.bind(&local_addr) {
                Ok(()) => {
                    trace!(local_port = port, "Bound local port.");
                    return Ok(());
                }
                Err(e) => trace!(local_port = port, error = %e, "Local port unavailable."),
            }
        }

        Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            NoAvailableLocalPort { ports: self.local_ports.clone() },
        ))
    }
}

impl Connector for StdConnector {
    type Stream = StdStream;

    fn connect(&self) -> io::Result<StdStream> {
        let socket = Socket::new(Domain::for_address(self.remote_addr), Type::STREAM, Some(Protocol::TCP))?;
        if !self.local_ports.is_empty() {
            // The previous connection on the same port may still be lingering in TIME_WAIT.
            socket.set_reuse_address(true)?;
            self.bind_local_port(&socket)?;
        }

        let remote_addr = SockAddr::from(self.remote_addr);
        match self.connect_timeout {
            Some(timeout) => socket.connect_timeout(&remote_addr, timeout)?,
            None => socket.connect(&remote_addr)?,
        }

        let stream = TcpStream::from(socket);
        stream.set_nodelay(true)?;
        stream.set_write_timeout(self.write_timeout)?;

        debug!(remote_addr = %self.remote_addr, local_addr = ?stream.local_addr().ok(), "Connected.");
        Ok(StdStream::new(stream))
    }
}

/// A plain TCP stream.
#[derive(Debug)]
pub struct StdStream {
    stream: TcpStream,
    broken: AtomicBool,
    closed: AtomicBool,
}

impl StdStream {
    fn new(stream: TcpStream) -> Self {
        StdStream { stream, broken: AtomicBool::new(false), closed: AtomicBool::new(false) }
    }
}

impl Stream for StdStream {
    fn write_payload(&self, payload: &[u8]) -> io::Result<()> {
        let result = (&self.stream).write_all(payload);
        if result.is_err() {
            self.broken.store(true, Ordering::Release);
        }
        result
    }

    fn is_connected(&self) -> bool {
        if self.closed.load(Ordering::Acquire) || self.broken.load(Ordering::Acquire) {
            return false;
        }

        // Any asynchronous error reported by the socket means the connection is gone.
        if !matches!(self.stream.take_error(), Ok(None)) {
            return false;
        }

        if peer_closed(&self.stream) {
            self.broken.store(true, Ordering::Release);
            return false;
        }

        true
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        // The peer may already be gone, in which case there's nothing left to shut down.
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Sends payloads over a single TCP connection, reconnecting and retrying as needed.
///
/// The connection is established lazily on the first send. Before each write, the connection's liveness is checked,
/// and a broken connection is closed and replaced. Connecting and reconnecting happen under a lock, with the
/// connection state checked both before and after acquiring it, so that only one of several racing senders actually
/// reconnects. Writes on a healthy connection do not take the lock.
///
/// When a write fails, it is retried immediately, without any delay, until the retry budget is spent. With
/// reconnection enabled, `retry_attempts` is the total number of attempts; otherwise only one attempt is made.
pub struct TcpSender<C: Connector = StdConnector> {
    connector: C,
    reconnect: bool,
    retry_attempts: usize,
    client_lock: Mutex<()>,
    connection: RwLock<Option<Arc<C::Stream>>>,
}

impl<C: Connector> TcpSender<C> {
    /// Creates a new `TcpSender`.
    ///
    /// A `retry_attempts` of zero is treated as one.
    pub fn new(connector: C, reconnect: bool, retry_attempts: usize) -> Self {
        TcpSender {
            connector,
            reconnect,
            retry_attempts: retry_attempts.max(1),
            client_lock: Mutex::new(()),
            connection: RwLock::new(None),
        }
    }

    /// Returns the connector.
    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Returns `true` if a live connection is currently held.
    pub fn is_connected(&self) -> bool {
        self.current().is_some_and(|stream| stream.is_connected())
    }

    /// Closes the current connection, if any.
    ///
    /// Calling this more than once is a no-op. A later send will connect again.
    pub fn close(&self) {
        let maybe_stream = self.connection.write().take();
        if let Some(stream) = maybe_stream {
            stream.close();
        }
    }

    fn current(&self) -> Option<Arc<C::Stream>> {
        self.connection.read().clone()
    }

    fn connect(&self) -> Result<Arc<C::Stream>, DeliveryFailure> {
        let stream = Arc::new(self.connector.connect().map_err(DeliveryFailure::classify)?);
        *self.connection.write() = Some(Arc::clone(&stream));
        Ok(stream)
    }

    fn ensure_connected(&self) -> Result<Arc<C::Stream>, DeliveryFailure> {
        if let Some(stream) = self.current() {
            if stream.is_connected() {
                return Ok(stream);
            }
        }

        let _guard = self.client_lock.lock();

        // Another sender may have (re)connected while we were waiting on the lock.
        match self.current() {
            None => {
                debug!("Initializing connection.");
                self.connect()
            }
            Some(stream) if !stream.is_connected() => {
                debug!("Connection broken. Restoring connection.");
                stream.close();
                self.connect()
            }
            Some(stream) => Ok(stream),
        }
    }

    fn try_send(&self, payload: &[u8]) -> Result<(), DeliveryFailure> {
        let stream = self.ensure_connected()?;
        trace!(payload_len = payload.len(), "Writing payload.");
        stream.write_payload(payload).map_err(DeliveryFailure::classify)
    }
}

impl<C: Connector> MetricsSender for TcpSender<C> {
    fn send(&self, payload: &[u8]) -> Result<(), SendError> {
        let mut attempts_left = if self.reconnect { self.retry_attempts - 1 } else { 0 };
        let mut attempts = 0;

        loop {
            attempts += 1;
            let failure = match self.try_send(payload) {
                Ok(()) => return Ok(()),
                Err(failure) => failure,
            };

            if attempts_left == 0 {
                error!(error = %failure, attempts, "Failed to write to metrics server.");
                return Err(SendError::NotDelivered {
                    metrics: String::from_utf8_lossy(payload).into_owned(),
                    attempts,
                    source: failure,
                });
            }

            debug!(error = %failure, attempts_left, "Failed to send payload. Retrying.");
            attempts_left -= 1;
        }
    }
}

impl<C: Connector> Drop for TcpSender<C> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Returns the first of the given local ports that can currently be bound, if any.
pub(crate) fn first_available_port(ports: &[u16]) -> Option<u16> {
    ports.iter().copied().find(|port| TcpListener::bind((Ipv4Addr::UNSPECIFIED, *port)).is_ok())
}

/// Returns `true` if the peer has closed its side of the connection.
///
/// The server never writes to us, so a readable socket with nothing to read means we've received a FIN. The check
/// peeks without blocking, leaving the socket itself in blocking mode for concurrent writers.
#[cfg(unix)]
fn peer_closed(stream: &TcpStream) -> bool {
    use std::mem::MaybeUninit;

    use socket2::SockRef;

    let socket = SockRef::from(stream);
    let mut buf = [MaybeUninit::<u8>::uninit(); 1];
    match socket.recv_with_flags(&mut buf, libc::MSG_PEEK | libc::MSG_DONTWAIT) {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) => !matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted),
    }
}

#[cfg(not(unix))]
fn peer_closed(_stream: &TcpStream) -> bool {
    false
}

fn unspecified_for(addr: &SocketAddr) -> IpAddr {
    match addr {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}
