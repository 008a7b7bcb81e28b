use std::{
    io,
    net::{Ipv4Addr, SocketAddr, ToSocketAddrs as _},
    time::Duration,
};

use quanta::Clock;
use thiserror::Error;
use tracing::debug;

use crate::{
    client::StatsdClient,
    forwarder::{
        tcp::{first_available_port, StdConnector, TcpSender},
        udp::UdpSender,
        MetricsSender,
    },
    sampling::{RandomSampler, Sampler},
};

const DEFAULT_REMOTE_HOST: &str = "127.0.0.1";
const DEFAULT_REMOTE_PORT: u16 = 8125;
const DEFAULT_MAX_PACKET_SIZE: usize = 512;
const DEFAULT_RETRY_ATTEMPTS: usize = 3;

// Largest payload that fits in a single IPv4 UDP datagram.
const MAX_UDP_PAYLOAD_LEN: usize = 65_507;

/// Errors that could occur while building a StatsD client.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The remote address is not valid, or could not be resolved.
    #[error("invalid remote address: {reason}")]
    InvalidRemoteAddress {
        /// Details about the failure.
        reason: String,
    },

    /// The remote host resolved only to non-IPv4 addresses.
    #[error("no IPv4 address found for host '{host}'")]
    NoIpv4Address {
        /// The host that was resolved.
        host: String,
    },

    /// The maximum packet size does not fit in a single UDP datagram.
    #[error("maximum packet size must be at most {MAX_UDP_PAYLOAD_LEN} bytes, got {0}")]
    InvalidMaxPacketSize(usize),

    /// The retry attempt count was zero.
    #[error("retry attempts must be at least 1")]
    InvalidRetryAttempts,

    /// None of the candidate local ports are available.
    #[error("none of the local ports {ports:?} are available")]
    NoAvailableLocalPort {
        /// The candidate ports.
        ports: Vec<u16>,
    },

    /// Failed to create the local socket.
    #[error("failed to create socket: {0}")]
    Io(#[from] io::Error),
}

/// How to pick an address when the remote host resolves to more than one IPv4 address.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum AddressSelection {
    /// Use the first address returned by the resolver.
    #[default]
    First,

    /// Use the last address returned by the resolver.
    Last,
}

/// Transport used to reach the remote server.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Transport {
    /// Connectionless, best-effort datagrams.
    #[default]
    Udp,

    /// A persistent stream connection, with reconnection and retries.
    Tcp,
}

/// Builder for a StatsD client.
#[derive(Debug)]
pub struct StatsdBuilder<R = RandomSampler> {
    host: String,
    port: u16,
    prefix: String,
    transport: Transport,
    address_selection: AddressSelection,
    max_packet_size: usize,
    reconnect: bool,
    retry_attempts: usize,
    local_ports: Vec<u16>,
    connect_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    sampler: R,
    clock: Option<Clock>,
}

impl<R> StatsdBuilder<R>
where
    R: Sampler,
{
    /// Set the remote host and port to send metrics to.
    ///
    /// The host can be either a literal IPv4 address or a host name. Host names are resolved when the client is built,
    /// and only IPv4 addresses are considered.
    ///
    /// Defaults to `127.0.0.1:8125`.
    ///
    /// # Errors
    ///
    /// If the host is empty, an error will be returned.
    pub fn with_remote_address<H>(mut self, host: H, port: u16) -> Result<Self, BuildError>
    where
        H: AsRef<str>,
    {
        let host = host.as_ref().trim();
        if host.is_empty() {
            return Err(BuildError::InvalidRemoteAddress { reason: "host must not be empty".to_string() });
        }

        self.host = host.to_string();
        self.port = port;
        Ok(self)
    }

    /// Set the prefix prepended to every metric name.
    ///
    /// A `.` is appended to a non-empty prefix unless it already ends with one.
    ///
    /// Defaults to no prefix.
    #[must_use]
    pub fn with_prefix<P>(mut self, prefix: P) -> Self
    where
        P: Into<String>,
    {
        self.prefix = prefix.into();
        self
    }

    /// Set the transport used by [`build`](StatsdBuilder::build).
    ///
    /// Defaults to [`Transport::Udp`].
    #[must_use]
    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    /// Set how to pick between multiple resolved addresses.
    ///
    /// Defaults to [`AddressSelection::First`].
    #[must_use]
    pub fn with_address_selection(mut self, selection: AddressSelection) -> Self {
        self.address_selection = selection;
        self
    }

    /// Set the maximum size of a single UDP packet.
    ///
    /// Payloads larger than this are split on line boundaries into multiple packets. A value of zero disables
    /// splitting. Only applies to UDP.
    ///
    /// Defaults to 512 bytes.
    ///
    /// # Errors
    ///
    /// If the size exceeds the largest possible UDP payload, an error will be returned.
    pub fn with_max_packet_size(mut self, max_packet_size: usize) -> Result<Self, BuildError> {
        if max_packet_size > MAX_UDP_PAYLOAD_LEN {
            return Err(BuildError::InvalidMaxPacketSize(max_packet_size));
        }

        self.max_packet_size = max_packet_size;
        Ok(self)
    }

    /// Sets whether or not to reconnect and retry when a send fails.
    ///
    /// When disabled, a failed send is reported after a single attempt. Only applies to TCP.
    ///
    /// Defaults to `true`.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Set the total number of attempts made for each send when reconnection is enabled.
    ///
    /// Attempts are retried immediately, without any delay. Only applies to TCP.
    ///
    /// Defaults to 3.
    ///
    /// # Errors
    ///
    /// If `retry_attempts` is zero, an error will be returned.
    pub fn with_retry_attempts(mut self, retry_attempts: usize) -> Result<Self, BuildError> {
        if retry_attempts == 0 {
            return Err(BuildError::InvalidRetryAttempts);
        }

        self.retry_attempts = retry_attempts;
        Ok(self)
    }

    /// Set the candidate local ports to connect from.
    ///
    /// Every connection, including reconnections, binds the first candidate that is available at that time. Only
    /// applies to TCP.
    ///
    /// Defaults to none, using an ephemeral port.
    #[must_use]
    pub fn with_local_ports<I>(mut self, ports: I) -> Self
    where
        I: IntoIterator<Item = u16>,
    {
        self.local_ports = ports.into_iter().collect();
        self
    }

    /// Set the connect timeout. Only applies to TCP.
    ///
    /// Defaults to no timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the write timeout.
    ///
    /// When the timeout is reached, the write fails. Over TCP, the failed write is retried like any other failure.
    ///
    /// Defaults to no timeout.
    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// Set the sampler consulted for metrics with a sample rate.
    ///
    /// Defaults to [`RandomSampler`].
    pub fn with_sampler<R2: Sampler>(self, sampler: R2) -> StatsdBuilder<R2> {
        StatsdBuilder {
            host: self.host,
            port: self.port,
            prefix: self.prefix,
            transport: self.transport,
            address_selection: self.address_selection,
            max_packet_size: self.max_packet_size,
            reconnect: self.reconnect,
            retry_attempts: self.retry_attempts,
            local_ports: self.local_ports,
            connect_timeout: self.connect_timeout,
            write_timeout: self.write_timeout,
            sampler,
            clock: self.clock,
        }
    }

    /// Set the clock used to time blocks of code.
    ///
    /// Defaults to the system clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Builds a client that sends over UDP.
    ///
    /// # Errors
    ///
    /// If the remote host cannot be resolved, or the local socket cannot be created, an error will be returned.
    pub fn build_udp(self) -> Result<StatsdClient<UdpSender, R>, BuildError> {
        let sender = self.udp_sender()?;
        Ok(self.into_client(sender))
    }

    /// Builds a client that sends over TCP.
    ///
    /// No connection is made until the first metric is sent.
    ///
    /// # Errors
    ///
    /// If the remote host cannot be resolved, or none of the candidate local ports are available, an error will be
    /// returned.
    pub fn build_tcp(self) -> Result<StatsdClient<TcpSender, R>, BuildError> {
        let sender = self.tcp_sender()?;
        Ok(self.into_client(sender))
    }

    /// Builds a client using the configured transport.
    ///
    /// # Errors
    ///
    /// See [`build_udp`](StatsdBuilder::build_udp) and [`build_tcp`](StatsdBuilder::build_tcp).
    pub fn build(self) -> Result<StatsdClient<Box<dyn MetricsSender>, R>, BuildError> {
        let sender: Box<dyn MetricsSender> = match self.transport {
            Transport::Udp => Box::new(self.udp_sender()?),
            Transport::Tcp => Box::new(self.tcp_sender()?),
        };

        Ok(self.into_client(sender))
    }

    fn udp_sender(&self) -> Result<UdpSender, BuildError> {
        let remote_addr = resolve_ipv4(&self.host, self.port, self.address_selection)?;
        let sender = UdpSender::new(remote_addr, self.max_packet_size)?.with_write_timeout(self.write_timeout)?;
        debug!(%remote_addr, max_packet_size = self.max_packet_size, "Built UDP sender.");

        Ok(sender)
    }

    fn tcp_sender(&self) -> Result<TcpSender, BuildError> {
        let remote_addr = resolve_ipv4(&self.host, self.port, self.address_selection)?;
        if !self.local_ports.is_empty() && first_available_port(&self.local_ports).is_none() {
            return Err(BuildError::NoAvailableLocalPort { ports: self.local_ports.clone() });
        }

        let connector = StdConnector::new(remote_addr)
            .with_local_ports(self.local_ports.clone())
            .with_connect_timeout(self.connect_timeout)
            .with_write_timeout(self.write_timeout);
        debug!(%remote_addr, reconnect = self.reconnect, retry_attempts = self.retry_attempts, "Built TCP sender.");

        Ok(TcpSender::new(connector, self.reconnect, self.retry_attempts))
    }

    fn into_client<S: MetricsSender>(self, sender: S) -> StatsdClient<S, R> {
        let client = StatsdClient::new(sender, &self.prefix).with_sampler(self.sampler);
        match self.clock {
            Some(clock) => client.with_clock(clock),
            None => client,
        }
    }
}

impl Default for StatsdBuilder {
    fn default() -> Self {
        StatsdBuilder {
            host: DEFAULT_REMOTE_HOST.to_string(),
            port: DEFAULT_REMOTE_PORT,
            prefix: String::new(),
            transport: Transport::Udp,
            address_selection: AddressSelection::First,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            reconnect: true,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            local_ports: Vec::new(),
            connect_timeout: None,
            write_timeout: None,
            sampler: RandomSampler,
            clock: None,
        }
    }
}

/// Resolves `host` to a single IPv4 socket address.
///
/// Literal IPv4 addresses are used as-is. Otherwise, the host is resolved and one of its IPv4 addresses is picked
/// according to `selection`.
fn resolve_ipv4(host: &str, port: u16, selection: AddressSelection) -> Result<SocketAddr, BuildError> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(SocketAddr::from((ip, port)));
    }

    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| BuildError::InvalidRemoteAddress { reason: format!("failed to resolve '{host}': {e}") })?;

    select_address(addrs, selection).ok_or_else(|| BuildError::NoIpv4Address { host: host.to_string() })
}

fn select_address<I>(addrs: I, selection: AddressSelection) -> Option<SocketAddr>
where
    I: IntoIterator<Item = SocketAddr>,
{
    let mut ipv4_addrs = addrs.into_iter().filter(SocketAddr::is_ipv4);
    match selection {
        AddressSelection::First => ipv4_addrs.next(),
        AddressSelection::Last => ipv4_addrs.last(),
    }
}
