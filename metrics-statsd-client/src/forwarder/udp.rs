//! UDP transport.

use std::{
    io,
    net::{Ipv4Addr, SocketAddr, UdpSocket},
    time::Duration,
};

use tracing::{trace, warn};

use super::{MetricsSender, SendError};

/// Sends payloads as UDP datagrams, splitting oversized payloads on line boundaries.
///
/// Every send is independent and best-effort: there is no connection state and nothing is retried.
pub struct UdpSender {
    socket: UdpSocket,
    remote_addr: SocketAddr,
    max_packet_size: usize,
}

impl UdpSender {
    /// Creates a new `UdpSender` targeting the given remote address.
    ///
    /// A `max_packet_size` of zero disables splitting.
    ///
    /// # Errors
    ///
    /// If the local socket cannot be bound, an error is returned.
    pub fn new(remote_addr: SocketAddr, max_packet_size: usize) -> io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        Ok(UdpSender { socket, remote_addr, max_packet_size })
    }

    /// Sets the write timeout of the underlying socket.
    ///
    /// # Errors
    ///
    /// If the timeout cannot be applied to the socket, an error is returned.
    pub fn with_write_timeout(self, timeout: Option<Duration>) -> io::Result<Self> {
        self.socket.set_write_timeout(timeout)?;
        Ok(self)
    }

    /// Returns the remote address datagrams are sent to.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Returns the maximum packet size, or zero if unlimited.
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }
}

impl MetricsSender for UdpSender {
    fn send(&self, payload: &[u8]) -> Result<(), SendError> {
        split_on_newlines(payload, self.max_packet_size, &mut |datagram| {
            trace!(datagram_len = datagram.len(), remote_addr = %self.remote_addr, "Sending datagram.");
            self.socket.send_to(datagram, self.remote_addr).map(|_| ())
        })
        .map_err(SendError::Io)
    }
}

/// Splits `payload` into datagrams no larger than `max_packet_size`, handing each one to `send` in order.
///
/// When the payload is too large, we search backwards from `max_packet_size` for a newline, and split the payload
/// around it: everything before the newline, and everything after it. Each half is then split again as needed. The
/// newline at a split point is not sent, since each datagram is implicitly terminated.
///
/// If there is no newline to split on, the payload is handed over as-is, even though it is oversized. The network may
/// silently truncate or drop it, which we accept over failing the caller.
///
/// A `max_packet_size` of zero disables splitting.
///
/// # Errors
///
/// The first error returned by `send` stops splitting and is returned.
pub fn split_on_newlines<F>(payload: &[u8], max_packet_size: usize, send: &mut F) -> io::Result<()>
where
    F: FnMut(&[u8]) -> io::Result<()>,
{
    if max_packet_size == 0 || payload.len() <= max_packet_size {
        return send(payload);
    }

    // Index zero is never a split point: it would leave an empty first half.
    let maybe_split = payload[1..=max_packet_size].iter().rposition(|b| *b == b'\n').map(|idx| idx + 1);
    match maybe_split {
        Some(idx) => {
            split_on_newlines(&payload[..idx], max_packet_size, send)?;

            let remaining = &payload[idx + 1..];
            if !remaining.is_empty() {
                split_on_newlines(remaining, max_packet_size, send)?;
            }

            Ok(())
        }
        None => {
            warn!(
                payload_len = payload.len(),
                max_packet_size, "Oversized payload has no line boundary to split on. Sending as-is."
            );
            send(payload)
        }
    }
}
