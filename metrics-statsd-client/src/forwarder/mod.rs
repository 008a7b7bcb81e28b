//! Delivery of encoded payloads to the remote server.

use std::{io, sync::Arc};

use thiserror::Error;

pub mod tcp;
pub mod udp;

/// Errors that could occur while delivering a payload.
#[derive(Debug, Error)]
pub enum SendError {
    /// The socket reported an error while sending a datagram.
    #[error("failed to send metrics: {0}")]
    Io(#[from] io::Error),

    /// Every delivery attempt failed.
    ///
    /// The undelivered payload is carried along so the caller can decide whether to retry or drop it.
    #[error("failed to send metrics after {attempts} attempt(s): {source}")]
    NotDelivered {
        /// The undelivered payload, decoded as text.
        metrics: String,

        /// Number of attempts made.
        attempts: usize,

        /// The failure of the last attempt.
        source: DeliveryFailure,
    },
}

impl SendError {
    /// Returns the undelivered payload, if this error carries one.
    pub fn undelivered_metrics(&self) -> Option<&str> {
        match self {
            SendError::Io(_) => None,
            SendError::NotDelivered { metrics, .. } => Some(metrics),
        }
    }
}

/// Classification of a single failed delivery attempt.
///
/// All classes are retried the same way; the distinction only exists for diagnostics.
#[derive(Debug, Error)]
pub enum DeliveryFailure {
    /// A plain I/O error.
    #[error("sending metrics via TCP failed with an I/O error: {0}")]
    Io(#[source] io::Error),

    /// A socket error carrying an OS-level error code.
    #[error("sending metrics via TCP failed with a socket error: {source}, code: {code}")]
    Socket {
        /// OS error code.
        code: i32,

        /// Underlying error.
        source: io::Error,
    },

    /// Any other failure.
    #[error("sending metrics via TCP failed with an unknown error: {0}")]
    Unclassified(String),
}

impl DeliveryFailure {
    /// Classifies an I/O error.
    ///
    /// Errors with an OS error code are socket errors, errors wrapping a custom payload are unclassified, and
    /// everything else is a plain I/O error.
    pub fn classify(e: io::Error) -> Self {
        if let Some(code) = e.raw_os_error() {
            DeliveryFailure::Socket { code, source: e }
        } else if e.get_ref().is_some() {
            DeliveryFailure::Unclassified(e.to_string())
        } else {
            DeliveryFailure::Io(e)
        }
    }
}

/// Delivers encoded payloads to a remote StatsD server.
///
/// A payload is one or more newline-terminated StatsD lines. Implementations apply their own policy for splitting,
/// retrying and reconnecting, and report failure only once that policy is exhausted.
pub trait MetricsSender: Send + Sync {
    /// Sends the given payload.
    ///
    /// # Errors
    ///
    /// If the payload could not be delivered, an error is returned.
    fn send(&self, payload: &[u8]) -> Result<(), SendError>;
}

impl<S> MetricsSender for Box<S>
where
    S: MetricsSender + ?Sized,
{
    fn send(&self, payload: &[u8]) -> Result<(), SendError> {
        (**self).send(payload)
    }
}

impl<S> MetricsSender for Arc<S>
where
    S: MetricsSender + ?Sized,
{
    fn send(&self, payload: &[u8]) -> Result<(), SendError> {
        (**self).send(payload)
    }
}
