//! A client for sending metrics to a [StatsD][statsd]-compatible server over UDP or TCP.
//!
//! [statsd]: https://github.com/statsd/statsd/blob/master/docs/metric_types.md
//!
//! # Usage
//!
//! ```no_run
//! # use metrics_statsd_client::{MetricEvent, StatsdBuilder};
//! // First, create a builder, and configure the remote server and a prefix for all metric names.
//! let client = StatsdBuilder::default()
//!     .with_remote_address("127.0.0.1", 8125)
//!     .expect("invalid remote address")
//!     .with_prefix("my_app")
//!     .build_udp()
//!     .expect("failed to build client");
//!
//! // Metrics can be sent one at a time:
//! client.send(&MetricEvent::counting("requests", 1)).expect("failed to send metric");
//!
//! // Or batched up, and sent together as a single payload:
//! client.add(&MetricEvent::gauge("queue_depth", 12.0)).expect("invalid metric");
//! client.add(&MetricEvent::timing("request_time", 87).with_sample_rate(0.1)).expect("invalid metric");
//! client.flush().expect("failed to flush metrics");
//!
//! // Blocks of code can be timed directly:
//! let rows = client.time_and_send("db.query", 1.0, || 42).expect("failed to send timing");
//! # let _ = rows;
//! ```
//!
//! # Transports
//!
//! ## UDP
//!
//! Every send is a best-effort, fire-and-forget operation. Payloads larger than the configured maximum packet size are
//! split on line boundaries into multiple datagrams. A single line that is longer than the maximum packet size is sent
//! as-is, and may be truncated or dropped by the network.
//!
//! ## TCP
//!
//! A single connection is established lazily on the first send, and is reused for every send afterwards. If a write
//! fails, the connection is re-established and the write is retried immediately, up to the configured number of
//! attempts. Once all attempts are exhausted, the error returned carries the undelivered payload.
//!
//! # Batching
//!
//! When flushing a batch fails, the batch is kept intact, so that it can be flushed again later. Metrics added in the
//! meantime are queued up behind it.
//!
//! # Sampling
//!
//! Counting and timing metrics support a sample rate. When the sample rate is below 1, the client only emits the metric
//! with a probability equal to the sample rate, and tags the emitted line with the rate so that the server can scale
//! the value back up.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::float_cmp)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

mod batch;
pub use self::batch::CommandBatch;

mod builder;
pub use self::builder::{AddressSelection, BuildError, StatsdBuilder, Transport};

mod client;
pub use self::client::{ClientError, StatsdClient};

pub mod forwarder;
pub use self::forwarder::{
    tcp::{NoAvailableLocalPort, TcpSender},
    udp::UdpSender,
    DeliveryFailure, MetricsSender, SendError,
};

mod kind;
pub use self::kind::{MetricError, MetricEvent, MetricKind, MetricValue, ValueType};

mod sampling;
pub use self::sampling::{AlwaysSample, RandomSampler, Sampler};

mod writer;
pub use self::writer::{format_line, format_value, normalize_prefix, LineWriter};
