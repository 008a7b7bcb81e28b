use std::{thread, time::Duration};

use metrics_statsd_client::{MetricEvent, StatsdBuilder, Transport};
use tracing::{info, warn};

fn main() {
    tracing_subscriber::fmt::init();

    let client = StatsdBuilder::default()
        .with_remote_address("localhost", 9125)
        .expect("failed to set remote address")
        .with_prefix("demo")
        .with_transport(Transport::Tcp)
        .with_retry_attempts(5)
        .expect("invalid retry attempts")
        .with_connect_timeout(Duration::from_secs(1))
        .with_write_timeout(Duration::from_secs(1))
        .build()
        .expect("failed to build StatsD client");

    let mut iteration: i64 = 0;
    loop {
        iteration += 1;
        client.add(&MetricEvent::counting("iterations", 1)).expect("invalid metric");
        client.add(&MetricEvent::histogram("iteration", iteration)).expect("invalid metric");
        client.add(&MetricEvent::set("workers", format!("worker-{}", iteration % 4))).expect("invalid metric");

        // A failed flush keeps the batch around, so it's simply retried on the next iteration.
        match client.flush() {
            Ok(()) => info!(iteration, "Flushed metrics."),
            Err(e) => warn!(error = %e, pending = client.pending().len(), "Failed to flush metrics."),
        }

        thread::sleep(Duration::from_secs(1));
    }
}
