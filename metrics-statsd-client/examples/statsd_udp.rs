use std::{thread, time::Duration};

use metrics_statsd_client::{MetricEvent, StatsdBuilder};
use rand::Rng as _;

fn main() {
    tracing_subscriber::fmt::init();

    let client = StatsdBuilder::default()
        .with_remote_address("localhost", 9125)
        .expect("failed to set remote address")
        .with_prefix("demo")
        .with_max_packet_size(256)
        .expect("invalid maximum packet size")
        .build_udp()
        .expect("failed to build StatsD client");

    client.send(&MetricEvent::counting("starts", 1)).expect("failed to send metric");

    let mut rng = rand::rng();

    // Loop over and over, pretending to do some work.
    loop {
        let work_ms = rng.random_range(1..50);
        client
            .time_and_add("loop_time", 0.5, || thread::sleep(Duration::from_millis(work_ms)))
            .expect("invalid timing metric");

        client.add(&MetricEvent::counting("loops", 1)).expect("invalid metric");
        client.add(&MetricEvent::gauge("queue_depth", rng.random_range(0.0..100.0))).expect("invalid metric");

        let delta = if rand::random_bool(0.75) { 1.0 } else { -1.0 };
        client.add(&MetricEvent::gauge("lucky_iterations", delta).as_delta()).expect("invalid metric");

        if client.pending().len() >= 32 {
            client.flush().expect("failed to flush metrics");
        }
    }
}
