use std::fmt;

use quanta::Clock;
use thiserror::Error;
use tracing::warn;

use crate::{
    batch::CommandBatch,
    forwarder::{MetricsSender, SendError},
    kind::{MetricError, MetricEvent},
    sampling::{RandomSampler, Sampler},
    writer::LineWriter,
};

/// Errors that could occur while emitting a metric.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The metric event is not legal for its kind.
    #[error(transparent)]
    InvalidMetric(#[from] MetricError),

    /// The metric could not be delivered.
    #[error(transparent)]
    Send(#[from] SendError),
}

/// A StatsD client.
///
/// Metrics can either be sent immediately, or added to a batch which is sent as a single payload when
/// [`flush`](StatsdClient::flush) is called. All methods take `&self`, so a client can be shared between threads, for
/// example behind an `Arc`.
///
/// Events for kinds which support a sample rate (counting and timing) are subject to sampling: when their sample rate
/// is below 1, the sampler decides whether the event is emitted at all. Events that are sampled out are dropped
/// silently.
pub struct StatsdClient<S, R = RandomSampler> {
    writer: LineWriter,
    batch: CommandBatch,
    sender: S,
    sampler: R,
    clock: Clock,
}

impl<S> StatsdClient<S>
where
    S: MetricsSender,
{
    /// Creates a new `StatsdClient` which sends through the given sender, prefixing every metric name with `prefix`.
    pub fn new(sender: S, prefix: &str) -> Self {
        StatsdClient {
            writer: LineWriter::new(prefix),
            batch: CommandBatch::new(),
            sender,
            sampler: RandomSampler,
            clock: Clock::new(),
        }
    }
}

impl<S, R> StatsdClient<S, R>
where
    S: MetricsSender,
    R: Sampler,
{
    /// Replaces the sampler.
    pub fn with_sampler<R2: Sampler>(self, sampler: R2) -> StatsdClient<S, R2> {
        StatsdClient { writer: self.writer, batch: self.batch, sender: self.sender, sampler, clock: self.clock }
    }

    /// Replaces the clock used to time blocks of code.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Returns the normalized prefix.
    pub fn prefix(&self) -> &str {
        self.writer.prefix()
    }

    /// Returns a reference to the underlying sender.
    pub fn sender(&self) -> &S {
        &self.sender
    }

    /// Returns a copy of the lines currently waiting to be flushed, in insertion order.
    pub fn pending(&self) -> Vec<String> {
        self.batch.snapshot()
    }

    /// Adds a metric to the batch.
    ///
    /// Nothing is sent until [`flush`](StatsdClient::flush) is called.
    ///
    /// # Errors
    ///
    /// If the event is not legal for its kind, an error is returned and nothing is added.
    pub fn add(&self, event: &MetricEvent) -> Result<(), MetricError> {
        event.validate()?;
        if self.sampled_out(event) {
            return Ok(());
        }

        self.batch.add(self.writer.write(event));
        Ok(())
    }

    /// Sends a single metric immediately.
    ///
    /// Only this metric is sent. The batch is left untouched.
    ///
    /// # Errors
    ///
    /// If the event is not legal for its kind, or it could not be delivered, an error is returned.
    pub fn send(&self, event: &MetricEvent) -> Result<(), ClientError> {
        event.validate()?;
        if self.sampled_out(event) {
            return Ok(());
        }

        let line = self.writer.write(event);
        self.sender.send(line.as_bytes())?;
        Ok(())
    }

    /// Sends every metric in the batch as a single payload.
    ///
    /// On success, the batch is left empty. If the batch is already empty, nothing is sent.
    ///
    /// # Errors
    ///
    /// If the payload could not be delivered, an error is returned and the batch keeps its metrics, ahead of any
    /// metrics added while the flush was in progress, so that the flush can be retried later.
    pub fn flush(&self) -> Result<(), SendError> {
        let lines = self.batch.take();
        if lines.is_empty() {
            return Ok(());
        }

        let payload = lines.concat();
        if let Err(e) = self.sender.send(payload.as_bytes()) {
            self.batch.restore(lines);
            return Err(e);
        }

        Ok(())
    }

    /// Runs `f`, and immediately sends a timing metric named `stat` with the elapsed time in milliseconds.
    ///
    /// The timing metric is emitted even if `f` panics, in which case any failure to send it is logged rather than
    /// returned.
    ///
    /// # Errors
    ///
    /// If `sample_rate` is not in the range `[0, 1]`, an error is returned before `f` is called. If the timing metric
    /// could not be delivered, an error is returned and the output of `f` is discarded.
    pub fn time_and_send<F, T>(&self, stat: &str, sample_rate: f64, f: F) -> Result<T, ClientError>
    where
        F: FnOnce() -> T,
    {
        self.time(stat, sample_rate, Self::send, f)
    }

    /// Runs `f`, and adds a timing metric named `stat` with the elapsed time in milliseconds to the batch.
    ///
    /// The timing metric is added even if `f` panics.
    ///
    /// # Errors
    ///
    /// If `sample_rate` is not in the range `[0, 1]`, an error is returned before `f` is called.
    pub fn time_and_add<F, T>(&self, stat: &str, sample_rate: f64, f: F) -> Result<T, MetricError>
    where
        F: FnOnce() -> T,
    {
        self.time(stat, sample_rate, Self::add, f)
    }

    fn time<F, T, E>(&self, stat: &str, sample_rate: f64, emit: EmitFn<Self, E>, f: F) -> Result<T, E>
    where
        F: FnOnce() -> T,
        E: From<MetricError> + fmt::Display,
    {
        MetricEvent::timing(stat, 0).with_sample_rate(sample_rate).validate()?;

        let mut guard = TimingGuard {
            client: self,
            clock: &self.clock,
            stat,
            sample_rate,
            emit,
            start: self.clock.now(),
            armed: true,
        };
        let output = f();
        guard.armed = false;

        guard.emit()?;
        Ok(output)
    }

    fn sampled_out(&self, event: &MetricEvent) -> bool {
        event.is_sampled() && !self.sampler.should_send(event.sample_rate())
    }
}

type EmitFn<C, E> = fn(&C, &MetricEvent) -> Result<(), E>;

/// Emits a timing metric for a block of code, from `Drop` if the block unwinds.
struct TimingGuard<'a, C, E: fmt::Display> {
    client: &'a C,
    clock: &'a Clock,
    stat: &'a str,
    sample_rate: f64,
    emit: EmitFn<C, E>,
    start: quanta::Instant,
    armed: bool,
}

impl<C, E: fmt::Display> TimingGuard<'_, C, E> {
    fn emit(&self) -> Result<(), E> {
        let elapsed = self.clock.now().saturating_duration_since(self.start);
        let millis = i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX);
        let event = MetricEvent::timing(self.stat, millis).with_sample_rate(self.sample_rate);
        (self.emit)(self.client, &event)
    }
}

impl<C, E: fmt::Display> Drop for TimingGuard<'_, C, E> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        if let Err(e) = self.emit() {
            warn!(stat = self.stat, error = %e, "Failed to emit timing metric for panicking block.");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        panic::{self, AssertUnwindSafe},
        time::Duration,
    };

    use mockall::{mock, predicate::eq, Sequence};
    use quanta::Clock;

    use super::{ClientError, StatsdClient};
    use crate::{
        forwarder::{DeliveryFailure, MetricsSender, SendError},
        kind::{MetricError, MetricEvent, MetricKind},
        sampling::{AlwaysSample, Sampler},
    };

    mock! {
        pub Sender {}

        impl MetricsSender for Sender {
            fn send(&self, payload: &[u8]) -> Result<(), SendError>;
        }
    }

    mock! {
        pub TestSampler {}

        impl Sampler for TestSampler {
            fn should_send(&self, sample_rate: f64) -> bool;
        }
    }

    fn not_delivered(payload: &[u8]) -> SendError {
        SendError::NotDelivered {
            metrics: String::from_utf8_lossy(payload).into_owned(),
            attempts: 3,
            source: DeliveryFailure::Unclassified("connection refused".to_string()),
        }
    }

    fn expect_payload(sender: &mut MockSender, expected: &'static str) {
        sender.expect_send().withf(move |payload| payload == expected.as_bytes()).times(1).returning(|_| Ok(()));
    }

    #[test]
    fn send_immediately() {
        let mut sender = MockSender::new();
        expect_payload(&mut sender, "app.hits:1|c\n");

        let client = StatsdClient::new(sender, "app").with_sampler(AlwaysSample);
        client.send(&MetricEvent::counting("hits", 1)).unwrap();
    }

    #[test]
    fn send_leaves_batch_untouched() {
        let mut sender = MockSender::new();
        expect_payload(&mut sender, "app.latency:12|ms\n");

        let client = StatsdClient::new(sender, "app").with_sampler(AlwaysSample);
        client.add(&MetricEvent::counting("hits", 1)).unwrap();
        client.send(&MetricEvent::timing("latency", 12)).unwrap();

        assert_eq!(client.pending(), vec!["app.hits:1|c\n"]);
    }

    #[test]
    fn flush_sends_batch_as_single_payload() {
        let mut sender = MockSender::new();
        expect_payload(&mut sender, "app.hits:1|c\napp.temp:+2.000000000000000|g\napp.users:bob|s\n");

        let client = StatsdClient::new(sender, "app").with_sampler(AlwaysSample);
        client.add(&MetricEvent::counting("hits", 1)).unwrap();
        client.add(&MetricEvent::gauge("temp", 2.0).as_delta()).unwrap();
        client.add(&MetricEvent::set("users", "bob")).unwrap();

        client.flush().unwrap();
        assert!(client.pending().is_empty());
    }

    #[test]
    fn empty_flush_sends_nothing() {
        let mut sender = MockSender::new();
        sender.expect_send().never();

        let client = StatsdClient::new(sender, "app");
        client.flush().unwrap();
    }

    #[test]
    fn failed_flush_keeps_batch() {
        let mut seq = Sequence::new();
        let mut sender = MockSender::new();
        sender.expect_send().times(1).in_sequence(&mut seq).returning(|payload| Err(not_delivered(payload)));
        sender
            .expect_send()
            .withf(|payload| payload == b"app.a:1|c\napp.b:2|c\napp.c:3|c\n")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let client = StatsdClient::new(sender, "app").with_sampler(AlwaysSample);
        client.add(&MetricEvent::counting("a", 1)).unwrap();
        client.add(&MetricEvent::counting("b", 2)).unwrap();

        let err = client.flush().unwrap_err();
        assert_eq!(err.undelivered_metrics(), Some("app.a:1|c\napp.b:2|c\n"));
        assert_eq!(client.pending(), vec!["app.a:1|c\n", "app.b:2|c\n"]);

        // Metrics added after the failure queue up behind the restored ones.
        client.add(&MetricEvent::counting("c", 3)).unwrap();
        client.flush().unwrap();
        assert!(client.pending().is_empty());
    }

    #[test]
    fn sampled_out_events_are_dropped() {
        let mut sender = MockSender::new();
        sender.expect_send().never();

        let mut sampler = MockTestSampler::new();
        sampler.expect_should_send().with(eq(0.1)).times(2).return_const(false);

        let client = StatsdClient::new(sender, "app").with_sampler(sampler);
        client.send(&MetricEvent::counting("hits", 1).with_sample_rate(0.1)).unwrap();
        client.add(&MetricEvent::counting("hits", 1).with_sample_rate(0.1)).unwrap();

        assert!(client.pending().is_empty());
    }

    #[test]
    fn sampled_in_events_carry_rate() {
        let mut sender = MockSender::new();
        expect_payload(&mut sender, "app.hits:1|c|@0.5\n");

        let mut sampler = MockTestSampler::new();
        sampler.expect_should_send().with(eq(0.5)).times(1).return_const(true);

        let client = StatsdClient::new(sender, "app").with_sampler(sampler);
        client.send(&MetricEvent::counting("hits", 1).with_sample_rate(0.5)).unwrap();
    }

    #[test]
    fn unsampled_events_skip_sampler() {
        let mut sender = MockSender::new();
        sender.expect_send().times(2).returning(|_| Ok(()));

        let mut sampler = MockTestSampler::new();
        sampler.expect_should_send().never();

        let client = StatsdClient::new(sender, "").with_sampler(sampler);
        client.send(&MetricEvent::counting("hits", 1)).unwrap();
        client.send(&MetricEvent::gauge("temp", 1.0)).unwrap();
    }

    #[test]
    fn invalid_events_are_rejected() {
        let mut sender = MockSender::new();
        sender.expect_send().never();

        let client = StatsdClient::new(sender, "app");

        let err = client.send(&MetricEvent::gauge("temp", 1.0).with_sample_rate(0.5)).unwrap_err();
        assert!(matches!(
            err,
            ClientError::InvalidMetric(MetricError::SampleRateNotSupported { kind: MetricKind::Gauge })
        ));

        let err = client.add(&MetricEvent::counting("hits", 1).as_delta()).unwrap_err();
        assert_eq!(err, MetricError::DeltaNotSupported { kind: MetricKind::Counting });
        assert!(client.pending().is_empty());
    }

    #[test]
    fn non_finite_gauges_are_rejected() {
        let mut sender = MockSender::new();
        sender.expect_send().never();

        let client = StatsdClient::new(sender, "app");
        let err = client.send(&MetricEvent::gauge("temp", f64::NAN)).unwrap_err();
        assert!(matches!(
            err,
            ClientError::InvalidMetric(MetricError::NonFiniteValue { kind: MetricKind::Gauge })
        ));

        let err = client.add(&MetricEvent::gauge("temp", f64::INFINITY).as_delta()).unwrap_err();
        assert_eq!(err, MetricError::NonFiniteValue { kind: MetricKind::Gauge });
        assert!(client.pending().is_empty());
    }

    #[test]
    fn send_failure_propagates() {
        let mut sender = MockSender::new();
        sender.expect_send().times(1).returning(|payload| Err(not_delivered(payload)));

        let client = StatsdClient::new(sender, "app");
        let err = client.send(&MetricEvent::counting("hits", 1)).unwrap_err();
        match err {
            ClientError::Send(e) => assert_eq!(e.undelivered_metrics(), Some("app.hits:1|c\n")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn time_and_send_measures_block() {
        let (clock, mock) = Clock::mock();

        let mut sender = MockSender::new();
        expect_payload(&mut sender, "app.work:250|ms\n");

        let client = StatsdClient::new(sender, "app").with_clock(clock);
        let output = client
            .time_and_send("work", 1.0, || {
                mock.increment(Duration::from_millis(250));
                42
            })
            .unwrap();

        assert_eq!(output, 42);
    }

    #[test]
    fn time_and_add_consults_sampler_once() {
        let (clock, mock) = Clock::mock();

        let mut sampler = MockTestSampler::new();
        sampler.expect_should_send().with(eq(0.25)).times(1).return_const(true);

        let client = StatsdClient::new(MockSender::new(), "app").with_clock(clock).with_sampler(sampler);
        let output = client
            .time_and_add("work", 0.25, || {
                mock.increment(Duration::from_millis(7));
                "done"
            })
            .unwrap();

        assert_eq!(output, "done");
        assert_eq!(client.pending(), vec!["app.work:7|ms|@0.25\n"]);
    }

    #[test]
    fn time_and_send_rejects_invalid_rate_before_running() {
        let client = StatsdClient::new(MockSender::new(), "app");

        let mut ran = false;
        let err = client.time_and_send("work", 1.5, || ran = true).unwrap_err();

        assert!(!ran);
        assert!(matches!(err, ClientError::InvalidMetric(MetricError::InvalidSampleRate { .. })));
    }

    #[test]
    fn timing_is_emitted_when_block_panics() {
        let (clock, mock) = Clock::mock();

        let client = StatsdClient::new(MockSender::new(), "app").with_clock(clock).with_sampler(AlwaysSample);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            client.time_and_add("work", 1.0, || {
                mock.increment(Duration::from_millis(30));
                panic!("block failed");
            })
        }));

        assert!(result.is_err());
        assert_eq!(client.pending(), vec!["app.work:30|ms\n"]);
    }

    #[test]
    fn timing_send_failure_during_panic_is_swallowed() {
        let mut sender = MockSender::new();
        sender.expect_send().times(1).returning(|payload| Err(not_delivered(payload)));

        let client = StatsdClient::new(sender, "app");
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            client.time_and_send("work", 1.0, || panic!("block failed"))
        }));

        assert!(result.is_err());
    }
}
