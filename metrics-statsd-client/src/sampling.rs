use rand::Rng as _;

/// Decides whether a sampled metric should be sent.
pub trait Sampler: Send + Sync {
    /// Returns `true` if a metric with the given sample rate should be sent.
    ///
    /// `sample_rate` is in the range `[0, 1]`.
    fn should_send(&self, sample_rate: f64) -> bool;
}

/// Samples using the thread-local random number generator.
///
/// A uniformly distributed draw in `[0, 1)` is compared against the sample rate, so a rate of 1 always sends and a rate
/// of 0 never does.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomSampler;

impl Sampler for RandomSampler {
    fn should_send(&self, sample_rate: f64) -> bool {
        rand::rng().random::<f64>() < sample_rate
    }
}

/// Sends every metric regardless of its sample rate.
///
/// Useful when the caller has already made the sampling decision.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysSample;

impl Sampler for AlwaysSample {
    fn should_send(&self, _sample_rate: f64) -> bool {
        true
    }
}

impl<S> Sampler for std::sync::Arc<S>
where
    S: Sampler + ?Sized,
{
    fn should_send(&self, sample_rate: f64) -> bool {
        (**self).should_send(sample_rate)
    }
}
