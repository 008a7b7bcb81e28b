use std::fmt;

use thiserror::Error;

/// Metric kind.
///
/// Each kind maps to the unit token written at the end of a StatsD line, and determines which values, sample rates,
/// and delta updates are legal for a metric of that kind.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub enum MetricKind {
    /// Counter type. Integer values, supports sampling.
    Counting,
    /// Timer type, in milliseconds. Integer values, supports sampling.
    Timing,
    /// Gauge type. Floating-point values, supports delta updates.
    Gauge,
    /// Histogram type. Integer values.
    Histogram,
    /// Meter type. Integer values.
    Meter,
    /// Set type. String values.
    Set,
}

impl MetricKind {
    /// Every metric kind, in declaration order.
    pub const ALL: [MetricKind; 6] = [
        MetricKind::Counting,
        MetricKind::Timing,
        MetricKind::Gauge,
        MetricKind::Histogram,
        MetricKind::Meter,
        MetricKind::Set,
    ];

    /// Returns the unit token for this kind, as written on the wire.
    pub const fn unit(self) -> &'static str {
        match self {
            MetricKind::Counting => "c",
            MetricKind::Timing => "ms",
            MetricKind::Gauge => "g",
            MetricKind::Histogram => "h",
            MetricKind::Meter => "m",
            MetricKind::Set => "s",
        }
    }

    /// Returns `true` if a value of the given type may be recorded for this kind.
    pub const fn is_value_type_allowed(self, value_type: ValueType) -> bool {
        matches!(
            (self, value_type),
            (
                MetricKind::Counting | MetricKind::Timing | MetricKind::Histogram | MetricKind::Meter,
                ValueType::Integer
            ) | (MetricKind::Gauge, ValueType::Float)
                | (MetricKind::Set, ValueType::Text)
        )
    }

    /// Returns `true` if this kind may carry a sample rate other than 1.
    pub const fn supports_sample_rate(self) -> bool {
        matches!(self, MetricKind::Counting | MetricKind::Timing)
    }

    /// Returns `true` if this kind may be sent as a relative adjustment.
    pub const fn supports_delta(self) -> bool {
        matches!(self, MetricKind::Gauge)
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricKind::Counting => "counting",
            MetricKind::Timing => "timing",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
            MetricKind::Meter => "meter",
            MetricKind::Set => "set",
        };
        f.write_str(name)
    }
}

/// The type of a metric value.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ValueType {
    /// A signed integer.
    Integer,
    /// A floating-point number.
    Float,
    /// An arbitrary string.
    Text,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Integer => "integer",
            ValueType::Float => "floating-point",
            ValueType::Text => "string",
        };
        f.write_str(name)
    }
}

/// A metric value.
#[derive(Clone, Debug, PartialEq)]
pub enum MetricValue {
    /// An integer value.
    Integer(i64),
    /// A floating-point value.
    Float(f64),
    /// A string value, used by sets.
    Text(String),
}

impl MetricValue {
    /// Returns the type of this value.
    pub const fn value_type(&self) -> ValueType {
        match self {
            MetricValue::Integer(_) => ValueType::Integer,
            MetricValue::Float(_) => ValueType::Float,
            MetricValue::Text(_) => ValueType::Text,
        }
    }
}

/// Errors that could occur when validating a metric event against its kind.
#[derive(Debug, Error, PartialEq)]
pub enum MetricError {
    /// The value type is not accepted by the metric kind.
    #[error("{kind} metrics do not accept {value_type} values")]
    ValueTypeNotAllowed {
        /// Metric kind.
        kind: MetricKind,
        /// Rejected value type.
        value_type: ValueType,
    },

    /// A sample rate other than 1 was given for a kind that cannot be sampled.
    #[error("{kind} metrics do not support a sample rate")]
    SampleRateNotSupported {
        /// Metric kind.
        kind: MetricKind,
    },

    /// A delta update was requested for a kind that only takes absolute values.
    #[error("{kind} metrics do not support delta updates")]
    DeltaNotSupported {
        /// Metric kind.
        kind: MetricKind,
    },

    /// The value is NaN or infinite, which cannot be written on the wire.
    #[error("{kind} metrics require a finite value")]
    NonFiniteValue {
        /// Kind of the rejected event.
        kind: MetricKind,
    },

    /// The sample rate is not within `[0, 1]`.
    #[error("sample rate must be between 0 and 1, got {rate}")]
    InvalidSampleRate {
        /// Rejected sample rate.
        rate: f64,
    },
}

/// A single metric event.
///
/// Events are immutable once built. Use the kind-specific constructors, optionally followed by
/// [`with_sample_rate`](MetricEvent::with_sample_rate) or [`as_delta`](MetricEvent::as_delta), and call
/// [`validate`](MetricEvent::validate) to check the combination is legal for the kind.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricEvent {
    name: String,
    value: MetricValue,
    kind: MetricKind,
    sample_rate: f64,
    is_delta: bool,
}

impl MetricEvent {
    /// Creates a new `MetricEvent` with a sample rate of 1 and absolute semantics.
    pub fn new<N>(kind: MetricKind, name: N, value: MetricValue) -> Self
    where
        N: Into<String>,
    {
        MetricEvent { name: name.into(), value, kind, sample_rate: 1.0, is_delta: false }
    }

    /// Creates a counting event.
    pub fn counting<N: Into<String>>(name: N, value: i64) -> Self {
        Self::new(MetricKind::Counting, name, MetricValue::Integer(value))
    }

    /// Creates a timing event, with the value in milliseconds.
    pub fn timing<N: Into<String>>(name: N, millis: i64) -> Self {
        Self::new(MetricKind::Timing, name, MetricValue::Integer(millis))
    }

    /// Creates a gauge event.
    pub fn gauge<N: Into<String>>(name: N, value: f64) -> Self {
        Self::new(MetricKind::Gauge, name, MetricValue::Float(value))
    }

    /// Creates a histogram event.
    pub fn histogram<N: Into<String>>(name: N, value: i64) -> Self {
        Self::new(MetricKind::Histogram, name, MetricValue::Integer(value))
    }

    /// Creates a meter event.
    pub fn meter<N: Into<String>>(name: N, value: i64) -> Self {
        Self::new(MetricKind::Meter, name, MetricValue::Integer(value))
    }

    /// Creates a set event.
    pub fn set<N: Into<String>, V: Into<String>>(name: N, value: V) -> Self {
        Self::new(MetricKind::Set, name, MetricValue::Text(value.into()))
    }

    /// Sets the sample rate of this event.
    #[must_use]
    pub fn with_sample_rate(mut self, sample_rate: f64) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Marks this event as a relative adjustment rather than an absolute value.
    #[must_use]
    pub fn as_delta(mut self) -> Self {
        self.is_delta = true;
        self
    }

    /// Metric name, without any prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Metric value.
    pub fn value(&self) -> &MetricValue {
        &self.value
    }

    /// Metric kind.
    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    /// Sample rate.
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Whether or not the value is a relative adjustment.
    pub fn is_delta(&self) -> bool {
        self.is_delta
    }

    /// Returns `true` if the sampler must be consulted before emitting this event.
    pub(crate) fn is_sampled(&self) -> bool {
        self.kind.supports_sample_rate() && self.sample_rate < 1.0
    }

    /// Checks that the value type, sample rate and delta flag are all legal for the event's kind.
    ///
    /// # Errors
    ///
    /// Returns the first violated rule, checked in the order: sample rate range, value type, finite value, sample rate
    /// support, delta support.
    pub fn validate(&self) -> Result<(), MetricError> {
        if !(0.0..=1.0).contains(&self.sample_rate) {
            return Err(MetricError::InvalidSampleRate { rate: self.sample_rate });
        }

        let value_type = self.value.value_type();
        if !self.kind.is_value_type_allowed(value_type) {
            return Err(MetricError::ValueTypeNotAllowed { kind: self.kind, value_type });
        }

        if matches!(self.value, MetricValue::Float(v) if !v.is_finite()) {
            return Err(MetricError::NonFiniteValue { kind: self.kind });
        }

        if self.sample_rate != 1.0 && !self.kind.supports_sample_rate() {
            return Err(MetricError::SampleRateNotSupported { kind: self.kind });
        }

        if self.is_delta && !self.kind.supports_delta() {
            return Err(MetricError::DeltaNotSupported { kind: self.kind });
        }

        Ok(())
    }
}
