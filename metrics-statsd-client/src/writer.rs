use crate::kind::{MetricEvent, MetricValue};

/// Normalizes a metric prefix so that it can be directly prepended to a metric name.
///
/// A non-empty prefix is suffixed with `.` unless it already ends with one. An empty prefix stays empty, so unprefixed
/// metric names are written without a leading `.`.
pub fn normalize_prefix(prefix: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('.') {
        prefix.to_string()
    } else {
        let mut normalized = String::with_capacity(prefix.len() + 1);
        normalized.push_str(prefix);
        normalized.push('.');
        normalized
    }
}

/// Formats a single StatsD line.
///
/// The line is `{prefix}{name}:{value}|{unit}\n`, with `|@{sample_rate}` inserted before the newline when the sample
/// rate is not 1. The prefix is written as-is, so it should already be normalized.
pub fn format_line(prefix: &str, name: &str, value: &str, unit: &str, sample_rate: f64) -> String {
    let mut line = String::with_capacity(prefix.len() + name.len() + value.len() + unit.len() + 8);
    line.push_str(prefix);
    line.push_str(name);
    line.push(':');
    line.push_str(value);
    line.push('|');
    line.push_str(unit);

    // A sample rate of 1 is the implied default, so we only write it when it's something else.
    if sample_rate != 1.0 {
        let mut float_writer = ryu::Buffer::new();
        line.push_str("|@");
        line.push_str(float_writer.format(sample_rate));
    }

    line.push('\n');
    line
}

/// Formats a metric value as it appears on the wire.
///
/// Integers are written in plain decimal, floating-point values with 15 fractional digits, and strings verbatim. When
/// `is_delta` is set, non-negative values are prefixed with `+`; negative values already carry their `-` sign.
pub fn format_value(value: &MetricValue, is_delta: bool) -> String {
    match value {
        MetricValue::Integer(v) => {
            let mut int_writer = itoa::Buffer::new();
            let formatted = int_writer.format(*v);
            if is_delta && *v >= 0 {
                format!("+{formatted}")
            } else {
                formatted.to_string()
            }
        }
        MetricValue::Float(v) => {
            // Collapse negative zero so a zero adjustment never renders as `+-0.0...`.
            let v = if *v == 0.0 { 0.0 } else { *v };
            if is_delta && v >= 0.0 {
                format!("+{v:.15}")
            } else {
                format!("{v:.15}")
            }
        }
        MetricValue::Text(v) => v.clone(),
    }
}

/// Formats metric events into StatsD lines with a fixed prefix.
///
/// `LineWriter` holds no mutable state, so a single instance can be shared freely across threads.
#[derive(Clone, Debug, Default)]
pub struct LineWriter {
    prefix: String,
}

impl LineWriter {
    /// Creates a new `LineWriter` with the given prefix.
    ///
    /// The prefix is normalized with [`normalize_prefix`].
    pub fn new(prefix: &str) -> Self {
        LineWriter { prefix: normalize_prefix(prefix) }
    }

    /// Returns the normalized prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Formats the given event.
    pub fn write(&self, event: &MetricEvent) -> String {
        let value = format_value(event.value(), event.is_delta());
        format_line(&self.prefix, event.name(), &value, event.kind().unit(), event.sample_rate())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{format_line, format_value, normalize_prefix, LineWriter};
    use crate::kind::{MetricEvent, MetricValue};

    #[test]
    fn prefix_normalization() {
        let cases = [("", ""), ("app", "app."), ("app.", "app."), ("a.b", "a.b.")];

        for (input, expected) in cases {
            assert_eq!(normalize_prefix(input), expected);
        }
    }

    #[test]
    fn lines() {
        // Cases are defined as: prefix, event, expected output.
        let cases = [
            ("app", MetricEvent::counting("hits", 5), "app.hits:5|c\n"),
            ("app.", MetricEvent::counting("hits", -5), "app.hits:-5|c\n"),
            ("", MetricEvent::counting("hits", 5), "hits:5|c\n"),
            ("app", MetricEvent::counting("hits", 5).with_sample_rate(0.5), "app.hits:5|c|@0.5\n"),
            ("app", MetricEvent::timing("db.query", 250), "app.db.query:250|ms\n"),
            (
                "app",
                MetricEvent::timing("db.query", 250).with_sample_rate(0.1),
                "app.db.query:250|ms|@0.1\n",
            ),
            ("app", MetricEvent::gauge("temp", 3.5), "app.temp:3.500000000000000|g\n"),
            ("app", MetricEvent::gauge("temp", 3.5).as_delta(), "app.temp:+3.500000000000000|g\n"),
            ("app", MetricEvent::gauge("temp", -3.5).as_delta(), "app.temp:-3.500000000000000|g\n"),
            ("app", MetricEvent::gauge("temp", 0.0).as_delta(), "app.temp:+0.000000000000000|g\n"),
            ("app", MetricEvent::gauge("temp", -0.0).as_delta(), "app.temp:+0.000000000000000|g\n"),
            ("app", MetricEvent::histogram("size", 1024), "app.size:1024|h\n"),
            ("app", MetricEvent::meter("requests", 1), "app.requests:1|m\n"),
            ("app", MetricEvent::set("users", "alice"), "app.users:alice|s\n"),
        ];

        for (prefix, event, expected) in cases {
            let writer = LineWriter::new(prefix);
            assert_eq!(writer.write(&event), expected);
        }
    }

    #[test]
    fn float_precision() {
        assert_eq!(format_value(&MetricValue::Float(0.1), false), "0.100000000000000");
        assert_eq!(format_value(&MetricValue::Float(-1234.5), false), "-1234.500000000000000");
        assert_eq!(format_value(&MetricValue::Float(1e-16), false), "0.000000000000000");
    }

    proptest! {
        #[test]
        fn unsampled_integer_lines(name in "[a-z][a-z0-9_.]{0,31}", value in any::<i64>()) {
            let line = format_line("app.", &name, &value.to_string(), "c", 1.0);
            prop_assert_eq!(line, format!("app.{name}:{value}|c\n"));
        }

        #[test]
        fn sample_rate_parses_back(name in "[a-z][a-z0-9_]{0,31}", value in any::<i64>(), rate in 0.0001f64..1.0) {
            let line = format_line("", &name, &value.to_string(), "ms", rate);
            let suffix = line.trim_end_matches('\n').rsplit_once("|@").map(|(_, rate)| rate.to_string());
            let parsed = suffix.and_then(|rate| rate.parse::<f64>().ok());
            prop_assert_eq!(parsed, Some(rate));
        }

        #[test]
        fn delta_sign_rule(value in any::<f64>().prop_filter("finite", |v| v.is_finite())) {
            let formatted = format_value(&MetricValue::Float(value), true);
            if value >= 0.0 {
                prop_assert!(formatted.starts_with('+'));
                prop_assert_eq!(&formatted[1..], format!("{:.15}", value.abs()));
            } else {
                prop_assert_eq!(formatted, format!("{value:.15}"));
            }
        }
    }
}
