use std::collections::BTreeMap;

use crate::label::SeriesKey;

/// Metric kind.
///
/// Defines the kind, or type, of a relayed metric:
/// - counters
/// - gauges
/// - histograms
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub enum MetricKind {
    /// Counter type.
    Counter,
    /// Gauge type.
    Gauge,
    /// Histogram type.
    Histogram,
}

impl MetricKind {
    /// Gets the Prometheus type name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

/// A snapshot of a producer-side cumulative histogram.
///
/// `bucket_counts[i]` is the number of observations less than or equal to `bucket_bounds[i]`.
/// Neither the ordering of the bounds nor the monotonicity of the counts is checked; both are
/// passed through to the exposition output as reported.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HistogramPayload {
    /// Upper bound of each bucket.
    pub bucket_bounds: Vec<i64>,
    /// Cumulative count of each bucket, aligned to `bucket_bounds`.
    pub bucket_counts: Vec<u64>,
    /// Sum of all observations.
    pub sum: f64,
    /// Total number of observations.
    pub total_count: u64,
}

impl HistogramPayload {
    /// Creates a new `HistogramPayload`.
    pub fn new(
        bucket_bounds: Vec<i64>,
        bucket_counts: Vec<u64>,
        sum: f64,
        total_count: u64,
    ) -> Self {
        HistogramPayload { bucket_bounds, bucket_counts, sum, total_count }
    }

    /// Whether or not every bound has exactly one count.
    pub fn is_aligned(&self) -> bool {
        self.bucket_bounds.len() == self.bucket_counts.len()
    }

    /// Gets the buckets as a `bound -> cumulative count` map.
    ///
    /// When a bound is repeated, the count reported last wins.
    pub fn buckets(&self) -> BTreeMap<i64, u64> {
        self.bucket_bounds.iter().copied().zip(self.bucket_counts.iter().copied()).collect()
    }
}

/// Value carried by a [`MetricSample`].
#[derive(Clone, Debug, PartialEq)]
pub enum MetricValue {
    /// Amount to add to a counter.
    Counter(u64),
    /// Absolute value to set a gauge to.
    Gauge(i64),
    /// Current state of a histogram.
    Histogram(HistogramPayload),
}

impl MetricValue {
    /// Gets the kind of metric this value updates.
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Counter(_) => MetricKind::Counter,
            MetricValue::Gauge(_) => MetricKind::Gauge,
            MetricValue::Histogram(_) => MetricKind::Histogram,
        }
    }
}

/// A single metric update pushed by a producer.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricSample {
    /// Metric name.
    pub name: String,
    /// Labels identifying the series.
    pub labels: SeriesKey,
    /// Update to apply.
    pub value: MetricValue,
}

impl MetricSample {
    /// Creates a new `MetricSample`.
    pub fn new<N: Into<String>>(name: N, labels: SeriesKey, value: MetricValue) -> Self {
        MetricSample { name: name.into(), labels, value }
    }

    /// Creates a counter sample.
    pub fn counter<N: Into<String>>(name: N, labels: SeriesKey, delta: u64) -> Self {
        MetricSample::new(name, labels, MetricValue::Counter(delta))
    }

    /// Creates a gauge sample.
    pub fn gauge<N: Into<String>>(name: N, labels: SeriesKey, value: i64) -> Self {
        MetricSample::new(name, labels, MetricValue::Gauge(value))
    }

    /// Creates a histogram sample.
    pub fn histogram<N: Into<String>>(
        name: N,
        labels: SeriesKey,
        payload: HistogramPayload,
    ) -> Self {
        MetricSample::new(name, labels, MetricValue::Histogram(payload))
    }

    /// Gets the kind of metric this sample updates.
    pub fn kind(&self) -> MetricKind {
        self.value.kind()
    }
}
