//! Wire types for the ingestion endpoint.
//!
//! Each request and response travels over the ingestion connection as a single
//! length-delimited Protocol Buffers message.
use crate::common::ConversionError;
use crate::label::SeriesKey;
use crate::sample::{HistogramPayload, MetricKind, MetricSample, MetricValue};

/// A batch of metrics published by a producer.
///
/// .proto:
/// ```protobuf
/// message PublishRequest {
///   repeated Metric metrics = 1;
/// }
/// ```
#[derive(prost::Message, Clone, PartialEq)]
pub struct PublishRequest {
    #[prost(message, repeated, tag = "1")]
    pub metrics: Vec<Metric>,
}

/// Reply to a [`PublishRequest`].
///
/// `total_received_metrics` counts every metric in the request, including any that were
/// dropped.
///
/// .proto:
/// ```protobuf
/// message PublishResponse {
///   uint64 total_received_metrics = 1;
/// }
/// ```
#[derive(prost::Message, Clone, PartialEq)]
pub struct PublishResponse {
    #[prost(uint64, tag = "1")]
    pub total_received_metrics: u64,
}

/// Kind of a published metric.
///
/// .proto:
/// ```protobuf
/// enum MetricType {
///   COUNTER = 0;
///   GAUGE = 1;
///   HISTOGRAM = 2;
/// }
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MetricType {
    Counter = 0,
    Gauge = 1,
    Histogram = 2,
}

impl From<MetricType> for MetricKind {
    fn from(value: MetricType) -> Self {
        match value {
            MetricType::Counter => MetricKind::Counter,
            MetricType::Gauge => MetricKind::Gauge,
            MetricType::Histogram => MetricKind::Histogram,
        }
    }
}

/// A label pair.
///
/// .proto:
/// ```protobuf
/// message Label {
///   string key   = 1;
///   string value = 2;
/// }
/// ```
#[derive(prost::Message, Clone, PartialEq)]
pub struct Label {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

/// A histogram snapshot.
///
/// .proto:
/// ```protobuf
/// message HistogramValue {
///   repeated int64  bucket_range = 1;
///   repeated uint64 bucket_count = 2;
///   double          sum          = 3;
///   uint64          total_count  = 4;
/// }
/// ```
#[derive(prost::Message, Clone, PartialEq)]
pub struct HistogramValue {
    #[prost(int64, repeated, tag = "1")]
    pub bucket_range: Vec<i64>,
    #[prost(uint64, repeated, tag = "2")]
    pub bucket_count: Vec<u64>,
    #[prost(double, tag = "3")]
    pub sum: f64,
    #[prost(uint64, tag = "4")]
    pub total_count: u64,
}

/// A single published metric.
///
/// .proto:
/// ```protobuf
/// message Metric {
///   string         name   = 1;
///   MetricType     type   = 2;
///   repeated Label labels = 3;
///   oneof value {
///     uint64         counter_value   = 4;
///     int64          gauge_value     = 5;
///     HistogramValue histogram_value = 6;
///   }
/// }
/// ```
#[derive(prost::Message, Clone, PartialEq)]
pub struct Metric {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(enumeration = "MetricType", tag = "2")]
    pub r#type: i32,
    #[prost(message, repeated, tag = "3")]
    pub labels: Vec<Label>,
    #[prost(oneof = "metric::Value", tags = "4, 5, 6")]
    pub value: Option<metric::Value>,
}

/// Nested types for [`Metric`].
pub mod metric {
    /// Value of a [`Metric`](super::Metric).
    #[derive(prost::Oneof, Clone, PartialEq)]
    pub enum Value {
        #[prost(uint64, tag = "4")]
        CounterValue(u64),
        #[prost(int64, tag = "5")]
        GaugeValue(i64),
        #[prost(message, tag = "6")]
        HistogramValue(super::HistogramValue),
    }
}

impl Metric {
    /// Creates a counter metric.
    pub fn counter<N: Into<String>>(name: N, labels: &[(&str, &str)], value: u64) -> Metric {
        Metric::with_value(name, MetricType::Counter, labels, metric::Value::CounterValue(value))
    }

    /// Creates a gauge metric.
    pub fn gauge<N: Into<String>>(name: N, labels: &[(&str, &str)], value: i64) -> Metric {
        Metric::with_value(name, MetricType::Gauge, labels, metric::Value::GaugeValue(value))
    }

    /// Creates a histogram metric.
    pub fn histogram<N: Into<String>>(
        name: N,
        labels: &[(&str, &str)],
        bucket_range: Vec<i64>,
        bucket_count: Vec<u64>,
        sum: f64,
        total_count: u64,
    ) -> Metric {
        let value = HistogramValue { bucket_range, bucket_count, sum, total_count };
        Metric::with_value(
            name,
            MetricType::Histogram,
            labels,
            metric::Value::HistogramValue(value),
        )
    }

    fn with_value<N: Into<String>>(
        name: N,
        metric_type: MetricType,
        labels: &[(&str, &str)],
        value: metric::Value,
    ) -> Metric {
        Metric {
            name: name.into(),
            r#type: metric_type as i32,
            labels: labels
                .iter()
                .map(|(k, v)| Label { key: (*k).to_owned(), value: (*v).to_owned() })
                .collect(),
            value: Some(value),
        }
    }
}

impl TryFrom<Metric> for MetricSample {
    type Error = ConversionError;

    fn try_from(metric: Metric) -> Result<Self, Self::Error> {
        let declared = MetricType::try_from(metric.r#type)
            .map(MetricKind::from)
            .map_err(|_| ConversionError::UnknownKind(metric.r#type))?;

        let value = match metric.value {
            Some(metric::Value::CounterValue(v)) => MetricValue::Counter(v),
            Some(metric::Value::GaugeValue(v)) => MetricValue::Gauge(v),
            Some(metric::Value::HistogramValue(h)) => MetricValue::Histogram(HistogramPayload::new(
                h.bucket_range,
                h.bucket_count,
                h.sum,
                h.total_count,
            )),
            None => return Err(ConversionError::MissingValue(metric.name)),
        };

        if value.kind() != declared {
            return Err(ConversionError::ValueKindMismatch {
                name: metric.name,
                declared,
                carried: value.kind(),
            });
        }

        let labels = metric.labels.into_iter().map(|l| (l.key, l.value)).collect::<SeriesKey>();
        Ok(MetricSample::new(metric.name, labels, value))
    }
}
