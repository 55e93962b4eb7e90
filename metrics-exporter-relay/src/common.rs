use std::io;

use thiserror::Error as ThisError;

use crate::sample::MetricKind;

/// Errors that could occur while building or installing the relay.
#[derive(Debug, ThisError)]
pub enum BuildError {
    /// The static label was not of the form `key:value`.
    #[error("static label must be of the form `key:value`, got `{0}`")]
    InvalidStaticLabel(String),

    /// The validity window was zero.
    #[error("validity window must be greater than zero")]
    InvalidValidityWindow,

    /// An allowed address could not be parsed.
    #[error("failed to parse address as a valid IP address/subnet: {0}")]
    InvalidAllowlistAddress(String),

    /// Binding the scrape listener did not succeed.
    #[error("failed to create HTTP listener: {0}")]
    FailedToCreateHTTPListener(String),

    /// Binding the ingestion listener did not succeed.
    #[error("failed to create ingestion listener: {0}")]
    FailedToCreateIngestListener(String),

    /// Creating the runtime for the listeners did not succeed.
    #[error("failed to spawn Tokio runtime for endpoints: {0}")]
    FailedToCreateRuntime(String),
}

/// Errors that cause a single sample to be dropped.
#[derive(Debug, PartialEq, ThisError)]
pub enum RecordError {
    /// The label keys differ from the ones the metric was first registered with.
    #[error("metric `{name}` was registered with label keys {expected:?}, got {actual:?}")]
    InconsistentLabels {
        /// Metric name.
        name: String,
        /// Label keys of the registered family.
        expected: Vec<String>,
        /// Label keys of the rejected sample.
        actual: Vec<String>,
    },

    /// The name is already registered as a different kind of metric.
    #[error("metric `{name}` is a {}, not a {}", .existing.as_str(), .requested.as_str())]
    KindMismatch {
        /// Metric name.
        name: String,
        /// Kind the name is registered as.
        existing: MetricKind,
        /// Kind of the rejected sample.
        requested: MetricKind,
    },

    /// A histogram used a label key reserved for its bucket lines.
    #[error("histogram `{name}` uses the reserved label key `{key}`")]
    ReservedLabel {
        /// Metric name.
        name: String,
        /// Reserved label key.
        key: String,
    },

    /// The name would render sample lines already rendered by another metric.
    #[error("metric `{name}` collides with the sample names of metric `{existing}`")]
    NameCollision {
        /// Metric name.
        name: String,
        /// Name of the registered metric it collides with.
        existing: String,
    },

    /// A histogram reported a different number of bounds and counts.
    #[error("histogram `{name}` has {bounds} bucket bounds but {counts} bucket counts")]
    MismatchedBuckets {
        /// Metric name.
        name: String,
        /// Number of bucket bounds.
        bounds: usize,
        /// Number of bucket counts.
        counts: usize,
    },
}

/// Errors converting a wire-level metric into a sample.
#[derive(Debug, PartialEq, ThisError)]
pub enum ConversionError {
    /// The metric type is not one this relay understands.
    #[error("unknown metric type {0}")]
    UnknownKind(i32),

    /// The metric carried no value.
    #[error("metric `{0}` has no value")]
    MissingValue(String),

    /// The value does not match the declared metric type.
    #[error(
        "metric `{name}` is declared as a {} but carries a {} value",
        .declared.as_str(),
        .carried.as_str()
    )]
    ValueKindMismatch {
        /// Metric name.
        name: String,
        /// Declared metric type.
        declared: MetricKind,
        /// Type of the carried value.
        carried: MetricKind,
    },
}

/// Errors reading from or writing to an ingestion connection.
#[derive(Debug, ThisError)]
pub enum FrameError {
    /// The connection failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The frame could not be decoded.
    #[error("failed to decode request: {0}")]
    Decode(#[from] prost::DecodeError),

    /// The frame length prefix exceeds the allowed maximum.
    #[error("frame of {0} bytes exceeds the maximum frame size")]
    TooLarge(usize),

    /// The connection closed partway through a frame.
    #[error("connection closed with {0} bytes of an incomplete frame buffered")]
    Truncated(usize),
}

/// Errors from a running endpoint.
#[derive(Debug, ThisError)]
pub enum ExporterError {
    /// The scrape listener stopped.
    #[error("HTTP listener failed: {0}")]
    HttpListener(io::Error),

    /// The ingestion listener stopped.
    #[error("ingestion listener failed: {0}")]
    IngestListener(io::Error),
}
