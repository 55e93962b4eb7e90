//! Relays metrics pushed by producer processes to a Prometheus scrape endpoint.
//!
//! Producers publish batches of counters, gauges, and histograms over a TCP connection, one
//! length-delimited [`proto::PublishRequest`] per batch.  The relay keeps the latest state of every
//! series in a [`Registry`] and serves it in the Prometheus text exposition format.
//!
//! Histograms are relayed as producers report them: each series carries its own bucket layout,
//! which may change from one update to the next.  Series that producers stop updating are removed
//! once the validity window has passed, so short-lived label values do not accumulate forever.
//!
//! # Usage
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use metrics_exporter_relay::RelayBuilder;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = RelayBuilder::new()
//!     .with_ingest_listener(([127, 0, 0, 1], 50051))
//!     .with_http_listener(([0, 0, 0, 0], 2112))
//!     .validity_window(Duration::from_secs(30))?
//!     .static_label_str("cluster:east-1")?
//!     .install()?;
//!
//! println!("{}", registry.render());
//! # Ok(())
//! # }
//! ```
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod builder;
pub use self::builder::RelayBuilder;

mod collector;
pub use self::collector::{Collector, Descriptor, HistogramSample, ScalarSample};

mod common;
pub use self::common::{BuildError, ConversionError, ExporterError, FrameError, RecordError};

mod expiry;
pub use self::expiry::{ExpiredSeries, ExpiryIndex, Reaper};

mod exporter;
pub use self::exporter::ExporterFuture;

pub mod formatting;

mod histogram;
pub use self::histogram::{DynamicHistogram, DynamicHistogramCollector};

mod ingest;
pub use self::ingest::Ingestor;

mod label;
pub use self::label::{Label, SeriesKey, StaticLabel};

#[allow(missing_docs)]
pub mod proto;

mod registry;
pub use self::registry::Registry;

mod sample;
pub use self::sample::{HistogramPayload, MetricKind, MetricSample, MetricValue};
