//! Network endpoints of the relay.
//!
//! The relay runs two listeners: an ingestion listener that producers publish metric batches to,
//! and an HTTP listener that Prometheus scrapes.  Both are driven as plain futures so callers can
//! schedule them on a runtime of their choosing.
use std::future::Future;
use std::pin::Pin;

use crate::common::ExporterError;

/// Convenience type for Future implementing an exporter.
pub type ExporterFuture = Pin<Box<dyn Future<Output = Result<(), ExporterError>> + Send + 'static>>;

pub(crate) mod http_listener;

pub(crate) mod ingest_listener;
