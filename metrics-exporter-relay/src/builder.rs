use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ipnet::IpNet;
use quanta::Clock;
use tracing::error;

use crate::common::BuildError;
use crate::exporter::{http_listener, ingest_listener, ExporterFuture};
use crate::expiry::Reaper;
use crate::ingest::Ingestor;
use crate::label::StaticLabel;
use crate::registry::Registry;

/// Builder for creating and installing a metrics relay.
///
/// A relay is made of a [`Registry`], an ingestion listener that producers publish metric batches
/// to, an HTTP listener that serves the registry to Prometheus, and a [`Reaper`] that removes
/// series producers have stopped updating.
pub struct RelayBuilder {
    ingest_address: SocketAddr,
    http_address: SocketAddr,
    allowed_addresses: Option<Vec<IpNet>>,
    validity_window: Duration,
    static_label: Option<StaticLabel>,
}

impl RelayBuilder {
    /// Creates a new [`RelayBuilder`].
    pub fn new() -> Self {
        Self {
            ingest_address: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 50051),
            http_address: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 2112),
            allowed_addresses: None,
            validity_window: Duration::from_secs(60),
            static_label: None,
        }
    }

    /// Sets the address producers publish metrics to.
    ///
    /// Defaults to `0.0.0.0:50051`.
    pub fn with_ingest_listener(mut self, addr: impl Into<SocketAddr>) -> Self {
        self.ingest_address = addr.into();
        self
    }

    /// Sets the listen address for the Prometheus scrape endpoint.
    ///
    /// The HTTP listener serves the metrics on `/metrics` and a liveness check on `/health`.
    ///
    /// Defaults to `0.0.0.0:2112`.
    pub fn with_http_listener(mut self, addr: impl Into<SocketAddr>) -> Self {
        self.http_address = addr.into();
        self
    }

    /// Adds an IP address or subnet to the allowlist for the scrape endpoint.
    ///
    /// If a client makes a request to the scrape endpoint and their IP is not present in the
    /// allowlist, either directly or within any of the allowed subnets, they will receive a 403
    /// Forbidden response.
    ///
    /// Defaults to allowing all IPs.
    ///
    /// ## Security Considerations
    ///
    /// On its own, an IP allowlist is insufficient for access control, if the exporter is running
    /// in an environment alongside applications (such as web browsers) that are susceptible to [DNS
    /// rebinding](https://en.wikipedia.org/wiki/DNS_rebinding) attacks.
    ///
    /// # Errors
    ///
    /// If the given address cannot be parsed into an IP address or subnet, an error variant will be
    /// returned describing the error.
    pub fn add_allowed_address<A>(mut self, address: A) -> Result<Self, BuildError>
    where
        A: AsRef<str>,
    {
        let address = address
            .as_ref()
            .parse::<IpNet>()
            .or_else(|_| address.as_ref().parse::<IpAddr>().map(IpNet::from))
            .map_err(|e| BuildError::InvalidAllowlistAddress(e.to_string()))?;
        self.allowed_addresses.get_or_insert(vec![]).push(address);

        Ok(self)
    }

    /// Sets how long a series stays exported without being updated.
    ///
    /// Series that have not been published within the window are removed by the reaper, which
    /// scans once per window plus one second.  A series may therefore stay visible for up to twice
    /// the window, plus one second, after its last update.
    ///
    /// Defaults to 60 seconds.
    ///
    /// # Errors
    ///
    /// If `window` is zero, an error variant will be returned.
    pub fn validity_window(mut self, window: Duration) -> Result<Self, BuildError> {
        if window.is_zero() {
            return Err(BuildError::InvalidValidityWindow);
        }

        self.validity_window = window;
        Ok(self)
    }

    /// Sets a label applied to every exported series.
    ///
    /// The static label takes precedence over a label with the same key sent by a producer.
    pub fn static_label(mut self, label: StaticLabel) -> Self {
        self.static_label = Some(label);
        self
    }

    /// Sets a label applied to every exported series, parsed from `key:value`.
    ///
    /// # Errors
    ///
    /// If there is no colon, or either side of it is empty, an error variant will be returned.
    pub fn static_label_str<S: AsRef<str>>(self, label: S) -> Result<Self, BuildError> {
        let label = label.as_ref().parse::<StaticLabel>()?;
        Ok(self.static_label(label))
    }

    /// Builds the relay and runs it on a background thread.
    ///
    /// If called from within a Tokio runtime, the relay is spawned onto that runtime.  Otherwise, a
    /// new single-threaded runtime is created on a dedicated thread.
    ///
    /// # Errors
    ///
    /// If there is an error while either building the relay or spawning the runtime, an error
    /// variant will be returned describing the error.
    pub fn install(self) -> Result<Arc<Registry>, BuildError> {
        use tokio::runtime;

        let registry = if let Ok(handle) = runtime::Handle::try_current() {
            let (registry, exporter) = {
                let _g = handle.enter();
                self.build()?
            };

            handle.spawn(run_exporter(exporter));

            registry
        } else {
            let runtime = runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| BuildError::FailedToCreateRuntime(e.to_string()))?;

            let (registry, exporter) = {
                let _g = runtime.enter();
                self.build()?
            };

            thread::Builder::new()
                .name("metrics-exporter-relay".to_string())
                .spawn(move || runtime.block_on(run_exporter(exporter)))
                .map_err(|e| BuildError::FailedToCreateRuntime(e.to_string()))?;

            registry
        };

        Ok(registry)
    }

    /// Builds the relay and returns the registry along with the future that drives it.
    ///
    /// The future runs the ingestion listener, the HTTP listener, and the reaper, and only
    /// completes if one of the listeners fails.  Both listeners are bound before this method
    /// returns, so an unusable address is reported here rather than by the future.
    ///
    /// In most cases, users should prefer to use [`RelayBuilder::install`].  If a caller needs to
    /// schedule the relay in a particular way, this method provides the flexibility to do so.
    ///
    /// # Errors
    ///
    /// If there is an error while binding either listener, an error variant will be returned
    /// describing the error.
    pub fn build(mut self) -> Result<(Arc<Registry>, ExporterFuture), BuildError> {
        let allowed_addresses = self.allowed_addresses.take();
        let ingest_address = self.ingest_address;
        let http_address = self.http_address;
        let static_label = self.static_label.take();

        let registry = Arc::new(self.build_registry());
        let ingestor = Ingestor::new(registry.clone(), static_label);

        let ingest = ingest_listener::new_ingest_listener(ingestor, ingest_address)?;
        let http =
            http_listener::new_http_listener(registry.clone(), http_address, allowed_addresses)?;
        let reaper = Reaper::new(registry.clone());

        let exporter: ExporterFuture = Box::pin(async move {
            tokio::select! {
                result = ingest => result,
                result = http => result,
                _ = reaper.run() => Ok(()),
            }
        });

        Ok((registry, exporter))
    }

    /// Builds the registry alone, without any listeners or reaper.
    pub fn build_registry(self) -> Registry {
        self.build_with_clock(Clock::new())
    }

    pub(crate) fn build_with_clock(self, clock: Clock) -> Registry {
        Registry::with_clock(clock, self.validity_window)
    }
}

impl Default for RelayBuilder {
    fn default() -> Self {
        RelayBuilder::new()
    }
}

async fn run_exporter(exporter: ExporterFuture) {
    if let Err(e) = exporter.await {
        error!(error = %e, "metrics relay stopped");
    }
}
