use std::sync::Arc;

use tracing::{trace, warn};

use crate::formatting::{sanitize_label_key, sanitize_metric_name};
use crate::label::{Label, StaticLabel};
use crate::proto::{PublishRequest, PublishResponse};
use crate::registry::Registry;
use crate::sample::MetricSample;

/// Applies published samples to a [`Registry`].
///
/// Before a sample is recorded, its name and label keys are sanitized and the static label, if
/// configured, is merged into its labels, replacing any label the producer sent with the same key.
/// Samples the registry rejects are logged and dropped; the rest of the batch is still applied.
#[derive(Clone)]
pub struct Ingestor {
    registry: Arc<Registry>,
    static_label: Option<Label>,
}

impl Ingestor {
    /// Creates a new `Ingestor`.
    pub fn new(registry: Arc<Registry>, static_label: Option<StaticLabel>) -> Ingestor {
        let static_label = static_label.map(|label| {
            let label = label.label();
            Label::new(sanitize_label_key(label.key()), label.value())
        });
        Ingestor { registry, static_label }
    }

    /// Gets the registry samples are applied to.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Applies every sample in `samples`, returning how many samples there were.
    pub fn ingest<I>(&self, samples: I) -> u64
    where
        I: IntoIterator<Item = MetricSample>,
    {
        let mut received = 0;
        for sample in samples {
            received += 1;

            let sample = self.normalize(sample);
            match self.registry.apply(&sample) {
                Ok(()) => trace!(name = %sample.name, labels = %sample.labels, "applied sample"),
                Err(e) => warn!(error = %e, "dropping sample"),
            }
        }
        received
    }

    /// Handles a single ingestion request.
    ///
    /// Metrics that cannot be converted into samples are logged and skipped.  The response counts
    /// every metric in the request, whether it was applied or not.
    pub fn publish(&self, request: PublishRequest) -> PublishResponse {
        let total_received_metrics = request.metrics.len() as u64;

        let samples = request.metrics.into_iter().filter_map(|metric| {
            MetricSample::try_from(metric)
                .map_err(|e| warn!(error = %e, "skipping malformed metric"))
                .ok()
        });
        self.ingest(samples);

        PublishResponse { total_received_metrics }
    }

    fn normalize(&self, sample: MetricSample) -> MetricSample {
        let MetricSample { name, labels, value } = sample;

        let mut labels = labels.map_keys(sanitize_label_key);
        if let Some(static_label) = &self.static_label {
            labels = labels.with_label(static_label);
        }

        MetricSample { name: sanitize_metric_name(&name), labels, value }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::label::SeriesKey;
    use crate::proto::Metric;
    use crate::sample::HistogramPayload;

    fn registry() -> Arc<Registry> {
        Arc::new(Registry::new(Duration::from_secs(60)))
    }

    fn labels(pairs: &[(&str, &str)]) -> SeriesKey {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_static_label_applies_to_every_kind() {
        let registry = registry();
        let static_label = "cluster:east-1".parse::<StaticLabel>().expect("valid label");
        let ingestor = Ingestor::new(registry.clone(), Some(static_label));

        let received = ingestor.ingest(vec![
            MetricSample::counter("reads", labels(&[("volume", "a")]), 2),
            MetricSample::gauge("temp", labels(&[]), 40),
            MetricSample::histogram(
                "latency",
                labels(&[("volume", "a")]),
                HistogramPayload::new(vec![10], vec![1], 4.0, 1),
            ),
        ]);
        assert_eq!(received, 3);

        let output = registry.render();
        assert!(output.contains("reads{cluster=\"east-1\",volume=\"a\"} 2\n"));
        assert!(output.contains("temp{cluster=\"east-1\"} 40\n"));
        assert!(output.contains("latency_bucket{cluster=\"east-1\",volume=\"a\",le=\"10\"} 1\n"));
        assert!(output.contains("latency_sum{cluster=\"east-1\",volume=\"a\"} 4\n"));

        for line in output.lines().filter(|l| !l.is_empty() && !l.starts_with('#')) {
            assert!(line.contains("cluster=\"east-1\""), "missing static label: {}", line);
        }
    }

    #[test]
    fn test_static_label_overrides_sample_label() {
        let registry = registry();
        let static_label = StaticLabel::new("cluster", "east-1").expect("valid label");
        let ingestor = Ingestor::new(registry.clone(), Some(static_label));

        ingestor.ingest(vec![MetricSample::counter("reads", labels(&[("cluster", "west")]), 1)]);

        assert_eq!(registry.counter_value("reads", &labels(&[("cluster", "east-1")])), Some(1));
        assert_eq!(registry.counter_value("reads", &labels(&[("cluster", "west")])), None);
    }

    #[test]
    fn test_names_and_keys_are_sanitized() {
        let registry = registry();
        let ingestor = Ingestor::new(registry.clone(), None);

        ingestor.ingest(vec![MetricSample::gauge(
            "volume.read-iops",
            labels(&[("array-id", "0")]),
            7,
        )]);

        let sanitized = labels(&[("array_id", "0")]);
        assert_eq!(registry.gauge_value("volume_read_iops", &sanitized), Some(7));
    }

    #[test]
    fn test_dropped_samples_still_count() {
        let registry = registry();
        let ingestor = Ingestor::new(registry.clone(), None);

        let received = ingestor.ingest(vec![
            MetricSample::counter("reads", labels(&[]), 1),
            MetricSample::gauge("reads", labels(&[]), 1),
            MetricSample::histogram(
                "latency",
                labels(&[]),
                HistogramPayload::new(vec![1, 2], vec![1], 1.0, 1),
            ),
            MetricSample::counter("reads", labels(&[]), 1),
        ]);

        assert_eq!(received, 4);
        assert_eq!(registry.counter_value("reads", &labels(&[])), Some(2));
        assert!(registry.descriptor("latency").is_none());
    }

    #[test]
    fn test_histogram_bucket_label_is_never_duplicated() {
        let registry = registry();
        let ingestor = Ingestor::new(registry.clone(), None);

        let received = ingestor.ingest(vec![
            MetricSample::histogram(
                "lat",
                labels(&[("le", "x")]),
                HistogramPayload::new(vec![10], vec![1], 1.0, 1),
            ),
            MetricSample::histogram(
                "lat",
                labels(&[]),
                HistogramPayload::new(vec![10], vec![1], 1.0, 1),
            ),
            MetricSample::gauge("lat_count", labels(&[]), 99),
        ]);
        assert_eq!(received, 3);

        let output = registry.render();
        assert!(!output.contains("le=\"x\""));
        assert!(output.contains("lat_bucket{le=\"10\"} 1\n"));
        assert_eq!(output.matches("lat_count ").count(), 1);
        assert!(output.contains("lat_count 1\n"));
    }

    #[test]
    fn test_publish_skips_malformed_metrics() {
        let registry = registry();
        let ingestor = Ingestor::new(registry.clone(), None);

        let mut unknown = Metric::gauge("temp", &[], 3);
        unknown.r#type = 7;
        let mut empty = Metric::counter("writes", &[], 3);
        empty.value = None;

        let request = PublishRequest {
            metrics: vec![
                Metric::counter("reads", &[("volume", "a")], 5),
                unknown,
                empty,
                Metric::histogram("latency", &[], vec![0, 10], vec![1, 2], 6.0, 2),
            ],
        };

        let response = ingestor.publish(request);
        assert_eq!(response.total_received_metrics, 4);

        assert_eq!(registry.counter_value("reads", &labels(&[("volume", "a")])), Some(5));
        assert!(registry.descriptor("temp").is_none());
        assert!(registry.descriptor("writes").is_none());
        assert_eq!(registry.histogram("latency", &labels(&[])).map(|h| h.count()), Some(2));
    }

    #[test]
    fn test_publish_empty_request() {
        let ingestor = Ingestor::new(registry(), None);
        let response = ingestor.publish(PublishRequest::default());
        assert_eq!(response.total_received_metrics, 0);
        assert_eq!(ingestor.registry().render(), "");
    }
}
