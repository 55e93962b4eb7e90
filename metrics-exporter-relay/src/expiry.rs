//! Series expiry.
//!
//! Producers come and go, and many of them label their metrics with short-lived values such as
//! volume or connection identifiers.  Without expiry, every label combination ever published
//! would stay in the scrape output forever, and the number of series would only grow.
//!
//! [`ExpiryIndex`] records when each series was last updated, and [`Reaper`] periodically asks
//! the [`Registry`] to delete every series that has not been updated within the validity window.
//! A series therefore stays visible for at most the validity window plus one reaper period after
//! its last update.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use quanta::Instant;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::label::SeriesKey;
use crate::registry::Registry;
use crate::sample::MetricKind;

/// A series whose validity window has elapsed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExpiredSeries {
    /// Kind of the metric.
    pub kind: MetricKind,
    /// Metric name.
    pub name: String,
    /// Labels identifying the series.
    pub labels: SeriesKey,
}

/// Last-update times of every known series.
#[derive(Debug, Default)]
pub struct ExpiryIndex {
    entries: HashMap<String, (MetricKind, HashMap<SeriesKey, Instant>)>,
}

impl ExpiryIndex {
    /// Creates an empty `ExpiryIndex`.
    pub fn new() -> ExpiryIndex {
        ExpiryIndex::default()
    }

    /// Records `now` as the last update time of the given series.
    pub fn touch(&mut self, kind: MetricKind, name: &str, labels: &SeriesKey, now: Instant) {
        match self.entries.get_mut(name) {
            Some((entry_kind, series)) => {
                *entry_kind = kind;
                match series.get_mut(labels) {
                    Some(last) => *last = now,
                    None => {
                        series.insert(labels.clone(), now);
                    }
                }
            }
            None => {
                let series = HashMap::from([(labels.clone(), now)]);
                self.entries.insert(name.to_owned(), (kind, series));
            }
        }
    }

    /// Gets the last update time of the given series.
    pub fn last_touched(&self, name: &str, labels: &SeriesKey) -> Option<Instant> {
        self.entries.get(name).and_then(|(_, series)| series.get(labels)).copied()
    }

    /// Stops tracking the given series.
    ///
    /// Returns `false` if the series was not tracked.
    pub fn forget(&mut self, name: &str, labels: &SeriesKey) -> bool {
        let Some((_, series)) = self.entries.get_mut(name) else {
            return false;
        };

        let removed = series.remove(labels).is_some();
        if series.is_empty() {
            self.entries.remove(name);
        }
        removed
    }

    /// Removes and returns every series last updated at least `validity_window` before `now`.
    pub fn drain_expired(&mut self, now: Instant, validity_window: Duration) -> Vec<ExpiredSeries> {
        let mut expired = Vec::new();

        self.entries.retain(|name, (kind, series)| {
            series.retain(|labels, last| {
                if now.saturating_duration_since(*last) >= validity_window {
                    expired.push(ExpiredSeries {
                        kind: *kind,
                        name: name.clone(),
                        labels: labels.clone(),
                    });
                    false
                } else {
                    true
                }
            });
            !series.is_empty()
        });

        expired
    }

    /// Number of tracked series.
    pub fn len(&self) -> usize {
        self.entries.values().map(|(_, series)| series.len()).sum()
    }

    /// Whether or not no series are tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Periodically deletes expired series from a [`Registry`].
///
/// The reaper wakes once per period, which is the registry's validity window plus one second, and
/// otherwise sits idle.  It never touches registry state directly; every deletion goes through
/// [`Registry::remove_expired`] and so through the same lock as ingestion.
#[derive(Clone)]
pub struct Reaper {
    registry: Arc<Registry>,
    period: Duration,
}

impl Reaper {
    /// Creates a new `Reaper` for `registry`.
    pub fn new(registry: Arc<Registry>) -> Reaper {
        let period = registry.validity_window() + Duration::from_secs(1);
        Reaper { registry, period }
    }

    /// Gets the time between scans.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Deletes every expired series, returning how many were deleted.
    pub fn scan(&self) -> usize {
        let removed = self.registry.remove_expired();
        if removed > 0 {
            debug!(removed, "removed expired series");
        } else {
            trace!("no expired series");
        }
        removed
    }

    /// Scans once per period, forever.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // The first tick completes immediately, and nothing can have expired yet.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            self.scan();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{HistogramPayload, MetricSample};
    use quanta::Clock;

    const VALIDITY: Duration = Duration::from_secs(60);

    fn labels(value: &str) -> SeriesKey {
        SeriesKey::from_labels([("volume", value)])
    }

    #[test]
    fn test_index_touch_and_forget() {
        let (clock, mock) = Clock::mock();
        let mut index = ExpiryIndex::new();

        index.touch(MetricKind::Gauge, "temp", &labels("a"), clock.now());
        mock.increment(Duration::from_secs(5));
        index.touch(MetricKind::Gauge, "temp", &labels("a"), clock.now());
        index.touch(MetricKind::Gauge, "temp", &labels("b"), clock.now());

        assert_eq!(index.len(), 2);
        assert_eq!(index.last_touched("temp", &labels("a")), Some(clock.now()));

        assert!(index.forget("temp", &labels("a")));
        assert!(!index.forget("temp", &labels("a")));
        assert!(!index.forget("missing", &labels("a")));
        assert!(index.forget("temp", &labels("b")));
        assert!(index.is_empty());
    }

    #[test]
    fn test_index_expiry_boundary() {
        let (clock, mock) = Clock::mock();
        let mut index = ExpiryIndex::new();
        index.touch(MetricKind::Counter, "reads", &labels("a"), clock.now());

        mock.increment(VALIDITY - Duration::from_nanos(1));
        assert!(index.drain_expired(clock.now(), VALIDITY).is_empty());
        assert_eq!(index.len(), 1);

        mock.increment(Duration::from_nanos(1));
        let expired = index.drain_expired(clock.now(), VALIDITY);
        assert_eq!(
            expired,
            vec![ExpiredSeries {
                kind: MetricKind::Counter,
                name: "reads".to_owned(),
                labels: labels("a"),
            }]
        );
        assert!(index.is_empty());
    }

    #[test]
    fn test_reaper_removes_only_stale_series() {
        let (clock, mock) = Clock::mock();
        let registry = Arc::new(Registry::with_clock(clock, VALIDITY));
        let reaper = Reaper::new(registry.clone());
        assert_eq!(reaper.period(), VALIDITY + Duration::from_secs(1));

        let payload = HistogramPayload::new(vec![0, 10], vec![1, 2], 5.0, 2);
        registry.apply(&MetricSample::counter("reads", labels("stale"), 1)).expect("recorded");
        registry.apply(&MetricSample::gauge("temp", labels("fresh"), 40)).expect("recorded");
        registry
            .apply(&MetricSample::histogram("latency", labels("stale"), payload.clone()))
            .expect("recorded");

        // Keep "fresh" alive with updates spaced closer than the validity window.
        for _ in 0..4 {
            mock.increment(Duration::from_secs(30));
            registry.apply(&MetricSample::gauge("temp", labels("fresh"), 41)).expect("recorded");
            let removed = reaper.scan();
            assert!(registry.gauge_value("temp", &labels("fresh")).is_some());
            if removed > 0 {
                assert_eq!(removed, 2);
            }
        }

        assert_eq!(registry.counter_value("reads", &labels("stale")), None);
        assert!(registry.histogram("latency", &labels("stale")).is_none());
        assert_eq!(registry.gauge_value("temp", &labels("fresh")), Some(41));

        let output = registry.render();
        assert!(!output.contains("reads"));
        assert!(!output.contains("latency"));
        assert!(output.contains("temp{volume=\"fresh\"} 41"));
    }

    #[test]
    fn test_reaper_does_not_remove_before_validity_window() {
        let (clock, mock) = Clock::mock();
        let registry = Arc::new(Registry::with_clock(clock, VALIDITY));
        let reaper = Reaper::new(registry.clone());

        registry.apply(&MetricSample::counter("reads", labels("a"), 3)).expect("recorded");

        mock.increment(VALIDITY - Duration::from_millis(1));
        assert_eq!(reaper.scan(), 0);
        assert_eq!(registry.counter_value("reads", &labels("a")), Some(3));

        mock.increment(Duration::from_millis(1));
        assert_eq!(reaper.scan(), 1);
        assert_eq!(registry.counter_value("reads", &labels("a")), None);

        // Nothing left to do, and a second scan is harmless.
        assert_eq!(reaper.scan(), 0);
    }

    #[test]
    fn test_reaper_tolerates_unknown_names() {
        let (clock, mock) = Clock::mock();
        let registry = Arc::new(Registry::with_clock(clock, VALIDITY));
        let reaper = Reaper::new(registry.clone());

        // Touched, but never recorded.
        registry.touch(MetricKind::Gauge, "ghost", &labels("a"));

        mock.increment(VALIDITY);
        assert_eq!(reaper.scan(), 0);
        assert_eq!(registry.render(), "");
    }

    #[test]
    fn test_reaper_runs_on_its_period() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap_or_else(|e| panic!("failed to create test runtime: {:?}", e));

        let (clock, mock) = Clock::mock();
        let registry = Arc::new(Registry::with_clock(clock, Duration::from_secs(2)));
        registry.apply(&MetricSample::counter("reads", labels("a"), 1)).expect("recorded");
        mock.increment(Duration::from_secs(2));

        runtime.block_on(async {
            let handle = tokio::spawn(Reaper::new(registry.clone()).run());

            tokio::time::sleep(Duration::from_millis(2500)).await;
            assert!(registry.counter_value("reads", &labels("a")).is_some());

            tokio::time::sleep(Duration::from_secs(1)).await;
            assert!(registry.counter_value("reads", &labels("a")).is_none());

            handle.abort();
        });
    }
}
