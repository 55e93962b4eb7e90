use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use parking_lot::Mutex;
use quanta::Clock;
use tracing::{debug, warn};

use crate::collector::{Collector, Descriptor, HistogramSample, ScalarSample};
use crate::common::RecordError;
use crate::expiry::ExpiryIndex;
use crate::formatting::{
    format_float, render_labels, sanitize_metric_name, write_help_line, write_metric_line,
    write_type_line,
};
use crate::histogram::{DynamicHistogram, DynamicHistogramCollector};
use crate::label::SeriesKey;
use crate::sample::{HistogramPayload, MetricKind, MetricSample, MetricValue};

/// All series of one counter or gauge metric name.
#[derive(Clone, Debug)]
pub(crate) struct MetricVec<T> {
    descriptor: Descriptor,
    series: HashMap<SeriesKey, T>,
}

/// Counter series, holding the accumulated total of each.
pub(crate) type CounterVec = MetricVec<u64>;

/// Gauge series, holding the last value set on each.
pub(crate) type GaugeVec = MetricVec<i64>;

impl<T: Copy + Default> MetricVec<T> {
    fn new(name: &str, kind: MetricKind, labels: &SeriesKey) -> MetricVec<T> {
        MetricVec { descriptor: Descriptor::new(name, kind, labels), series: HashMap::new() }
    }

    fn entry(&mut self, labels: &SeriesKey) -> &mut T {
        self.series.entry(labels.clone()).or_default()
    }

    /// Gets the current value of the series under `labels`.
    pub fn get(&self, labels: &SeriesKey) -> Option<T> {
        self.series.get(labels).copied()
    }

    fn remove(&mut self, labels: &SeriesKey) -> bool {
        self.series.remove(labels).is_some()
    }
}

impl<T: Copy> Collector for MetricVec<T> {
    type Sample = ScalarSample<T>;

    fn describe(&self) -> &Descriptor {
        &self.descriptor
    }

    fn collect(&self) -> Vec<ScalarSample<T>> {
        let mut series = self.series.iter().collect::<Vec<_>>();
        series.sort_by(|a, b| a.0.cmp(b.0));
        series
            .into_iter()
            .map(|(labels, value)| ScalarSample {
                label_values: labels.values().map(str::to_owned).collect(),
                value: *value,
            })
            .collect()
    }
}

enum Family {
    Counter(CounterVec),
    Gauge(GaugeVec),
    Histogram(DynamicHistogramCollector),
}

impl Family {
    fn new(name: &str, kind: MetricKind, labels: &SeriesKey) -> Family {
        match kind {
            MetricKind::Counter => Family::Counter(MetricVec::new(name, kind, labels)),
            MetricKind::Gauge => Family::Gauge(MetricVec::new(name, kind, labels)),
            MetricKind::Histogram => {
                Family::Histogram(DynamicHistogramCollector::new(name, labels))
            }
        }
    }

    fn kind(&self) -> MetricKind {
        match self {
            Family::Counter(_) => MetricKind::Counter,
            Family::Gauge(_) => MetricKind::Gauge,
            Family::Histogram(_) => MetricKind::Histogram,
        }
    }

    fn remove(&mut self, labels: &SeriesKey) -> bool {
        match self {
            Family::Counter(vec) => vec.remove(labels),
            Family::Gauge(vec) => vec.remove(labels),
            Family::Histogram(collector) => collector.remove_histogram(labels),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Family::Counter(vec) => vec.series.is_empty(),
            Family::Gauge(vec) => vec.series.is_empty(),
            Family::Histogram(collector) => collector.is_empty(),
        }
    }

    fn snapshot(&self) -> Snapshot {
        match self {
            Family::Counter(vec) => Snapshot::Counter(vec.describe().clone(), vec.collect()),
            Family::Gauge(vec) => Snapshot::Gauge(vec.describe().clone(), vec.collect()),
            Family::Histogram(collector) => {
                Snapshot::Histogram(collector.describe().clone(), collector.collect())
            }
        }
    }
}

enum Snapshot {
    Counter(Descriptor, Vec<ScalarSample<u64>>),
    Gauge(Descriptor, Vec<ScalarSample<i64>>),
    Histogram(Descriptor, Vec<HistogramSample>),
}

/// Outcome of removing a single series.
enum Removal {
    Removed,
    SeriesNotFound,
    UnknownFamily,
}

/// Label carrying the upper bound of a histogram bucket line.
const BUCKET_LABEL: &str = "le";

/// Suffixes of the sample names rendered for a histogram.
const HISTOGRAM_SUFFIXES: [&str; 3] = ["bucket", "sum", "count"];

#[derive(Default)]
struct State {
    families: BTreeMap<String, Family>,
    expiry: ExpiryIndex,
}

impl State {
    /// Gets the family registered under `name`, registering it from `labels` if the name is new.
    fn family_mut(
        &mut self,
        name: &str,
        kind: MetricKind,
        labels: &SeriesKey,
    ) -> Result<&mut Family, RecordError> {
        if !self.families.contains_key(name) {
            self.check_name_collision(name, kind)?;
        }

        Ok(self.families.entry(name.to_owned()).or_insert_with(|| {
            debug!(name, kind = kind.as_str(), labels = %labels, "registering metric family");
            Family::new(name, kind, labels)
        }))
    }

    /// Checks that a new family named `name` would not render the same sample names as a
    /// registered one.
    ///
    /// A histogram `name` renders `name_bucket`, `name_sum`, and `name_count`, so those names are
    /// taken for as long as the histogram is registered, and vice versa.
    fn check_name_collision(&self, name: &str, kind: MetricKind) -> Result<(), RecordError> {
        let collision = |existing: String| RecordError::NameCollision {
            name: name.to_owned(),
            existing,
        };

        if kind == MetricKind::Histogram {
            for suffix in HISTOGRAM_SUFFIXES {
                let derived = format!("{name}_{suffix}");
                if self.families.contains_key(&derived) {
                    return Err(collision(derived));
                }
            }
        }

        for suffix in HISTOGRAM_SUFFIXES {
            let base = name.strip_suffix(suffix).and_then(|base| base.strip_suffix('_'));
            if let Some(base) = base {
                if let Some(Family::Histogram(_)) = self.families.get(base) {
                    return Err(collision(base.to_owned()));
                }
            }
        }

        Ok(())
    }

    fn record_counter(
        &mut self,
        name: &str,
        labels: &SeriesKey,
        delta: u64,
    ) -> Result<(), RecordError> {
        match self.family_mut(name, MetricKind::Counter, labels)? {
            Family::Counter(vec) => {
                check_labels(vec.describe(), labels)?;
                let value = vec.entry(labels);
                *value = value.saturating_add(delta);
                Ok(())
            }
            other => Err(kind_mismatch(name, other.kind(), MetricKind::Counter)),
        }
    }

    fn record_gauge(
        &mut self,
        name: &str,
        labels: &SeriesKey,
        value: i64,
    ) -> Result<(), RecordError> {
        match self.family_mut(name, MetricKind::Gauge, labels)? {
            Family::Gauge(vec) => {
                check_labels(vec.describe(), labels)?;
                *vec.entry(labels) = value;
                Ok(())
            }
            other => Err(kind_mismatch(name, other.kind(), MetricKind::Gauge)),
        }
    }

    fn record_histogram(
        &mut self,
        name: &str,
        labels: &SeriesKey,
        payload: &HistogramPayload,
    ) -> Result<(), RecordError> {
        // Checked before the family lookup so a rejected sample never registers a name.
        if !payload.is_aligned() {
            return Err(RecordError::MismatchedBuckets {
                name: name.to_owned(),
                bounds: payload.bucket_bounds.len(),
                counts: payload.bucket_counts.len(),
            });
        }
        if labels.keys().any(|key| key == BUCKET_LABEL) {
            return Err(RecordError::ReservedLabel {
                name: name.to_owned(),
                key: BUCKET_LABEL.to_owned(),
            });
        }

        match self.family_mut(name, MetricKind::Histogram, labels)? {
            Family::Histogram(collector) => {
                check_labels(collector.describe(), labels)?;
                if collector.find_histogram(labels).is_none() {
                    collector.add_histogram(labels.clone(), DynamicHistogram::new());
                }
                if let Some(histogram) = collector.find_histogram_mut(labels) {
                    histogram.update_labels(labels);
                    histogram.update(payload);
                }
                Ok(())
            }
            other => Err(kind_mismatch(name, other.kind(), MetricKind::Histogram)),
        }
    }

    fn record(&mut self, sample: &MetricSample) -> Result<(), RecordError> {
        match &sample.value {
            MetricValue::Counter(delta) => {
                self.record_counter(&sample.name, &sample.labels, *delta)
            }
            MetricValue::Gauge(value) => self.record_gauge(&sample.name, &sample.labels, *value),
            MetricValue::Histogram(payload) => {
                self.record_histogram(&sample.name, &sample.labels, payload)
            }
        }
    }

    fn remove(&mut self, kind: MetricKind, name: &str, labels: &SeriesKey) -> Removal {
        let removal = match self.families.get_mut(name) {
            Some(family) if family.kind() == kind => {
                if !family.remove(labels) {
                    Removal::SeriesNotFound
                } else {
                    // The last series takes the family with it, so the name can be registered
                    // again, possibly with other label keys or as another kind.
                    if family.is_empty() {
                        self.families.remove(name);
                        debug!(name, kind = kind.as_str(), "unregistered metric family");
                    }
                    Removal::Removed
                }
            }
            _ => Removal::UnknownFamily,
        };

        if let Removal::Removed = removal {
            self.expiry.forget(name, labels);
        }
        removal
    }
}

fn check_labels(descriptor: &Descriptor, labels: &SeriesKey) -> Result<(), RecordError> {
    if descriptor.accepts(labels) {
        Ok(())
    } else {
        Err(RecordError::InconsistentLabels {
            name: descriptor.name().to_owned(),
            expected: descriptor.label_keys().to_vec(),
            actual: labels.keys().map(str::to_owned).collect(),
        })
    }
}

fn kind_mismatch(name: &str, existing: MetricKind, requested: MetricKind) -> RecordError {
    RecordError::KindMismatch { name: name.to_owned(), existing, requested }
}

/// Store of every relayed metric.
///
/// Each metric name maps to one family: a counter vector, a gauge vector, or a dynamic histogram
/// collector.  A family is created the first time its name is recorded, fixing its kind and label
/// keys until its last series is removed.
///
/// A single lock guards all families and the expiry index.  Recording, removing, expiring, and
/// the snapshot taken by [`render`](Registry::render) all hold it, and only for in-memory map
/// work.
pub struct Registry {
    state: Mutex<State>,
    clock: Clock,
    validity_window: Duration,
}

impl Registry {
    /// Creates a new `Registry` whose series expire after `validity_window` without updates.
    pub fn new(validity_window: Duration) -> Registry {
        Registry::with_clock(Clock::new(), validity_window)
    }

    /// Creates a new `Registry` that reads update times from `clock`.
    pub fn with_clock(clock: Clock, validity_window: Duration) -> Registry {
        Registry { state: Mutex::new(State::default()), clock, validity_window }
    }

    /// Gets the validity window.
    pub fn validity_window(&self) -> Duration {
        self.validity_window
    }

    /// Adds `delta` to the counter series under `labels`, starting from zero if the series is new.
    pub fn record_counter(
        &self,
        name: &str,
        labels: &SeriesKey,
        delta: u64,
    ) -> Result<(), RecordError> {
        self.state.lock().record_counter(name, labels, delta)
    }

    /// Sets the gauge series under `labels` to `value`.
    pub fn record_gauge(
        &self,
        name: &str,
        labels: &SeriesKey,
        value: i64,
    ) -> Result<(), RecordError> {
        self.state.lock().record_gauge(name, labels, value)
    }

    /// Replaces the histogram series under `labels` with `payload`.
    ///
    /// The first call for a name registers a dynamic histogram collector for it.  Buckets, sum
    /// and count of the series are all replaced; nothing is merged with the previous snapshot.
    pub fn record_histogram(
        &self,
        name: &str,
        labels: &SeriesKey,
        payload: &HistogramPayload,
    ) -> Result<(), RecordError> {
        self.state.lock().record_histogram(name, labels, payload)
    }

    /// Marks the given series as updated now.
    pub fn touch(&self, kind: MetricKind, name: &str, labels: &SeriesKey) {
        let now = self.clock.now();
        self.state.lock().expiry.touch(kind, name, labels, now);
    }

    /// Records `sample` and, if it was accepted, marks its series as updated now.
    ///
    /// Both happen under one hold of the lock, so an expiry scan can never observe the update
    /// without the touch.
    pub fn apply(&self, sample: &MetricSample) -> Result<(), RecordError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.record(sample)?;
        state.expiry.touch(sample.kind(), &sample.name, &sample.labels, now);
        Ok(())
    }

    /// Removes the series under `labels`.
    ///
    /// Returns `false` if there was no such series.
    pub fn remove(&self, kind: MetricKind, name: &str, labels: &SeriesKey) -> bool {
        matches!(self.state.lock().remove(kind, name, labels), Removal::Removed)
    }

    /// Removes every series not updated within the validity window, returning how many were
    /// removed.
    pub fn remove_expired(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state.lock();

        let expired = state.expiry.drain_expired(now, self.validity_window);
        let mut removed = 0;
        for series in expired {
            match state.remove(series.kind, &series.name, &series.labels) {
                Removal::Removed => removed += 1,
                Removal::SeriesNotFound => {
                    debug!(
                        name = %series.name,
                        labels = %series.labels,
                        "expired series already removed"
                    );
                }
                Removal::UnknownFamily => {
                    warn!(
                        name = %series.name,
                        kind = series.kind.as_str(),
                        labels = %series.labels,
                        "expired series belongs to an unregistered metric, ignoring"
                    );
                }
            }
        }
        removed
    }

    /// Gets the current value of a counter series.
    pub fn counter_value(&self, name: &str, labels: &SeriesKey) -> Option<u64> {
        match self.state.lock().families.get(name) {
            Some(Family::Counter(vec)) => vec.get(labels),
            _ => None,
        }
    }

    /// Gets the current value of a gauge series.
    pub fn gauge_value(&self, name: &str, labels: &SeriesKey) -> Option<i64> {
        match self.state.lock().families.get(name) {
            Some(Family::Gauge(vec)) => vec.get(labels),
            _ => None,
        }
    }

    /// Gets a copy of a histogram series.
    pub fn histogram(&self, name: &str, labels: &SeriesKey) -> Option<DynamicHistogram> {
        match self.state.lock().families.get(name) {
            Some(Family::Histogram(collector)) => collector.find_histogram(labels).cloned(),
            _ => None,
        }
    }

    /// Gets the descriptor of the family registered under `name`.
    pub fn descriptor(&self, name: &str) -> Option<Descriptor> {
        self.state.lock().families.get(name).map(|family| match family {
            Family::Counter(vec) => vec.describe().clone(),
            Family::Gauge(vec) => vec.describe().clone(),
            Family::Histogram(collector) => collector.describe().clone(),
        })
    }

    /// Returns the metrics in the Prometheus text exposition format.
    ///
    /// Families are written in name order and series in label order.  The registry lock is only
    /// held while copying the current state, not while formatting it.
    pub fn render(&self) -> String {
        let snapshots = {
            let state = self.state.lock();
            state.families.values().map(Family::snapshot).collect::<Vec<_>>()
        };

        let mut output = String::new();
        for snapshot in snapshots {
            match snapshot {
                Snapshot::Counter(descriptor, samples) => {
                    let name = write_family_header(&mut output, &descriptor);
                    for sample in samples {
                        let labels = label_strings(&descriptor, &sample.label_values);
                        write_metric_line::<&str, u64>(
                            &mut output,
                            &name,
                            None,
                            &labels,
                            None,
                            sample.value,
                        );
                    }
                }
                Snapshot::Gauge(descriptor, samples) => {
                    let name = write_family_header(&mut output, &descriptor);
                    for sample in samples {
                        let labels = label_strings(&descriptor, &sample.label_values);
                        write_metric_line::<&str, i64>(
                            &mut output,
                            &name,
                            None,
                            &labels,
                            None,
                            sample.value,
                        );
                    }
                }
                Snapshot::Histogram(descriptor, samples) => {
                    let name = write_family_header(&mut output, &descriptor);
                    for sample in samples {
                        let labels = label_strings(&descriptor, &sample.label_values);
                        for (le, count) in sample.buckets {
                            write_metric_line(
                                &mut output,
                                &name,
                                Some("bucket"),
                                &labels,
                                Some((BUCKET_LABEL, le)),
                                count,
                            );
                        }
                        write_metric_line(
                            &mut output,
                            &name,
                            Some("bucket"),
                            &labels,
                            Some((BUCKET_LABEL, "+Inf")),
                            sample.count,
                        );
                        write_metric_line::<&str, String>(
                            &mut output,
                            &name,
                            Some("sum"),
                            &labels,
                            None,
                            format_float(sample.sum),
                        );
                        write_metric_line::<&str, u64>(
                            &mut output,
                            &name,
                            Some("count"),
                            &labels,
                            None,
                            sample.count,
                        );
                    }
                }
            }
            output.push('\n');
        }

        output
    }
}

fn write_family_header(output: &mut String, descriptor: &Descriptor) -> String {
    let name = sanitize_metric_name(descriptor.name());
    write_help_line(output, &name, &descriptor.help());
    write_type_line(output, &name, descriptor.kind().as_str());
    name
}

fn label_strings(descriptor: &Descriptor, values: &[String]) -> Vec<String> {
    let keys = descriptor.label_keys().iter().map(String::as_str);
    render_labels(keys.zip(values.iter().map(String::as_str)))
}
