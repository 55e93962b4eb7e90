//! Histograms whose bucket layout may differ per series and change between updates.
//!
//! A regular Prometheus histogram declares its bucket bounds once, and every series under the
//! metric name shares them.  Producers relayed through this crate report their own bounds with
//! every update, and may change them at any time.  [`DynamicHistogramCollector`] therefore keeps
//! the raw `bound -> cumulative count` map of each series and only turns it into exposition
//! samples when collected.
use std::collections::{BTreeMap, HashMap};

use crate::collector::{Collector, Descriptor, HistogramSample};
use crate::label::SeriesKey;
use crate::sample::{HistogramPayload, MetricKind};

/// The current state of a single histogram series.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DynamicHistogram {
    label_keys: Vec<String>,
    label_values: Vec<String>,
    buckets: BTreeMap<i64, u64>,
    sum: f64,
    count: u64,
}

impl DynamicHistogram {
    /// Creates an empty `DynamicHistogram`.
    pub fn new() -> DynamicHistogram {
        DynamicHistogram::default()
    }

    /// Sets the label keys and values from `labels`.
    pub fn update_labels(&mut self, labels: &SeriesKey) {
        self.label_keys = labels.keys().map(str::to_owned).collect();
        self.label_values = labels.values().map(str::to_owned).collect();
    }

    /// Replaces the buckets, sum, and count with those of `payload`.
    ///
    /// Producers report absolute snapshots, so nothing from the previous state is kept, including
    /// bounds that are absent from the new payload.
    pub fn update(&mut self, payload: &HistogramPayload) {
        self.buckets = payload.buckets();
        self.sum = payload.sum;
        self.count = payload.total_count;
    }

    /// Gets the label keys.
    pub fn label_keys(&self) -> &[String] {
        &self.label_keys
    }

    /// Gets the label values, ordered to match [`label_keys`](DynamicHistogram::label_keys).
    pub fn label_values(&self) -> &[String] {
        &self.label_values
    }

    /// Gets the `(upper bound, cumulative count)` pairs in ascending bound order.
    pub fn buckets(&self) -> impl Iterator<Item = (i64, u64)> + '_ {
        self.buckets.iter().map(|(bound, count)| (*bound, *count))
    }

    /// Gets the sum of all observations.
    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// Gets the total number of observations.
    pub fn count(&self) -> u64 {
        self.count
    }

    fn sample(&self) -> HistogramSample {
        HistogramSample {
            label_values: self.label_values.clone(),
            buckets: self.buckets().collect(),
            sum: self.sum,
            count: self.count,
        }
    }
}

/// All series of one histogram metric name.
#[derive(Clone, Debug)]
pub struct DynamicHistogramCollector {
    descriptor: Descriptor,
    histograms: HashMap<SeriesKey, DynamicHistogram>,
}

impl DynamicHistogramCollector {
    /// Creates a new `DynamicHistogramCollector`.
    ///
    /// `labels` fixes the label keys every series of this collector must use.
    pub fn new<N: Into<String>>(name: N, labels: &SeriesKey) -> DynamicHistogramCollector {
        DynamicHistogramCollector {
            descriptor: Descriptor::new(name, MetricKind::Histogram, labels),
            histograms: HashMap::new(),
        }
    }

    /// Registers `histogram` under `labels`, replacing any histogram already there.
    pub fn add_histogram(&mut self, labels: SeriesKey, histogram: DynamicHistogram) {
        self.histograms.insert(labels, histogram);
    }

    /// Gets the histogram registered under `labels`.
    pub fn find_histogram(&self, labels: &SeriesKey) -> Option<&DynamicHistogram> {
        self.histograms.get(labels)
    }

    /// Gets the histogram registered under `labels` for updating.
    pub fn find_histogram_mut(&mut self, labels: &SeriesKey) -> Option<&mut DynamicHistogram> {
        self.histograms.get_mut(labels)
    }

    /// Removes the histogram registered under `labels`.
    ///
    /// Returns `false` if there was none.
    pub fn remove_histogram(&mut self, labels: &SeriesKey) -> bool {
        self.histograms.remove(labels).is_some()
    }

    /// Number of series in this collector.
    pub fn len(&self) -> usize {
        self.histograms.len()
    }

    /// Whether or not this collector has no series.
    pub fn is_empty(&self) -> bool {
        self.histograms.is_empty()
    }
}

impl Collector for DynamicHistogramCollector {
    type Sample = HistogramSample;

    fn describe(&self) -> &Descriptor {
        &self.descriptor
    }

    fn collect(&self) -> Vec<HistogramSample> {
        let mut series = self.histograms.iter().collect::<Vec<_>>();
        series.sort_by(|a, b| a.0.cmp(b.0));
        series.into_iter().map(|(_, histogram)| histogram.sample()).collect()
    }
}
