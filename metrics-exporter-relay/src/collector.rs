//! Scrape-time collection of metric families.
use crate::label::SeriesKey;
use crate::sample::MetricKind;

/// Describes a metric family.
///
/// All series in a family share one name and one set of label keys; only the label values differ
/// between series.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Descriptor {
    name: String,
    kind: MetricKind,
    label_keys: Vec<String>,
}

impl Descriptor {
    /// Creates a new `Descriptor`.
    ///
    /// The label keys are taken from `labels`, which is the label set of the first series
    /// recorded under this name.
    pub fn new<N: Into<String>>(name: N, kind: MetricKind, labels: &SeriesKey) -> Descriptor {
        Descriptor {
            name: name.into(),
            kind,
            label_keys: labels.keys().map(str::to_owned).collect(),
        }
    }

    /// Gets the metric name.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Gets the metric kind.
    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    /// Gets the label keys, in sorted order.
    pub fn label_keys(&self) -> &[String] {
        &self.label_keys
    }

    /// Gets the help text rendered for this family.
    pub fn help(&self) -> String {
        format!("{} relayed from metric publishers", self.kind.as_str())
    }

    /// Whether or not `labels` has exactly the label keys of this family.
    pub fn accepts(&self, labels: &SeriesKey) -> bool {
        labels.has_keys(&self.label_keys)
    }
}

/// A source of metrics read at scrape time.
///
/// `describe` returns the family descriptor and `collect` returns one sample per series, with
/// label values ordered to match the descriptor's label keys.
pub trait Collector {
    /// Sample type produced for each series.
    type Sample;

    /// Gets the descriptor of the family this collector exposes.
    fn describe(&self) -> &Descriptor;

    /// Gets the current state of every series in the family, ordered by series key.
    fn collect(&self) -> Vec<Self::Sample>;
}

/// Current value of one counter or gauge series.
#[derive(Clone, Debug, PartialEq)]
pub struct ScalarSample<T> {
    /// Label values, ordered to match the descriptor's label keys.
    pub label_values: Vec<String>,
    /// Current value.
    pub value: T,
}

/// Current state of one dynamic histogram series.
#[derive(Clone, Debug, PartialEq)]
pub struct HistogramSample {
    /// Label values, ordered to match the descriptor's label keys.
    pub label_values: Vec<String>,
    /// `(upper bound, cumulative count)` pairs in ascending bound order.
    pub buckets: Vec<(i64, u64)>,
    /// Sum of all observations.
    pub sum: f64,
    /// Total number of observations.
    pub count: u64,
}
