//! Labels and series identity.
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::common::BuildError;

/// A single key/value label pair.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Label {
    key: String,
    value: String,
}

impl Label {
    /// Creates a new `Label`.
    pub fn new<K, V>(key: K, value: V) -> Label
    where
        K: Into<String>,
        V: Into<String>,
    {
        Label { key: key.into(), value: value.into() }
    }

    /// Gets the key of this label.
    pub fn key(&self) -> &str {
        self.key.as_str()
    }

    /// Gets the value of this label.
    pub fn value(&self) -> &str {
        self.value.as_str()
    }

    /// Consumes this label, returning the key and value.
    pub fn into_parts(self) -> (String, String) {
        (self.key, self.value)
    }
}

/// Canonical identity of one time series within a metric name.
///
/// A `SeriesKey` holds its labels sorted by key, with at most one value per key.  Two label sets
/// containing the same pairs produce equal keys regardless of the order they were supplied in.
/// Labels are stored as typed pairs rather than a joined string, so keys or values containing
/// separator characters can never collide with a different label set.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SeriesKey(Vec<Label>);

impl SeriesKey {
    /// Creates an empty `SeriesKey`.
    pub fn empty() -> SeriesKey {
        SeriesKey(Vec::new())
    }

    /// Builds a `SeriesKey` from key/value pairs.
    ///
    /// When a key appears more than once, the last value wins.
    pub fn from_labels<I, K, V>(labels: I) -> SeriesKey
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let sorted = labels
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect::<BTreeMap<String, String>>();

        SeriesKey(sorted.into_iter().map(|(key, value)| Label { key, value }).collect())
    }

    /// Returns a copy of this key with `label` merged in, replacing any existing value for the
    /// same label key.
    pub fn with_label(&self, label: &Label) -> SeriesKey {
        let mut labels = self.0.clone();
        match labels.binary_search_by(|l| l.key.as_str().cmp(label.key())) {
            Ok(idx) => labels[idx].value = label.value.clone(),
            Err(idx) => labels.insert(idx, label.clone()),
        }
        SeriesKey(labels)
    }

    /// Returns a copy of this key with every label key passed through `f`.
    pub(crate) fn map_keys<F>(&self, f: F) -> SeriesKey
    where
        F: Fn(&str) -> String,
    {
        SeriesKey::from_labels(self.0.iter().map(|l| (f(l.key()), l.value.clone())))
    }

    /// Gets the labels, sorted by key.
    pub fn labels(&self) -> &[Label] {
        &self.0
    }

    /// Gets the label keys, in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(Label::key)
    }

    /// Gets the label values, ordered to match [`keys`](SeriesKey::keys).
    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(Label::value)
    }

    /// Whether or not the label keys of this series match `keys` exactly.
    pub fn has_keys(&self, keys: &[String]) -> bool {
        self.0.len() == keys.len() && self.keys().zip(keys).all(|(a, b)| a == b.as_str())
    }

    /// Number of labels in this key.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether or not this key has no labels.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for SeriesKey
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        SeriesKey::from_labels(iter)
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, label) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={:?}", label.key, label.value)?;
        }
        f.write_str("}")
    }
}

/// A label applied to every series the relay exports.
///
/// Parsed from `key:value`.  The input is split at the first colon, so the value may itself
/// contain colons, but neither side may be empty.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StaticLabel(Label);

impl StaticLabel {
    /// Creates a new `StaticLabel`.
    pub fn new<K, V>(key: K, value: V) -> Result<StaticLabel, BuildError>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let (key, value) = (key.into(), value.into());
        if key.is_empty() || value.is_empty() {
            return Err(BuildError::InvalidStaticLabel(format!("{}:{}", key, value)));
        }
        Ok(StaticLabel(Label { key, value }))
    }

    /// Gets the underlying label.
    pub fn label(&self) -> &Label {
        &self.0
    }
}

impl FromStr for StaticLabel {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((key, value)) if !key.is_empty() && !value.is_empty() => {
                StaticLabel::new(key, value)
            }
            _ => Err(BuildError::InvalidStaticLabel(s.to_owned())),
        }
    }
}
