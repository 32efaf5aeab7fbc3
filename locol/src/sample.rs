//! Normalized observations shared by both ingestion paths.

use std::{collections::BTreeMap, time::SystemTime};

/// Label set of a sample. Keys are unique; the map keeps them sorted so that
/// two label sets with the same pairs always compare equal.
pub type Labels = BTreeMap<String, String>;

/// Label key under which the metric name travels while a sample is inside the
/// exposition parser. Never exposed outside it.
pub const NAME_LABEL: &str = "__name__";

/// Label key that discriminates histogram buckets.
pub const BUCKET_LABEL: &str = "le";

/// Label key that discriminates summary quantiles.
pub const QUANTILE_LABEL: &str = "quantile";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Kind of a metric family
pub enum MetricType {
    /// A cumulative metric that only goes up, resetting to zero on restart
    Counter,
    /// A single numerical value that can go up and down
    Gauge,
    /// Observations counted into cumulative buckets
    Histogram,
    /// Observations summarized as precomputed quantiles plus sum and count
    Summary,
    /// Type not declared and not inferable
    #[default]
    Unknown,
}

impl MetricType {
    /// Parse the type keyword of a `# TYPE` line. `untyped` maps to
    /// [`MetricType::Unknown`].
    #[must_use]
    pub fn from_keyword(s: &str) -> Option<Self> {
        match s {
            "counter" => Some(Self::Counter),
            "gauge" => Some(Self::Gauge),
            "histogram" => Some(Self::Histogram),
            "summary" => Some(Self::Summary),
            "untyped" | "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Descriptive metadata carried alongside a series.
pub struct MetricDefinition {
    /// The metric name
    pub name: String,
    /// Help text from a `# HELP` line or an OTLP description
    pub help: Option<String>,
    /// The metric type
    pub metric_type: MetricType,
}

#[derive(Debug, Clone, PartialEq)]
/// One observation of a metric.
pub struct MetricSample {
    /// The metric name
    pub name: String,
    /// The metric labels
    pub labels: Labels,
    /// The observed value
    pub value: f64,
    /// When the observation was made
    pub timestamp: SystemTime,
}

impl MetricSample {
    /// Create a new [`MetricSample`].
    #[must_use]
    pub fn new(name: impl Into<String>, labels: Labels, value: f64, timestamp: SystemTime) -> Self {
        Self {
            name: name.into(),
            labels,
            value,
            timestamp,
        }
    }

    /// The canonical identity of this sample's series.
    #[must_use]
    pub fn key(&self) -> String {
        crate::key::generate_key(&self.name, &self.labels)
    }
}
