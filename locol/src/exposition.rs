//! Prometheus text exposition format.
//!
//! Scraped text is parsed in one pass into [`MetricFamily`] values. Parsing is
//! all or nothing: any malformed line, invalid name or invalid histogram aborts
//! the whole parse and no families are returned. This keeps half-updated
//! families out of the series store and the quantile computations.
//!
//! <https://github.com/prometheus/docs/blob/main/content/docs/instrumenting/exposition_formats.md>

pub mod parser;

use std::time::{Duration, SystemTime};

pub use self::parser::Parser;

use crate::{
    histogram::{self, Histogram},
    sample::{Labels, MetricDefinition, MetricSample, MetricType},
};

/// Errors produced while parsing exposition text
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Metric name does not match `[a-zA-Z_:][a-zA-Z0-9_:]*`
    #[error("Invalid metric name: {0:?}")]
    InvalidMetricName(String),
    /// A sample or metadata line could not be understood
    #[error("Malformed metric line: {0:?}")]
    MalformedMetricLine(String),
    /// A `# TYPE` line names a type that does not exist
    #[error("Unknown metric type: {0:?}")]
    UnknownMetricType(String),
    /// A histogram family violates the cumulative bucket contract
    #[error("Invalid histogram buckets for metric {0}")]
    InvalidHistogramBuckets(String),
}

#[derive(Debug, Clone, PartialEq)]
/// One sample line belonging to a [`MetricFamily`].
pub struct FamilySample {
    /// Full sample name, including any `_bucket`, `_sum` or `_count` suffix
    pub name: String,
    /// Labels of the sample
    pub labels: Labels,
    /// Sample value
    pub value: f64,
    /// Optional timestamp in milliseconds since the Unix epoch
    pub timestamp_ms: Option<i64>,
}

impl FamilySample {
    /// Timestamp of the sample, or `default` when the line carried none.
    #[must_use]
    pub fn timestamp_or(&self, default: SystemTime) -> SystemTime {
        match self.timestamp_ms {
            Some(ms) if ms >= 0 => {
                SystemTime::UNIX_EPOCH + Duration::from_millis(ms.unsigned_abs())
            }
            Some(ms) => SystemTime::UNIX_EPOCH
                .checked_sub(Duration::from_millis(ms.unsigned_abs()))
                .unwrap_or(default),
            None => default,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// Samples sharing a base name, with their metadata.
pub struct MetricFamily {
    /// Base name of the family
    pub name: String,
    /// Text of the `# HELP` line, if any
    pub help: Option<String>,
    /// Declared or inferred type
    pub metric_type: MetricType,
    /// Samples in parse order
    pub values: Vec<FamilySample>,
}

impl MetricFamily {
    /// Metadata of this family.
    #[must_use]
    pub fn definition(&self) -> MetricDefinition {
        MetricDefinition {
            name: self.name.clone(),
            help: self.help.clone(),
            metric_type: self.metric_type,
        }
    }

    /// Every value as a normalized sample, timestamped `default` where the
    /// line carried no timestamp.
    pub fn samples(&self, default: SystemTime) -> impl Iterator<Item = MetricSample> + '_ {
        self.values.iter().map(move |s| {
            MetricSample::new(
                s.name.clone(),
                s.labels.clone(),
                s.value,
                s.timestamp_or(default),
            )
        })
    }

    /// Rebuild the histograms of this family, one result per label set. Only
    /// meaningful for [`MetricType::Histogram`] families.
    #[must_use]
    pub fn histograms(&self, timestamp: SystemTime) -> Vec<Result<Histogram, histogram::Error>> {
        Histogram::from_samples(
            &self.name,
            self.values
                .iter()
                .map(|s| (s.name.as_str(), &s.labels, s.value)),
            timestamp,
        )
    }
}

/// Parse `text` into metric families.
///
/// # Errors
///
/// See [`Error`]. Any error aborts the parse.
pub fn parse(text: &str) -> Result<Vec<MetricFamily>, Error> {
    let mut parser = Parser::new();
    for line in text.lines() {
        parser.feed_line(line)?;
    }
    parser.finish()
}
