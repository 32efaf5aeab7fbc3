//! Histogram reconstruction and quantile estimation.
//!
//! A cumulative histogram arrives as a set of bucket samples, each carrying an
//! upper bound in its `le` label and the count of observations at or below
//! that bound, plus a sum and a count. [`Histogram`] is only ever constructed
//! from a set of buckets that satisfies the cumulative contract:
//!
//! * upper bounds strictly ascending,
//! * counts non-decreasing,
//! * the final upper bound is `+Inf`.
//!
//! Anything else is rejected with [`Error::InvalidHistogramBuckets`]. A
//! histogram whose buckets are fine but whose sum or count is missing is
//! [`Error::Incomplete`]; callers skip those rather than treat them as faults.

use std::{cmp::Ordering, collections::BTreeMap, time::SystemTime};

use crate::sample::{BUCKET_LABEL, Labels};

/// Errors produced while constructing a [`Histogram`]
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Buckets violate the cumulative histogram contract.
    #[error("Invalid histogram buckets for metric {0}")]
    InvalidHistogramBuckets(String),
    /// Sum or count is absent.
    #[error("Histogram {0} is missing its sum or count")]
    Incomplete(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
/// One cumulative bucket.
pub struct Bucket {
    /// Inclusive upper bound, possibly `+Inf`
    pub upper_bound: f64,
    /// Observations at or below `upper_bound`
    pub cumulative_count: f64,
}

/// Parse a bucket bound. `+Inf` and `inf`, in any case and with an optional
/// sign, mean positive infinity. NaN is not a bound.
#[must_use]
pub fn parse_bound(s: &str) -> Option<f64> {
    let trimmed = s.trim();
    let unsigned = trimmed.strip_prefix('+').unwrap_or(trimmed);
    if unsigned.eq_ignore_ascii_case("inf") || unsigned.eq_ignore_ascii_case("infinity") {
        return Some(f64::INFINITY);
    }
    match trimmed.parse::<f64>() {
        Ok(v) if !v.is_nan() => Some(v),
        _ => None,
    }
}

/// Sort `raw` `(upper_bound, cumulative_count)` pairs and check them against
/// the cumulative contract.
///
/// # Errors
///
/// Returns [`Error::InvalidHistogramBuckets`] naming `name` if any bound or
/// count is NaN, two buckets share a bound, counts decrease, or the largest
/// bound is not `+Inf`.
pub fn validate_buckets(name: &str, mut raw: Vec<(f64, f64)>) -> Result<Vec<Bucket>, Error> {
    let invalid = || Error::InvalidHistogramBuckets(name.to_string());

    if raw.iter().any(|(b, c)| b.is_nan() || c.is_nan()) {
        return Err(invalid());
    }
    raw.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));

    match raw.last() {
        Some((bound, _)) if *bound == f64::INFINITY => {}
        _ => return Err(invalid()),
    }

    let mut buckets = Vec::with_capacity(raw.len());
    let mut prev: Option<Bucket> = None;
    for (upper_bound, cumulative_count) in raw {
        if let Some(p) = prev {
            if upper_bound <= p.upper_bound || cumulative_count < p.cumulative_count {
                return Err(invalid());
            }
        }
        let bucket = Bucket {
            upper_bound,
            cumulative_count,
        };
        buckets.push(bucket);
        prev = Some(bucket);
    }
    Ok(buckets)
}

#[derive(Debug, Clone, PartialEq)]
/// A reconstructed cumulative histogram.
pub struct Histogram {
    name: String,
    timestamp: SystemTime,
    labels: Labels,
    buckets: Vec<Bucket>,
    sum: f64,
    count: f64,
}

impl Histogram {
    /// Build a histogram from unsorted `(upper_bound, cumulative_count)`
    /// pairs.
    ///
    /// # Errors
    ///
    /// See [`validate_buckets`].
    pub fn new(
        name: impl Into<String>,
        labels: Labels,
        raw_buckets: Vec<(f64, f64)>,
        sum: f64,
        count: f64,
        timestamp: SystemTime,
    ) -> Result<Self, Error> {
        let name = name.into();
        let buckets = validate_buckets(&name, raw_buckets)?;
        Ok(Self {
            name,
            timestamp,
            labels,
            buckets,
            sum,
            count,
        })
    }

    /// Build a histogram from explicit bounds and per-bucket (not cumulative)
    /// counts, the layout used on the wire. `counts` has one more entry than
    /// `bounds`, the last counting observations above the largest bound.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Incomplete`] if there are no counts or no sum, and
    /// [`Error::InvalidHistogramBuckets`] if the lengths disagree or the
    /// resulting buckets are invalid.
    pub fn from_explicit_bounds(
        name: impl Into<String>,
        labels: Labels,
        bounds: &[f64],
        counts: &[u64],
        sum: Option<f64>,
        count: u64,
        timestamp: SystemTime,
    ) -> Result<Self, Error> {
        let name = name.into();
        if counts.is_empty() {
            return Err(Error::Incomplete(name));
        }
        if counts.len() != bounds.len() + 1 {
            return Err(Error::InvalidHistogramBuckets(name));
        }
        let Some(sum) = sum else {
            return Err(Error::Incomplete(name));
        };

        let mut cumulative = 0u64;
        let raw = bounds
            .iter()
            .copied()
            .chain(std::iter::once(f64::INFINITY))
            .zip(counts.iter())
            .map(|(bound, c)| {
                cumulative = cumulative.saturating_add(*c);
                (bound, cumulative as f64)
            })
            .collect();

        Self::new(name, labels, raw, sum, count as f64, timestamp)
    }

    /// Rebuild every histogram found in the samples of one family named
    /// `name`.
    ///
    /// Samples are `(sample_name, labels, value)`. `<name>_bucket` samples
    /// must carry an `le` label; they are grouped by their remaining labels
    /// and matched with the `<name>_sum` and `<name>_count` samples of the
    /// same label set. Any other sample is ignored. One result is produced per
    /// label set, in label order.
    pub fn from_samples<'a, I>(name: &str, samples: I, timestamp: SystemTime) -> Vec<Result<Self, Error>>
    where
        I: IntoIterator<Item = (&'a str, &'a Labels, f64)>,
    {
        #[derive(Default)]
        struct Group {
            buckets: Vec<(f64, f64)>,
            sum: Option<f64>,
            count: Option<f64>,
            bad_bound: bool,
        }

        let bucket_name = format!("{name}_bucket");
        let sum_name = format!("{name}_sum");
        let count_name = format!("{name}_count");

        let mut groups: BTreeMap<Labels, Group> = BTreeMap::new();
        for (sample_name, labels, value) in samples {
            if sample_name == bucket_name {
                let mut rest = labels.clone();
                let bound = rest.remove(BUCKET_LABEL);
                let group = groups.entry(rest).or_default();
                match bound.as_deref().and_then(parse_bound) {
                    Some(b) => group.buckets.push((b, value)),
                    None => group.bad_bound = true,
                }
            } else if sample_name == sum_name {
                groups.entry(labels.clone()).or_default().sum = Some(value);
            } else if sample_name == count_name {
                groups.entry(labels.clone()).or_default().count = Some(value);
            }
        }

        groups
            .into_iter()
            .map(|(labels, group)| {
                if group.bad_bound {
                    return Err(Error::InvalidHistogramBuckets(name.to_string()));
                }
                let buckets = validate_buckets(name, group.buckets)?;
                match (group.sum, group.count) {
                    (Some(sum), Some(count)) => Ok(Self {
                        name: name.to_string(),
                        timestamp,
                        labels,
                        buckets,
                        sum,
                        count,
                    }),
                    _ => Err(Error::Incomplete(name.to_string())),
                }
            })
            .collect()
    }

    /// Metric name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// When the histogram was observed.
    #[must_use]
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// Labels, excluding `le`.
    #[must_use]
    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    /// Replace the labels. `le` is never a histogram label and is dropped.
    #[must_use]
    pub fn with_labels(mut self, mut labels: Labels) -> Self {
        labels.remove(BUCKET_LABEL);
        self.labels = labels;
        self
    }

    /// Buckets in ascending bound order.
    #[must_use]
    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// Sum of observations.
    #[must_use]
    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// Number of observations.
    #[must_use]
    pub fn count(&self) -> f64 {
        self.count
    }

    /// Canonical identity of this histogram.
    #[must_use]
    pub fn key(&self) -> String {
        crate::key::generate_key(&self.name, &self.labels)
    }

    /// Arithmetic mean of observations, 0 when there are none.
    #[must_use]
    pub fn mean(&self) -> f64 {
        if self.count > 0.0 {
            self.sum / self.count
        } else {
            0.0
        }
    }

    /// Estimate the `p`th percentile, `p` in `[0, 100]`.
    ///
    /// Returns 0 for an empty histogram, a zero count, or `p` out of range.
    /// The estimate is the upper bound of the first bucket reaching the target
    /// rank, linearly interpolated from the previous bucket except when the
    /// match is the first bucket, the `+Inf` bucket, or follows an empty
    /// bucket. Those cases return the bound as is.
    #[must_use]
    pub fn percentile(&self, p: f64) -> f64 {
        if self.buckets.is_empty() || self.count == 0.0 || !(0.0..=100.0).contains(&p) {
            return 0.0;
        }

        let target = (p / 100.0) * self.count;
        let mut prev_bound = 0.0;
        let mut prev_count = 0.0;

        for (idx, bucket) in self.buckets.iter().enumerate() {
            if bucket.cumulative_count >= target {
                if idx == 0 || bucket.upper_bound.is_infinite() || prev_count == 0.0 {
                    return bucket.upper_bound;
                }
                return prev_bound
                    + (bucket.upper_bound - prev_bound) * (target - prev_count)
                        / (bucket.cumulative_count - prev_count);
            }
            prev_bound = bucket.upper_bound;
            prev_count = bucket.cumulative_count;
        }

        self.buckets
            .iter()
            .rev()
            .map(|b| b.upper_bound)
            .find(|b| b.is_finite())
            .unwrap_or(0.0)
    }
}
