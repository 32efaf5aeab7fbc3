//! Time-windowed series storage.
//!
//! Every distinct metric identity -- see [`crate::key`] -- maps to one
//! [`TimeSeries`]. Samples older than the retention window are evicted each
//! time a series is appended to. Eviction is lazy: a series that stops
//! receiving values keeps its stale samples until its next append or until
//! someone calls [`SeriesStore::sweep`]. There is no background timer.
//!
//! Each series sits behind its own lock. Appends to the same series serialize,
//! appends to different series only contend on the brief map lookup.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Mutex, RwLock},
    time::{Duration, SystemTime},
};

use rustc_hash::FxHashMap;

use crate::sample::{Labels, MetricDefinition, MetricSample};

/// Default age past which samples are evicted.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60 * 60);

/// Source of the current time for eviction decisions.
pub trait Clock: Send + Sync + fmt::Debug {
    /// The current time.
    fn now(&self) -> SystemTime;
}

#[derive(Debug, Clone, Copy, Default)]
/// Wall clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

#[cfg(test)]
#[derive(Debug)]
/// A clock that only moves when told to.
pub(crate) struct ManualClock {
    now: Mutex<SystemTime>,
}

#[cfg(test)]
impl ManualClock {
    /// Create a clock frozen at `now`.
    #[must_use]
    pub(crate) fn new(now: SystemTime) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Move the clock to `now`.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub(crate) fn set(&self, now: SystemTime) {
        *self.now.lock().expect("lock poisoned") = now;
    }

    /// Move the clock forward by `by`.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    pub(crate) fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("lock poisoned");
        *now += by;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().expect("lock poisoned")
    }
}

#[derive(Debug, Clone, PartialEq)]
/// A single point in a [`TimeSeries`].
pub struct Point {
    /// When the value was observed
    pub timestamp: SystemTime,
    /// The observed value
    pub value: f64,
    /// Labels of the observation
    pub labels: Labels,
}

#[derive(Debug, Clone)]
/// Samples for one metric identity within a retention window.
pub struct TimeSeries {
    identity: String,
    definition: Option<MetricDefinition>,
    points: VecDeque<Point>,
    retention: Duration,
}

impl TimeSeries {
    /// Create an empty series.
    #[must_use]
    pub fn new(
        identity: impl Into<String>,
        definition: Option<MetricDefinition>,
        retention: Duration,
    ) -> Self {
        Self {
            identity: identity.into(),
            definition,
            points: VecDeque::new(),
            retention,
        }
    }

    /// Canonical identity of this series.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Descriptive metadata, if known.
    #[must_use]
    pub fn definition(&self) -> Option<&MetricDefinition> {
        self.definition.as_ref()
    }

    /// Retention window of this series.
    #[must_use]
    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Replace the definition of this series.
    pub fn set_definition(&mut self, definition: MetricDefinition) {
        self.definition = Some(definition);
    }

    /// Append `point` and evict everything older than `now - retention`.
    pub fn append(&mut self, point: Point, now: SystemTime) {
        self.points.push_back(point);
        self.evict(now);
    }

    /// Drop points with a timestamp before `now - retention`, returning how
    /// many were dropped.
    pub fn evict(&mut self, now: SystemTime) -> usize {
        let Some(horizon) = now.checked_sub(self.retention) else {
            return 0;
        };
        let before = self.points.len();
        // Points may arrive out of timestamp order, so scan them all.
        self.points.retain(|p| p.timestamp >= horizon);
        before - self.points.len()
    }

    /// Points oldest to newest by arrival.
    pub fn points(&self) -> impl Iterator<Item = &Point> {
        self.points.iter()
    }

    /// The most recently appended point.
    #[must_use]
    pub fn latest(&self) -> Option<&Point> {
        self.points.back()
    }

    /// Number of points held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether no points are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// All series, keyed by canonical identity.
#[derive(Debug)]
pub struct SeriesStore {
    retention: Duration,
    clock: Arc<dyn Clock>,
    series: RwLock<FxHashMap<String, Arc<Mutex<TimeSeries>>>>,
}

impl SeriesStore {
    /// Create an empty store evicting after `retention`, reading time from
    /// `clock`.
    #[must_use]
    pub fn new(retention: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            retention,
            clock,
            series: RwLock::new(FxHashMap::default()),
        }
    }

    /// Retention window applied to every series.
    #[must_use]
    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Current time according to the store's clock.
    #[must_use]
    pub fn now(&self) -> SystemTime {
        self.clock.now()
    }

    fn entry(&self, identity: &str) -> Arc<Mutex<TimeSeries>> {
        if let Some(series) = self
            .series
            .read()
            .expect("lock poisoned")
            .get(identity)
        {
            return Arc::clone(series);
        }
        let mut map = self.series.write().expect("lock poisoned");
        Arc::clone(map.entry(identity.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(TimeSeries::new(identity, None, self.retention)))
        }))
    }

    /// Append `sample` to the series of its identity, creating the series if
    /// needed, then evict that series. A `definition`, when given, replaces
    /// the series' current one.
    ///
    /// # Panics
    ///
    /// Panics if a series lock is poisoned.
    pub fn add_value(&self, sample: MetricSample, definition: Option<&MetricDefinition>) {
        let identity = sample.key();
        let series = self.entry(&identity);
        let now = self.clock.now();
        let mut series = series.lock().expect("lock poisoned");
        if let Some(definition) = definition {
            if series.definition() != Some(definition) {
                series.set_definition(definition.clone());
            }
        }
        series.append(
            Point {
                timestamp: sample.timestamp,
                value: sample.value,
                labels: sample.labels,
            },
            now,
        );
    }

    /// Evict every series against the current time and forget series left
    /// empty. Returns the number of points dropped.
    ///
    /// # Panics
    ///
    /// Panics if a lock is poisoned.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut map = self.series.write().expect("lock poisoned");
        let mut dropped = 0;
        map.retain(|_, series| {
            let mut series = series.lock().expect("lock poisoned");
            dropped += series.evict(now);
            !series.is_empty()
        });
        dropped
    }

    /// Snapshot of the series for `identity`.
    ///
    /// # Panics
    ///
    /// Panics if a lock is poisoned.
    #[must_use]
    pub fn series(&self, identity: &str) -> Option<TimeSeries> {
        let map = self.series.read().expect("lock poisoned");
        map.get(identity)
            .map(|series| series.lock().expect("lock poisoned").clone())
    }

    /// Sorted identities of all series held.
    ///
    /// # Panics
    ///
    /// Panics if the map lock is poisoned.
    #[must_use]
    pub fn identities(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .series
            .read()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Number of series held.
    ///
    /// # Panics
    ///
    /// Panics if the map lock is poisoned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.series.read().expect("lock poisoned").len()
    }

    /// Whether no series are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::Arc,
        time::{Duration, SystemTime},
    };

    use super::{ManualClock, Point, SeriesStore, TimeSeries};
    use crate::sample::{Labels, MetricDefinition, MetricSample, MetricType};

    fn t0() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    fn point(timestamp: SystemTime, value: f64) -> Point {
        Point {
            timestamp,
            value,
            labels: Labels::new(),
        }
    }

    #[test]
    fn append_past_window_evicts_old() {
        let window = Duration::from_secs(3600);
        let mut series = TimeSeries::new("x", None, window);
        series.append(point(t0(), 1.0), t0());

        let later = t0() + window + Duration::from_millis(1);
        series.append(point(later, 2.0), later);

        assert_eq!(series.len(), 1);
        assert_eq!(series.latest().unwrap().value, 2.0);
    }

    #[test]
    fn sample_exactly_at_horizon_survives() {
        let window = Duration::from_secs(10);
        let mut series = TimeSeries::new("x", None, window);
        series.append(point(t0(), 1.0), t0());
        series.append(point(t0() + window, 2.0), t0() + window);
        assert_eq!(series.len(), 2);
    }

    #[test]
    fn eviction_is_lazy_until_sweep() {
        let clock = Arc::new(ManualClock::new(t0()));
        let store = SeriesStore::new(Duration::from_secs(60), clock.clone());
        store.add_value(MetricSample::new("idle", Labels::new(), 1.0, t0()), None);

        clock.advance(Duration::from_secs(120));
        // No append, stale data is still there.
        assert_eq!(store.series("idle").unwrap().len(), 1);

        assert_eq!(store.sweep(), 1);
        assert!(store.series("idle").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn store_keys_by_identity() {
        let clock = Arc::new(ManualClock::new(t0()));
        let store = SeriesStore::new(Duration::from_secs(60), clock);
        let definition = MetricDefinition {
            name: "req".to_string(),
            help: Some("requests".to_string()),
            metric_type: MetricType::Counter,
        };

        let mut a = Labels::new();
        a.insert("code".to_string(), "200".to_string());
        let mut b = Labels::new();
        b.insert("code".to_string(), "500".to_string());

        store.add_value(MetricSample::new("req", a.clone(), 1.0, t0()), Some(&definition));
        store.add_value(MetricSample::new("req", a, 2.0, t0()), None);
        store.add_value(MetricSample::new("req", b, 3.0, t0()), Some(&definition));

        assert_eq!(
            store.identities(),
            vec![
                "req{code=\"200\"}".to_string(),
                "req{code=\"500\"}".to_string()
            ]
        );
        let ok = store.series("req{code=\"200\"}").unwrap();
        assert_eq!(ok.len(), 2);
        assert_eq!(ok.definition(), Some(&definition));
    }

    #[test]
    fn concurrent_appends_to_distinct_series() {
        let clock = Arc::new(ManualClock::new(t0()));
        let store = Arc::new(SeriesStore::new(Duration::from_secs(60), clock));
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let mut labels = Labels::new();
                        labels.insert("worker".to_string(), worker.to_string());
                        store.add_value(MetricSample::new("w", labels, f64::from(i), t0()), None);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.len(), 4);
        for id in store.identities() {
            assert_eq!(store.series(&id).unwrap().len(), 100);
        }
    }
}
