//! Ingestion router.
//!
//! The [`Ingestor`] is where both entry points end. It drains the listener's
//! envelope stream and the scrapers' results and routes what they carry:
//!
//! * scalar metric points into the [`SeriesStore`],
//! * histogram points into the latest-histogram table,
//! * log records into a bounded [`CircularBuffer`] of [`LogLine`].
//!
//! Spans and profiles are only counted.

use std::{
    num::NonZeroUsize,
    sync::{Arc, Mutex, RwLock},
    time::{Duration, SystemTime},
};

use metrics::counter;
use opentelemetry_proto::tonic::{
    collector::{
        logs::v1::ExportLogsServiceRequest, metrics::v1::ExportMetricsServiceRequest,
        trace::v1::ExportTraceServiceRequest,
    },
    common::v1::{AnyValue, KeyValue, any_value},
    logs::v1::LogRecord,
    metrics::v1::{Metric, NumberDataPoint, metric::Data, number_data_point},
};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    circular_buffer::CircularBuffer,
    exposition::MetricFamily,
    histogram::{self, Histogram},
    listener::{Envelope, EnvelopeStream, ExportProfilesServiceRequest},
    sample::{Labels, MetricDefinition, MetricSample, MetricType},
    scrape::Scrape,
    series::SeriesStore,
};

#[derive(Debug, Clone, PartialEq)]
/// A log record flattened for the log buffer
pub struct LogLine {
    /// Event time, or observed time when the event time is unset
    pub timestamp: SystemTime,
    /// Severity text, derived from the severity number when absent
    pub severity: String,
    /// Body rendered as text
    pub body: String,
    /// Record attributes
    pub attributes: Labels,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// What one call to the ingestor routed where.
pub struct Ingested {
    /// Samples appended to the series store
    pub samples: u64,
    /// Histograms stored
    pub histograms: u64,
    /// Histograms rejected for invalid buckets
    pub histogram_failures: u64,
    /// Histograms skipped for a missing sum or count
    pub histograms_incomplete: u64,
    /// Exponential histogram and summary points skipped
    pub skipped_points: u64,
    /// Log records buffered
    pub logs: u64,
    /// Spans counted
    pub spans: u64,
    /// Profiles counted
    pub profiles: u64,
}

/// Routes decoded telemetry into locol's in-memory stores.
#[derive(Debug)]
pub struct Ingestor {
    store: Arc<SeriesStore>,
    histograms: RwLock<FxHashMap<String, Histogram>>,
    logs: Mutex<CircularBuffer<LogLine>>,
    labels: Vec<(String, String)>,
}

impl Ingestor {
    /// Create an ingestor writing samples to `store` and keeping at most
    /// `log_capacity` log lines. `labels` are attached to every metric the
    /// ingestor emits.
    #[must_use]
    pub fn new(
        store: Arc<SeriesStore>,
        log_capacity: NonZeroUsize,
        labels: &[(String, String)],
    ) -> Self {
        Self {
            store,
            histograms: RwLock::new(FxHashMap::default()),
            logs: Mutex::new(CircularBuffer::new(log_capacity)),
            labels: labels.to_vec(),
        }
    }

    /// The series store samples are written to.
    #[must_use]
    pub fn store(&self) -> &Arc<SeriesStore> {
        &self.store
    }

    /// Latest histogram for the canonical key `key`.
    ///
    /// # Panics
    ///
    /// Panics if the histogram lock is poisoned.
    #[must_use]
    pub fn histogram(&self, key: &str) -> Option<Histogram> {
        self.histograms
            .read()
            .expect("lock poisoned")
            .get(key)
            .cloned()
    }

    /// Sorted keys of all histograms held.
    ///
    /// # Panics
    ///
    /// Panics if the histogram lock is poisoned.
    #[must_use]
    pub fn histogram_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .histograms
            .read()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect();
        keys.sort_unstable();
        keys
    }

    /// Buffered log lines, oldest first.
    ///
    /// # Panics
    ///
    /// Panics if the log buffer lock is poisoned.
    #[must_use]
    pub fn logs(&self) -> Vec<LogLine> {
        self.logs.lock().expect("lock poisoned").iter().cloned().collect()
    }

    /// Newest buffered log line satisfying `predicate`.
    ///
    /// # Panics
    ///
    /// Panics if the log buffer lock is poisoned.
    pub fn last_log_matching<P>(&self, predicate: P) -> Option<LogLine>
    where
        P: FnMut(&LogLine) -> bool,
    {
        self.logs
            .lock()
            .expect("lock poisoned")
            .last_matching(predicate)
            .cloned()
    }

    /// Route one decoded envelope.
    pub fn ingest_envelope(&self, envelope: Envelope) -> Ingested {
        match envelope {
            Envelope::Metrics(request) => self.ingest_metrics(request),
            Envelope::Logs(request) => self.ingest_logs(request),
            Envelope::Traces(request) => self.count_spans(&request),
            Envelope::Profiles(request) => self.count_profiles(&request),
        }
    }

    fn ingest_metrics(&self, request: ExportMetricsServiceRequest) -> Ingested {
        let mut ingested = Ingested::default();
        let now = self.store.now();
        for metric in request
            .resource_metrics
            .into_iter()
            .flat_map(|rm| rm.scope_metrics)
            .flat_map(|sm| sm.metrics)
        {
            self.ingest_metric(metric, now, &mut ingested);
        }
        self.record(&ingested);
        ingested
    }

    fn ingest_metric(&self, metric: Metric, now: SystemTime, ingested: &mut Ingested) {
        let Some(data) = metric.data else {
            debug!("Metric {} carries no data", metric.name);
            return;
        };
        let help = (!metric.description.is_empty()).then_some(metric.description);
        let definition = |metric_type| MetricDefinition {
            name: metric.name.clone(),
            help: help.clone(),
            metric_type,
        };

        match data {
            Data::Gauge(gauge) => {
                let definition = definition(MetricType::Gauge);
                self.ingest_number_points(&definition, gauge.data_points, now, ingested);
            }
            Data::Sum(sum) => {
                let metric_type = if sum.is_monotonic {
                    MetricType::Counter
                } else {
                    MetricType::Gauge
                };
                let definition = definition(metric_type);
                self.ingest_number_points(&definition, sum.data_points, now, ingested);
            }
            Data::Histogram(h) => {
                for point in h.data_points {
                    let result = Histogram::from_explicit_bounds(
                        metric.name.as_str(),
                        attributes_to_labels(&point.attributes),
                        &point.explicit_bounds,
                        &point.bucket_counts,
                        point.sum,
                        point.count,
                        timestamp_or(point.time_unix_nano, now),
                    );
                    // A bad point only costs itself; its siblings still land.
                    match result {
                        Ok(histogram) => {
                            self.store_histogram(histogram);
                            ingested.histograms += 1;
                        }
                        Err(histogram::Error::Incomplete(name)) => {
                            debug!("Skipping incomplete histogram {name}");
                            ingested.histograms_incomplete += 1;
                        }
                        Err(e @ histogram::Error::InvalidHistogramBuckets(_)) => {
                            warn!("Dropping histogram point: {e}");
                            ingested.histogram_failures += 1;
                        }
                    }
                }
            }
            Data::ExponentialHistogram(eh) => {
                ingested.skipped_points += eh.data_points.len() as u64;
            }
            Data::Summary(s) => {
                ingested.skipped_points += s.data_points.len() as u64;
            }
        }
    }

    fn ingest_number_points(
        &self,
        definition: &MetricDefinition,
        points: Vec<NumberDataPoint>,
        now: SystemTime,
        ingested: &mut Ingested,
    ) {
        for point in points {
            #[allow(clippy::cast_precision_loss)]
            let value = match point.value {
                Some(number_data_point::Value::AsDouble(v)) => v,
                Some(number_data_point::Value::AsInt(v)) => v as f64,
                None => continue,
            };
            let sample = MetricSample::new(
                definition.name.as_str(),
                attributes_to_labels(&point.attributes),
                value,
                timestamp_or(point.time_unix_nano, now),
            );
            self.store.add_value(sample, Some(definition));
            ingested.samples += 1;
        }
    }

    fn ingest_logs(&self, request: ExportLogsServiceRequest) -> Ingested {
        let mut ingested = Ingested::default();
        let now = self.store.now();
        let mut buffer = self.logs.lock().expect("lock poisoned");
        for record in request
            .resource_logs
            .into_iter()
            .flat_map(|rl| rl.scope_logs)
            .flat_map(|sl| sl.log_records)
        {
            buffer.push(log_line(record, now));
            ingested.logs += 1;
        }
        drop(buffer);
        self.record(&ingested);
        ingested
    }

    fn count_spans(&self, request: &ExportTraceServiceRequest) -> Ingested {
        let spans = request
            .resource_spans
            .iter()
            .flat_map(|rs| &rs.scope_spans)
            .map(|ss| ss.spans.len() as u64)
            .sum();
        let ingested = Ingested {
            spans,
            ..Ingested::default()
        };
        self.record(&ingested);
        ingested
    }

    fn count_profiles(&self, request: &ExportProfilesServiceRequest) -> Ingested {
        let profiles = request
            .resource_profiles
            .iter()
            .flat_map(|rp| &rp.scope_profiles)
            .map(|sp| sp.profiles.len() as u64)
            .sum();
        let ingested = Ingested {
            profiles,
            ..Ingested::default()
        };
        self.record(&ingested);
        ingested
    }

    /// Route the families of one successful scrape. Counter, gauge, summary
    /// and untyped values go to the series store; histogram families are
    /// rebuilt and stored as histograms.
    pub fn ingest_scrape(&self, scrape: Scrape) -> Ingested {
        let mut ingested = Ingested::default();
        for family in &scrape.families {
            self.ingest_family(family, &scrape.tags, scrape.timestamp, &mut ingested);
        }
        self.record(&ingested);
        ingested
    }

    fn ingest_family(
        &self,
        family: &MetricFamily,
        tags: &Labels,
        timestamp: SystemTime,
        ingested: &mut Ingested,
    ) {
        if family.metric_type == MetricType::Histogram {
            for result in family.histograms(timestamp) {
                match result {
                    Ok(histogram) => {
                        let histogram = if tags.is_empty() {
                            histogram
                        } else {
                            retag(histogram, tags)
                        };
                        self.store_histogram(histogram);
                        ingested.histograms += 1;
                    }
                    Err(histogram::Error::Incomplete(name)) => {
                        debug!("Skipping incomplete histogram {name}");
                        ingested.histograms_incomplete += 1;
                    }
                    Err(e @ histogram::Error::InvalidHistogramBuckets(_)) => {
                        warn!("Dropping histogram: {e}");
                        ingested.histogram_failures += 1;
                    }
                }
            }
            return;
        }

        let definition = family.definition();
        for mut sample in family.samples(timestamp) {
            for (k, v) in tags {
                sample
                    .labels
                    .entry(k.clone())
                    .or_insert_with(|| v.clone());
            }
            self.store.add_value(sample, Some(&definition));
            ingested.samples += 1;
        }
    }

    fn store_histogram(&self, histogram: Histogram) {
        let key = histogram.key();
        let mut histograms = self.histograms.write().expect("lock poisoned");
        match histograms.get(&key) {
            Some(existing) if existing.timestamp() > histogram.timestamp() => {
                debug!("Ignoring out of order histogram for {key}");
            }
            _ => {
                histograms.insert(key, histogram);
            }
        }
    }

    fn record(&self, ingested: &Ingested) {
        let labels = &self.labels;
        for (name, value) in [
            ("samples_ingested", ingested.samples),
            ("histograms_ingested", ingested.histograms),
            ("histogram_failures", ingested.histogram_failures),
            ("histograms_incomplete", ingested.histograms_incomplete),
            ("data_points_skipped", ingested.skipped_points),
            ("log_records_received", ingested.logs),
            ("spans_received", ingested.spans),
            ("profiles_received", ingested.profiles),
        ] {
            if value > 0 {
                counter!(name, labels).increment(value);
            }
        }
    }

    /// Drain `envelopes` and `scrapes` until both have ended or `shutdown`
    /// fires.
    pub async fn run(
        self: Arc<Self>,
        mut envelopes: EnvelopeStream,
        mut scrapes: mpsc::Receiver<Scrape>,
        shutdown: locol_signal::Watcher,
    ) {
        let shutdown_wait = shutdown.recv();
        tokio::pin!(shutdown_wait);

        let mut envelopes_open = true;
        let mut scrapes_open = true;
        while envelopes_open || scrapes_open {
            tokio::select! {
                () = &mut shutdown_wait => {
                    info!("shutdown signal received");
                    return;
                }
                envelope = envelopes.recv(), if envelopes_open => match envelope {
                    Some(envelope) => {
                        self.ingest_envelope(envelope);
                    }
                    None => {
                        debug!("Envelope stream ended");
                        envelopes_open = false;
                    }
                },
                scrape = scrapes.recv(), if scrapes_open => match scrape {
                    Some(scrape) => {
                        self.ingest_scrape(scrape);
                    }
                    None => {
                        debug!("Scrape channel closed");
                        scrapes_open = false;
                    }
                },
            }
        }
        info!("All ingestion sources ended");
    }
}

/// Copy of `histogram` with `tags` added to its labels. Labels already
/// present win.
fn retag(histogram: Histogram, tags: &Labels) -> Histogram {
    let mut labels = histogram.labels().clone();
    for (k, v) in tags {
        labels.entry(k.clone()).or_insert_with(|| v.clone());
    }
    histogram.with_labels(labels)
}

/// `nanos` since the Unix epoch, or `default` when zero.
fn timestamp_or(nanos: u64, default: SystemTime) -> SystemTime {
    if nanos == 0 {
        default
    } else {
        SystemTime::UNIX_EPOCH + Duration::from_nanos(nanos)
    }
}

fn attributes_to_labels(attributes: &[KeyValue]) -> Labels {
    attributes
        .iter()
        .map(|kv| {
            let value = kv.value.as_ref().map(any_value_string).unwrap_or_default();
            (kv.key.clone(), value)
        })
        .collect()
}

fn any_value_string(value: &AnyValue) -> String {
    use any_value::Value;

    match &value.value {
        Some(Value::StringValue(s)) => s.clone(),
        Some(Value::BoolValue(b)) => b.to_string(),
        Some(Value::IntValue(i)) => i.to_string(),
        Some(Value::DoubleValue(d)) => d.to_string(),
        Some(Value::BytesValue(bytes)) => bytes.iter().map(|b| format!("{b:02x}")).collect(),
        Some(Value::ArrayValue(array)) => {
            let items: Vec<String> = array.values.iter().map(any_value_string).collect();
            format!("[{}]", items.join(","))
        }
        Some(Value::KvlistValue(list)) => {
            let items: Vec<String> = list
                .values
                .iter()
                .map(|kv| {
                    let v = kv.value.as_ref().map(any_value_string).unwrap_or_default();
                    format!("{}={v}", kv.key)
                })
                .collect();
            format!("{{{}}}", items.join(","))
        }
        None => String::new(),
    }
}

/// Severity text for an OTLP severity number, per the log data model ranges.
fn severity_name(number: i32) -> &'static str {
    match number {
        1..=4 => "TRACE",
        5..=8 => "DEBUG",
        9..=12 => "INFO",
        13..=16 => "WARN",
        17..=20 => "ERROR",
        21..=24 => "FATAL",
        _ => "UNSPECIFIED",
    }
}

fn log_line(record: LogRecord, now: SystemTime) -> LogLine {
    let nanos = if record.time_unix_nano == 0 {
        record.observed_time_unix_nano
    } else {
        record.time_unix_nano
    };
    let severity = if record.severity_text.is_empty() {
        severity_name(record.severity_number).to_string()
    } else {
        record.severity_text
    };
    LogLine {
        timestamp: timestamp_or(nanos, now),
        severity,
        body: record.body.as_ref().map(any_value_string).unwrap_or_default(),
        attributes: attributes_to_labels(&record.attributes),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        num::NonZeroUsize,
        sync::Arc,
        time::{Duration, SystemTime},
    };

    use opentelemetry_proto::tonic::{
        collector::{
            logs::v1::ExportLogsServiceRequest, metrics::v1::ExportMetricsServiceRequest,
            trace::v1::ExportTraceServiceRequest,
        },
        common::v1::{AnyValue, ArrayValue, KeyValue, any_value},
        logs::v1::{LogRecord, ResourceLogs, ScopeLogs},
        metrics::v1::{
            Gauge, Histogram as OtlpHistogram, HistogramDataPoint, Metric, NumberDataPoint,
            ResourceMetrics, ScopeMetrics, Sum, Summary, SummaryDataPoint, metric::Data,
            number_data_point,
        },
        profiles::v1::{Profile, ResourceProfiles, ScopeProfiles},
        trace::v1::{ResourceSpans, ScopeSpans, Span},
    };

    use super::{Ingestor, any_value_string, severity_name};
    use crate::{
        exposition,
        listener::{Envelope, ExportProfilesServiceRequest},
        sample::MetricType,
        scrape::Scrape,
        series::{ManualClock, SeriesStore},
    };

    fn t0() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    fn ingestor() -> Ingestor {
        let clock = Arc::new(ManualClock::new(t0()));
        let store = Arc::new(SeriesStore::new(Duration::from_secs(3600), clock));
        Ingestor::new(store, NonZeroUsize::new(2).unwrap(), &[])
    }

    fn string_attr(key: &str, value: &str) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: Some(AnyValue {
                value: Some(any_value::Value::StringValue(value.to_string())),
            }),
        }
    }

    fn metrics(metrics: Vec<Metric>) -> Envelope {
        Envelope::Metrics(ExportMetricsServiceRequest {
            resource_metrics: vec![ResourceMetrics {
                scope_metrics: vec![ScopeMetrics {
                    metrics,
                    ..Default::default()
                }],
                ..Default::default()
            }],
        })
    }

    fn histogram_point(bounds: Vec<f64>, counts: Vec<u64>, host: &str) -> HistogramDataPoint {
        HistogramDataPoint {
            attributes: vec![string_attr("host", host)],
            count: counts.iter().sum(),
            sum: Some(10.0),
            bucket_counts: counts,
            explicit_bounds: bounds,
            ..Default::default()
        }
    }

    #[test]
    fn gauge_and_sum_points_become_samples() {
        let ingestor = ingestor();
        let gauge = Metric {
            name: "temperature".to_string(),
            description: "degrees".to_string(),
            data: Some(Data::Gauge(Gauge {
                data_points: vec![NumberDataPoint {
                    attributes: vec![string_attr("room", "a")],
                    value: Some(number_data_point::Value::AsDouble(21.5)),
                    ..Default::default()
                }],
            })),
            ..Default::default()
        };
        let sum = Metric {
            name: "requests".to_string(),
            data: Some(Data::Sum(Sum {
                data_points: vec![NumberDataPoint {
                    value: Some(number_data_point::Value::AsInt(42)),
                    ..Default::default()
                }],
                is_monotonic: true,
                ..Default::default()
            })),
            ..Default::default()
        };

        let ingested = ingestor.ingest_envelope(metrics(vec![gauge, sum]));
        assert_eq!(ingested.samples, 2);

        let store = ingestor.store();
        let temperature = store.series("temperature{room=\"a\"}").unwrap();
        assert_eq!(temperature.latest().unwrap().value, 21.5);
        // Unset timestamps fall back to the store clock.
        assert_eq!(temperature.latest().unwrap().timestamp, t0());
        assert_eq!(
            temperature.definition().unwrap().help.as_deref(),
            Some("degrees")
        );

        let requests = store.series("requests").unwrap();
        assert_eq!(requests.latest().unwrap().value, 42.0);
        assert_eq!(
            requests.definition().unwrap().metric_type,
            MetricType::Counter
        );
    }

    #[test]
    fn bad_histogram_point_does_not_affect_siblings() {
        let ingestor = ingestor();
        let metric = Metric {
            name: "latency".to_string(),
            data: Some(Data::Histogram(OtlpHistogram {
                data_points: vec![
                    histogram_point(vec![1.0, 2.0], vec![1, 2, 3], "good"),
                    // Bounds not ascending.
                    histogram_point(vec![2.0, 1.0], vec![1, 2, 3], "bad"),
                    // Length mismatch.
                    histogram_point(vec![1.0], vec![1, 2, 3], "short"),
                ],
                ..Default::default()
            })),
            ..Default::default()
        };

        let ingested = ingestor.ingest_envelope(metrics(vec![metric]));
        assert_eq!(ingested.histograms, 1);
        assert_eq!(ingested.histogram_failures, 2);

        assert_eq!(
            ingestor.histogram_keys(),
            vec!["latency{host=\"good\"}".to_string()]
        );
        let h = ingestor.histogram("latency{host=\"good\"}").unwrap();
        assert_eq!(h.count(), 6.0);
        assert_eq!(h.buckets().last().unwrap().upper_bound, f64::INFINITY);
        assert_eq!(h.buckets().last().unwrap().cumulative_count, 6.0);
    }

    #[test]
    fn histogram_without_sum_is_skipped() {
        let ingestor = ingestor();
        let mut point = histogram_point(vec![1.0], vec![1, 1], "x");
        point.sum = None;
        let metric = Metric {
            name: "latency".to_string(),
            data: Some(Data::Histogram(OtlpHistogram {
                data_points: vec![point],
                ..Default::default()
            })),
            ..Default::default()
        };
        let ingested = ingestor.ingest_envelope(metrics(vec![metric]));
        assert_eq!(ingested.histograms_incomplete, 1);
        assert!(ingestor.histogram_keys().is_empty());
    }

    #[test]
    fn summaries_are_skipped() {
        let ingestor = ingestor();
        let metric = Metric {
            name: "rpc".to_string(),
            data: Some(Data::Summary(Summary {
                data_points: vec![SummaryDataPoint::default(), SummaryDataPoint::default()],
            })),
            ..Default::default()
        };
        let ingested = ingestor.ingest_envelope(metrics(vec![metric]));
        assert_eq!(ingested.skipped_points, 2);
        assert!(ingestor.store().is_empty());
    }

    #[test]
    fn logs_fill_ring_buffer() {
        let ingestor = ingestor();
        let record = |body: &str, severity: i32| LogRecord {
            time_unix_nano: 1_000_000_000,
            severity_number: severity,
            body: Some(AnyValue {
                value: Some(any_value::Value::StringValue(body.to_string())),
            }),
            attributes: vec![string_attr("service", "api")],
            ..Default::default()
        };
        let request = ExportLogsServiceRequest {
            resource_logs: vec![ResourceLogs {
                scope_logs: vec![ScopeLogs {
                    log_records: vec![record("one", 9), record("two", 17), record("three", 9)],
                    ..Default::default()
                }],
                ..Default::default()
            }],
        };

        let ingested = ingestor.ingest_envelope(Envelope::Logs(request));
        assert_eq!(ingested.logs, 3);

        // Capacity two: the oldest line was overwritten.
        let logs = ingestor.logs();
        let bodies: Vec<&str> = logs.iter().map(|l| l.body.as_str()).collect();
        assert_eq!(bodies, vec!["two", "three"]);
        assert_eq!(logs[0].severity, "ERROR");
        assert_eq!(
            logs[0].timestamp,
            SystemTime::UNIX_EPOCH + Duration::from_secs(1)
        );
        assert_eq!(logs[0].attributes.get("service").map(String::as_str), Some("api"));

        let error = ingestor.last_log_matching(|l| l.severity == "ERROR").unwrap();
        assert_eq!(error.body, "two");
    }

    #[test]
    fn spans_are_counted() {
        let ingestor = ingestor();
        let request = ExportTraceServiceRequest {
            resource_spans: vec![ResourceSpans {
                scope_spans: vec![ScopeSpans {
                    spans: vec![Span::default(), Span::default(), Span::default()],
                    ..Default::default()
                }],
                ..Default::default()
            }],
        };
        let ingested = ingestor.ingest_envelope(Envelope::Traces(request));
        assert_eq!(ingested.spans, 3);
        assert!(ingestor.store().is_empty());
    }

    #[test]
    fn profiles_are_counted() {
        let ingestor = ingestor();
        let request = ExportProfilesServiceRequest {
            resource_profiles: vec![ResourceProfiles {
                scope_profiles: vec![ScopeProfiles {
                    profiles: vec![Profile::default(), Profile::default()],
                    ..Default::default()
                }],
                ..Default::default()
            }],
        };
        let ingested = ingestor.ingest_envelope(Envelope::Profiles(request));
        assert_eq!(ingested.profiles, 2);
        assert!(ingestor.store().is_empty());
    }

    #[test]
    fn scrape_routes_families() {
        let ingestor = ingestor();
        let text = r#"
# TYPE up gauge
up{job="otelcol"} 1
# TYPE rpc_seconds histogram
rpc_seconds_bucket{le="0.1"} 10
rpc_seconds_bucket{le="+Inf"} 20
rpc_seconds_sum 3
rpc_seconds_count 20
"#;
        let mut tags = crate::sample::Labels::new();
        tags.insert("collector".to_string(), "edge".to_string());
        let scrape = Scrape {
            uri: "http://localhost:8888/metrics".to_string(),
            timestamp: t0(),
            tags,
            families: exposition::parse(text).unwrap(),
        };

        let ingested = ingestor.ingest_scrape(scrape);
        assert_eq!(ingested.samples, 1);
        assert_eq!(ingested.histograms, 1);

        let up = ingestor
            .store()
            .series("up{collector=\"edge\",job=\"otelcol\"}")
            .unwrap();
        assert_eq!(up.definition().unwrap().metric_type, MetricType::Gauge);

        let h = ingestor.histogram("rpc_seconds{collector=\"edge\"}").unwrap();
        assert_eq!(h.percentile(50.0), 0.1);
    }

    #[test]
    fn newer_histogram_replaces_older() {
        let ingestor = ingestor();
        let at = |secs: u64, counts: Vec<u64>| {
            let mut point = histogram_point(vec![1.0], counts, "x");
            point.time_unix_nano = secs * 1_000_000_000;
            Metric {
                name: "h".to_string(),
                data: Some(Data::Histogram(OtlpHistogram {
                    data_points: vec![point],
                    ..Default::default()
                })),
                ..Default::default()
            }
        };

        ingestor.ingest_envelope(metrics(vec![at(20, vec![5, 5])]));
        ingestor.ingest_envelope(metrics(vec![at(10, vec![1, 1])]));
        assert_eq!(ingestor.histogram("h{host=\"x\"}").unwrap().count(), 10.0);
        ingestor.ingest_envelope(metrics(vec![at(30, vec![2, 2])]));
        assert_eq!(ingestor.histogram("h{host=\"x\"}").unwrap().count(), 4.0);
    }

    #[test]
    fn attribute_rendering() {
        let array = AnyValue {
            value: Some(any_value::Value::ArrayValue(ArrayValue {
                values: vec![
                    AnyValue {
                        value: Some(any_value::Value::IntValue(1)),
                    },
                    AnyValue {
                        value: Some(any_value::Value::BoolValue(true)),
                    },
                ],
            })),
        };
        assert_eq!(any_value_string(&array), "[1,true]");
        let bytes = AnyValue {
            value: Some(any_value::Value::BytesValue(vec![0xde, 0xad])),
        };
        assert_eq!(any_value_string(&bytes), "dead");
        assert_eq!(severity_name(0), "UNSPECIFIED");
        assert_eq!(severity_name(13), "WARN");
    }

    #[tokio::test]
    async fn run_drains_until_sources_end() {
        let ingestor = Arc::new(ingestor());
        let listener = crate::listener::Listener::new(
            crate::listener::Config {
                addr: "127.0.0.1:0".parse().unwrap(),
                ..Default::default()
            },
            &[],
        );
        listener.start().await.unwrap();
        let envelopes = listener.envelopes().unwrap();
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        let (watcher, _broadcaster) = locol_signal::signal();

        let handle = tokio::spawn(Arc::clone(&ingestor).run(envelopes, rx, watcher));
        tx.send(Scrape {
            uri: String::new(),
            timestamp: t0(),
            tags: crate::sample::Labels::new(),
            families: exposition::parse("up 1\n").unwrap(),
        })
        .await
        .unwrap();
        drop(tx);
        listener.stop().await;

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(ingestor.store().series("up").is_some());
    }
}
