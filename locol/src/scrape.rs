//! Prometheus exposition scraper
//!
//! Pulls exposition text from a collector's metrics endpoint on an interval,
//! parses it and hands the resulting families to the ingestor. A scrape is
//! all or nothing: if the fetch or the parse fails nothing from that cycle is
//! forwarded.

use std::time::{Duration, SystemTime};

use metrics::counter;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    exposition::{self, MetricFamily},
    sample::Labels,
};

/// Per-request timeout of a scrape.
pub const SCRAPE_TIMEOUT: Duration = Duration::from_secs(1);

fn default_period_ms() -> u64 {
    1_000
}

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Scraper`]
pub enum Error {
    /// The endpoint could not be reached or its body read
    #[error("failed to fetch {uri}: {source}")]
    Fetch {
        /// Endpoint scraped
        uri: String,
        /// Underlying client error
        #[source]
        source: reqwest::Error,
    },
    /// The endpoint answered with a non-success status
    #[error("{uri} answered with status {status}")]
    Status {
        /// Endpoint scraped
        uri: String,
        /// HTTP status received
        status: u16,
    },
    /// The body is not valid exposition text
    #[error("failed to parse exposition from {uri}: {source}")]
    Parse {
        /// Endpoint scraped
        uri: String,
        /// Parser error
        #[source]
        source: exposition::Error,
    },
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "snake_case")]
/// Configuration for one scrape target
pub struct Config {
    /// URI to scrape
    pub uri: String,
    /// Scrape period in milliseconds
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,
    /// Metric family names to keep. Leave unset to keep all families.
    pub metrics: Option<Vec<String>>,
    /// Optional additional tags to label scraped samples
    pub tags: Option<FxHashMap<String, String>>,
}

impl Config {
    /// Scrape period as a [`Duration`]. Never zero.
    #[must_use]
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq)]
/// One successfully parsed scrape
pub struct Scrape {
    /// Endpoint scraped
    pub uri: String,
    /// When the scrape completed; the timestamp of samples that carry none
    pub timestamp: SystemTime,
    /// Configured tags, added to every sample
    pub tags: Labels,
    /// Parsed families
    pub families: Vec<MetricFamily>,
}

/// The scraper for one target.
#[derive(Debug)]
pub struct Scraper {
    config: Config,
    client: reqwest::Client,
    labels: Vec<(String, String)>,
}

impl Scraper {
    /// Create a new [`Scraper`]. `labels` are attached to the scraper's own
    /// metrics.
    #[must_use]
    pub fn new(config: Config, labels: &[(String, String)]) -> Self {
        let mut labels = labels.to_vec();
        labels.push(("uri".to_string(), config.uri.clone()));
        Self {
            config,
            client: reqwest::Client::new(),
            labels,
        }
    }

    /// Fetch and parse the target once.
    ///
    /// # Errors
    ///
    /// See [`Error`].
    pub async fn scrape(&self) -> Result<Scrape, Error> {
        let uri = &self.config.uri;
        let fetch_error = |source| Error::Fetch {
            uri: uri.clone(),
            source,
        };

        let response = self
            .client
            .get(uri)
            .timeout(SCRAPE_TIMEOUT)
            .send()
            .await
            .map_err(fetch_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status {
                uri: uri.clone(),
                status: status.as_u16(),
            });
        }
        let text = response.text().await.map_err(fetch_error)?;

        let mut families = exposition::parse(&text).map_err(|source| Error::Parse {
            uri: uri.clone(),
            source,
        })?;
        if let Some(keep) = &self.config.metrics {
            families.retain(|family| keep.contains(&family.name));
        }

        let tags = self
            .config
            .tags
            .iter()
            .flatten()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(Scrape {
            uri: uri.clone(),
            timestamp: SystemTime::now(),
            tags,
            families,
        })
    }

    /// Scrape on the configured period until `shutdown` fires or the
    /// receiving end of `sink` is dropped. Failed cycles are logged and
    /// skipped.
    pub async fn run(self, sink: mpsc::Sender<Scrape>, shutdown: locol_signal::Watcher) {
        info!(
            "Scraper for {} starting at {:?} interval",
            self.config.uri,
            self.config.period()
        );

        let shutdown_wait = shutdown.recv();
        tokio::pin!(shutdown_wait);

        let mut poll = tokio::time::interval(self.config.period());
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    match self.scrape().await {
                        Ok(scrape) => {
                            counter!("scrapes_succeeded", &self.labels).increment(1);
                            debug!("Scraped {} families from {}", scrape.families.len(), scrape.uri);
                            if sink.send(scrape).await.is_err() {
                                info!("Scrape consumer gone, stopping scraper for {}", self.config.uri);
                                return;
                            }
                        }
                        Err(e) => {
                            counter!("scrapes_failed", &self.labels).increment(1);
                            warn!("{e}");
                        }
                    }
                }
                () = &mut shutdown_wait => {
                    info!("shutdown signal received");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use rustc_hash::FxHashMap;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        sync::mpsc,
    };

    use super::{Config, Error, Scraper};
    use crate::sample::MetricType;

    /// Answer every connection with `status` and `body`.
    async fn serve(status: &'static str, body: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = stream.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 {status}\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        addr
    }

    fn config(addr: SocketAddr) -> Config {
        Config {
            uri: format!("http://{addr}/metrics"),
            period_ms: 10,
            metrics: None,
            tags: None,
        }
    }

    const BODY: &str = "# TYPE up gauge\nup 1\n# TYPE reqs counter\nreqs{code=\"200\"} 7\n";

    #[tokio::test]
    async fn scrape_parses_families() {
        let addr = serve("200 OK", BODY).await;
        let mut config = config(addr);
        let mut tags = FxHashMap::default();
        tags.insert("collector".to_string(), "edge".to_string());
        config.tags = Some(tags);

        let scrape = Scraper::new(config, &[]).scrape().await.unwrap();
        assert_eq!(scrape.families.len(), 2);
        assert_eq!(scrape.families[0].metric_type, MetricType::Gauge);
        assert_eq!(scrape.tags.get("collector").map(String::as_str), Some("edge"));
    }

    #[tokio::test]
    async fn scrape_filters_families() {
        let addr = serve("200 OK", BODY).await;
        let mut config = config(addr);
        config.metrics = Some(vec!["reqs".to_string()]);

        let scrape = Scraper::new(config, &[]).scrape().await.unwrap();
        assert_eq!(scrape.families.len(), 1);
        assert_eq!(scrape.families[0].name, "reqs");
    }

    #[tokio::test]
    async fn bad_exposition_is_all_or_nothing() {
        let addr = serve("200 OK", "up 1\nbroken line here\n").await;
        let result = Scraper::new(config(addr), &[]).scrape().await;
        assert!(matches!(result, Err(Error::Parse { .. })));
    }

    #[tokio::test]
    async fn error_status_rejected() {
        let addr = serve("503 Service Unavailable", "").await;
        let result = Scraper::new(config(addr), &[]).scrape().await;
        assert!(matches!(result, Err(Error::Status { status: 503, .. })));
    }

    #[tokio::test]
    async fn run_forwards_until_shutdown() {
        let addr = serve("200 OK", BODY).await;
        let (tx, mut rx) = mpsc::channel(4);
        let (watcher, broadcaster) = locol_signal::signal();
        let handle = tokio::spawn(Scraper::new(config(addr), &[]).run(tx, watcher));

        let scrape = rx.recv().await.unwrap();
        assert_eq!(scrape.families.len(), 2);

        // A blocked send must not keep the scraper from exiting.
        drop(rx);
        broadcaster.signal_and_wait().await;
        handle.await.unwrap();
    }
}
