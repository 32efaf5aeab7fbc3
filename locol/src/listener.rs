//! OTLP/HTTP ingestion listener.
//!
//! The listener accepts OTLP export requests on `POST /v1/traces`,
//! `/v1/metrics`, `/v1/logs` and `/v1/profiles`, decodes each body into the
//! matching protobuf message and publishes it, wrapped in an [`Envelope`], on
//! an ordered stream. Consumers take the stream with
//! [`Listener::envelopes`].
//!
//! ## Lifecycle
//!
//! `Stopped -> Starting -> Running -> Stopping -> Stopped`. Bind failure goes
//! straight from `Starting` back to `Stopped`. [`Listener::stop`] is
//! idempotent and may be called before [`Listener::start`]; every stop ends
//! the publish stream so consumers observe a clean end of input.
//!
//! ## Metrics
//!
//! | Metric | Description |
//! | --- | --- |
//! | `requests_received` | Requests routed to a signal endpoint |
//! | `bytes_received` | Raw body bytes received, before decompression |
//! | `decode_failures` | Bodies that failed protobuf decoding |
//! | `envelopes_published` | Envelopes handed to the publish stream |
//! | `connection.limit` / `connection.current` | Connection concurrency |
//!
//! Signal endpoint metrics carry a `signal` label.

mod common;
pub mod routes;

use std::{
    net::SocketAddr,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::Duration,
};

use opentelemetry_proto::tonic::{
    collector::{
        logs::v1::ExportLogsServiceRequest, metrics::v1::ExportMetricsServiceRequest,
        trace::v1::ExportTraceServiceRequest,
    },
    profiles::v1::ResourceProfiles,
};
use prost::Message;
use serde::Deserialize;
use tokio::{net::TcpListener, sync::mpsc, sync::watch, task::JoinHandle};
use tokio_stream::Stream;
use tracing::{error, info, warn};

fn default_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 4318))
}

fn default_concurrency_limit() -> usize {
    100
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
/// Configuration for [`Listener`]
pub struct Config {
    /// Address to listen on
    #[serde(default = "default_addr")]
    pub addr: SocketAddr,
    /// Maximum number of connections served at once; connections beyond it
    /// are dropped
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    /// How long `stop` waits for in-flight connections to drain, in
    /// milliseconds
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            concurrency_limit: default_concurrency_limit(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl Config {
    /// The drain grace period as a [`Duration`].
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Listener`]
pub enum Error {
    /// The listen address could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address we attempted to bind
        addr: SocketAddr,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },
    /// The serving task ended abnormally
    #[error("listener task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Lifecycle state of a [`Listener`]
pub enum State {
    /// Not serving
    Stopped,
    /// Binding
    Starting,
    /// Accepting connections
    Running,
    /// Draining connections
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// The OTLP signal an endpoint carries
pub enum Signal {
    /// Spans
    Traces,
    /// Metric data points
    Metrics,
    /// Log records
    Logs,
    /// Profiles
    Profiles,
}

impl Signal {
    /// All signals, in route registration order.
    pub const ALL: [Signal; 4] = [
        Signal::Traces,
        Signal::Metrics,
        Signal::Logs,
        Signal::Profiles,
    ];

    /// Short lowercase name, used as a metric label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Signal::Traces => "traces",
            Signal::Metrics => "metrics",
            Signal::Logs => "logs",
            Signal::Profiles => "profiles",
        }
    }

    /// HTTP path of this signal's endpoint.
    #[must_use]
    pub fn path(self) -> &'static str {
        match self {
            Signal::Traces => "/v1/traces",
            Signal::Metrics => "/v1/metrics",
            Signal::Logs => "/v1/logs",
            Signal::Profiles => "/v1/profiles",
        }
    }

    /// Decode `body` as this signal's export request.
    ///
    /// # Errors
    ///
    /// Returns the protobuf decode error if `body` is not a valid message.
    pub fn decode(self, body: &[u8]) -> Result<Envelope, prost::DecodeError> {
        Ok(match self {
            Signal::Traces => Envelope::Traces(ExportTraceServiceRequest::decode(body)?),
            Signal::Metrics => Envelope::Metrics(ExportMetricsServiceRequest::decode(body)?),
            Signal::Logs => Envelope::Logs(ExportLogsServiceRequest::decode(body)?),
            Signal::Profiles => Envelope::Profiles(ExportProfilesServiceRequest::decode(body)?),
        })
    }
}

/// Body of `POST /v1/profiles`, per
/// `collector/profiles/v1development/profiles_service.proto`.
/// `opentelemetry-proto` generates the profile data types but not this
/// collector message. The shared dictionary (field 2) is not kept.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ExportProfilesServiceRequest {
    /// Profiles grouped by resource
    #[prost(message, repeated, tag = "1")]
    pub resource_profiles: Vec<ResourceProfiles>,
}

#[derive(Debug, Clone, PartialEq)]
/// A decoded OTLP export request
pub enum Envelope {
    /// `POST /v1/traces`
    Traces(ExportTraceServiceRequest),
    /// `POST /v1/metrics`
    Metrics(ExportMetricsServiceRequest),
    /// `POST /v1/logs`
    Logs(ExportLogsServiceRequest),
    /// `POST /v1/profiles`
    Profiles(ExportProfilesServiceRequest),
}

impl Envelope {
    /// The signal this envelope carries.
    #[must_use]
    pub fn signal(&self) -> Signal {
        match self {
            Envelope::Traces(_) => Signal::Traces,
            Envelope::Metrics(_) => Signal::Metrics,
            Envelope::Logs(_) => Signal::Logs,
            Envelope::Profiles(_) => Signal::Profiles,
        }
    }
}

#[derive(Debug)]
/// Ordered stream of published envelopes. Ends once the listener stops.
pub struct EnvelopeStream {
    receiver: mpsc::UnboundedReceiver<Envelope>,
}

impl EnvelopeStream {
    /// Receive the next envelope, `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.receiver.recv().await
    }
}

impl Stream for EnvelopeStream {
    type Item = Envelope;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Envelope>> {
        self.receiver.poll_recv(cx)
    }
}

/// State shared between the [`Listener`] handle, its serving task and the
/// request handlers.
#[derive(Debug)]
pub(crate) struct Shared {
    state: watch::Sender<State>,
    /// Publish slot. `None` whenever the listener is not running.
    publisher: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    /// Stream for the current run, until a consumer takes it.
    stream: Mutex<Option<EnvelopeStream>>,
    last_error: Mutex<Option<String>>,
    last_decode_error: Mutex<Option<String>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Shared {
    fn new() -> Self {
        let (state, _) = watch::channel(State::Stopped);
        Self {
            state,
            publisher: Mutex::new(None),
            stream: Mutex::new(None),
            last_error: Mutex::new(None),
            last_decode_error: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    fn set_state(&self, state: State) {
        self.state.send_replace(state);
    }

    /// Open a fresh publish stream, replacing any previous one.
    fn open(&self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.publisher.lock().expect("lock poisoned") = Some(sender);
        *self.stream.lock().expect("lock poisoned") = Some(EnvelopeStream { receiver });
    }

    /// Drop the publish sender so that consumers see the end of the stream.
    fn close(&self) {
        self.publisher.lock().expect("lock poisoned").take();
    }

    /// Publish `envelope` in arrival order. Returns `false` if the listener
    /// is shutting down or no one is listening.
    pub(crate) fn publish(&self, envelope: Envelope) -> bool {
        let publisher = self.publisher.lock().expect("lock poisoned");
        match publisher.as_ref() {
            Some(sender) => sender.send(envelope).is_ok(),
            None => false,
        }
    }

    fn record_error(&self, error: &Error) {
        *self.last_error.lock().expect("lock poisoned") = Some(error.to_string());
    }

    pub(crate) fn record_decode_error(&self, reason: String) {
        *self.last_decode_error.lock().expect("lock poisoned") = Some(reason);
    }
}

#[derive(Debug)]
struct Running {
    broadcaster: locol_signal::Broadcaster,
    task: JoinHandle<Result<(), common::Error>>,
}

#[derive(Debug)]
/// The OTLP/HTTP listener.
pub struct Listener {
    config: Config,
    labels: Vec<(String, String)>,
    shared: Arc<Shared>,
    /// Serializes `start` and `stop`.
    running: tokio::sync::Mutex<Option<Running>>,
}

impl Listener {
    /// Create a stopped listener. `labels` are attached to every metric the
    /// listener emits.
    #[must_use]
    pub fn new(config: Config, labels: &[(String, String)]) -> Self {
        Self {
            config,
            labels: labels.to_vec(),
            shared: Arc::new(Shared::new()),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> State {
        *self.shared.state.borrow()
    }

    /// Watch lifecycle transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<State> {
        self.shared.state.subscribe()
    }

    /// The most recent bind or serving failure, if any.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().expect("lock poisoned").clone()
    }

    /// Reason the most recent undecodable request was rejected, if any.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn last_decode_error(&self) -> Option<String> {
        self.shared
            .last_decode_error
            .lock()
            .expect("lock poisoned")
            .clone()
    }

    /// Address actually bound by the current run. Useful when configured
    /// with port 0.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock().expect("lock poisoned")
    }

    /// Take the envelope stream of the current run. Each run has exactly one
    /// stream; later calls return `None` until the next `start`.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn envelopes(&self) -> Option<EnvelopeStream> {
        self.shared.stream.lock().expect("lock poisoned").take()
    }

    /// Bind and begin serving. Returns once the bind has been attempted. A
    /// no-op when already running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Bind`] if the address cannot be bound. The error is
    /// also recorded as [`Listener::last_error`] and the listener is left
    /// `Stopped`.
    pub async fn start(&self) -> Result<(), Error> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            if !current.task.is_finished() {
                return Ok(());
            }
            // The serving task died on its own; it already recorded why.
            running.take();
        }

        self.shared.set_state(State::Starting);
        let addr = self.config.addr;
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(source) => {
                let error = Error::Bind { addr, source };
                error!("OTLP listener failed to start: {error}");
                self.shared.record_error(&error);
                self.shared.set_state(State::Stopped);
                return Err(error);
            }
        };
        let local_addr = listener.local_addr().ok();
        *self.shared.local_addr.lock().expect("lock poisoned") = local_addr;
        info!(
            "Starting OTLP HTTP listener on {}",
            local_addr.unwrap_or(addr)
        );

        self.shared.open();
        let (watcher, broadcaster) = locol_signal::signal();
        let router = Arc::new(routes::Router::otlp(&self.shared, &self.labels));
        let shared = Arc::clone(&self.shared);
        let labels = self.labels.clone();
        let concurrency_limit = self.config.concurrency_limit;

        let task = tokio::spawn(async move {
            let service = routes::Service::new(router);
            let result =
                common::run_httpd(listener, concurrency_limit, watcher, labels, move || {
                    let service = service.clone();
                    hyper::service::service_fn(move |req| {
                        let service = service.clone();
                        service.handle_request(req)
                    })
                })
                .await;

            if let Err(e) = &result {
                error!("OTLP listener failed: {e}");
                shared.record_error(&Error::Task(e.to_string()));
                shared.close();
                shared.set_state(State::Stopped);
            }
            result
        });

        *running = Some(Running { broadcaster, task });
        self.shared.set_state(State::Running);
        Ok(())
    }

    /// Stop serving. Signals the accept loop, drains in-flight connections
    /// for at most the configured grace period, ends the publish stream and
    /// leaves the listener `Stopped`. Safe to call at any time, any number of
    /// times.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(Running {
            broadcaster,
            mut task,
        }) = running.take()
        else {
            self.shared.close();
            self.shared.set_state(State::Stopped);
            return;
        };

        self.shared.set_state(State::Stopping);
        info!("Stopping OTLP HTTP listener");
        broadcaster.signal();

        let grace = self.config.shutdown_grace();
        let joined = match tokio::time::timeout(grace, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!("Connections did not drain within {grace:?}, aborting");
                task.abort();
                task.await
            }
        };
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.shared.record_error(&Error::Task(e.to_string())),
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                error!("OTLP listener task panicked: {e}");
                self.shared.record_error(&Error::Task(e.to_string()));
            }
        }

        self.shared.close();
        self.shared.local_addr.lock().expect("lock poisoned").take();
        self.shared.set_state(State::Stopped);
        info!("OTLP HTTP listener stopped");
    }
}
