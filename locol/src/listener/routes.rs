//! Route table and request handling for the OTLP/HTTP listener.

use std::{fmt, sync::Arc};

use bytes::Bytes;
use http::{Method, StatusCode, header};
use http_body_util::{BodyExt, combinators::BoxBody};
use hyper::{Request, Response};
use metrics::counter;
use tracing::{debug, warn};

use crate::codec;

use super::{Shared, Signal};

/// Content type every OTLP/HTTP protobuf request must carry.
pub const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";

#[derive(Debug, Clone, PartialEq, Eq)]
/// Outcome of a [`Handler`]
pub struct Reply {
    /// Response status
    pub status: StatusCode,
    /// Response body, if any
    pub body: Option<Bytes>,
}

impl Reply {
    /// `200 OK` with an empty body.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            status: StatusCode::OK,
            body: None,
        }
    }

    /// `status` with a plain text reason.
    #[must_use]
    pub fn error(status: StatusCode, reason: impl Into<String>) -> Self {
        Self {
            status,
            body: Some(Bytes::from(reason.into())),
        }
    }

    fn into_response(self) -> Response<BoxBody<Bytes, hyper::Error>> {
        let mut response = Response::new(crate::full(self.body.unwrap_or_default()));
        *response.status_mut() = self.status;
        response
    }
}

/// Consumes a fully read, decompressed request body.
pub trait Handler: Send + Sync + fmt::Debug {
    /// Handle `body`, producing the reply sent to the client.
    fn handle(&self, body: Bytes) -> Reply;

    /// Reply for a body that could not be decoded, `reason` saying why.
    fn malformed(&self, reason: String) -> Reply {
        Reply::error(StatusCode::INTERNAL_SERVER_ERROR, reason)
    }
}

#[derive(Debug)]
/// One entry of the [`Router`]
pub struct Route {
    method: Method,
    path: String,
    content_type: String,
    handler: Arc<dyn Handler>,
    labels: Vec<(String, String)>,
}

#[derive(Debug, Default)]
/// Table of `(method, path)` to [`Handler`].
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `method` and `path`. Requests must carry
    /// `content_type`. `labels` are attached to the route's metrics.
    #[must_use]
    pub fn route(
        mut self,
        method: Method,
        path: impl Into<String>,
        content_type: impl Into<String>,
        handler: Arc<dyn Handler>,
        labels: Vec<(String, String)>,
    ) -> Self {
        self.routes.push(Route {
            method,
            path: path.into(),
            content_type: content_type.into(),
            handler,
            labels,
        });
        self
    }

    /// The four OTLP signal endpoints, publishing through `shared`.
    pub(crate) fn otlp(shared: &Arc<Shared>, base_labels: &[(String, String)]) -> Self {
        Signal::ALL.into_iter().fold(Self::new(), |router, signal| {
            let mut labels = Vec::with_capacity(base_labels.len() + 1);
            labels.push(("signal".to_string(), signal.as_str().to_string()));
            labels.extend_from_slice(base_labels);

            let handler = SignalHandler {
                signal,
                shared: Arc::clone(shared),
                labels: labels.clone(),
            };
            router.route(
                Method::POST,
                signal.path(),
                PROTOBUF_CONTENT_TYPE,
                Arc::new(handler),
                labels,
            )
        })
    }

    /// Find the route for `method` and `path`.
    ///
    /// # Errors
    ///
    /// Returns `404` for an unknown path and `405` for a known path with the
    /// wrong method.
    pub fn lookup(&self, method: &Method, path: &str) -> Result<&Route, StatusCode> {
        let mut path_known = false;
        for route in &self.routes {
            if route.path == path {
                if route.method == method {
                    return Ok(route);
                }
                path_known = true;
            }
        }
        if path_known {
            Err(StatusCode::METHOD_NOT_ALLOWED)
        } else {
            Err(StatusCode::NOT_FOUND)
        }
    }
}

/// Whether the `Content-Type` header names `expected`, ignoring any
/// parameters after `;`.
fn content_type_matches(header: Option<&http::HeaderValue>, expected: &str) -> bool {
    header
        .and_then(|ct| ct.to_str().ok())
        .and_then(|ct| ct.split(';').next())
        .is_some_and(|media| media.trim().eq_ignore_ascii_case(expected))
}

/// Decodes one OTLP signal and publishes the result.
#[derive(Debug)]
pub(crate) struct SignalHandler {
    signal: Signal,
    shared: Arc<Shared>,
    labels: Vec<(String, String)>,
}

impl Handler for SignalHandler {
    fn handle(&self, body: Bytes) -> Reply {
        match self.signal.decode(&body) {
            Ok(envelope) => {
                if self.shared.publish(envelope) {
                    counter!("envelopes_published", &self.labels).increment(1);
                    Reply::ok()
                } else {
                    Reply::error(StatusCode::SERVICE_UNAVAILABLE, "listener is shutting down")
                }
            }
            Err(e) => self.malformed(e.to_string()),
        }
    }

    fn malformed(&self, reason: String) -> Reply {
        counter!("decode_failures", &self.labels).increment(1);
        let reason = format!("failed to decode {} request: {reason}", self.signal.as_str());
        warn!("{reason}");
        self.shared.record_decode_error(reason.clone());
        Reply::error(StatusCode::INTERNAL_SERVER_ERROR, reason)
    }
}

/// Per-connection HTTP service over a shared [`Router`].
#[derive(Debug, Clone)]
pub(crate) struct Service {
    router: Arc<Router>,
}

impl Service {
    pub(crate) fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    pub(crate) async fn handle_request(
        self,
        req: Request<hyper::body::Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
        let route = match self.router.lookup(req.method(), req.uri().path()) {
            Ok(route) => route,
            Err(status) => {
                debug!("No route for {} {}: {status}", req.method(), req.uri().path());
                return Ok(Reply {
                    status,
                    body: None,
                }
                .into_response());
            }
        };

        counter!("requests_received", &route.labels).increment(1);

        let content_type = req.headers().get(header::CONTENT_TYPE);
        if !content_type_matches(content_type, &route.content_type) {
            debug!(
                "Rejecting {} request with content type {content_type:?}",
                route.path
            );
            return Ok(Reply::error(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                format!("expected content type {}", route.content_type),
            )
            .into_response());
        }

        let content_encoding = req.headers().get(header::CONTENT_ENCODING).cloned();
        let body = req.into_body().collect().await?.to_bytes();
        counter!("bytes_received", &route.labels).increment(body.len() as u64);

        let body = match codec::decode(content_encoding.as_ref(), body) {
            Ok(body) => body,
            Err(e @ codec::Error::Unsupported(_)) => {
                debug!("Rejecting {} request: {e}", route.path);
                return Ok(Reply::error(StatusCode::UNSUPPORTED_MEDIA_TYPE, e.to_string())
                    .into_response());
            }
            Err(e @ codec::Error::Decode { .. }) => {
                return Ok(route.handler.malformed(e.to_string()).into_response());
            }
        };

        Ok(route.handler.handle(body).into_response())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use bytes::Bytes;
    use http::{Method, StatusCode};

    use super::{Handler, Reply, Router, content_type_matches};

    #[derive(Debug, Default)]
    struct Recording {
        bodies: Mutex<Vec<Bytes>>,
    }

    impl Handler for Recording {
        fn handle(&self, body: Bytes) -> Reply {
            self.bodies.lock().unwrap().push(body);
            Reply::ok()
        }
    }

    #[test]
    fn lookup_distinguishes_404_and_405() {
        let handler = Arc::new(Recording::default());
        let router = Router::new().route(
            Method::POST,
            "/v1/metrics",
            "application/x-protobuf",
            handler.clone(),
            Vec::new(),
        );

        let route = router.lookup(&Method::POST, "/v1/metrics").unwrap();
        assert_eq!(route.handler.handle(Bytes::from_static(b"x")), Reply::ok());
        assert_eq!(handler.bodies.lock().unwrap().len(), 1);

        assert_eq!(
            router.lookup(&Method::GET, "/v1/metrics").unwrap_err(),
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(
            router.lookup(&Method::POST, "/v1/nope").unwrap_err(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn malformed_defaults_to_internal_error() {
        let reply = Recording::default().malformed("bad gzip".to_string());
        assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(reply.body.as_deref(), Some(&b"bad gzip"[..]));
    }

    #[test]
    fn content_type_parameters() {
        let header = |s: &'static str| http::HeaderValue::from_static(s);
        let expected = "application/x-protobuf";
        assert!(content_type_matches(Some(&header("application/x-protobuf")), expected));
        assert!(content_type_matches(
            Some(&header("Application/X-Protobuf ; charset=utf-8")),
            expected
        ));
        assert!(!content_type_matches(Some(&header("application/json")), expected));
        assert!(!content_type_matches(None, expected));
    }
}
