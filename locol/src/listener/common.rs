use std::sync::Arc;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::service::Service;
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use locol_signal::Watcher;
use metrics::gauge;
use tokio::{
    net::TcpListener,
    pin,
    sync::{Semaphore, TryAcquireError},
    task::JoinSet,
};
use tracing::{debug, error, info, warn};

#[derive(thiserror::Error, Debug)]
pub(crate) enum Error {
    /// A connection task panicked.
    #[error("connection task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Serve `listener` until `shutdown` fires, then stop accepting and let every
/// open connection finish its in-flight requests before returning.
pub(crate) async fn run_httpd<SF, S>(
    listener: TcpListener,
    concurrency_limit: usize,
    shutdown: Watcher,
    labels: Vec<(String, String)>,
    make_service: SF,
) -> Result<(), Error>
where
    // "service factory"
    SF: Send + Sync + 'static + Clone + Fn() -> S,
    S: Service<
            hyper::Request<hyper::body::Incoming>,
            Response = hyper::Response<BoxBody<Bytes, hyper::Error>>,
            Error = hyper::Error,
        > + Send
        + 'static,
    S::Future: Send + 'static,
{
    let sem = Arc::new(Semaphore::new(concurrency_limit));
    let mut join_set = JoinSet::new();

    gauge!("connection.limit", &labels).set(concurrency_limit as f64);

    // Unregistered: only used to hand out registered watchers to connections.
    let registrar = shutdown.clone();
    let shutdown_fut = shutdown.recv();
    pin!(shutdown_fut);
    loop {
        let claimed_permits = concurrency_limit - sem.available_permits();

        gauge!("connection.current", &labels).set(claimed_permits as f64);
        tokio::select! {
            () = &mut shutdown_fut => {
                info!("Shutdown signal received, stopping accept loop.");
                break;
            }

            Some(joined) = join_set.join_next(), if !join_set.is_empty() => {
                joined?;
            }

            incoming = listener.accept() => {
                let (stream, addr) = match incoming {
                    Ok(sa) => sa,
                    Err(e) => {
                        error!("Error accepting connection: {e}");
                        continue;
                    }
                };
                debug!("Accepted connection from {addr}");

                let Ok(conn_shutdown) = registrar.register() else {
                    // Shutdown already observed, the loop exits next turn.
                    drop(stream);
                    continue;
                };
                let sem = Arc::clone(&sem);
                let service_factory = make_service.clone();

                join_set.spawn(async move {
                    let permit = match sem.try_acquire() {
                        Ok(p) => p,
                        Err(TryAcquireError::Closed) => {
                            error!("Semaphore closed");
                            return;
                        }
                        Err(TryAcquireError::NoPermits) => {
                            warn!("httpd over connection capacity, load shedding");
                            drop(stream);
                            return;
                        }
                    };

                    let builder = auto::Builder::new(TokioExecutor::new());
                    let conn = builder.serve_connection(TokioIo::new(stream), service_factory());
                    pin!(conn);
                    let conn_shutdown = conn_shutdown.recv();
                    pin!(conn_shutdown);

                    let result = tokio::select! {
                        result = conn.as_mut() => result,
                        () = &mut conn_shutdown => {
                            // Finish in-flight requests, refuse new ones.
                            conn.as_mut().graceful_shutdown();
                            conn.as_mut().await
                        }
                    };
                    if let Err(e) = result {
                        error!("Error serving {addr}: {e}");
                    }
                    drop(permit);
                });
            }
        }
    }

    drop(listener);
    while let Some(joined) = join_set.join_next().await {
        joined?;
    }
    Ok(())
}
