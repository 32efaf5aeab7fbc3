//! The locol telemetry ingestion and metrics analytics engine.
//!
//! locol receives OTLP traces, metrics, logs and profiles over HTTP, scrapes
//! Prometheus exposition text from collectors, and keeps what it learns in
//! bounded in-memory stores: time-windowed series, reconstructed histograms
//! and a ring buffer of recent log lines. The `locol` binary found elsewhere in
//! this project wires these pieces together.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

use bytes::Bytes;
use http_body_util::{BodyExt, Full, combinators::BoxBody};

pub mod circular_buffer;
pub(crate) mod codec;
pub mod config;
pub mod exposition;
pub mod histogram;
pub mod ingest;
pub mod key;
pub mod listener;
pub mod sample;
pub mod scrape;
pub mod series;

pub(crate) fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}
