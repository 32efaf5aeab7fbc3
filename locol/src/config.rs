//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program. Crashes are most likely
//! to originate from this code, intentionally.
use std::{
    fs,
    net::SocketAddr,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    time::Duration,
};

use rustc_hash::{FxHashMap, FxHashSet};
use serde::Deserialize;

use crate::{listener, scrape, series};

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<std::io::Error>,
    },
    /// The listener would refuse every connection
    #[error("listener concurrency_limit must be greater than zero")]
    ZeroConcurrency,
    /// The same URI is scraped twice
    #[error("Duplicate scrape target: {0}")]
    DuplicateScrapeTarget(String),
}

fn default_retention_seconds() -> u64 {
    series::DEFAULT_RETENTION.as_secs()
}

fn default_log_capacity() -> NonZeroUsize {
    NonZeroUsize::new(10_000).unwrap_or(NonZeroUsize::MIN)
}

/// Main configuration struct for this program
#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Where locol exposes its own telemetry. Unset disables the exporter.
    pub telemetry: Option<Telemetry>,
    /// The OTLP/HTTP listener
    #[serde(default)]
    pub listener: listener::Config,
    /// Age in seconds past which series samples are evicted
    #[serde(default = "default_retention_seconds")]
    pub retention_seconds: u64,
    /// Number of log lines kept in memory
    #[serde(default = "default_log_capacity")]
    pub log_capacity: NonZeroUsize,
    /// Exposition endpoints to scrape
    #[serde(default)]
    pub scrape: Vec<scrape::Config>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            telemetry: None,
            listener: listener::Config::default(),
            retention_seconds: default_retention_seconds(),
            log_capacity: default_log_capacity(),
            scrape: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
#[serde(deny_unknown_fields)]
/// locol emits its internal telemetry for scraping at a prometheus poll
/// endpoint.
pub struct Telemetry {
    /// Address and port for prometheus exporter
    pub addr: SocketAddr,
    /// Additional labels to include in every metric
    #[serde(default)]
    pub global_labels: FxHashMap<String, String>,
}

impl Config {
    /// Parse and validate a YAML document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid YAML for [`Config`] or
    /// fails validation.
    pub fn from_yaml(contents: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate the YAML file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or its contents are not a
    /// valid configuration.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path).map_err(|source| Error::ReadFile {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        Self::from_yaml(&contents)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.listener.concurrency_limit == 0 {
            return Err(Error::ZeroConcurrency);
        }
        let mut seen = FxHashSet::default();
        for target in &self.scrape {
            if !seen.insert(target.uri.as_str()) {
                return Err(Error::DuplicateScrapeTarget(target.uri.clone()));
            }
        }
        Ok(())
    }

    /// Series retention window.
    #[must_use]
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_seconds)
    }
}
