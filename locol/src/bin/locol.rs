use std::{
    env,
    fmt::{self, Display},
    path::Path,
    str::FromStr,
    sync::Arc,
};

use clap::{Args, Parser, Subcommand};
use jemallocator::Jemalloc;
use locol::{
    config::{self, Config, Telemetry},
    ingest::Ingestor,
    listener::{self, Listener},
    scrape::Scraper,
    series::{SeriesStore, SystemClock},
};
use locol_signal::Watcher;
use metrics::gauge;
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::FxHashMap;
use tokio::{
    runtime::Builder,
    signal,
    sync::mpsc,
    task::JoinHandle,
    time::{self, Duration},
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

/// How often stale series are swept from the store.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Invalid locol config: {0}")]
    Config(#[from] config::Error),
    #[error("Listener failed: {0}")]
    Listener(#[from] listener::Error),
    #[error("Parsing Prometheus address failed: {0}")]
    PrometheusAddr(#[from] std::net::AddrParseError),
    #[error("Failed to install Prometheus exporter: {0}")]
    Prometheus(#[from] metrics_exporter_prometheus::BuildError),
    #[error("Listener envelope stream already taken")]
    EnvelopeStream,
    #[error(transparent)]
    Registration(#[from] locol_signal::RegisterError),
}

fn default_config_path() -> String {
    "/etc/locol/locol.yaml".to_string()
}

#[derive(Default, Clone, Debug)]
struct CliKeyValues {
    inner: FxHashMap<String, String>,
}

impl CliKeyValues {
    #[cfg(test)]
    fn get(&self, key: &str) -> Option<&str> {
        self.inner.get(key).map(String::as_str)
    }
}

impl Display for CliKeyValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        for (k, v) in &self.inner {
            write!(f, "{k}={v},")?;
        }
        Ok(())
    }
}

impl FromStr for CliKeyValues {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        // A key always matches `[[:alpha:]_]+` and is followed by '='. Values
        // may themselves contain ',', so keys are the only reliable delimiter:
        // a value runs until the next key or the end of input.
        static RE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"([[:alpha:]_]+)=").expect("Invalid regex pattern provided"));

        let mut labels = FxHashMap::default();

        for cap in RE.captures_iter(input) {
            let key = cap[1].to_string();
            let Some(whole) = cap.get(0) else {
                continue;
            };
            let start = whole.end();

            // Find the next key or run into the end of the input.
            let end = RE.find_at(input, start).map_or(input.len(), |m| m.start());
            let value = input[start..end].trim_end_matches(',').to_string();

            labels.insert(key, value);
        }

        Ok(Self { inner: labels })
    }
}

#[derive(Parser)]
#[clap(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run locol with specified configuration
    Run(RunCommand),
    /// Validate configuration file and exit
    ConfigCheck(ConfigCheckCommand),
}

#[derive(Args)]
struct RunCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
    /// additional labels to apply to locol's own metrics, format KEY=VAL,KEY2=VAL
    #[clap(long)]
    global_labels: Option<CliKeyValues>,
    /// address to bind the prometheus exporter to, overrides the
    /// configuration file
    #[clap(long)]
    prometheus_addr: Option<String>,
    /// the maximum time to wait, in seconds, for controlled shutdown
    #[clap(long, default_value_t = 30)]
    max_shutdown_delay: u16,
}

#[derive(Args)]
struct ConfigCheckCommand {
    /// path on disk to the configuration file
    #[clap(long, default_value_t = default_config_path())]
    config_path: String,
}

fn load_config(config_path: &str) -> Result<Config, Error> {
    let config = if let Ok(env_var_value) = env::var("LOCOL_CONFIG") {
        debug!("Using config from env var 'LOCOL_CONFIG'");
        Config::from_yaml(&env_var_value)
    } else {
        debug!("Attempting to open configuration file at: {config_path}");
        Config::load(Path::new(config_path))
    };
    config.map_err(|err| {
        error!("Configuration validation failed: {err}");
        Error::Config(err)
    })
}

fn validate_config(config_path: &str) -> Result<Config, Error> {
    let config = load_config(config_path)?;
    info!("Configuration file is valid");
    Ok(config)
}

fn get_config(args: &RunCommand, contents: Option<String>) -> Result<Config, Error> {
    let mut config = if let Some(contents) = contents {
        Config::from_yaml(&contents)?
    } else {
        load_config(&args.config_path)?
    };

    let options_global_labels = args.global_labels.clone().unwrap_or_default();
    if let Some(prom_addr) = &args.prometheus_addr {
        config.telemetry = Some(Telemetry {
            addr: prom_addr.parse()?,
            global_labels: options_global_labels.inner,
        });
    } else if let Some(telemetry) = config.telemetry.as_mut() {
        for (k, v) in options_global_labels.inner {
            telemetry.global_labels.insert(k, v);
        }
    }
    Ok(config)
}

fn install_exporter(telemetry: Telemetry) -> Result<(), Error> {
    let mut builder = PrometheusBuilder::new().with_http_listener(telemetry.addr);
    for (k, v) in telemetry.global_labels {
        builder = builder.add_global_label(k, v);
    }
    builder.install()?;
    info!("Prometheus exporter listening on {}", telemetry.addr);
    Ok(())
}

/// Everything `inner_main` runs between startup and shutdown.
struct Pipeline {
    store: Arc<SeriesStore>,
    ingestor: Arc<Ingestor>,
    listener: Listener,
    ingest_handle: JoinHandle<()>,
}

/// Start the listener, one scraper per target and the ingestor. Every task
/// spawned holds a watcher registered on `shutdown`.
async fn start_pipeline(config: Config, shutdown: &Watcher) -> Result<Pipeline, Error> {
    let store = Arc::new(SeriesStore::new(config.retention(), Arc::new(SystemClock)));
    let ingestor = Arc::new(Ingestor::new(Arc::clone(&store), config.log_capacity, &[]));

    let listener = Listener::new(config.listener, &[]);
    listener.start().await?;
    let envelopes = listener.envelopes().ok_or(Error::EnvelopeStream)?;

    //
    // SCRAPERS
    //
    let (scrape_snd, scrape_rcv) = mpsc::channel(config.scrape.len().max(1) * 4);
    for cfg in config.scrape {
        let scraper = Scraper::new(cfg, &[]);
        tokio::spawn(scraper.run(scrape_snd.clone(), shutdown.register()?));
    }
    drop(scrape_snd);

    //
    // INGESTOR
    //
    let ingest_handle =
        tokio::spawn(Arc::clone(&ingestor).run(envelopes, scrape_rcv, shutdown.register()?));

    Ok(Pipeline {
        store,
        ingestor,
        listener,
        ingest_handle,
    })
}

async fn inner_main(mut config: Config, max_shutdown_delay: Duration) -> Result<(), Error> {
    let (shutdown_watcher, shutdown_broadcast) = locol_signal::signal();

    if let Some(telemetry) = config.telemetry.take() {
        install_exporter(telemetry)?;
    }

    let Pipeline {
        store,
        ingestor,
        listener,
        ingest_handle,
    } = start_pipeline(config, &shutdown_watcher).await?;
    // Any watcher left alive here would hold up `signal_and_wait_timeout`.
    drop(shutdown_watcher);

    let mut interval = time::interval(Duration::from_millis(400));
    let mut sweep = time::interval(SWEEP_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                gauge!("locol.running").set(1.0);
                gauge!("series").set(store.len() as f64);
                gauge!("histograms").set(ingestor.histogram_keys().len() as f64);
            },
            _ = sweep.tick() => {
                let dropped = store.sweep();
                debug!("Swept {dropped} stale samples");
            },
            _ = signal::ctrl_c() => {
                info!("received ctrl-c");
                break;
            },
        }
    }

    listener.stop().await;
    if let Some(e) = listener.last_error() {
        warn!("Listener reported: {e}");
    }
    if !shutdown_broadcast
        .signal_and_wait_timeout(max_shutdown_delay)
        .await
    {
        warn!("Shutdown delay of {max_shutdown_delay:?} exceeded");
    }
    if let Err(e) = ingest_handle.await {
        error!("Could not join the ingestor task: {e}");
    }
    Ok(())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(false)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting locol {version}.");

    let args = match Cli::parse().command {
        Commands::Run(run_cmd) => run_cmd,
        Commands::ConfigCheck(config_check_cmd) => {
            match validate_config(&config_check_cmd.config_path) {
                Ok(_) => std::process::exit(0),
                Err(_) => std::process::exit(1),
            }
        }
    };

    let config = get_config(&args, None)?;
    let max_shutdown_delay = Duration::from_secs(args.max_shutdown_delay.into());

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    let res = runtime.block_on(inner_main(config, max_shutdown_delay));
    info!(
        "Shutting down runtime with a {} second delay. May leave orphaned tasks.",
        max_shutdown_delay.as_secs(),
    );
    runtime.shutdown_timeout(max_shutdown_delay);
    info!("Bye. :)");
    res
}
