use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use error_monitor::analysis::DeviationAnalyzer;
use error_monitor::baseline::BaselineRegistry;
use error_monitor::config::Config;
use error_monitor::error::{ConfigError, IngestError};
use error_monitor::events::{monitoring_version, Fingerprint, HourBucket, TimeWindow};
use error_monitor::ingest::{BatchRecord, IngestOutcome, IngestionCoordinator, LivePayload};
use error_monitor::store::{AggregateStore, SqliteBackend};
use log::{error, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Command-line arguments for the error monitor
#[derive(Parser)]
#[command(
    name = "error-monitor",
    about = "Per-version error aggregation and deploy deviation analysis",
    long_about = "Ingests application error logs from deploy-time scraping and hourly \
                  warehouse exports, keeps per-version hourly counts, and flags new or \
                  elevated errors against baselines of known-good deploys."
)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Configuration file path (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(
        short,
        long,
        help = "Enable verbose logging output (sets RUST_LOG=debug)"
    )]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Import warehouse rows (JSON lines) for one hour
    Import {
        /// Input file, or `-` for stdin
        #[arg(default_value = "-")]
        input: PathBuf,
        /// Hour label such as 20141120_10; the hour is imported at most once
        #[arg(long)]
        hour: Option<String>,
    },
    /// Ingest deploy-time payloads (JSON lines) and print deviations
    Monitor {
        /// Input file, or `-` for stdin
        #[arg(default_value = "-")]
        input: PathBuf,
    },
    /// Register a deploy's monitored window as a baseline
    Baseline {
        version: String,
        /// Window start (RFC 3339)
        start: DateTime<Utc>,
        /// Window end (RFC 3339)
        end: DateTime<Utc>,
    },
    /// Analyze a deploy window against baselines of earlier deploys
    Analyze {
        version: String,
        /// Window start (RFC 3339)
        start: DateTime<Utc>,
        /// Window end (RFC 3339)
        end: DateTime<Utc>,
        /// Known-good deploy to compare against; repeatable
        #[arg(long = "baseline")]
        baselines: Vec<String>,
    },
    /// List the errors seen on a version
    Errors {
        version: String,
        /// Show deploy-time monitoring data instead of warehouse data
        #[arg(long)]
        monitoring: bool,
    },
    /// Show the per-version hourly history of one error
    History { fingerprint: String },
    /// Remove counters and samples past the retention period
    Prune,
    /// Check that the store is reachable
    Ping,
}

impl Cli {
    /// Validate the CLI arguments
    ///
    /// # Returns
    ///
    /// `Ok(())` if all arguments are valid, `Err(String)` with error message otherwise
    fn validate(&self) -> Result<(), String> {
        if let Some(ref config_path) = self.config {
            // Missing files fall back to defaults in load_config
            if config_path.exists() {
                if !config_path.is_file() {
                    return Err(format!(
                        "Configuration path is not a file: {}",
                        config_path.display()
                    ));
                }

                if let Some(extension) = config_path.extension() {
                    if extension != "toml" {
                        warn!(
                            "Configuration file does not have .toml extension: {}",
                            config_path.display()
                        );
                    }
                }
            }
        }

        match &self.command {
            Command::Import {
                hour: Some(hour), ..
            } if HourBucket::parse_log_hour(hour).is_none() => {
                Err(format!("Invalid hour label '{}', expected YYYYMMDD_HH", hour))
            }
            Command::Baseline { version, .. } | Command::Analyze { version, .. }
                if version.trim().is_empty() =>
            {
                Err("Version must not be empty".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// Load configuration from file or use defaults
///
/// A missing or invalid file is reported and replaced by the defaults.
fn load_config(config_path: Option<&Path>) -> Config {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            match Config::from_file(path) {
                Ok(config) => config,
                Err(ConfigError::ReadError(_)) => {
                    warn!(
                        "Configuration file '{}' not found or unreadable, using defaults",
                        path.display()
                    );
                    Config::default()
                }
                Err(e) => {
                    error!("Configuration error in '{}': {}", path.display(), e);
                    warn!("Using default configuration due to invalid config file");
                    Config::default()
                }
            }
        }
        None => {
            info!("Using default configuration");
            Config::default()
        }
    }
}

/// Explicitly constructed components, shared by every command
struct ErrorMonitor {
    config: Config,
    store: Arc<AggregateStore>,
    coordinator: IngestionCoordinator,
}

impl ErrorMonitor {
    fn open(config: Config) -> Result<Self> {
        let backend = SqliteBackend::open(&config.store.path).with_context(|| {
            format!("Failed to open store at {}", config.store.path.display())
        })?;
        let store = Arc::new(AggregateStore::new(
            Arc::new(backend),
            config.store.timeout(),
            config.store.sample_limit,
        ));
        let registry = Arc::new(BaselineRegistry::new(Arc::clone(&store)));
        let analyzer = DeviationAnalyzer::new(Arc::clone(&store), config.analysis.clone());
        let coordinator = IngestionCoordinator::new(
            Arc::clone(&store),
            registry,
            analyzer,
            config.ingest.clone(),
        )?;

        Ok(Self {
            config,
            store,
            coordinator,
        })
    }

    async fn run(&self, command: Command) -> Result<()> {
        match command {
            Command::Import { input, hour } => {
                let (rows, mut outcomes) = read_json_lines::<BatchRecord>(&input)?;
                let hour = hour.as_deref().and_then(HourBucket::parse_log_hour);
                match hour {
                    Some(hour) => match self.coordinator.import_hour(hour, rows).await? {
                        Some(stored) => outcomes.extend(stored),
                        None => {
                            info!("Nothing to do for {}", hour);
                            return Ok(());
                        }
                    },
                    None => outcomes.extend(self.coordinator.ingest_batch_all(rows).await),
                }
                print_json(&outcomes)
            }
            Command::Monitor { input } => {
                let (payloads, failures) = read_json_lines::<LivePayload>(&input)?;
                for failure in failures {
                    print_json(&failure)?;
                }
                for payload in payloads {
                    print_json(&self.coordinator.ingest_live(payload).await)?;
                }
                Ok(())
            }
            Command::Baseline {
                version,
                start,
                end,
            } => {
                let entry = self
                    .coordinator
                    .register_deploy_baseline(&version, TimeWindow::new(start, end))
                    .await?;
                print_json(&entry)
            }
            Command::Analyze {
                version,
                start,
                end,
                baselines,
            } => {
                let deviations = self
                    .coordinator
                    .analyze_deploy(
                        &monitoring_version(&version),
                        TimeWindow::new(start, end),
                        &baselines,
                    )
                    .await?;
                print_json(&deviations)
            }
            Command::Errors {
                version,
                monitoring,
            } => {
                let version = if monitoring {
                    monitoring_version(&version)
                } else {
                    version
                };
                let mut listing = Vec::new();
                for (fingerprint, count) in self.store.version_errors(&version).await? {
                    let definition = self.store.describe(&fingerprint).await?;
                    listing.push(serde_json::json!({
                        "fingerprint": fingerprint,
                        "count": count,
                        "definition": definition,
                    }));
                }
                print_json(&listing)
            }
            Command::History { fingerprint } => {
                let history = self
                    .store
                    .error_history(&Fingerprint::new(fingerprint))
                    .await?;
                print_json(&history)
            }
            Command::Prune => {
                let removed = self
                    .store
                    .prune(Utc::now(), self.config.store.retention())
                    .await?;
                print_json(&serde_json::json!({ "removed": removed }))
            }
            Command::Ping => {
                self.store.ping().await?;
                print_json(&serde_json::json!({ "ok": true }))
            }
        }
    }

    async fn shutdown(&self) {
        if let Err(e) = self.store.shutdown().await {
            error!("Failed to flush store on shutdown: {}", e);
        }
    }
}

/// Parse a JSON-lines input; unparseable lines become failed outcomes
fn read_json_lines<T: DeserializeOwned>(input: &Path) -> Result<(Vec<T>, Vec<IngestOutcome>)> {
    let reader: Box<dyn BufRead> = if input == Path::new("-") {
        Box::new(BufReader::new(std::io::stdin()))
    } else {
        let file = std::fs::File::open(input)
            .with_context(|| format!("Failed to open {}", input.display()))?;
        Box::new(BufReader::new(file))
    };

    let mut parsed = Vec::new();
    let mut failures = Vec::new();
    for (number, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", input.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(value) => parsed.push(value),
            Err(e) => {
                warn!("Skipping line {}: {}", number + 1, e);
                failures.push(IngestOutcome::Failed {
                    error: IngestError::MalformedInput(format!("line {}: {}", number + 1, e)),
                });
            }
        }
    }
    Ok((parsed, failures))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    if let Err(e) = cli.validate() {
        error!("Invalid arguments: {}", e);
        std::process::exit(1);
    }

    let config = load_config(cli.config.as_deref());
    let monitor = match ErrorMonitor::open(config) {
        Ok(monitor) => monitor,
        Err(e) => {
            error!("Failed to initialize error monitor: {:#}", e);
            std::process::exit(1);
        }
    };

    let result = monitor.run(cli.command).await;
    monitor.shutdown().await;

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
