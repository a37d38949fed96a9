//! # Moisture Logger
//!
//! Console front end for the soil-moisture data logger.
//!
//! The `run` command keeps the sensor link alive and accepts single-letter
//! commands on stdin:
//!
//! ```text
//! s         start data collection
//! x         stop data collection
//! r         show recent readings
//! e <file>  export all readings to CSV
//! q         quit
//! ```
//!
//! Status, progress and connectivity updates from the background tasks are
//! printed as they arrive.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use moisture_logger::app::App;
use moisture_logger::config::{Config, LoggingConfig};
use moisture_logger::error::LoggerError;
use moisture_logger::events::{self, Severity, UiEvent};
use moisture_logger::serial::port_trait::TokioSerialOpener;
use moisture_logger::store::export::export_csv;
use moisture_logger::store::{Reading, ReadingStore};

/// Default configuration file location
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Parser)]
#[command(version, about = "Log soil-moisture sensor readings into SQLite")]
struct Args {
    /// Configuration file
    #[arg(long, short, default_value = DEFAULT_CONFIG_PATH, env = "MOISTURE_LOGGER_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Monitor the sensor link and accept commands on stdin (default)
    Run,

    /// Export every stored reading to a CSV file
    Export {
        #[arg(long, short)]
        output: PathBuf,
    },

    /// Print the newest stored readings
    Recent {
        #[arg(long, short)]
        limit: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (config, from_file) = load_config(&args.config)?;
    let _log_guard = init_logging(&config.logging);

    info!("Moisture Logger v{} starting...", env!("CARGO_PKG_VERSION"));
    if !from_file {
        warn!("No configuration at {}, using defaults", args.config.display());
    }

    let store = ReadingStore::connect(&config.storage.database_url)
        .await
        .with_context(|| format!("failed to open reading store {}", config.storage.database_url))?;

    match args.command.unwrap_or(Cmd::Run) {
        Cmd::Run => run_console(&config, store).await?,
        Cmd::Export { output } => {
            let count = export_csv(&store, &output)
                .await
                .with_context(|| format!("failed to export to {}", output.display()))?;
            println!("Exported {} readings to {}", count, output.display());
        }
        Cmd::Recent { limit } => {
            let readings = store
                .latest(limit.unwrap_or(config.storage.recent_limit))
                .await
                .context("failed to query readings")?;
            print_readings(&readings);
        }
    }

    Ok(())
}

/// Load the config file, falling back to defaults when it does not exist
fn load_config(path: &Path) -> Result<(Config, bool)> {
    match Config::load(path) {
        Ok(config) => Ok((config, true)),
        Err(LoggerError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok((Config::default(), false)),
        Err(e) => Err(e).with_context(|| format!("failed to load configuration from {}", path.display())),
    }
}

/// Console logging, plus a daily rolling file when `log_dir` is set
fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    let (file_layer, guard) = if config.log_dir.is_empty() {
        (None, None)
    } else {
        let appender = tracing_appender::rolling::daily(&config.log_dir, "moisture-logger.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
    };

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with(fmt::layer())
        .with(file_layer)
        .init();

    guard
}

async fn run_console(config: &Config, store: ReadingStore) -> Result<()> {
    let (sink, mut events) = events::channel();
    let app = App::start(config, Arc::new(TokioSerialOpener), store.clone(), sink)
        .await
        .with_context(|| format!("failed to acquire sensor link at {}", config.serial.port))?;

    print_help();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            Some(event) = events.recv() => render(&event),

            line = stdin.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                if !handle_command(&app, &store, config, line.trim()).await {
                    break;
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    app.shutdown().await;
    while let Ok(event) = events.try_recv() {
        render(&event);
    }

    Ok(())
}

/// Execute one console command, returning `false` to quit
async fn handle_command(app: &App, store: &ReadingStore, config: &Config, line: &str) -> bool {
    let (command, argument) = match line.split_once(char::is_whitespace) {
        Some((command, argument)) => (command, argument.trim()),
        None => (line, ""),
    };

    match command.to_lowercase().as_str() {
        "" => {}
        "s" => {
            if let Err(e) = app.controller().start().await {
                warn!("Start rejected: {}", e);
            }
        }
        "x" => app.controller().stop().await,
        "r" => match store.latest(config.storage.recent_limit).await {
            Ok(readings) => print_readings(&readings),
            Err(e) => warn!("Failed to query readings: {}", e),
        },
        "e" if !argument.is_empty() => match export_csv(store, Path::new(argument)).await {
            Ok(count) => render(&UiEvent::Status {
                text: format!("Data exported successfully ({} readings)", count),
                severity: Severity::Success,
            }),
            Err(e) => render(&UiEvent::Status {
                text: format!("Export failed: {}", e),
                severity: Severity::Error,
            }),
        },
        "q" => return false,
        _ => print_help(),
    }

    true
}

fn render(event: &UiEvent) {
    match event {
        UiEvent::Status { text, severity } => {
            let tag = match severity {
                Severity::Info => "info",
                Severity::Success => " ok ",
                Severity::Warning => "warn",
                Severity::Error => "FAIL",
            };
            println!("[{}] {}", tag, text);
        }
        UiEvent::Progress(percent) => println!("[....] Progress: {:.0}%", percent),
        UiEvent::Connectivity(connected) => {
            println!("[link] {}", if *connected { "connected" } else { "disconnected" })
        }
    }
}

fn print_readings(readings: &[Reading]) {
    if readings.is_empty() {
        println!("No readings stored yet");
        return;
    }

    println!("{:>6}  {:>9}  {:>11}  {:>8}  {}", "id", "moisture", "temperature", "humidity", "created");
    for r in readings {
        println!(
            "{:>6}  {:>9}  {:>11}  {:>8}  {}",
            r.id,
            r.moisture_percent.map(|m| format!("{:.2}%", m)).unwrap_or_else(|| "-".to_string()),
            r.temperature.map(|t| format!("{:.2}°C", t)).unwrap_or_else(|| "-".to_string()),
            r.humidity.map(|h| format!("{:.2}%", h)).unwrap_or_else(|| "-".to_string()),
            r.date_created.format("%Y-%m-%d %H:%M:%S"),
        );
    }
}

fn print_help() {
    println!("Commands:");
    println!("  s         start data collection");
    println!("  x         stop data collection");
    println!("  r         show recent readings");
    println!("  e <file>  export all readings to CSV");
    println!("  q         quit");
}
