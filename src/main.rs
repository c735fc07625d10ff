//! CLI entry point for the GTFS-RT merger.
//!
//! Provides subcommands for running the merge service from a config file,
//! inspecting a single feed, and validating a config.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gtfs_rt_merger::{
    config::MergerConfig,
    coordinator::Coordinator,
    fetch::{BasicClient, fetch_bytes},
    output::print_json,
    parser::parse_snapshot,
    sink::{sink_from_config, spawn_sink},
    source::PollingSource,
    stats::CycleStats,
};
use tracing::{error, info};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "gtfs_rt_merger")]
#[command(about = "Merges several GTFS-RT feeds into one", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the merge service until Ctrl+C
    Run {
        /// Path to the JSON config file
        #[arg(short, long, default_value = "merger.json")]
        config: PathBuf,
    },
    /// Decode a single GTFS-RT feed from a file or URL and log a summary
    Inspect {
        /// Path to file or URL to fetch
        #[arg(value_name = "FILE_OR_URL")]
        source: String,
    },
    /// Validate a config file without starting anything
    CheckConfig {
        #[arg(short, long, default_value = "merger.json")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/gtfs_rt_merger.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("gtfs_rt_merger.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run(&config).await?,
        Commands::Inspect { source } => {
            let bytes = fetcher(&source).await?;
            let snapshot = parse_snapshot(&bytes)?;
            let stats = CycleStats::from_entities(snapshot.entities());

            print_json(&stats)?;
        }
        Commands::CheckConfig { config } => {
            let config = MergerConfig::load(&config)?;
            info!(
                sources = config.sources.len(),
                sinks = config.sinks.len(),
                filters = ?config.filter_chain().names(),
                timeout_ms = config.timeout_ms,
                dispatcher = ?config.dispatcher,
                "Config is valid"
            );
        }
    }

    Ok(())
}

/// Loads feed data from a local file path or fetches it over HTTP.
#[tracing::instrument(fields(source = %url))]
async fn fetcher(url: &str) -> Result<Vec<u8>> {
    let bytes = if url.starts_with("http") {
        let client = BasicClient::new(Duration::from_secs(30))?;
        fetch_bytes(&client, url).await?.to_vec()
    } else {
        tokio::fs::read(url)
            .await
            .with_context(|| format!("failed to read {url}"))?
    };
    Ok(bytes)
}

/// Starts sinks, the coordinator and every configured source, then waits for
/// Ctrl+C or for the coordinator to stop on its own.
#[tracing::instrument(fields(config = %config_path.display()))]
async fn run(config_path: &Path) -> Result<()> {
    let config = MergerConfig::load(config_path)?;
    let (mut coordinator, handle) =
        Coordinator::new(config.coordinator_settings(), config.filter_chain());

    let mut sink_tasks = Vec::with_capacity(config.sinks.len());
    for sink_config in &config.sinks {
        let sink = sink_from_config(sink_config).await?;
        info!(sink = %sink.name(), "Sink attached");
        sink_tasks.push(spawn_sink(sink, coordinator.attach_consumer()));
    }

    let mut coordinator_task = tokio::spawn(coordinator.run());

    let mut source_tasks = Vec::with_capacity(config.sources.len());
    for source_config in &config.sources {
        let source = PollingSource::from_config(source_config)
            .with_context(|| format!("failed to set up source '{}'", source_config.name))?;
        let link = handle.subscribe().await?;
        info!(
            feed = source.name(),
            source = %link.id(),
            url = %source_config.url,
            poll_interval_secs = source_config.poll_interval_secs,
            "Source attached"
        );
        source_tasks.push(tokio::spawn(source.run(link)));
    }

    info!(
        sources = source_tasks.len(),
        sinks = sink_tasks.len(),
        "Merger running. Press Ctrl+C to stop."
    );

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Ctrl+C received, shutting down");
            handle.shutdown().await?;
            (&mut coordinator_task).await
        }
        result = &mut coordinator_task => result,
    };

    for task in source_tasks {
        task.abort();
    }
    for task in sink_tasks {
        let _ = task.await;
    }

    match outcome.context("coordinator task panicked")? {
        Ok(()) => {
            info!("Merger stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Coordinator failed");
            Err(e.into())
        }
    }
}
