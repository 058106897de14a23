// geotrack: command-line host for the geotrack engine
//
// Opens the engine on a local database, replays scripted platform input
// through it and inspects what it stored, synced and logged.

mod config;
mod replay;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use colored::*;
use config::CliConfig;
use geotrack_core::{
    logging, BackgroundGeolocation, Event, EventName, FixSource, LocationFilter, LocationSample,
    LogLevel, ProviderEvent, SyncStatus, UreqTransport,
};
use replay::{ReplayLine, ReplaySource};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Parser)]
#[command(name = "geotrack")]
#[command(about = "Geotrack: background location tracking engine", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start tracking and replay a JSON Lines script of platform input
    Run {
        /// Script with one fix/activity/signal per line
        #[arg(short, long)]
        fixes: PathBuf,
        /// Start in foreground mode
        #[arg(long)]
        foreground: bool,
        /// Pause between lines (overrides replay_delay_ms)
        #[arg(long)]
        delay_ms: Option<u64>,
        /// Do not push pending locations when the script ends
        #[arg(long)]
        no_sync: bool,
    },
    /// List stored locations
    Locations {
        /// Only locations not yet delivered
        #[arg(short, long)]
        pending: bool,
        #[arg(short, long)]
        limit: Option<usize>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Delete one location or all of them
    Delete {
        id: Option<u64>,
        #[arg(long, conflicts_with = "id")]
        all: bool,
    },
    /// Push every pending location to the configured url
    Sync,
    /// Engine and CLI configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show persisted log entries
    Logs {
        #[arg(short, long, default_value = "50")]
        limit: usize,
        /// Minimum level (trace, debug, info, warn, error)
        #[arg(long, default_value = "info")]
        level: String,
        /// Only entries after this id
        #[arg(long, default_value = "0")]
        from: u64,
    },
    /// Show engine status
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Set a key. Values are parsed as JSON, falling back to a string.
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = CliConfig::load()?;
    let _guard = init_logging(&settings)?;

    match cli.command {
        Commands::Run {
            fixes,
            foreground,
            delay_ms,
            no_sync,
        } => cmd_run(&settings, fixes, foreground, delay_ms, no_sync).await,
        Commands::Locations {
            pending,
            limit,
            json,
        } => cmd_locations(&settings, pending, limit, json).await,
        Commands::Delete { id, all } => cmd_delete(&settings, id, all).await,
        Commands::Sync => cmd_sync(&settings).await,
        Commands::Config { action } => cmd_config(settings, action).await,
        Commands::Logs { limit, level, from } => cmd_logs(&settings, limit, &level, from).await,
        Commands::Status => cmd_status(&settings).await,
    }
}

/// Stderr output filtered by RUST_LOG, an optional daily log file and the
/// engine's persistent log ring
fn init_logging(settings: &CliConfig) -> Result<Option<WorkerGuard>> {
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = if settings.file_logging {
        let log_dir = settings.storage_dir()?.join("logs");
        std::fs::create_dir_all(&log_dir).context("Failed to create log directory")?;
        let appender = tracing_appender::rolling::daily(log_dir, "geotrack.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_filter(EnvFilter::new("info"));
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .with(file_layer)
        .with(logging::global_ring().layer())
        .init();

    Ok(guard)
}

fn open_engine(settings: &CliConfig, source: Arc<dyn FixSource>) -> Result<BackgroundGeolocation> {
    let storage = settings.storage_dir()?;
    let storage = storage
        .to_str()
        .context("Storage path is not valid UTF-8")?;
    let transport = Arc::new(UreqTransport::with_timeout(Duration::from_secs(
        settings.http_timeout_secs,
    )));
    BackgroundGeolocation::with_storage(storage, source, transport)
        .context("Failed to open the engine")
}

fn format_timestamp(ms: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms as i64)
        .map(|dt| dt.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

fn colored_status(status: SyncStatus) -> ColoredString {
    match status {
        SyncStatus::Pending => status.to_string().yellow(),
        SyncStatus::Synced => status.to_string().green(),
        SyncStatus::Failed => status.to_string().red(),
    }
}

fn print_sample(sample: &LocationSample) {
    let location = &sample.location;
    let accuracy = location
        .accuracy
        .map(|a| format!("±{:.0} m", a))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "  {:>5}  {}  {:>11.6} {:>11.6}  {:>8}  {:<8} {}",
        sample.id.to_string().bright_cyan(),
        format_timestamp(location.time).dimmed(),
        location.latitude,
        location.longitude,
        accuracy,
        location.provider,
        colored_status(sample.status)
    );
}

fn describe_event(event: &Event) -> String {
    match event {
        Event::Location(sample) => format!(
            "#{} {:.6},{:.6}",
            sample.id, sample.location.latitude, sample.location.longitude
        ),
        Event::Stationary(region) => format!(
            "{:.6},{:.6} r={} m",
            region.anchor.latitude, region.anchor.longitude, region.radius
        ),
        Event::Activity(observation) => {
            format!("{} ({}%)", observation.activity_type, observation.confidence)
        }
        Event::Error(payload) => format!("[{}] {}", payload.code, payload.message),
        Event::Authorization(status) => format!("{:?}", status),
        Event::HttpAuthorization { status } => format!("HTTP {}", status),
        _ => String::new(),
    }
}

async fn cmd_run(
    settings: &CliConfig,
    script: PathBuf,
    foreground: bool,
    delay_ms: Option<u64>,
    no_sync: bool,
) -> Result<()> {
    let lines = replay::read_script(&script)?;
    let source = Arc::new(ReplaySource::new());
    let engine = open_engine(settings, source.clone())?;

    for name in EventName::ALL {
        engine.on(
            name.as_str(),
            Arc::new(|event: &Event| {
                let name = event.name().to_string();
                let label = match event {
                    Event::Error(_) | Event::HttpAuthorization { .. } => name.bright_red(),
                    Event::Location(_) => name.bright_green(),
                    _ => name.bright_blue(),
                };
                println!("  {} {}", label, describe_event(event));
            }),
        )?;
    }

    if foreground {
        engine.switch_mode(1)?;
    }

    println!("{}", "Geotrack: replaying".bold());
    println!("  Script: {} ({} lines)", script.display(), lines.len());
    println!("  Mode:   {}", engine.mode().to_string().bright_cyan());
    println!();

    engine.start()?;

    let delay = Duration::from_millis(delay_ms.unwrap_or(settings.replay_delay_ms));
    for line in lines {
        match line {
            ReplayLine::Fix(fix) => engine.on_raw_fix(fix.into_location(geotrack_core::now_ms())),
            ReplayLine::Activity(observation) => engine.on_activity(observation),
            ReplayLine::Signal(signal) => engine.on_host_signal(signal).await,
            ReplayLine::Services(enabled) => {
                source.set_enabled(enabled);
                engine.on_provider_event(ProviderEvent::ServicesEnabled(enabled));
            }
            ReplayLine::Authorization(id) => {
                let status = replay::authorization_from_id(id)?;
                source.set_authorization(status);
                engine.on_provider_event(ProviderEvent::Authorization(status));
            }
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
    engine.settle().await;

    if !no_sync && engine.get_config().url.is_some() {
        match engine.force_sync().await {
            Ok(report) => println!(
                "{} Synced {} location(s) in {} batch(es)",
                "✓".green(),
                report.synced,
                report.batches
            ),
            Err(e) => println!("{} Sync failed: {}", "✗".red(), e),
        }
    }

    let stored = engine.get_locations()?;
    let pending = engine.get_valid_locations()?.len();
    println!();
    println!("{}", "Summary".bold());
    println!("  Stored:        {}", stored.len());
    println!("  Pending:       {}", pending);
    println!("  Motion:        {}", engine.motion_state());
    println!("  Requests made: {}", source.request_history().len());
    if let Some(region) = engine.get_stationary_location() {
        println!(
            "  Stationary at: {:.6},{:.6}",
            region.anchor.latitude, region.anchor.longitude
        );
    }

    engine.close().await;
    Ok(())
}

async fn cmd_locations(
    settings: &CliConfig,
    pending: bool,
    limit: Option<usize>,
    json: bool,
) -> Result<()> {
    let engine = open_engine(settings, Arc::new(ReplaySource::new()))?;

    let mut samples = if pending {
        engine.get_valid_locations()?
    } else {
        engine.get_locations_filtered(&LocationFilter {
            limit,
            ..LocationFilter::default()
        })?
    };
    if let Some(limit) = limit {
        samples.truncate(limit);
    }

    if json {
        let items: Vec<Value> = samples
            .iter()
            .map(|sample| Value::Object(sample.to_json()))
            .collect();
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else if samples.is_empty() {
        println!("{}", "No locations stored.".dimmed());
    } else {
        println!("{} ({} shown)", "Locations".bold(), samples.len());
        println!();
        for sample in &samples {
            print_sample(sample);
        }
    }

    engine.close().await;
    Ok(())
}

async fn cmd_delete(settings: &CliConfig, id: Option<u64>, all: bool) -> Result<()> {
    let engine = open_engine(settings, Arc::new(ReplaySource::new()))?;

    match (id, all) {
        (_, true) => {
            let removed = engine.delete_all_locations()?;
            println!("{} Deleted {} location(s)", "✓".green(), removed);
        }
        (Some(id), false) => {
            if engine.delete_location(id)? {
                println!("{} Deleted location {}", "✓".green(), id.to_string().bright_cyan());
            } else {
                println!("{}", format!("No location with id {}", id).dimmed());
            }
        }
        (None, false) => anyhow::bail!("Give a location id or --all"),
    }

    engine.close().await;
    Ok(())
}

async fn cmd_sync(settings: &CliConfig) -> Result<()> {
    let engine = open_engine(settings, Arc::new(ReplaySource::new()))?;
    let Some(url) = engine.get_config().url else {
        engine.close().await;
        anyhow::bail!("No url configured. Set one with: geotrack config set url <endpoint>");
    };

    println!("Syncing to {}", url.bright_cyan());
    let result = engine.force_sync().await;
    engine.close().await;

    let report = result?;
    println!(
        "{} Synced {} location(s) in {} batch(es)",
        "✓".green(),
        report.synced,
        report.batches
    );
    Ok(())
}

async fn cmd_config(mut settings: CliConfig, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } if config::KEYS.contains(&key.as_str()) => {
            settings.set(&key, &value)?;
            settings.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } if config::KEYS.contains(&key.as_str()) => {
            if let Some(value) = settings.get(&key) {
                println!("{} = {}", key.bright_cyan(), value);
            }
        }

        action => {
            let engine = open_engine(&settings, Arc::new(ReplaySource::new()))?;
            let result = engine_config(&engine, &settings, action);
            engine.close().await;
            result?;
        }
    }

    Ok(())
}

fn engine_config(
    engine: &BackgroundGeolocation,
    settings: &CliConfig,
    action: ConfigAction,
) -> Result<()> {
    let current = serde_json::to_value(engine.get_config())?;

    match action {
        ConfigAction::Set { key, value } => {
            let parsed = serde_json::from_str(&value).unwrap_or(Value::String(value.clone()));
            let mut patch = serde_json::Map::new();
            patch.insert(key.clone(), parsed);
            engine.configure(&Value::Object(patch))?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => match current.get(&key) {
            Some(value) => println!("{} = {}", key.bright_cyan(), value),
            None => anyhow::bail!("Unknown config key: {}", key),
        },

        ConfigAction::List => {
            println!("{}", "Engine configuration".bold());
            println!();
            if let Some(fields) = current.as_object() {
                for (key, value) in fields {
                    println!("  {:<28} {}", key.bright_cyan(), value);
                }
            }
            println!();
            println!("{}", "CLI settings".bold());
            println!();
            for (key, value) in settings.list() {
                println!("  {:<28} {}", key.bright_cyan(), value);
            }
        }
    }
    Ok(())
}

async fn cmd_logs(settings: &CliConfig, limit: usize, level: &str, from: u64) -> Result<()> {
    let min_level: LogLevel = level.parse().map_err(anyhow::Error::msg)?;
    let engine = open_engine(settings, Arc::new(ReplaySource::new()))?;
    let entries = engine.get_log_entries(limit, from, min_level)?;
    engine.close().await;

    if entries.is_empty() {
        println!("{}", "No log entries.".dimmed());
        return Ok(());
    }

    for entry in entries {
        let level = match entry.level {
            LogLevel::Error => entry.level.as_str().bright_red(),
            LogLevel::Warn => entry.level.as_str().yellow(),
            LogLevel::Info => entry.level.as_str().green(),
            LogLevel::Debug | LogLevel::Trace => entry.level.as_str().dimmed(),
        };
        println!(
            "{:>6} {} {:<5} {}",
            entry.id.to_string().dimmed(),
            format_timestamp(entry.timestamp),
            level,
            entry.message
        );
        if let Some(stack) = entry.stack_trace {
            println!("{}", stack.dimmed());
        }
    }
    Ok(())
}

async fn cmd_status(settings: &CliConfig) -> Result<()> {
    let engine = open_engine(settings, Arc::new(ReplaySource::new()))?;
    let status = engine.check_status();
    let config = engine.get_config();
    let stored = engine.get_locations()?;
    let pending = engine.get_valid_locations()?.len();

    println!("{}", "Geotrack status".bold());
    println!("  Storage:   {}", settings.storage_dir()?.display().to_string().bright_cyan());
    println!("  Running:   {}", status.is_running);
    println!("  Pipeline:  {}", status.pipeline);
    println!("  Mode:      {}", engine.mode());
    println!("  Stored:    {} ({} pending)", stored.len(), pending);
    if let Some(last) = stored.last() {
        println!("  Last fix:  {}", format_timestamp(last.location.time));
    }
    match &config.url {
        Some(url) => println!("  Sync url:  {}", url),
        None => println!("  Sync url:  {}", "(none)".dimmed()),
    }
    println!(
        "  Sync:      every {} s or {} pending",
        config.sync_interval_ms / 1000,
        config.sync_threshold
    );

    engine.close().await;
    Ok(())
}
