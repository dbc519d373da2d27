//! hems: relay consumer and operator CLI for the wattmeter bridge.

use std::fs::OpenOptions;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Local, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use comfy_table::{Cell, Table};
use tokio::sync::watch;
use tracing::{error, info, warn, Level};

use hems_core::config::{load_config, Config};
use hems_core::device::DeviceRegistry;
use hems_core::liveness;
use hems_core::notify::WebhookNotifier;
use hems_core::slot::{BIN_MINUTES, DEFAULT_GRACE_SECONDS};
use hems_core::{
    Event, FileIdentityStore, IdentityStore, MemoryIdentityStore, PacketDecoder, RelayMessage,
};

mod metrics;
mod pipeline;
mod relay;

use metrics::ReliabilityTracker;
use pipeline::{JsonLinesSink, LogSink, MeasurementSink, Pipeline, PipelineError};
use relay::RelaySubscriber;

#[derive(Parser)]
#[command(name = "hems", version, about = "Wattmeter relay consumer and reliability tracker")]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = "config.yaml")]
    config: PathBuf,

    /// Debug logging
    #[arg(short = 'D', long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct RelayArgs {
    /// Relay host (defaults to the config value)
    #[arg(short = 's', long, env = "HEMS_SERVER_HOST")]
    server_host: Option<String>,

    /// Relay port (defaults to the config value)
    #[arg(short = 'p', long, env = "HEMS_SERVER_PORT")]
    server_port: Option<u16>,
}

impl RelayArgs {
    fn resolve(&self, config: &Config) -> (String, u16) {
        (
            self.server_host.clone().unwrap_or_else(|| config.relay.host.clone()),
            self.server_port.unwrap_or(config.relay.port),
        )
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Consume relay frames, forward named readings, and track heartbeats
    Listen {
        #[command(flatten)]
        relay: RelayArgs,

        /// Stop after this many measurements (0 = no limit)
        #[arg(short = 'n', long, default_value = "0")]
        count: u64,

        /// Log readings instead of writing them to stdout
        #[arg(short = 'd', long, env = "DUMMY_MODE")]
        dummy: bool,

        /// Field name for the watt value in output records
        #[arg(long, default_value = "power")]
        field: String,

        /// Seconds after a slot boundary that may still count for the previous slot
        #[arg(long, default_value_t = DEFAULT_GRACE_SECONDS)]
        grace: i64,
    },

    /// Decode relay lines from a file (or - for stdin) and print events
    Decode {
        file: PathBuf,

        /// Print every event as JSON instead of the measurement table
        #[arg(short, long)]
        raw: bool,
    },

    /// Record relay lines with elapsed time to a file
    Dump {
        #[command(flatten)]
        relay: RelayArgs,

        /// Output file
        #[arg(short, long, default_value = "packet.dump")]
        output: PathBuf,
    },

    /// Show per-sensor availability and communication errors
    Stats {
        /// Histogram window in hours
        #[arg(long, default_value = "24")]
        hours: i64,

        /// Number of latest errors to list
        #[arg(long, default_value = "10")]
        limit: i64,
    },

    /// Recompute daily availability rows
    Summary {
        /// UTC date (YYYY-MM-DD), defaults to yesterday
        #[arg(long)]
        date: Option<NaiveDate>,
    },

    /// Exit 0 if the liveness file is fresh
    Healthz,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.debug { Level::DEBUG } else { Level::INFO })
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let config = load_config(&cli.config).unwrap_or_else(|e| {
        error!("Error loading config {}: {e}", cli.config.display());
        std::process::exit(1);
    });

    match cli.command {
        Commands::Listen {
            relay,
            count,
            dummy,
            field,
            grace,
        } => {
            let (host, port) = relay.resolve(&config);
            cmd_listen(&config, &host, port, count, dummy, &field, grace).await
        }
        Commands::Decode { file, raw } => cmd_decode(&config, file, raw),
        Commands::Dump { relay, output } => {
            let (host, port) = relay.resolve(&config);
            cmd_dump(&host, port, &output).await
        }
        Commands::Stats { hours, limit } => cmd_stats(&config, hours, limit),
        Commands::Summary { date } => cmd_summary(&config, date),
        Commands::Healthz => cmd_healthz(&config),
    }
}

/// Flip the shutdown flag on SIGINT or SIGTERM.
fn spawn_signal_handler(tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
        warn!("Shutdown requested");
        let _ = tx.send(true);
    });
}

fn open_tracker(config: &Config) -> Option<ReliabilityTracker> {
    let metrics = config.metrics.as_ref()?;
    let path = metrics.data.to_string_lossy();
    match ReliabilityTracker::open(&path) {
        Ok(t) => Some(t),
        Err(e) => {
            error!("Error opening metrics database {path}: {e}");
            std::process::exit(1);
        }
    }
}

fn require_tracker(config: &Config) -> ReliabilityTracker {
    open_tracker(config).unwrap_or_else(|| {
        error!("No metrics database configured (metrics.data)");
        std::process::exit(1);
    })
}

fn load_devices(config: &Config) -> DeviceRegistry {
    DeviceRegistry::load(&config.device.define).unwrap_or_else(|e| {
        error!("Error loading device list {}: {e}", config.device.define.display());
        std::process::exit(1);
    })
}

// ---------------------------------------------------------------------------
// listen
// ---------------------------------------------------------------------------

async fn cmd_listen(
    config: &Config,
    host: &str,
    port: u16,
    count: u64,
    dummy: bool,
    field: &str,
    grace: i64,
) {
    let decoder = PacketDecoder::new(
        FileIdentityStore::new(&config.device.cache),
        config.decoder.watt_scale,
    );
    let devices = load_devices(config);

    let result = if dummy {
        info!("Dummy mode: readings are logged only, heartbeats are not recorded");
        let pipeline = build_pipeline(config, decoder, devices, LogSink, count, None);
        run_listen(pipeline, host, port).await
    } else {
        let sink = JsonLinesSink::new(io::stdout(), field);
        let pipeline = build_pipeline(config, decoder, devices, sink, count, Some(grace));
        run_listen(pipeline, host, port).await
    };

    if let Err(e) = result {
        error!("Listen loop failed: {e}");
        if let Some(webhook) = &config.webhook {
            WebhookNotifier::from_config(webhook)
                .notify_error("hems listen failed", &e.to_string())
                .await;
        }
        std::process::exit(1);
    }
}

fn build_pipeline<S: IdentityStore, K: MeasurementSink>(
    config: &Config,
    decoder: PacketDecoder<S>,
    devices: DeviceRegistry,
    sink: K,
    count: u64,
    heartbeat_grace: Option<i64>,
) -> Pipeline<S, K> {
    let mut pipeline = Pipeline::new(decoder, devices, sink)
        .with_liveness(&config.liveness.measure)
        .with_max_events(count);
    if let Some(grace) = heartbeat_grace {
        if let Some(tracker) = open_tracker(config) {
            pipeline = pipeline.with_tracker(tracker, grace);
        }
    }
    pipeline
}

async fn run_listen<S: IdentityStore, K: MeasurementSink>(
    mut pipeline: Pipeline<S, K>,
    host: &str,
    port: u16,
) -> Result<(), PipelineError> {
    let (tx, mut shutdown) = watch::channel(false);
    spawn_signal_handler(tx);

    let mut subscriber = RelaySubscriber::connect(host, port).await?;
    while let Some(msg) = subscriber.next(&mut shutdown).await? {
        pipeline.handle(&msg.frame, metrics::now())?;
        if pipeline.is_done() {
            info!("Received {} measurement(s), stopping", pipeline.events);
            break;
        }
    }

    let decoder = pipeline.decoder();
    info!(
        "Frames: {} total, {} measurements, {} duplicates, {} rejected, {} sent, {} send failures, {} unnamed",
        decoder.total_frames,
        decoder.measurements,
        decoder.duplicates,
        decoder.rejected,
        pipeline.sent,
        pipeline.send_failures,
        pipeline.unnamed
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// decode
// ---------------------------------------------------------------------------

fn cmd_decode(config: &Config, file: PathBuf, raw: bool) {
    let reader: Box<dyn BufRead> = if file.to_str() == Some("-") {
        Box::new(io::stdin().lock())
    } else {
        let f = std::fs::File::open(&file).unwrap_or_else(|e| {
            error!("Error opening {}: {e}", file.display());
            std::process::exit(1);
        });
        Box::new(io::BufReader::new(f))
    };

    // Start from the persisted map but never write it back.
    let known = FileIdentityStore::new(&config.device.cache).load();
    let mut decoder = PacketDecoder::new(
        MemoryIdentityStore::with_map(known),
        config.decoder.watt_scale,
    );
    let devices = DeviceRegistry::load(&config.device.define).unwrap_or_else(|e| {
        warn!("No device names ({e})");
        DeviceRegistry::default()
    });

    let mut rows = Vec::new();
    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => continue,
        };
        let text = line.trim();
        if text.is_empty() || text.starts_with('#') {
            continue;
        }

        // Dump files prefix each line with the elapsed seconds.
        let (elapsed, message) = match text.split_once(' ') {
            Some((head, rest)) if head.parse::<f64>().is_ok() => (head.parse::<f64>().ok(), rest),
            _ => (None, text),
        };

        let frame = match RelayMessage::parse(message) {
            Ok(f) => f,
            Err(e) => {
                warn!("Skipping {message:?}: {e}");
                continue;
            }
        };

        let event = match decoder.decode(&frame.header, &frame.payload) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                error!("{e}");
                continue;
            }
        };

        if raw {
            match serde_json::to_string(&event) {
                Ok(json) => println!("{json}"),
                Err(e) => error!("{e}"),
            }
        }
        if let Event::Measurement(m) = event {
            let name = m
                .address
                .as_ref()
                .and_then(|a| devices.name_of(a))
                .map(str::to_string);
            rows.push((elapsed, m, name));
        }
    }

    if raw {
        return;
    }

    println!();
    println!(
        "Frames: {} total, {} measurements, {} duplicates, {} rejected",
        decoder.total_frames, decoder.measurements, decoder.duplicates, decoder.rejected
    );
    println!();

    if rows.is_empty() {
        return;
    }

    let mut table = Table::new();
    table.set_header(vec!["Elapsed (s)", "Dev ID", "Address", "Name", "Watt"]);
    for (elapsed, m, name) in &rows {
        table.add_row(vec![
            Cell::new(elapsed.map(|e| format!("{e:.1}")).unwrap_or("-".into())),
            Cell::new(m.dev_id_str()),
            Cell::new(m.resolved_name()),
            Cell::new(name.as_deref().unwrap_or("-")),
            Cell::new(format!("{:.2}", m.watt)),
        ]);
    }
    println!("{table}");
}

// ---------------------------------------------------------------------------
// dump
// ---------------------------------------------------------------------------

async fn cmd_dump(host: &str, port: u16, output: &Path) {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(output)
        .unwrap_or_else(|e| {
            error!("Error opening {}: {e}", output.display());
            std::process::exit(1);
        });

    let (tx, mut shutdown) = watch::channel(false);
    spawn_signal_handler(tx);

    let mut subscriber = RelaySubscriber::connect(host, port).await.unwrap_or_else(|e| {
        error!("Error connecting to relay {host}:{port}: {e}");
        std::process::exit(1);
    });

    let mut start: Option<Instant> = None;
    let mut packets = 0u64;
    loop {
        let msg = match subscriber.next(&mut shutdown).await {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(e) => {
                error!("Relay read failed: {e}");
                std::process::exit(1);
            }
        };
        let elapsed = start.get_or_insert_with(Instant::now).elapsed().as_secs_f64();
        if let Err(e) = writeln!(file, "{elapsed:.3} {}", msg.line) {
            error!("Error writing {}: {e}", output.display());
            std::process::exit(1);
        }
        packets += 1;
        info!("Receive {packets} packet(s)");
    }

    info!("Wrote {packets} packet(s) to {}", output.display());
}

// ---------------------------------------------------------------------------
// stats / summary
// ---------------------------------------------------------------------------

fn sensor_names(config: &Config, tracker: &ReliabilityTracker) -> Vec<String> {
    match DeviceRegistry::load(&config.device.define) {
        Ok(devices) => devices.names(),
        Err(e) => {
            warn!("No device list ({e}), using sensors found in the database");
            tracker.sensors().unwrap_or_default()
        }
    }
}

fn format_local(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".into())
}

fn cmd_stats(config: &Config, hours: i64, limit: i64) {
    let tracker = require_tracker(config);
    let names = sensor_names(config, &tracker);
    let now = metrics::now();

    let stats = tracker.sensor_stats(&names, now).unwrap_or_else(|e| {
        error!("Error reading sensor stats: {e}");
        std::process::exit(1);
    });

    println!();
    if let Ok(Some(start)) = tracker.metrics_start() {
        println!("Collecting since {}", format_local(start));
        println!();
    }

    let mut table = Table::new();
    table.set_header(vec!["Sensor", "Total (%)", "24h (%)", "Last received (UTC)"]);
    for s in &stats {
        table.add_row(vec![
            Cell::new(&s.name),
            Cell::new(format!("{:.2}", s.availability_total)),
            Cell::new(format!("{:.2}", s.availability_24h)),
            Cell::new(s.last_received.as_deref().unwrap_or("-")),
        ]);
    }
    println!("{table}");

    match tracker.error_histogram(hours) {
        Ok(hist) => {
            println!();
            println!("Communication errors, last {hours}h: {}", hist.total);
            if hist.total > 0 {
                let mut table = Table::new();
                table.set_header(vec!["Time", "Errors"]);
                for (bin, count) in hist.bins.iter().enumerate().filter(|(_, c)| **c > 0) {
                    let minutes = bin as u32 * BIN_MINUTES;
                    table.add_row(vec![
                        Cell::new(format!("{:02}:{:02}", minutes / 60, minutes % 60)),
                        Cell::new(count),
                    ]);
                }
                println!("{table}");
            }
        }
        Err(e) => error!("Error reading error histogram: {e}"),
    }

    match tracker.latest_errors(limit) {
        Ok(errors) if !errors.is_empty() => {
            println!();
            let mut table = Table::new();
            table.set_header(vec!["Sensor", "Slot start", "Type"]);
            for e in &errors {
                table.add_row(vec![
                    Cell::new(&e.sensor_name),
                    Cell::new(format_local(e.timestamp)),
                    Cell::new(&e.error_type),
                ]);
            }
            println!("{table}");
        }
        Ok(_) => {}
        Err(e) => error!("Error reading latest errors: {e}"),
    }
    println!();
}

fn cmd_summary(config: &Config, date: Option<NaiveDate>) {
    let mut tracker = require_tracker(config);
    let names = sensor_names(config, &tracker);
    let date = date.unwrap_or_else(|| Utc::now().date_naive() - chrono::Duration::days(1));

    let mut table = Table::new();
    table.set_header(vec!["Sensor", "Date", "Expected", "Received", "Availability (%)"]);
    for name in &names {
        match tracker.update_availability_summary(name, date) {
            Ok(row) => {
                table.add_row(vec![
                    Cell::new(&row.sensor_name),
                    Cell::new(&row.date),
                    Cell::new(row.total_expected),
                    Cell::new(row.total_received),
                    Cell::new(format!("{:.2}", row.availability_percent)),
                ]);
            }
            Err(e) => {
                error!("Error updating availability for {name}: {e}");
                std::process::exit(1);
            }
        }
    }
    println!("{table}");
}

// ---------------------------------------------------------------------------
// healthz
// ---------------------------------------------------------------------------

fn cmd_healthz(config: &Config) {
    let path = &config.liveness.measure;
    if liveness::is_fresh(path, config.liveness.interval) {
        info!("OK.");
        return;
    }
    match liveness::age(path) {
        Some(age) => error!("measure: liveness file {} is {age}s old", path.display()),
        None => error!("measure: liveness file {} not found", path.display()),
    }
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use hems_core::config::MetricsConfig;
    use hems_core::decode::DEFAULT_WATT_SCALE;

    fn config_with_metrics(dir: &Path) -> Config {
        let mut config = Config::default();
        config.metrics = Some(MetricsConfig {
            data: dir.join("metrics.db"),
        });
        config.liveness.measure = dir.join("healthz");
        config
    }

    fn decoder() -> PacketDecoder<MemoryIdentityStore> {
        PacketDecoder::new(MemoryIdentityStore::new(), DEFAULT_WATT_SCALE)
    }

    #[test]
    fn test_dummy_pipeline_skips_tracker() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_metrics(dir.path());
        let pipeline = build_pipeline(&config, decoder(), DeviceRegistry::default(), LogSink, 0, None);
        assert!(pipeline.tracker().is_none());
        assert!(!dir.path().join("metrics.db").exists());
    }

    #[test]
    fn test_pipeline_tracks_heartbeats() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_metrics(dir.path());
        let pipeline = build_pipeline(
            &config,
            decoder(),
            DeviceRegistry::default(),
            LogSink,
            0,
            Some(DEFAULT_GRACE_SECONDS),
        );
        assert!(pipeline.tracker().is_some());
    }
}
