// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! sensorfleet-record - run a recording node.
//!
//! Usage:
//!   sensorfleet-record gen-config --output node.toml
//!   sensorfleet-record validate --config node.toml
//!   sensorfleet-record run --config node.toml
//!   sensorfleet-record run --config node.toml --duration 60 --assume-free-gb 100

use anyhow::Context;
use clap::{Parser, Subcommand};
use sensorfleet::{
    Broker, BrokerClient, ClientOptions, ConfigurationManager, FleetMonitor, MemoryBroker,
    NodeIdentity, PathSelector, ShutdownCoordinator,
};
use sensorfleet_metrics::{DeltaCollector, DeltaReporter, COLLECTOR_CLASS};
use sensorfleet_recording::{
    DiskUsage, DriveWatcher, FixedDiskUsage, NodeConfig, RecorderConfig, RecorderError,
    RecorderPipeline, StatvfsDiskUsage, SyntheticSourceConfig, DRIVE_WATCHER_CLASS, GB,
    RECORDER_CLASS,
};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Class of the orchestrating process itself.
const NODE_CLASS: &str = "RecordNode";
const CAPTURE_STAGE: &str = "Capture";
const QUEUE_STAGE: &str = "Queue";

#[derive(Parser, Debug)]
#[command(name = "sensorfleet-record")]
#[command(about = "SensorFleet recording node")]
#[command(version)]
struct Args {
    /// Log level or filter (trace, debug, info, warn, error); overrides the file
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the node until Ctrl+C or a fleet shutdown
    Run {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,

        /// Stop after this many seconds (0 = indefinite)
        #[arg(long, default_value = "0")]
        duration: u64,

        /// Report this much free space on every root instead of asking the OS
        #[arg(long)]
        assume_free_gb: Option<u64>,
    },

    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "node.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Run {
            config,
            duration,
            assume_free_gb,
        } => {
            let node = NodeConfig::from_file(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            init_logging(args.log_level.as_deref().unwrap_or(&node.log_level));
            cmd_run(node, duration, assume_free_gb)
        }
        Commands::GenConfig { output } => {
            init_logging(args.log_level.as_deref().unwrap_or("info"));
            cmd_gen_config(output)
        }
        Commands::Validate { config } => {
            init_logging(args.log_level.as_deref().unwrap_or("info"));
            cmd_validate(config)
        }
    }
}

fn cmd_run(config: NodeConfig, duration: u64, assume_free_gb: Option<u64>) -> anyhow::Result<()> {
    info!("SensorFleet recording node v{}", env!("CARGO_PKG_VERSION"));
    info!("Node: {}", config.node_name);

    let broker = MemoryBroker::new();
    let monitor = FleetMonitor::start(&broker)?;
    let node = ShutdownCoordinator::register(NodeIdentity::new(NODE_CLASS), &broker);

    let manager = ConfigurationManager::new(config.config_tree()?);
    let config_client = broker.connect(ClientOptions::new(format!("{}-config", config.node_name)))?;
    manager.attach(config_client)?;
    let _recorders_view = manager.register(
        PathSelector::<Vec<RecorderConfig>>::new("recorders", "/data/recorders(/|$)").on_update(
            |recorders| {
                info!(
                    recorders = recorders.len(),
                    "Recorder settings changed; they apply to the next start"
                )
            },
        ),
    )?;

    let collector = DeltaCollector::start(
        ShutdownCoordinator::register(NodeIdentity::new(COLLECTOR_CLASS), &broker),
        config.delta_collector.clone(),
    )?;

    let disk: Arc<dyn DiskUsage> = match assume_free_gb {
        Some(gb) => {
            let fixed = FixedDiskUsage::new();
            for root in &config.drive_watcher.roots {
                fixed.set(root.clone(), gb * GB);
            }
            warn!("Using assumed free space of {} GB per drive", gb);
            Arc::new(fixed)
        }
        None => Arc::new(StatvfsDiskUsage),
    };
    let watcher = DriveWatcher::start(
        ShutdownCoordinator::register(NodeIdentity::new(DRIVE_WATCHER_CLASS), &broker),
        config.drive_watcher.clone(),
        disk,
    )?;
    let _watcher_view = manager.register(watcher.config_selector("drive_watcher"))?;

    let mut recorders = Vec::with_capacity(config.recorders.len());
    let mut sources = Vec::with_capacity(config.recorders.len());
    for recorder_config in &config.recorders {
        let recorder = RecorderPipeline::start(
            ShutdownCoordinator::register(NodeIdentity::new(RECORDER_CLASS), &broker),
            recorder_config.clone(),
        )?;
        sources.push(spawn_source(&broker, Arc::clone(&recorder), &config.synthetic)?);
        recorders.push(recorder);
    }

    let signal = Arc::clone(&node);
    ctrlc::set_handler(move || {
        signal.request_fleet_shutdown();
    })?;

    info!(
        recorders = recorders.len(),
        "Recording started. Press Ctrl+C to stop."
    );

    let start = Instant::now();
    let duration_limit = (duration > 0).then(|| Duration::from_secs(duration));
    let mut last_report = Instant::now();
    while !node.wait_terminated(Duration::from_millis(200)) {
        if duration_limit.is_some_and(|limit| start.elapsed() >= limit) && !monitor.shutdown_requested() {
            info!("Duration limit reached");
            node.request_fleet_shutdown();
        }

        if last_report.elapsed() >= Duration::from_secs(10) {
            for recorder in &recorders {
                let stats = recorder.stats();
                info!(
                    device = %recorder.config().name,
                    "Recorded {} items ({:.1} MB), {} dropped",
                    stats.items_written.load(Ordering::Relaxed),
                    stats.bytes_written.load(Ordering::Relaxed) as f64 / 1_048_576.0,
                    stats.items_dropped.load(Ordering::Relaxed)
                );
            }
            last_report = Instant::now();
        }
    }

    for source in sources {
        if source.join().is_err() {
            warn!("Synthetic source panicked");
        }
    }
    if !monitor.wait_all_finished(Duration::from_secs(10)) {
        warn!("Some nodes did not report a finished shutdown");
    }
    for crashed in monitor.crashed() {
        warn!(node = %crashed, "Node crashed");
    }

    info!("Recording stopped");
    for recorder in &recorders {
        let stats = recorder.stats();
        info!(
            "  {}: {} items, {} files",
            recorder.config().name,
            stats.items_written.load(Ordering::Relaxed),
            stats.files_opened.load(Ordering::Relaxed)
        );
    }
    if let Some(folder) = watcher.current_folder() {
        info!("  Last segment: {}", folder.display());
    }
    info!(
        "  Latency points: {}",
        collector.stats().points_published.load(Ordering::Relaxed)
    );

    monitor.stop();
    Ok(())
}

/// Feed `recorder` with synthetic payloads, reporting a capture and a queue
/// delta for every frame.
fn spawn_source(
    broker: &MemoryBroker,
    recorder: Arc<RecorderPipeline>,
    config: &SyntheticSourceConfig,
) -> anyhow::Result<JoinHandle<()>> {
    let capture = reporter(broker, CAPTURE_STAGE)?;
    let queue = reporter(broker, QUEUE_STAGE)?;
    let token = recorder.coordinator().cancellation_token();
    let period = Duration::from_secs_f64(1.0 / config.rate_hz);
    let payload_bytes = config.payload_bytes;
    let device = recorder.config().name.clone();

    let handle = thread::Builder::new()
        .name(format!("source-{}", device))
        .spawn(move || {
            let mut frame: i64 = 0;
            while !token.is_cancelled() {
                frame += 1;

                let span = capture.begin(&device, frame, &[]);
                let payload = vec![(frame % 251) as u8; payload_bytes];
                if let Err(e) = span.finish() {
                    warn!("Failed to report capture delta: {}", e);
                }

                let span = queue.begin(&device, frame, &[CAPTURE_STAGE]);
                match recorder.push(payload) {
                    Ok(()) | Err(RecorderError::QueueFull) => {}
                    Err(_) => break,
                }
                if let Err(e) = span.finish() {
                    warn!("Failed to report queue delta: {}", e);
                }

                if token.wait_timeout(period) {
                    break;
                }
            }
        })?;
    Ok(handle)
}

fn reporter(broker: &MemoryBroker, stage: &str) -> anyhow::Result<DeltaReporter> {
    let identity = NodeIdentity::new(stage);
    let client: Arc<dyn BrokerClient> = broker.connect(ClientOptions::new(identity.client_id()))?;
    Ok(DeltaReporter::new(&identity, client))
}

fn cmd_gen_config(output: PathBuf) -> anyhow::Result<()> {
    let toml_str = NodeConfig::example().to_toml()?;

    let content = format!(
        r#"# SensorFleet recording node configuration
# Generated by sensorfleet-record gen-config

{}
"#,
        toml_str
    );

    std::fs::write(&output, content)?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(config_path: PathBuf) -> anyhow::Result<()> {
    match NodeConfig::from_file(&config_path) {
        Ok(config) => {
            println!("Configuration valid!");
            println!();
            println!("Node: {}", config.node_name);
            println!("Drives: {}", config.drive_watcher.roots.len());
            for (i, root) in config.drive_watcher.roots.iter().enumerate() {
                println!("  [{}] {}", i, root.display());
            }
            println!("Recorders: {}", config.recorders.len());
            for recorder in &config.recorders {
                println!(
                    "  {} (.{}, queue {})",
                    recorder.name,
                    recorder.extension,
                    recorder
                        .queue_capacity
                        .map_or_else(|| "unbounded".to_string(), |c| c.to_string())
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            std::process::exit(1);
        }
    }
}
