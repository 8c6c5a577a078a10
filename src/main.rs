use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use camcore::config::{self, AppConfig};
use camcore::events::EventBus;
use camcore::ingest::IngestSupervisor;
use camcore::pipeline::DispatchLoop;
use camcore::recorder::SessionRecorder;
use camcore::state::CoreContext;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// camcore command line arguments
#[derive(Parser, Debug)]
#[command(name = "camcore")]
#[command(version, about = "Multi-camera capture and recording core", long_about = None)]
struct CliArgs {
    /// Path to the configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Recordings directory (overrides config)
    #[arg(short = 'r', long, value_name = "DIR")]
    recordings_dir: Option<PathBuf>,

    /// Do not start ingest automatically at startup
    #[arg(long)]
    no_autostart: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting camcore v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration with CLI overrides
    let mut config = config::load_config(args.config.as_deref())?;
    if let Some(dir) = args.recordings_dir {
        config.recording.recordings_dir = dir;
    }
    let config: Arc<AppConfig> = Arc::new(config);
    tracing::info!(
        "Recordings directory: {}",
        config.recording.recordings_dir.display()
    );

    // Startup diagnostics: what capture hardware is actually present
    match tokio::task::spawn_blocking(camcore::capture::enumerate_capture_nodes).await? {
        Ok(nodes) => {
            for node in &nodes {
                tracing::info!(
                    "Capture node {}: {} [{}] ({})",
                    node.path.display(),
                    node.card,
                    node.driver,
                    node.formats.join(", ")
                );
            }
        }
        Err(e) => tracing::warn!("Capture node scan failed: {}", e),
    }

    // The media framework needs its dispatch loop before any graph exists
    let dispatch = DispatchLoop::start()?;

    // Core components, wired through an explicit context
    let (shutdown_tx, _) = broadcast::channel(1);
    let events = EventBus::new(config.device_id.clone(), &config.events);
    let supervisor = IngestSupervisor::new(Arc::clone(&config), Arc::clone(&events));
    let recorder = SessionRecorder::new(
        Arc::clone(&config),
        Arc::clone(&events),
        Arc::clone(&supervisor),
    );

    supervisor.spawn_background_tasks().await;
    recorder.spawn_background_tasks().await;

    let context = CoreContext::new(
        config,
        events,
        Arc::clone(&supervisor),
        recorder,
        shutdown_tx,
    );

    // Bring up ingest for every enabled camera; cameras without signal stay
    // in no_signal and the health loop picks them up on hot-plug.
    if args.no_autostart {
        tracing::info!("Autostart disabled, ingest idle until requested");
    } else {
        let results = supervisor.start_all().await;
        let streaming = results.values().filter(|ok| **ok).count();
        tracing::info!(
            "Ingest started for {}/{} cameras",
            streaming,
            results.len()
        );
    }

    // Run until SIGINT/SIGTERM
    wait_for_signal().await;
    tracing::info!("Shutdown signal received, stopping");

    if let Err(e) = context.shutdown().await {
        tracing::warn!("Graceful shutdown incomplete: {}", e);
    }
    dispatch.shutdown();

    tracing::info!("camcore stopped");
    Ok(())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

fn init_logging(level: LogLevel, verbose: u8) {
    let level = match (level, verbose) {
        (_, 2..) => "trace",
        (_, 1) => "debug",
        (LogLevel::Error, _) => "error",
        (LogLevel::Warn, _) => "warn",
        (LogLevel::Info, _) => "info",
        (LogLevel::Debug, _) => "debug",
        (LogLevel::Trace, _) => "trace",
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("camcore={}", level)));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}
