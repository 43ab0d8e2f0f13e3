//! Binary entry point for lapse.
//!
//! Runs the capture agent, the ingest receiver, and a few spool maintenance
//! commands.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
// Allow print_stderr in main binary for CLI output
#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]
// Allow needless_pass_by_value for command functions
#![allow(clippy::needless_pass_by_value)]
// Allow multiple crate versions from transitive dependencies
#![allow(clippy::multiple_crate_versions)]

use clap::{Parser, Subcommand};
use lapse::camera::{LightMeter, RpicamCamera, SimulatedCamera};
use lapse::config::CameraDriver;
use lapse::observability::{self, InitOptions};
use lapse::{Agent, AgentConfig, DeliveryState, Shutdown, SpoolQueue};
use std::path::Path;
use std::process::ExitCode;

/// Failed frames listed by `lapse status`.
const STATUS_FAILED_LIMIT: usize = 20;

/// Lapse - time-lapse capture agent with an offline-tolerant upload queue.
#[derive(Parser)]
#[command(name = "lapse")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to configuration file.
    #[arg(short, long, global = true, env = "LAPSE_CONFIG_PATH")]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Run the capture agent until interrupted.
    Run {
        /// Use the simulated camera instead of the configured driver.
        #[arg(long)]
        simulate: bool,
    },

    /// Run the ingest receiver.
    Serve,

    /// Show spool statistics.
    Status,

    /// Move permanently failed frames back to pending.
    RequeueFailed,

    /// Show the effective configuration.
    Config,
}

/// Main entry point.
fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        },
    };

    let long_running = matches!(cli.command, Commands::Run { .. } | Commands::Serve);
    let metrics = lapse::config::MetricsSettings {
        enabled: config.metrics.enabled && long_running,
        ..config.metrics
    };
    let _observability = match observability::init(
        &config.logging,
        &metrics,
        InitOptions {
            verbose: cli.verbose,
        },
    ) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Failed to initialize observability: {e}");
            return ExitCode::FAILURE;
        },
    };

    match run_command(cli.command, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        },
    }
}

/// Runs the selected command.
fn run_command(command: Commands, config: AgentConfig) -> lapse::Result<()> {
    match command {
        Commands::Run { simulate } => cmd_run(config, simulate),
        Commands::Serve => cmd_serve(&config),
        Commands::Status => cmd_status(&config),
        Commands::RequeueFailed => cmd_requeue_failed(&config),
        Commands::Config => cmd_config(&config),
    }
}

/// Loads configuration.
fn load_config(path: Option<&str>) -> lapse::Result<AgentConfig> {
    match path {
        Some(path) if !path.trim().is_empty() => AgentConfig::load_from_file(Path::new(path)),
        _ => AgentConfig::load_default(),
    }
}

fn cmd_run(config: AgentConfig, simulate: bool) -> lapse::Result<()> {
    let meter: Box<dyn LightMeter> = if simulate || config.camera.driver == CameraDriver::Simulated
    {
        tracing::info!("Using simulated camera");
        Box::new(SimulatedCamera::dusk())
    } else {
        Box::new(RpicamCamera::new(config.camera.clone()))
    };

    let agent = Agent::new(config, meter)?;
    let shutdown = Shutdown::new();

    let handler = shutdown.clone();
    ctrlc::set_handler(move || handler.trigger())
        .map_err(|e| lapse::Error::operation("install_signal_handler", e))?;

    agent.run_until_shutdown(&shutdown)
}

fn cmd_serve(config: &AgentConfig) -> lapse::Result<()> {
    lapse::receiver::serve(config.receiver.clone())
}

fn cmd_status(config: &AgentConfig) -> lapse::Result<()> {
    let path = config.spool_path();
    println!("Lapse Status");
    println!("============");
    println!();
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Device: {}", config.device_id);
    println!("Spool: {}", path.display());

    if !path.exists() {
        println!();
        println!("Spool not initialized");
        return Ok(());
    }

    let queue = SpoolQueue::attach(&path)?;
    let stats = queue.stats()?;
    println!();
    println!("Pending: {}", stats.pending);
    println!("Delivering: {}", stats.delivering);
    println!("Delivered: {}", stats.delivered);
    println!("Failed: {}", stats.failed_permanent);
    println!("Backlog bytes: {}", stats.pending_bytes);

    let failed = queue.list(DeliveryState::FailedPermanent, STATUS_FAILED_LIMIT)?;
    if !failed.is_empty() {
        println!();
        println!("Failed frames:");
        for entry in failed {
            println!(
                "  #{} {} ({} attempts): {}",
                entry.seq(),
                entry.photo().filename(),
                entry.attempts(),
                entry.last_error().unwrap_or("unknown")
            );
        }
        println!();
        println!("Use 'lapse requeue-failed' to retry them");
    }
    Ok(())
}

fn cmd_requeue_failed(config: &AgentConfig) -> lapse::Result<()> {
    let queue = SpoolQueue::attach(config.spool_path())?;
    let moved = queue.requeue_failed()?;
    println!("Requeued {moved} frame(s)");
    Ok(())
}

fn cmd_config(config: &AgentConfig) -> lapse::Result<()> {
    println!("Current Configuration");
    println!("=====================");
    println!();
    println!("Device ID: {}", config.device_id);
    println!("Data Directory: {}", config.data_dir.display());
    println!("Clock Sanity Epoch: {}", config.clock_sanity_epoch);
    println!("Capture Interval: {:?}", config.capture.interval);
    println!();
    println!("Exposure:");
    println!("  Manual Below: {:.3}", config.exposure.manual_below);
    println!("  Auto Above: {:.3}", config.exposure.auto_above);
    println!("  Target: {:.3}", config.exposure.target);
    println!("  Deadband: {:.3}", config.exposure.deadband);
    println!(
        "  Duration: {:?} ({:?}..={:?})",
        config.exposure.default_duration,
        config.exposure.min_duration,
        config.exposure.max_duration
    );
    println!();
    println!("Upload:");
    println!("  Endpoint: {}", config.upload.endpoint);
    println!("  Timeout: {:?}", config.upload.timeout);
    println!(
        "  Backoff: {:?} x{} up to {:?}",
        config.upload.initial_backoff, config.upload.backoff_multiplier, config.upload.max_backoff
    );
    println!("  Insecure HTTP: {}", config.upload.allow_insecure_http);
    println!();
    println!("Camera: {:?}", config.camera.driver);
    println!("Logging: {:?} ({})", config.logging.format, config.logging.level);
    println!(
        "Metrics: {}",
        if config.metrics.enabled {
            format!("enabled on port {}", config.metrics.port)
        } else {
            "disabled".to_string()
        }
    );
    println!();
    println!("Receiver:");
    println!("  Listen: {}", config.receiver.listen);
    println!("  Root: {}", config.receiver.root.display());
    for device in &config.receiver.devices {
        println!(
            "  Device {}: max {} bytes",
            device.device_id, device.max_file_size_bytes
        );
    }
    Ok(())
}
