//! Heliotherm Daemon (heliothermd)
//!
//! Runs the solar-thermal control loop and serves its state over a Unix
//! domain socket.
//!
//! # Lifecycle
//! - **Startup**: load settings, initialise logging, open the sensor channel
//! - **Run**: one control cycle per interval, API served concurrently
//! - **Signals**: SIGINT/SIGTERM let the running cycle finish, then exit

mod control_loop;
mod server;
mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use ht_core::settings::{default_settings_path, load_settings, save_settings, Settings};
use ht_core::{ControlLoop, SysfsChannel};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "heliothermd")]
#[command(version)]
#[command(about = "Heliotherm - solar-thermal heating control daemon")]
#[command(long_about = "Heliotherm - solar-thermal heating control daemon

Reads the collector and tank sensors, runs the circulation pump and backup
heater, and accounts the energy each heat source delivers.

ENVIRONMENT VARIABLES:
    HELIOTHERM_LOG=debug   Log level / filter directives

FILES:
    /etc/heliotherm/settings.json   Controller settings")]
struct Cli {
    /// Settings file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// API socket path (overrides settings)
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Write a default settings file to the config path and exit
    #[arg(long)]
    write_default_config: bool,
}

/// Journald when the journal socket exists, stdout otherwise.
/// Returns whether journald is in use.
fn init_logging(log_level: &str) -> bool {
    let use_journald = std::path::Path::new("/run/systemd/journal/socket").exists();

    if use_journald {
        match tracing_journald::layer() {
            Ok(journald_layer) => {
                use tracing_subscriber::prelude::*;
                tracing_subscriber::registry()
                    .with(journald_layer)
                    .with(tracing_subscriber::EnvFilter::new(log_level))
                    .init();
                return true;
            }
            Err(e) => {
                eprintln!("Failed to create journald layer: {}, falling back to stdout", e);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_env_filter(log_level)
        .init();
    false
}

fn install_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());

        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };

        eprintln!("PANIC at {}: {}", location, message);
    }));
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    install_panic_hook();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(default_settings_path);

    if cli.write_default_config {
        save_settings(&config_path, &Settings::default())
            .with_context(|| format!("writing default settings to {}", config_path.display()))?;
        println!("Wrote default settings to {}", config_path.display());
        return Ok(());
    }

    let log_level = std::env::var("HELIOTHERM_LOG").unwrap_or_else(|_| "info".to_string());
    let use_journald = init_logging(&log_level);

    info!("STARTUP: heliothermd {} starting", VERSION);
    info!("STARTUP: Logging to {}", if use_journald { "systemd journal" } else { "stdout" });

    let settings = match load_settings(&config_path) {
        Ok(settings) => settings,
        Err(e) => {
            error!("STARTUP: invalid settings in {}: {}", config_path.display(), e);
            return Err(e).context("loading settings");
        }
    };
    let socket_path = cli.socket.unwrap_or_else(|| settings.daemon.socket_path.clone());

    info!("STARTUP: Settings: {}", config_path.display());
    info!("STARTUP: Socket path: {}", socket_path.display());
    info!("STARTUP: Sensors: {:?}", settings.sensors.known_sensor_ids());

    for id in settings.sensors.known_sensor_ids() {
        if !settings.sensors.paths.contains_key(&id) {
            warn!(sensor = %id, "STARTUP: no sysfs path configured, sensor will read as failed");
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let signal_tx = shutdown_tx.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("SIGNAL: Received SIGINT/SIGTERM - finishing current cycle");
        signal_tx.send_replace(true);
    }) {
        warn!("Failed to set signal handler: {}. Shutdown via signals may not work cleanly.", e);
    }

    let channel = Arc::new(SysfsChannel::new(settings.sensors.paths.clone()));
    let control = ControlLoop::new(&settings, channel).with_telemetry(Arc::new(telemetry::LogTelemetry));
    let (handle, loop_channels) = control_loop::channels(control.snapshot().clone());

    let control_task = tokio::spawn(control_loop::run_control_loop(
        control,
        loop_channels,
        shutdown_rx.clone(),
        settings.daemon.cycle_interval(),
    ));

    info!("STARTUP: control loop started");

    let result = server::run_server(&socket_path, handle, shutdown_rx).await;
    // Server gone (error or signal): no further cycles either
    shutdown_tx.send_replace(true);

    if let Err(e) = control_task.await {
        error!("Control loop task ended abnormally: {}", e);
    }

    match &result {
        Ok(()) => info!("SHUTDOWN: Daemon terminated gracefully"),
        Err(e) => error!("Server error: {:#}", e),
    }
    result
}
