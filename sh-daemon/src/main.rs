//! Shop Heater Daemon (shopheaterd)
//!
//! Owns the rig hardware and serves telemetry and control to clients over
//! TCP (newline-delimited JSON).
//!
//! # Lifecycle
//! 1. Load settings, initialise logging
//! 2. Claim the rig: valves open, fan stopped, flow meter attached
//! 3. Serve until SIGINT/SIGTERM
//! 4. Finalize recording sessions, detach the flow meter, stop the fan,
//!    release the valve relays

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use sh_core::hw::{sim::SimRig, sysfs};
use sh_core::{default_settings_path, FileSessionStore, Heater, Settings};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Simulated flow: ~7.5 edges/s is about 1 L/min at 450 pulses per liter
const SIM_PULSE_HZ: f64 = 7.5;

#[derive(Parser, Debug)]
#[command(name = "shopheaterd", version, about = "Shop Heater coolant loop control daemon")]
struct Args {
    /// Settings file (default: ~/.config/shopheater/settings.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides settings
    #[arg(short, long)]
    bind: Option<String>,

    /// Directory for recorded sessions, overrides settings
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Run against a simulated rig instead of sysfs hardware
    #[arg(long)]
    simulate: bool,
}

/// Returns true when logging to the journal
fn init_logging() -> bool {
    let log_level = std::env::var("SHOPHEATER_LOG").unwrap_or_else(|_| "info".to_string());

    let use_journald = std::path::Path::new("/run/systemd/journal/socket").exists();
    if use_journald {
        match tracing_journald::layer() {
            Ok(journald_layer) => {
                use tracing_subscriber::prelude::*;
                tracing_subscriber::registry()
                    .with(journald_layer)
                    .with(tracing_subscriber::EnvFilter::new(&log_level))
                    .init();
                return true;
            }
            Err(e) => {
                eprintln!("Failed to create journald layer: {}, falling back to stdout", e);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(&log_level)
        .init();
    false
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!("Failed to install SIGTERM handler: {}", e),
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    std::panic::set_hook(Box::new(|panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());
        eprintln!("PANIC at {}: {}", location, panic_info);
    }));

    let args = Args::parse();
    let use_journald = init_logging();

    info!("STARTUP: shopheaterd {} starting", VERSION);
    info!("STARTUP: Logging to {}", if use_journald { "systemd journal" } else { "stdout" });

    let config_path = args.config.clone().unwrap_or_else(default_settings_path);
    let mut settings = Settings::load(&config_path)
        .with_context(|| format!("loading settings from {:?}", config_path))?;
    if let Some(bind) = args.bind {
        settings.server.bind = bind;
    }
    if let Some(dir) = args.data_dir {
        settings.recording.data_dir = dir;
    }
    settings.validate()?;

    // The simulated rig and its pulse thread live until the rig is released
    let mut simulation = None;
    let rig = if args.simulate {
        info!("STARTUP: Using simulated rig");
        let sim = SimRig::with_default_sensors();
        let pulses = sim.spawn_pulse_generator(settings.flow.edge_channel, SIM_PULSE_HZ);
        let rig = sim.rig();
        simulation = Some((sim, pulses));
        rig
    } else {
        match sysfs::open_rig(settings.fan.pwm_chip, settings.fan.pwm_frequency_hz) {
            Ok(rig) => rig,
            Err(e) => {
                error!("STARTUP: {}", e);
                std::process::exit(1);
            }
        }
    };

    let store = FileSessionStore::new(settings.recording.data_dir.clone());
    info!("STARTUP: Sessions will be saved to {:?}", store.dir());

    let heater = match Heater::from_rig(rig, &settings, Box::new(store)) {
        Ok(heater) => Arc::new(heater),
        Err(e) => {
            error!("STARTUP: {}", e);
            std::process::exit(1);
        }
    };

    let listener = match TcpListener::bind(&settings.server.bind).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("STARTUP: cannot bind {}: {}", settings.server.bind, e);
            heater.shutdown();
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("SIGNAL: Received SIGINT/SIGTERM - initiating shutdown");
        let _ = shutdown_tx.send(true);
    });

    sh_daemon::run(listener, heater.clone(), &settings.server, shutdown_rx).await;

    heater.shutdown();
    drop(simulation);

    info!("SHUTDOWN: Daemon terminated gracefully");
    Ok(())
}
