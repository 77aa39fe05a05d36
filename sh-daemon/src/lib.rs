//! Shop Heater daemon internals
//!
//! The binary wires these together; integration tests drive them directly
//! against a simulated rig.

pub mod broker;
pub mod registry;
pub mod server;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace};

use sh_core::constants::server::CLIENT_QUEUE_DEPTH;
use sh_core::settings::ServerSettings;
use sh_core::Heater;

use crate::broker::Broker;

/// Sample sensors every `period` until shutdown. Runs even with no clients
/// so that recording sessions keep filling.
pub async fn run_sampling_loop(heater: Arc<Heater>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let heater = heater.clone();
                match tokio::task::spawn_blocking(move || heater.sample_tick()).await {
                    Ok(frame) => trace!(flow_rate = frame.flow_rate, "Sampled"),
                    Err(e) => error!("Sampling task failed: {}", e),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Sampling loop stopped");
}

/// Push a snapshot to every client every `period` until shutdown
pub async fn run_broadcast_loop(broker: Arc<Broker>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let delivered = broker.broadcast().await;
                trace!(delivered, "Broadcast");
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("Broadcast loop stopped");
}

/// Serve `heater` on `listener` until `shutdown` flips to true.
///
/// Returns once the accept loop and both periodic loops have stopped. The
/// caller still owns the rig and must call [`Heater::shutdown`] afterwards.
pub async fn run(
    listener: TcpListener,
    heater: Arc<Heater>,
    settings: &ServerSettings,
    shutdown: watch::Receiver<bool>,
) {
    let broker = Arc::new(Broker::new(heater.clone(), CLIENT_QUEUE_DEPTH));

    let sampling = tokio::spawn(run_sampling_loop(
        heater,
        settings.sampling_interval(),
        shutdown.clone(),
    ));
    let broadcast = tokio::spawn(run_broadcast_loop(
        broker.clone(),
        settings.broadcast_interval(),
        shutdown.clone(),
    ));
    info!(
        sampling_ms = settings.sampling_interval_ms,
        broadcast_ms = settings.broadcast_interval_ms,
        "Periodic tasks started"
    );

    server::run_server(listener, broker, settings.max_connections, shutdown).await;

    let _ = sampling.await;
    let _ = broadcast.await;
    info!("Daemon tasks stopped");
}
