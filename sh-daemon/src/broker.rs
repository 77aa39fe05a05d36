//! Command and telemetry broker
//!
//! Sits between the network and the [`Heater`]: assembles telemetry frames,
//! fans them out through the [`ClientRegistry`], and applies inbound
//! commands. Commands run on the blocking pool because they drive hardware
//! and may finalize a session to disk.

use std::sync::Arc;

use serde::Serialize;
use sh_core::Heater;
use sh_protocol::{CommandMessage, ErrorMessage};
use tracing::{error, info, warn};

use crate::registry::{ClientId, ClientRegistry, Frame};

/// Serialize one outbound line
pub fn encode_frame<T: Serialize>(value: &T) -> Option<Frame> {
    match serde_json::to_string(value) {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            error!("Failed to serialize frame: {}", e);
            None
        }
    }
}

pub fn error_frame(message: impl Into<String>) -> Option<Frame> {
    encode_frame(&ErrorMessage::new(message))
}

pub struct Broker {
    heater: Arc<Heater>,
    registry: ClientRegistry,
}

impl Broker {
    pub fn new(heater: Arc<Heater>, queue_depth: usize) -> Self {
        Self {
            heater,
            registry: ClientRegistry::new(queue_depth),
        }
    }

    pub fn heater(&self) -> &Arc<Heater> {
        &self.heater
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    /// Current snapshot as a wire frame
    pub fn snapshot_frame(&self) -> Option<Frame> {
        encode_frame(&self.heater.snapshot())
    }

    /// Push the current snapshot to every client
    pub async fn broadcast(&self) -> usize {
        match self.snapshot_frame() {
            Some(frame) => self.registry.broadcast(&frame).await,
            None => 0,
        }
    }

    /// Handle one inbound line from `client`.
    ///
    /// Returns the frames to send back, in order: one error per rejected
    /// field or unparseable line, then (if a command was applied) the
    /// updated snapshot.
    pub async fn handle_line(&self, client: ClientId, line: &str) -> Vec<Frame> {
        let cmd = match CommandMessage::parse(line) {
            Ok(cmd) => cmd,
            Err(reason) => {
                warn!(client, "Rejected message: {}", reason);
                return error_frame(reason).into_iter().collect();
            }
        };

        if cmd.is_empty() {
            return self.snapshot_frame().into_iter().collect();
        }

        info!(client, fields = ?cmd.field_names(), "AUDIT: applying command");

        let heater = self.heater.clone();
        let applied = tokio::task::spawn_blocking(move || heater.apply_command(&cmd)).await;

        let mut frames = Vec::new();
        match applied {
            Ok(errors) => {
                for e in errors {
                    warn!(client, "AUDIT: command field failed: {}", e);
                    frames.extend(error_frame(e.to_string()));
                }
            }
            Err(e) => {
                error!(client, "Command task failed: {}", e);
                frames.extend(error_frame("Internal error applying command"));
            }
        }
        frames.extend(self.snapshot_frame());
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sh_core::hw::sim::SimRig;
    use sh_core::{FileSessionStore, Settings};
    use sh_protocol::{FlowMode, TelemetryMessage};

    fn broker(sim: &SimRig, dir: &std::path::Path) -> Broker {
        let mut settings = Settings::default();
        settings.fan.kick_start_ms = 0;
        let heater =
            Heater::from_rig(sim.rig(), &settings, Box::new(FileSessionStore::new(dir))).unwrap();
        Broker::new(Arc::new(heater), 8)
    }

    #[tokio::test]
    async fn test_command_reply_is_updated_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimRig::with_default_sensors();
        let broker = broker(&sim, dir.path());

        let frames = broker.handle_line(1, r#"{"diversion": false}"#).await;
        assert_eq!(frames.len(), 1);
        let snap: TelemetryMessage = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(snap.flow_mode, FlowMode::Main);
        assert!(!snap.diversion_state);
    }

    #[tokio::test]
    async fn test_malformed_line_gets_error() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimRig::with_default_sensors();
        let broker = broker(&sim, dir.path());

        let frames = broker.handle_line(1, "{fan_speed: 10").await;
        assert_eq!(frames.len(), 1);
        let err: ErrorMessage = serde_json::from_str(&frames[0]).unwrap();
        assert!(err.error.starts_with("Invalid command"));
    }

    #[tokio::test]
    async fn test_hardware_failure_reported_before_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimRig::with_default_sensors();
        let broker = broker(&sim, dir.path());
        sim.fail_writes(23, true);

        let frames = broker.handle_line(1, r#"{"main_loop": false}"#).await;
        assert_eq!(frames.len(), 2);
        let err: ErrorMessage = serde_json::from_str(&frames[0]).unwrap();
        assert!(err.error.contains("channel 23"));
        let snap: TelemetryMessage = serde_json::from_str(&frames[1]).unwrap();
        assert!(!snap.main_loop_state);
    }

    #[tokio::test]
    async fn test_broadcast_without_clients() {
        let dir = tempfile::tempdir().unwrap();
        let sim = SimRig::with_default_sensors();
        let broker = broker(&sim, dir.path());
        assert_eq!(broker.broadcast().await, 0);
    }
}
