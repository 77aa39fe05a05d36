//! Recording sessions
//!
//! Two independent sessions share the sampling tick: a durable `log` and an
//! ephemeral `graph`. Each collects points only while enabled and is handed
//! to a [`SessionSink`] when it is disabled or the process shuts down.
//! Finalizing an empty session writes nothing.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use sh_error::Result;
use sh_protocol::{ControlMode, Deltas, FlowMode, Temperatures};
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Log,
    Graph,
}

impl SessionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionKind::Log => "log",
            SessionKind::Graph => "graph",
        }
    }
}

/// One recorded sample; also the persisted log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionPoint {
    pub timestamp: DateTime<Local>,
    #[serde(flatten)]
    pub temperatures: Temperatures,
    #[serde(flatten)]
    pub deltas: Deltas,
    pub flow_rate: f64,
    pub fan_speed: u8,
    pub main_loop_state: bool,
    pub diversion_state: bool,
    pub control_mode: ControlMode,
    pub flow_mode: FlowMode,
}

/// A completed session ready for persistence
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedSession {
    pub kind: SessionKind,
    pub started_at: DateTime<Local>,
    pub ended_at: DateTime<Local>,
    pub points: Vec<SessionPoint>,
}

impl FinishedSession {
    pub fn duration_seconds(&self) -> f64 {
        (self.ended_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    pub fn data_points(&self) -> usize {
        self.points.len()
    }
}

#[derive(Debug)]
pub struct RecordingSession {
    kind: SessionKind,
    enabled: bool,
    started_at: Option<DateTime<Local>>,
    points: Vec<SessionPoint>,
}

impl RecordingSession {
    pub fn new(kind: SessionKind) -> Self {
        Self {
            kind,
            enabled: false,
            started_at: None,
            points: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn started_at(&self) -> Option<DateTime<Local>> {
        self.started_at
    }

    /// Start a fresh buffer. No effect if already enabled.
    pub fn enable(&mut self, now: DateTime<Local>) {
        if self.enabled {
            return;
        }
        self.enabled = true;
        self.points.clear();
        self.started_at = Some(now);
        info!(session = self.kind.as_str(), "Recording started");
    }

    /// Stop recording. Returns the buffer if it held any points.
    pub fn disable(&mut self, now: DateTime<Local>) -> Option<FinishedSession> {
        if !self.enabled {
            return None;
        }
        self.enabled = false;
        let points = std::mem::take(&mut self.points);
        let started_at = self.started_at.take()?;
        info!(session = self.kind.as_str(), points = points.len(), "Recording stopped");

        if points.is_empty() {
            return None;
        }
        Some(FinishedSession {
            kind: self.kind,
            started_at,
            ended_at: now,
            points,
        })
    }

    pub fn record(&mut self, point: &SessionPoint) {
        if self.enabled {
            self.points.push(point.clone());
        }
    }
}

/// Destination for finished sessions
pub trait SessionSink: Send + Sync {
    fn persist(&self, session: &FinishedSession) -> Result<()>;
}

/// Hand a finished session to `sink`. A failure loses the data and is logged.
pub fn persist_finished(sink: &dyn SessionSink, finished: &FinishedSession) {
    if let Err(e) = sink.persist(finished) {
        error!(
            session = finished.kind.as_str(),
            points = finished.data_points(),
            "Session data lost: {}",
            e
        );
    }
}

/// Both sessions. Finished buffers are returned to the caller, which persists
/// them after releasing whatever lock guards the manager.
#[derive(Debug)]
pub struct SessionManager {
    log: RecordingSession,
    graph: RecordingSession,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            log: RecordingSession::new(SessionKind::Log),
            graph: RecordingSession::new(SessionKind::Graph),
        }
    }

    fn session_mut(&mut self, kind: SessionKind) -> &mut RecordingSession {
        match kind {
            SessionKind::Log => &mut self.log,
            SessionKind::Graph => &mut self.graph,
        }
    }

    pub fn session(&self, kind: SessionKind) -> &RecordingSession {
        match kind {
            SessionKind::Log => &self.log,
            SessionKind::Graph => &self.graph,
        }
    }

    pub fn is_enabled(&self, kind: SessionKind) -> bool {
        self.session(kind).is_enabled()
    }

    /// Enable or disable `kind`; disabling a non-empty session returns it
    #[must_use]
    pub fn set_enabled(&mut self, kind: SessionKind, enabled: bool) -> Option<FinishedSession> {
        let now = Local::now();
        if enabled {
            self.session_mut(kind).enable(now);
            None
        } else {
            self.session_mut(kind).disable(now)
        }
    }

    /// Append to every enabled session
    pub fn record(&mut self, point: &SessionPoint) {
        self.log.record(point);
        self.graph.record(point);
    }

    /// Stop anything still recording
    #[must_use]
    pub fn shutdown(&mut self) -> Vec<FinishedSession> {
        let mut finished = Vec::new();
        for kind in [SessionKind::Log, SessionKind::Graph] {
            if self.is_enabled(kind) {
                debug!(session = kind.as_str(), "Finalizing session at shutdown");
                finished.extend(self.set_enabled(kind, false));
            }
        }
        finished
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Keeps finished sessions in memory
    #[derive(Clone, Default)]
    pub struct MemorySessionSink {
        pub finished: Arc<Mutex<Vec<FinishedSession>>>,
    }

    impl SessionSink for MemorySessionSink {
        fn persist(&self, session: &FinishedSession) -> Result<()> {
            self.finished.lock().push(session.clone());
            Ok(())
        }
    }
}
