//! Flow measurement
//!
//! [`PulseCounter`] folds hall-sensor edges into a pulse total and turns it
//! into volume, mass and an instantaneous rate. [`FlowMeter`] owns the edge
//! registration that feeds it.
//!
//! The edge callback runs on a context the async runtime does not control
//! (interrupt thread or sysfs watcher). Counter state is therefore guarded by
//! one short `parking_lot` mutex, held only for the read-modify-write.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sh_error::{Result, ShopHeaterError};
use tracing::{debug, info, warn};

use crate::constants::flow::{
    KG_PER_POUND, MIN_SAMPLE_INTERVAL_SECS, PULSES_PER_LITER, PULSES_PER_POUND,
};
use crate::hw::{EdgeHandle, EdgeKind, EdgeSource};

/// Conversion constants for one flow sensor.
///
/// The liters and pounds constants come from independent calibrations and are
/// not expected to agree with each other.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlowCalibration {
    pub pulses_per_liter: f64,
    pub pulses_per_pound: f64,
}

impl Default for FlowCalibration {
    fn default() -> Self {
        Self {
            pulses_per_liter: PULSES_PER_LITER,
            pulses_per_pound: PULSES_PER_POUND,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MassUnit {
    Pounds,
    Kilograms,
}

#[derive(Debug, Default)]
struct FlowCounterState {
    total_pulses: u64,
    /// `None` until the first rate sample after construction
    last_sample_time: Option<Instant>,
    last_sample_pulses: u64,
}

/// Thread-safe pulse counter
#[derive(Debug)]
pub struct PulseCounter {
    state: Mutex<FlowCounterState>,
    calibration: FlowCalibration,
}

impl Default for PulseCounter {
    fn default() -> Self {
        Self::new(FlowCalibration::default())
    }
}

impl PulseCounter {
    pub fn new(calibration: FlowCalibration) -> Self {
        Self {
            state: Mutex::new(FlowCounterState::default()),
            calibration,
        }
    }

    pub fn calibration(&self) -> FlowCalibration {
        self.calibration
    }

    /// Count one edge. Called from the edge context: no allocation, no I/O.
    #[inline]
    pub fn on_edge(&self) {
        let mut state = self.state.lock();
        state.total_pulses = state.total_pulses.saturating_add(1);
    }

    /// Zero the total and re-baseline the rate window at the current instant.
    pub fn reset(&self) {
        self.reset_at(Instant::now());
    }

    pub fn reset_at(&self, now: Instant) {
        let mut state = self.state.lock();
        state.total_pulses = 0;
        state.last_sample_pulses = 0;
        state.last_sample_time = Some(now);
        drop(state);
        info!("Flow counter reset");
    }

    /// Liters per minute since the previous sample.
    pub fn sample_rate_per_minute(&self) -> f64 {
        self.sample_rate_at(Instant::now())
    }

    /// Rate sample against an explicit clock reading.
    ///
    /// Returns 0.0 for the first sample after construction and when the
    /// window is shorter than 1 ms. The window is advanced in both cases.
    pub fn sample_rate_at(&self, now: Instant) -> f64 {
        let mut state = self.state.lock();
        let total = state.total_pulses;
        let previous = state.last_sample_time.replace(now);
        let delta_pulses = total.saturating_sub(state.last_sample_pulses);
        state.last_sample_pulses = total;
        drop(state);

        let Some(previous) = previous else {
            return 0.0;
        };
        let delta_secs = now.saturating_duration_since(previous).as_secs_f64();
        if delta_secs < MIN_SAMPLE_INTERVAL_SECS {
            return 0.0;
        }

        (delta_pulses as f64 / self.calibration.pulses_per_liter) / delta_secs * 60.0
    }

    pub fn pulse_count(&self) -> u64 {
        self.state.lock().total_pulses
    }

    pub fn total_volume_liters(&self) -> f64 {
        self.pulse_count() as f64 / self.calibration.pulses_per_liter
    }

    pub fn total_mass(&self, unit: MassUnit) -> f64 {
        let pounds = self.pulse_count() as f64 / self.calibration.pulses_per_pound;
        match unit {
            MassUnit::Pounds => pounds,
            MassUnit::Kilograms => pounds * KG_PER_POUND,
        }
    }
}

/// A [`PulseCounter`] wired to an edge source.
///
/// Construction fails if the edge cannot be registered. Dropping an attached
/// meter deregisters it.
pub struct FlowMeter {
    counter: Arc<PulseCounter>,
    edges: Box<dyn EdgeSource>,
    channel: u32,
    handle: Option<EdgeHandle>,
}

impl FlowMeter {
    pub fn attach(
        mut edges: Box<dyn EdgeSource>,
        channel: u32,
        edge: EdgeKind,
        calibration: FlowCalibration,
    ) -> Result<Self> {
        let counter = Arc::new(PulseCounter::new(calibration));
        let sink = counter.clone();
        let handle = edges
            .register_edge_callback(channel, edge, Arc::new(move || sink.on_edge()))
            .map_err(|e| ShopHeaterError::hardware_init(format!("flow meter gpio{}", channel), e.to_string()))?;

        info!(channel, edge = edge.sysfs_name(), "Flow meter attached");
        Ok(Self {
            counter,
            edges,
            channel,
            handle: Some(handle),
        })
    }

    pub fn counter(&self) -> Arc<PulseCounter> {
        self.counter.clone()
    }

    pub fn is_attached(&self) -> bool {
        self.handle.is_some()
    }

    /// Stop counting. Deregistration failures are logged, never returned.
    pub fn detach(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match self.edges.deregister(handle) {
            Ok(()) => debug!(channel = self.channel, "Flow meter detached"),
            Err(e) => warn!(channel = self.channel, "Failed to deregister flow edge: {}", e),
        }
    }
}

impl Drop for FlowMeter {
    fn drop(&mut self) {
        self.detach();
    }
}
