//! Sampling and snapshot assembly
//!
//! A sampling tick produces a [`SensorFrame`]: every calibrated temperature,
//! the derived deltas and one flow-rate sample. Telemetry snapshots combine
//! the latest frame with live control state at the moment they are requested.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Local};
use sh_protocol::{ControlMode, Deltas, TelemetryMessage, Temperatures};

use crate::control::ValveFanState;
use crate::flow::PulseCounter;
use crate::session::SessionPoint;
use crate::thermometry::{delta_of, round2, CalibratedThermometry};

/// Deltas from calibrated readings
pub fn compute_deltas(t: &Temperatures) -> Deltas {
    Deltas {
        delta_water_heater: delta_of(t.water_hot, t.water_cold),
        delta_water_radiator: delta_of(t.water_mix, t.water_cold),
        delta_air: delta_of(t.air_heated, t.air_cool),
    }
}

/// Sensor values from one sampling tick
#[derive(Debug, Clone, PartialEq)]
pub struct SensorFrame {
    pub temperatures: Temperatures,
    pub deltas: Deltas,
    /// L/min, 2 decimals
    pub flow_rate: f64,
    pub sampled_at: DateTime<Local>,
}

impl Default for SensorFrame {
    fn default() -> Self {
        Self {
            temperatures: Temperatures::default(),
            deltas: Deltas::default(),
            flow_rate: 0.0,
            sampled_at: Local::now(),
        }
    }
}

/// Live control fields merged into every snapshot
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlView {
    pub state: ValveFanState,
    pub control_mode: ControlMode,
    pub save_enabled: bool,
    pub graph_enabled: bool,
}

impl SensorFrame {
    pub fn snapshot(&self, view: &ControlView) -> TelemetryMessage {
        TelemetryMessage {
            temperatures: self.temperatures.clone(),
            deltas: self.deltas.clone(),
            flow_rate: self.flow_rate,
            fan_speed: view.state.fan_speed_percent,
            main_loop_state: view.state.main_open,
            diversion_state: view.state.diversion_open,
            control_mode: view.control_mode,
            flow_mode: view.state.mode,
            save_enabled: view.save_enabled,
            graph_enabled: view.graph_enabled,
        }
    }

    pub fn session_point(&self, view: &ControlView) -> SessionPoint {
        SessionPoint {
            timestamp: self.sampled_at,
            temperatures: self.temperatures.clone(),
            deltas: self.deltas.clone(),
            flow_rate: self.flow_rate,
            fan_speed: view.state.fan_speed_percent,
            main_loop_state: view.state.main_open,
            diversion_state: view.state.diversion_open,
            control_mode: view.control_mode,
            flow_mode: view.state.mode,
        }
    }
}

/// Reads every sensor for one tick
pub struct Sampler {
    thermometry: CalibratedThermometry,
    counter: Arc<PulseCounter>,
}

impl Sampler {
    pub fn new(thermometry: CalibratedThermometry, counter: Arc<PulseCounter>) -> Self {
        Self {
            thermometry,
            counter,
        }
    }

    pub fn thermometry(&self) -> &CalibratedThermometry {
        &self.thermometry
    }

    pub fn counter(&self) -> &Arc<PulseCounter> {
        &self.counter
    }

    /// Temperatures may block on the bus; call off the event loop
    pub fn sample(&self) -> SensorFrame {
        let temperatures = self.thermometry.read_all();
        self.frame(temperatures, Instant::now())
    }

    /// Build a frame from already-read temperatures, sampling the flow rate at `now`
    pub fn frame(&self, temperatures: Temperatures, now: Instant) -> SensorFrame {
        let deltas = compute_deltas(&temperatures);
        SensorFrame {
            temperatures,
            deltas,
            flow_rate: round2(self.counter.sample_rate_at(now)),
            sampled_at: Local::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::sim::SimRig;
    use crate::thermometry::{CalibrationTable, SensorBindings};
    use sh_protocol::FlowMode;
    use std::time::Duration;

    fn view() -> ControlView {
        ControlView {
            state: ValveFanState::safe_default(),
            control_mode: ControlMode::Manual,
            save_enabled: false,
            graph_enabled: true,
        }
    }

    #[test]
    fn test_deltas_follow_probe_pairs() {
        let t = Temperatures {
            water_hot: Some(140.0),
            water_mix: Some(100.5),
            water_cold: Some(60.2),
            water_reservoir: None,
            air_heated: Some(95.0),
            air_cool: None,
        };
        let d = compute_deltas(&t);
        assert_eq!(d.delta_water_heater, Some(79.8));
        assert_eq!(d.delta_water_radiator, Some(40.3));
        assert_eq!(d.delta_air, None);
    }

    #[test]
    fn test_flow_rate_rounded_to_two_decimals() {
        let sim = SimRig::with_default_sensors();
        let counter = Arc::new(PulseCounter::default());
        let sampler = Sampler::new(
            CalibratedThermometry::new(
                sim.rig().thermometers,
                SensorBindings::default(),
                CalibrationTable::default(),
            ),
            counter.clone(),
        );
        let t0 = Instant::now();
        sampler.frame(Temperatures::default(), t0);
        for _ in 0..100 {
            counter.on_edge();
        }
        // 100 / 450 L over 7 s → 1.904761... L/min
        let frame = sampler.frame(Temperatures::default(), t0 + Duration::from_secs(7));
        assert_eq!(frame.flow_rate, 1.9);
    }

    #[test]
    fn test_sample_reads_all_bound_probes() {
        let sim = SimRig::with_default_sensors();
        let sampler = Sampler::new(
            CalibratedThermometry::new(
                sim.rig().thermometers,
                SensorBindings::default(),
                CalibrationTable::default(),
            ),
            Arc::new(PulseCounter::default()),
        );
        let frame = sampler.sample();
        // water_reservoir has no offset: 21 °C → 69.8 °F
        assert_eq!(frame.temperatures.water_reservoir, Some(69.8));
        assert!(frame.deltas.delta_air.is_some());
        assert_eq!(frame.flow_rate, 0.0);
    }

    #[test]
    fn test_snapshot_merges_live_state() {
        let frame = SensorFrame {
            flow_rate: 3.25,
            ..Default::default()
        };
        let mut v = view();
        v.state.main_open = false;
        v.state.mode = FlowMode::Diversion;
        v.state.fan_speed_percent = 100;

        let msg = frame.snapshot(&v);
        assert_eq!(msg.flow_rate, 3.25);
        assert_eq!(msg.fan_speed, 100);
        assert!(!msg.main_loop_state);
        assert_eq!(msg.flow_mode, FlowMode::Diversion);
        assert!(msg.graph_enabled);

        let point = frame.session_point(&v);
        assert_eq!(point.timestamp, frame.sampled_at);
        assert_eq!(point.flow_mode, FlowMode::Diversion);
    }
}
