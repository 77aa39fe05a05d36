//! The rig controller
//!
//! [`Heater`] owns every piece of rig state: the flow-control state machine,
//! both recording sessions, the flow meter and the latest sensor frame. The
//! daemon builds one at startup, shares it behind an `Arc`, and calls
//! [`Heater::shutdown`] exactly once on the way out.
//!
//! Lock order when more than one is held: `control` before `sessions`.
//! Finished sessions are persisted after `sessions` is released, so a slow
//! disk never holds up a snapshot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use sh_error::{Result, ShopHeaterError};
use sh_protocol::{CommandMessage, TelemetryMessage};
use tracing::{info, warn};

use crate::control::FlowControl;
use crate::fan::FanDrive;
use crate::flow::{FlowMeter, MassUnit};
use crate::hw::HardwareRig;
use crate::session::{persist_finished, FinishedSession, SessionKind, SessionManager, SessionSink};
use crate::settings::Settings;
use crate::telemetry::{ControlView, Sampler, SensorFrame};
use crate::thermometry::CalibratedThermometry;
use crate::valves::ValveBank;

pub struct Heater {
    control: Mutex<FlowControl>,
    sessions: Mutex<SessionManager>,
    sink: Box<dyn SessionSink>,
    meter: Mutex<FlowMeter>,
    sampler: Sampler,
    latest: RwLock<SensorFrame>,
    shut_down: AtomicBool,
}

impl Heater {
    /// Claim the rig. The outputs reach the safe state before the flow meter
    /// is attached; any hardware init failure aborts construction.
    pub fn from_rig(rig: HardwareRig, settings: &Settings, sink: Box<dyn SessionSink>) -> Result<Self> {
        let HardwareRig {
            pwm,
            digital,
            edges,
            thermometers,
        } = rig;

        let control = FlowControl::new(
            FanDrive::new(pwm, settings.fan.pwm_channel, settings.fan.kick_start()),
            ValveBank::new(
                digital,
                settings.valves.main_channel,
                settings.valves.diversion_channel,
                settings.valves.active_low,
            ),
        )?;

        let meter = FlowMeter::attach(
            edges,
            settings.flow.edge_channel,
            settings.flow.edge,
            settings.flow.calibration(),
        )?;

        let thermometry = CalibratedThermometry::new(
            thermometers,
            settings.sensors.bindings(),
            settings.sensors.calibration(),
        );
        let sampler = Sampler::new(thermometry, meter.counter());

        Ok(Self {
            control: Mutex::new(control),
            sessions: Mutex::new(SessionManager::new()),
            sink,
            meter: Mutex::new(meter),
            sampler,
            latest: RwLock::new(SensorFrame::default()),
            shut_down: AtomicBool::new(false),
        })
    }

    /// One sampling tick. Blocks on the temperature bus; run off the event loop.
    pub fn sample_tick(&self) -> SensorFrame {
        self.sample_tick_at(Instant::now())
    }

    pub fn sample_tick_at(&self, now: Instant) -> SensorFrame {
        let temperatures = self.sampler.thermometry().read_all();
        let frame = self.sampler.frame(temperatures, now);

        if let Err(e) = self.control.lock().service(now) {
            warn!("Fan settle failed: {}", e);
        }

        let view = self.control_view();
        *self.latest.write() = frame.clone();
        self.sessions.lock().record(&frame.session_point(&view));
        frame
    }

    /// Latest sensor frame merged with live control state
    pub fn snapshot(&self) -> TelemetryMessage {
        let view = self.control_view();
        self.latest.read().snapshot(&view)
    }

    fn control_view(&self) -> ControlView {
        let (state, control_mode) = {
            let control = self.control.lock();
            (control.state(), control.control_mode())
        };
        let sessions = self.sessions.lock();
        ControlView {
            state,
            control_mode,
            save_enabled: sessions.is_enabled(SessionKind::Log),
            graph_enabled: sessions.is_enabled(SessionKind::Graph),
        }
    }

    /// Apply every present field in order: fan, main, diversion, mode, save, graph.
    ///
    /// A failing field does not stop the rest. Returns the failures.
    pub fn apply_command(&self, cmd: &CommandMessage) -> Vec<ShopHeaterError> {
        let mut errors = Vec::new();

        if let Some(speed) = cmd.fan_speed {
            if let Err(e) = self.control.lock().set_fan_speed(speed) {
                errors.push(e);
            }
        }
        if let Some(open) = cmd.main_loop {
            if let Err(e) = self.control.lock().set_main(open) {
                errors.push(e);
            }
        }
        if let Some(open) = cmd.diversion {
            if let Err(e) = self.control.lock().set_diversion(open) {
                errors.push(e);
            }
        }
        if let Some(mode) = cmd.control_mode.as_deref() {
            self.control.lock().set_control_mode(mode);
        }
        if let Some(enabled) = cmd.save_enabled {
            let finished = self.sessions.lock().set_enabled(SessionKind::Log, enabled);
            self.finalize(finished);
        }
        if let Some(enabled) = cmd.graph_enabled {
            let finished = self.sessions.lock().set_enabled(SessionKind::Graph, enabled);
            self.finalize(finished);
        }

        errors
    }

    fn finalize(&self, finished: impl IntoIterator<Item = FinishedSession>) {
        for session in finished {
            persist_finished(self.sink.as_ref(), &session);
        }
    }

    /// Total volume in liters and mass in pounds since start
    pub fn flow_totals(&self) -> (f64, f64) {
        let counter = self.sampler.counter();
        (counter.total_volume_liters(), counter.total_mass(MassUnit::Pounds))
    }

    /// Finalize sessions, stop counting, stop the fan, release the valves.
    /// Later calls do nothing.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down rig");

        let finished = self.sessions.lock().shutdown();
        self.finalize(finished);
        self.meter.lock().detach();

        let (liters, pounds) = self.flow_totals();
        info!(liters, pounds, "Flow totals for this run");

        self.control.lock().shutdown();
    }
}

impl std::fmt::Debug for Heater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heater")
            .field("state", &self.control.lock().state())
            .finish_non_exhaustive()
    }
}
