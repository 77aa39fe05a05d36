//! Simulated rig
//!
//! In-memory implementation of every hardware capability. Records each
//! write so tests can assert on what reached the "pins", lets tests deliver
//! flow pulses by hand, and supports injected failures. The daemon uses it
//! for `--simulate` runs on machines without the rig attached.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use sh_error::{Result, ShopHeaterError};
use tracing::debug;

use super::{
    DigitalIo, EdgeCallback, EdgeHandle, EdgeKind, EdgeSource, HardwareRig, Level, PwmOutput,
    TemperatureBus,
};
use crate::constants::sensors::DEFAULT_BINDINGS;

/// Writes kept per output kind; older entries are dropped
const WRITE_HISTORY_LIMIT: usize = 256;

fn push_bounded<T>(log: &mut VecDeque<T>, entry: T) {
    if log.len() == WRITE_HISTORY_LIMIT {
        log.pop_front();
    }
    log.push_back(entry);
}

#[derive(Default)]
struct SimState {
    duty: HashMap<u32, u8>,
    pwm_log: VecDeque<(u32, u8)>,
    levels: HashMap<u32, Level>,
    digital_log: VecDeque<(u32, Level)>,
    temperatures: BTreeMap<String, f64>,
    failing_sensors: BTreeSet<String>,
    failing_channels: BTreeSet<u32>,
    callbacks: HashMap<u64, (u32, EdgeCallback)>,
    next_handle: u64,
    refuse_edge_registration: bool,
}

/// Handle to a shared simulated rig. Clones observe the same state.
#[derive(Clone, Default)]
pub struct SimRig {
    state: Arc<Mutex<SimState>>,
}

impl SimRig {
    pub fn new() -> Self {
        Self::default()
    }

    /// A rig with all six default probes present at room temperature
    pub fn with_default_sensors() -> Self {
        let rig = Self::new();
        for (_, id) in DEFAULT_BINDINGS {
            rig.set_temperature(id, 21.0);
        }
        rig
    }

    /// Capability set backed by this rig
    pub fn rig(&self) -> HardwareRig {
        HardwareRig {
            pwm: Box::new(SimPwm(self.clone())),
            digital: Box::new(SimDigital(self.clone())),
            edges: Box::new(SimEdges(self.clone())),
            thermometers: Arc::new(SimThermometers(self.clone())),
        }
    }

    /// Deliver `count` edges on `channel` to every registered callback
    pub fn pulse(&self, channel: u32, count: u64) {
        // Callbacks run outside the lock, as they would on a real interrupt thread
        let callbacks: Vec<EdgeCallback> = self
            .state
            .lock()
            .callbacks
            .values()
            .filter(|(ch, _)| *ch == channel)
            .map(|(_, cb)| cb.clone())
            .collect();
        for _ in 0..count {
            for cb in &callbacks {
                cb();
            }
        }
    }

    pub fn set_temperature(&self, sensor_id: &str, celsius: f64) {
        self.state
            .lock()
            .temperatures
            .insert(sensor_id.to_string(), celsius);
    }

    /// Unplug a probe: it disappears from the bus listing
    pub fn remove_sensor(&self, sensor_id: &str) {
        self.state.lock().temperatures.remove(sensor_id);
    }

    /// Probe stays listed but every read fails
    pub fn fail_sensor(&self, sensor_id: &str, failing: bool) {
        let mut state = self.state.lock();
        if failing {
            state.failing_sensors.insert(sensor_id.to_string());
        } else {
            state.failing_sensors.remove(sensor_id);
        }
    }

    /// Make every PWM or digital write on `channel` fail
    pub fn fail_writes(&self, channel: u32, failing: bool) {
        let mut state = self.state.lock();
        if failing {
            state.failing_channels.insert(channel);
        } else {
            state.failing_channels.remove(&channel);
        }
    }

    pub fn refuse_edge_registration(&self, refuse: bool) {
        self.state.lock().refuse_edge_registration = refuse;
    }

    pub fn duty(&self, channel: u32) -> Option<u8> {
        self.state.lock().duty.get(&channel).copied()
    }

    /// Recent duties written to `channel`, oldest first
    pub fn duty_history(&self, channel: u32) -> Vec<u8> {
        self.state
            .lock()
            .pwm_log
            .iter()
            .filter(|(ch, _)| *ch == channel)
            .map(|(_, d)| *d)
            .collect()
    }

    pub fn level(&self, channel: u32) -> Option<Level> {
        self.state.lock().levels.get(&channel).copied()
    }

    /// Recent levels written to `channel`, oldest first
    pub fn level_history(&self, channel: u32) -> Vec<Level> {
        self.state
            .lock()
            .digital_log
            .iter()
            .filter(|(ch, _)| *ch == channel)
            .map(|(_, l)| *l)
            .collect()
    }

    pub fn registered_callbacks(&self) -> usize {
        self.state.lock().callbacks.len()
    }

    /// Deliver pulses on a dedicated OS thread at roughly `hz` edges per second
    pub fn spawn_pulse_generator(&self, channel: u32, hz: f64) -> PulseGenerator {
        let stop = Arc::new(AtomicBool::new(false));
        let period = Duration::from_secs_f64(1.0 / hz.max(0.1));
        let rig = self.clone();
        let stop_flag = stop.clone();
        let thread = std::thread::Builder::new()
            .name("sim-flow-pulses".into())
            .spawn(move || {
                while !stop_flag.load(Ordering::Relaxed) {
                    std::thread::sleep(period);
                    rig.pulse(channel, 1);
                }
            })
            .ok();
        debug!(channel, hz, "Simulated pulse generator started");
        PulseGenerator { stop, thread }
    }

    fn check_writable(&self, channel: u32) -> Result<()> {
        if self.state.lock().failing_channels.contains(&channel) {
            return Err(ShopHeaterError::hardware_write(channel, "simulated write failure"));
        }
        Ok(())
    }
}

/// Background pulse source; stops and joins on drop
pub struct PulseGenerator {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for PulseGenerator {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct SimPwm(SimRig);

impl PwmOutput for SimPwm {
    fn set_pwm_duty(&mut self, channel: u32, percent: u8) -> Result<()> {
        self.0.check_writable(channel)?;
        let mut state = self.0.state.lock();
        state.duty.insert(channel, percent);
        push_bounded(&mut state.pwm_log, (channel, percent));
        Ok(())
    }
}

struct SimDigital(SimRig);

impl DigitalIo for SimDigital {
    fn write_digital(&mut self, channel: u32, level: Level) -> Result<()> {
        self.0.check_writable(channel)?;
        let mut state = self.0.state.lock();
        state.levels.insert(channel, level);
        push_bounded(&mut state.digital_log, (channel, level));
        Ok(())
    }

    fn read_digital(&mut self, channel: u32) -> Result<Level> {
        // Unwritten lines float high through the relay board pull-ups
        Ok(self
            .0
            .state
            .lock()
            .levels
            .get(&channel)
            .copied()
            .unwrap_or(Level::High))
    }
}

struct SimEdges(SimRig);

impl EdgeSource for SimEdges {
    fn register_edge_callback(
        &mut self,
        channel: u32,
        _edge: EdgeKind,
        callback: EdgeCallback,
    ) -> Result<EdgeHandle> {
        let mut state = self.0.state.lock();
        if state.refuse_edge_registration {
            return Err(ShopHeaterError::EdgeRegistration {
                channel,
                reason: "simulated registration failure".into(),
            });
        }
        state.next_handle += 1;
        let id = state.next_handle;
        state.callbacks.insert(id, (channel, callback));
        Ok(EdgeHandle(id))
    }

    fn deregister(&mut self, handle: EdgeHandle) -> Result<()> {
        match self.0.state.lock().callbacks.remove(&handle.0) {
            Some(_) => Ok(()),
            None => Err(ShopHeaterError::generic(format!(
                "Unknown edge handle {}",
                handle.0
            ))),
        }
    }
}

struct SimThermometers(SimRig);

impl TemperatureBus for SimThermometers {
    fn read_raw_temperature(&self, sensor_id: &str) -> Result<f64> {
        let state = self.0.state.lock();
        if state.failing_sensors.contains(sensor_id) {
            return Err(ShopHeaterError::sensor_read(sensor_id, "simulated read failure"));
        }
        state
            .temperatures
            .get(sensor_id)
            .copied()
            .ok_or_else(|| ShopHeaterError::sensor_read(sensor_id, "not on bus"))
    }

    fn list_sensor_ids(&self) -> Result<BTreeSet<String>> {
        Ok(self.0.state.lock().temperatures.keys().cloned().collect())
    }
}
