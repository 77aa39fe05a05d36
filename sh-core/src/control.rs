//! Fan and valve state machine
//!
//! The only real state is `(main_open, diversion_open, fan_speed_percent)`;
//! [`FlowMode`] is derived from the valve pair on every change. The coolant
//! loop must never have both paths closed: a command that would close the
//! last open path first forces the other one open.
//!
//! Commands re-read current state on entry, so the invariant holds under any
//! interleaving of callers. Hardware failures are returned to the caller and
//! leave the in-memory state as commanded.

use std::time::Instant;

use serde::Serialize;
use sh_error::{Result, ShopHeaterError};
use sh_protocol::{ControlMode, FlowMode};
use tracing::{debug, info, warn};

use crate::constants::fan::MAX_COMMAND_PERCENT;
use crate::fan::FanDrive;
use crate::hw::Level;
use crate::valves::{CoolantPath, ValveBank};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ValveFanState {
    /// Commanded speed, 0..=100. The drive caps its output at 99.
    pub fan_speed_percent: u8,
    pub main_open: bool,
    pub diversion_open: bool,
    pub mode: FlowMode,
}

impl ValveFanState {
    /// Both paths open, fan stopped
    pub fn safe_default() -> Self {
        Self {
            fan_speed_percent: 0,
            main_open: true,
            diversion_open: true,
            mode: FlowMode::Mix,
        }
    }

    pub fn is_open(&self, path: CoolantPath) -> bool {
        match path {
            CoolantPath::Main => self.main_open,
            CoolantPath::Diversion => self.diversion_open,
        }
    }

    fn set_open(&mut self, path: CoolantPath, open: bool) {
        match path {
            CoolantPath::Main => self.main_open = open,
            CoolantPath::Diversion => self.diversion_open = open,
        }
        self.mode = FlowMode::from_valves(self.main_open, self.diversion_open);
    }
}

pub struct FlowControl {
    state: ValveFanState,
    control_mode: ControlMode,
    fan: FanDrive,
    valves: ValveBank,
}

impl FlowControl {
    /// Take ownership of the outputs and drive them to the safe default.
    ///
    /// Nothing else can be commanded until this succeeds.
    pub fn new(fan: FanDrive, valves: ValveBank) -> Result<Self> {
        let mut control = Self {
            state: ValveFanState::safe_default(),
            control_mode: ControlMode::default(),
            fan,
            valves,
        };

        for path in [CoolantPath::Main, CoolantPath::Diversion] {
            control.valves.set_path(path, true).map_err(|e| {
                ShopHeaterError::hardware_init(format!("{} valve", path.as_str()), e.to_string())
            })?;
        }
        control
            .fan
            .stop()
            .map_err(|e| ShopHeaterError::hardware_init("fan", e.to_string()))?;

        match control.read_valve_levels() {
            Ok((main, diversion)) => debug!(?main, ?diversion, "Valve relay levels after init"),
            Err(e) => warn!("Could not read back valve relay levels: {}", e),
        }

        info!("Flow control initialised: both paths open, fan stopped");
        Ok(control)
    }

    pub fn state(&self) -> ValveFanState {
        self.state
    }

    pub fn control_mode(&self) -> ControlMode {
        self.control_mode
    }

    /// Duty actually on the fan output
    pub fn fan_duty(&self) -> u8 {
        self.fan.duty()
    }

    pub fn set_fan_speed(&mut self, percent: i64) -> Result<()> {
        self.set_fan_speed_at(percent, Instant::now())
    }

    /// Clamp to 0..=100, store, and hand off to the drive
    pub fn set_fan_speed_at(&mut self, percent: i64, now: Instant) -> Result<()> {
        let clamped = percent.clamp(0, MAX_COMMAND_PERCENT) as u8;
        self.state.fan_speed_percent = clamped;
        self.fan.set_speed_at(clamped, now)
    }

    pub fn set_main(&mut self, open: bool) -> Result<()> {
        self.set_path(CoolantPath::Main, open)
    }

    pub fn set_diversion(&mut self, open: bool) -> Result<()> {
        self.set_path(CoolantPath::Diversion, open)
    }

    fn set_path(&mut self, path: CoolantPath, open: bool) -> Result<()> {
        let other = path.other();
        if !open && !self.state.is_open(other) {
            warn!(
                closing = path.as_str(),
                forced_open = other.as_str(),
                "Safety override: both coolant paths would be closed, opening {}",
                other.as_str()
            );
            self.state.set_open(other, true);
            self.valves.set_path(other, true)?;
        }

        self.state.set_open(path, open);
        self.valves.set_path(path, open)?;
        debug!(flow_mode = self.state.mode.as_str(), "Coolant path changed");
        Ok(())
    }

    /// Unknown modes are logged and ignored
    pub fn set_control_mode(&mut self, mode: &str) {
        match mode.parse::<ControlMode>() {
            Ok(mode) => {
                self.control_mode = mode;
                info!(mode = mode.as_str(), "Control mode set");
            }
            Err(e) => warn!("{}", e),
        }
    }

    /// Advance time-based output behaviour (fan kick-start settle)
    pub fn service(&mut self, now: Instant) -> Result<()> {
        self.fan.service(now)
    }

    pub fn read_valve_levels(&mut self) -> Result<(Level, Level)> {
        self.valves.read_levels()
    }

    /// Stop the fan and de-energise both relays
    pub fn shutdown(&mut self) {
        if let Err(e) = self.fan.stop() {
            warn!("Failed to stop fan: {}", e);
        }
        self.state.fan_speed_percent = 0;
        self.valves.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::sim::SimRig;
    use proptest::prelude::*;
    use std::time::Duration;

    fn control(sim: &SimRig) -> FlowControl {
        let rig = sim.rig();
        FlowControl::new(
            FanDrive::new(rig.pwm, 0, Duration::ZERO),
            ValveBank::new(rig.digital, 23, 24, true),
        )
        .unwrap()
    }

    fn assert_consistent(state: &ValveFanState) {
        assert!(state.main_open || state.diversion_open);
        assert_eq!(state.mode, FlowMode::from_valves(state.main_open, state.diversion_open));
    }

    #[test]
    fn test_initial_state_is_mix_with_fan_stopped() {
        let sim = SimRig::new();
        let ctl = control(&sim);
        assert_eq!(ctl.state(), ValveFanState::safe_default());
        assert_eq!(sim.level(23), Some(Level::Low));
        assert_eq!(sim.level(24), Some(Level::Low));
        assert_eq!(sim.duty(0), Some(0));
        assert_eq!(ctl.control_mode(), ControlMode::Manual);
    }

    #[test]
    fn test_valve_levels_read_back_as_driven() {
        let sim = SimRig::new();
        let mut ctl = control(&sim);
        assert_eq!(ctl.read_valve_levels().unwrap(), (Level::Low, Level::Low));
        ctl.set_diversion(false).unwrap();
        assert_eq!(ctl.read_valve_levels().unwrap(), (Level::Low, Level::High));
    }

    #[test]
    fn test_safety_override_scenario() {
        let sim = SimRig::new();
        let mut ctl = control(&sim);

        ctl.set_diversion(false).unwrap();
        let s = ctl.state();
        assert!(s.main_open);
        assert!(!s.diversion_open);
        assert_eq!(s.mode, FlowMode::Main);

        ctl.set_main(false).unwrap();
        let s = ctl.state();
        assert!(!s.main_open);
        assert!(s.diversion_open);
        assert_eq!(s.mode, FlowMode::Diversion);

        // Diversion was opened on the pins before main was closed
        assert_eq!(sim.level_history(24), vec![Level::Low, Level::High, Level::Low]);
        assert_eq!(sim.level_history(23), vec![Level::Low, Level::High]);
    }

    #[test]
    fn test_fan_speed_clamped_to_100_at_boundary() {
        let sim = SimRig::new();
        let mut ctl = control(&sim);
        ctl.set_fan_speed(150).unwrap();
        assert_eq!(ctl.state().fan_speed_percent, 100);
        assert_eq!(sim.duty(0), Some(99));

        ctl.set_fan_speed(-20).unwrap();
        assert_eq!(ctl.state().fan_speed_percent, 0);
        assert_eq!(sim.duty(0), Some(0));
    }

    #[test]
    fn test_hardware_failure_does_not_roll_back() {
        let sim = SimRig::new();
        let mut ctl = control(&sim);
        sim.fail_writes(23, true);
        assert!(ctl.set_main(false).is_err());
        assert!(!ctl.state().main_open);
        assert_eq!(ctl.state().mode, FlowMode::Diversion);
    }

    #[test]
    fn test_forced_open_failure_leaves_target_open() {
        let sim = SimRig::new();
        let mut ctl = control(&sim);
        ctl.set_diversion(false).unwrap();
        sim.fail_writes(24, true);
        assert!(ctl.set_main(false).is_err());
        let s = ctl.state();
        assert!(s.main_open && s.diversion_open);
        assert_eq!(sim.level(23), Some(Level::Low));
    }

    #[test]
    fn test_init_failure_is_fatal() {
        let sim = SimRig::new();
        sim.fail_writes(24, true);
        let rig = sim.rig();
        let err = FlowControl::new(
            FanDrive::new(rig.pwm, 0, Duration::ZERO),
            ValveBank::new(rig.digital, 23, 24, true),
        )
        .err()
        .unwrap();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_unknown_control_mode_ignored() {
        let sim = SimRig::new();
        let mut ctl = control(&sim);
        ctl.set_control_mode("automatic");
        assert_eq!(ctl.control_mode(), ControlMode::Automatic);
        ctl.set_control_mode("turbo");
        assert_eq!(ctl.control_mode(), ControlMode::Automatic);
    }

    #[test]
    fn test_shutdown_stops_fan_and_releases() {
        let sim = SimRig::new();
        let mut ctl = control(&sim);
        ctl.set_fan_speed(60).unwrap();
        ctl.shutdown();
        assert_eq!(sim.duty(0), Some(0));
        assert_eq!(sim.level(23), Some(Level::High));
        assert_eq!(sim.level(24), Some(Level::High));
    }

    #[test]
    fn test_service_settles_kick_start() {
        let sim = SimRig::new();
        let rig = sim.rig();
        let mut ctl = FlowControl::new(
            FanDrive::new(rig.pwm, 0, Duration::from_secs(1)),
            ValveBank::new(rig.digital, 23, 24, true),
        )
        .unwrap();
        let t0 = Instant::now();
        ctl.set_fan_speed_at(25, t0).unwrap();
        assert_eq!(ctl.fan_duty(), 99);
        assert_eq!(ctl.state().fan_speed_percent, 25);
        ctl.service(t0 + Duration::from_secs(1)).unwrap();
        assert_eq!(ctl.fan_duty(), 25);
    }

    proptest! {
        #[test]
        fn prop_never_both_closed(cmds in proptest::collection::vec((any::<bool>(), any::<bool>()), 0..64)) {
            let sim = SimRig::new();
            let mut ctl = control(&sim);
            for (main, open) in cmds {
                if main {
                    ctl.set_main(open).unwrap();
                } else {
                    ctl.set_diversion(open).unwrap();
                }
                let s = ctl.state();
                assert_consistent(&s);
                // Pins agree with memory (active-low: open is LOW)
                prop_assert_eq!(sim.level(23) == Some(Level::Low), s.main_open);
                prop_assert_eq!(sim.level(24) == Some(Level::Low), s.diversion_open);
            }
        }
    }
}
