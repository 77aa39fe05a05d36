//! Diverter solenoid relays
//!
//! Two normally-closed solenoids switched through a relay board. With the
//! usual active-low board a LOW output energises the relay and opens the path.

use sh_error::Result;
use tracing::{debug, info, warn};

use crate::hw::{DigitalIo, Level};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoolantPath {
    Main,
    Diversion,
}

impl CoolantPath {
    pub fn other(self) -> Self {
        match self {
            CoolantPath::Main => CoolantPath::Diversion,
            CoolantPath::Diversion => CoolantPath::Main,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CoolantPath::Main => "main",
            CoolantPath::Diversion => "diversion",
        }
    }
}

pub struct ValveBank {
    io: Box<dyn DigitalIo>,
    main_channel: u32,
    diversion_channel: u32,
    active_low: bool,
}

impl ValveBank {
    pub fn new(
        io: Box<dyn DigitalIo>,
        main_channel: u32,
        diversion_channel: u32,
        active_low: bool,
    ) -> Self {
        Self {
            io,
            main_channel,
            diversion_channel,
            active_low,
        }
    }

    pub fn channel(&self, path: CoolantPath) -> u32 {
        match path {
            CoolantPath::Main => self.main_channel,
            CoolantPath::Diversion => self.diversion_channel,
        }
    }

    /// Output level that puts the solenoid in the requested position
    pub fn level_for(&self, open: bool) -> Level {
        if open == self.active_low {
            Level::Low
        } else {
            Level::High
        }
    }

    pub fn set_path(&mut self, path: CoolantPath, open: bool) -> Result<()> {
        let channel = self.channel(path);
        let level = self.level_for(open);
        self.io.write_digital(channel, level)?;
        debug!(path = path.as_str(), channel, open, ?level, "Valve driven");
        Ok(())
    }

    /// Current `(main, diversion)` output levels
    pub fn read_levels(&mut self) -> Result<(Level, Level)> {
        let main = self.io.read_digital(self.main_channel)?;
        let diversion = self.io.read_digital(self.diversion_channel)?;
        Ok((main, diversion))
    }

    /// De-energise both relays. Last hardware action at shutdown.
    pub fn release(&mut self) {
        let idle = self.level_for(false);
        for path in [CoolantPath::Main, CoolantPath::Diversion] {
            let channel = self.channel(path);
            if let Err(e) = self.io.write_digital(channel, idle) {
                warn!(path = path.as_str(), "Failed to release valve relay: {}", e);
            }
        }
        info!("Valve relays released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::sim::SimRig;

    #[test]
    fn test_active_low_open_is_low() {
        let sim = SimRig::new();
        let mut bank = ValveBank::new(sim.rig().digital, 23, 24, true);
        bank.set_path(CoolantPath::Main, true).unwrap();
        bank.set_path(CoolantPath::Diversion, false).unwrap();
        assert_eq!(sim.level(23), Some(Level::Low));
        assert_eq!(sim.level(24), Some(Level::High));
        assert_eq!(bank.read_levels().unwrap(), (Level::Low, Level::High));
    }

    #[test]
    fn test_active_high_wiring() {
        let sim = SimRig::new();
        let mut bank = ValveBank::new(sim.rig().digital, 23, 24, false);
        bank.set_path(CoolantPath::Diversion, true).unwrap();
        assert_eq!(sim.level(24), Some(Level::High));
    }

    #[test]
    fn test_release_deenergises_both() {
        let sim = SimRig::new();
        let mut bank = ValveBank::new(sim.rig().digital, 23, 24, true);
        bank.set_path(CoolantPath::Main, true).unwrap();
        bank.set_path(CoolantPath::Diversion, true).unwrap();
        bank.release();
        assert_eq!(sim.level(23), Some(Level::High));
        assert_eq!(sim.level(24), Some(Level::High));
    }

    #[test]
    fn test_release_continues_past_failure() {
        let sim = SimRig::new();
        let mut bank = ValveBank::new(sim.rig().digital, 23, 24, true);
        sim.fail_writes(23, true);
        bank.release();
        assert_eq!(sim.level(24), Some(Level::High));
    }
}
