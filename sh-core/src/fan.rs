//! Fan drive (BTS7960, forward PWM only)
//!
//! Owns the low-level output rules: duty never exceeds 99%, and a stopped
//! fan is kick-started at full duty before settling on the requested value.
//! The settle is a deadline serviced by [`FanDrive::service`], so callers
//! never sleep.

use std::time::{Duration, Instant};

use sh_error::Result;
use tracing::debug;

use crate::constants::fan::{KICK_START_DUTY_PERCENT, MAX_DUTY_PERCENT};
use crate::hw::PwmOutput;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingSettle {
    target: u8,
    due: Instant,
}

pub struct FanDrive {
    pwm: Box<dyn PwmOutput>,
    channel: u32,
    kick_start: Duration,
    /// Last duty written to the output
    duty: u8,
    pending: Option<PendingSettle>,
}

impl FanDrive {
    pub fn new(pwm: Box<dyn PwmOutput>, channel: u32, kick_start: Duration) -> Self {
        Self {
            pwm,
            channel,
            kick_start,
            duty: 0,
            pending: None,
        }
    }

    /// Duty currently on the output
    pub fn duty(&self) -> u8 {
        self.duty
    }

    /// Duty the drive will settle on
    pub fn target(&self) -> u8 {
        self.pending.map(|p| p.target).unwrap_or(self.duty)
    }

    pub fn is_kicking(&self) -> bool {
        self.pending.is_some()
    }

    pub fn set_speed(&mut self, percent: u8) -> Result<()> {
        self.set_speed_at(percent, Instant::now())
    }

    /// Request a duty. Values above 99 are capped.
    pub fn set_speed_at(&mut self, percent: u8, now: Instant) -> Result<()> {
        let target = percent.min(MAX_DUTY_PERCENT);

        if target == 0 {
            self.pending = None;
            return self.write(0);
        }

        if let Some(pending) = self.pending.as_mut() {
            pending.target = target;
            return Ok(());
        }

        if self.duty == 0 && !self.kick_start.is_zero() {
            debug!(channel = self.channel, target, "Kick-starting fan");
            self.write(KICK_START_DUTY_PERCENT)?;
            self.pending = Some(PendingSettle {
                target,
                due: now + self.kick_start,
            });
            return Ok(());
        }

        self.write(target)
    }

    /// Apply a pending settle once its deadline has passed
    pub fn service(&mut self, now: Instant) -> Result<()> {
        match self.pending {
            Some(pending) if now >= pending.due => {
                self.pending = None;
                self.write(pending.target)
            }
            _ => Ok(()),
        }
    }

    pub fn stop(&mut self) -> Result<()> {
        self.pending = None;
        self.write(0)
    }

    fn write(&mut self, duty: u8) -> Result<()> {
        self.pwm.set_pwm_duty(self.channel, duty)?;
        self.duty = duty;
        debug!(channel = self.channel, duty, "Fan duty written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::sim::SimRig;
    use crate::hw::MockPwmOutput;
    use sh_error::ShopHeaterError;

    const KICK: Duration = Duration::from_millis(1000);

    fn drive(sim: &SimRig, kick: Duration) -> FanDrive {
        FanDrive::new(sim.rig().pwm, 0, kick)
    }

    #[test]
    fn test_duty_capped_at_99() {
        let sim = SimRig::new();
        let mut fan = drive(&sim, Duration::ZERO);
        fan.set_speed(100).unwrap();
        assert_eq!(sim.duty(0), Some(99));
        fan.set_speed(255).unwrap();
        assert_eq!(fan.duty(), 99);
    }

    #[test]
    fn test_kick_start_from_stopped() {
        let sim = SimRig::new();
        let mut fan = drive(&sim, KICK);
        let t0 = Instant::now();

        fan.set_speed_at(30, t0).unwrap();
        assert_eq!(sim.duty(0), Some(99));
        assert_eq!(fan.target(), 30);

        fan.service(t0 + Duration::from_millis(500)).unwrap();
        assert_eq!(sim.duty(0), Some(99));

        fan.service(t0 + KICK).unwrap();
        assert_eq!(sim.duty(0), Some(30));
        assert!(!fan.is_kicking());
        assert_eq!(sim.duty_history(0), vec![99, 30]);
    }

    #[test]
    fn test_running_fan_changes_directly() {
        let sim = SimRig::new();
        let mut fan = drive(&sim, KICK);
        let t0 = Instant::now();
        fan.set_speed_at(40, t0).unwrap();
        fan.service(t0 + KICK).unwrap();
        fan.set_speed_at(60, t0 + KICK).unwrap();
        assert_eq!(sim.duty_history(0), vec![99, 40, 60]);
    }

    #[test]
    fn test_command_during_kick_replaces_target() {
        let sim = SimRig::new();
        let mut fan = drive(&sim, KICK);
        let t0 = Instant::now();
        fan.set_speed_at(30, t0).unwrap();
        fan.set_speed_at(70, t0 + Duration::from_millis(200)).unwrap();
        // Deadline is still measured from the first kick
        fan.service(t0 + KICK).unwrap();
        assert_eq!(sim.duty_history(0), vec![99, 70]);
    }

    #[test]
    fn test_zero_cancels_kick() {
        let sim = SimRig::new();
        let mut fan = drive(&sim, KICK);
        let t0 = Instant::now();
        fan.set_speed_at(30, t0).unwrap();
        fan.set_speed_at(0, t0).unwrap();
        fan.service(t0 + KICK).unwrap();
        assert_eq!(sim.duty_history(0), vec![99, 0]);
    }

    #[test]
    fn test_write_failure_keeps_previous_duty() {
        let mut pwm = MockPwmOutput::new();
        pwm.expect_set_pwm_duty()
            .returning(|ch, _| Err(ShopHeaterError::hardware_write(ch, "EIO")));
        let mut fan = FanDrive::new(Box::new(pwm), 0, Duration::ZERO);
        assert!(fan.set_speed(50).is_err());
        assert_eq!(fan.duty(), 0);
    }
}
