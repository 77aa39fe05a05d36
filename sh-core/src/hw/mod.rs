//! Hardware capability layer
//!
//! The core never touches pins or buses directly. It consumes these
//! capabilities, which are provided either by the Linux sysfs backend or by
//! the in-memory simulated rig.

pub mod sim;
pub mod sysfs;

use std::collections::BTreeSet;
use std::sync::Arc;

use sh_error::Result;

/// Digital output/input level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn as_bit(self) -> u8 {
        match self {
            Level::Low => 0,
            Level::High => 1,
        }
    }

    pub fn from_bit(bit: u8) -> Self {
        if bit == 0 {
            Level::Low
        } else {
            Level::High
        }
    }
}

/// Which electrical transition fires an edge callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    Rising,
    Falling,
    Both,
}

impl EdgeKind {
    /// Value for the sysfs `edge` attribute
    pub fn sysfs_name(self) -> &'static str {
        match self {
            EdgeKind::Rising => "rising",
            EdgeKind::Falling => "falling",
            EdgeKind::Both => "both",
        }
    }
}

/// Opaque registration returned by [`EdgeSource::register_edge_callback`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeHandle(pub u64);

/// Invoked once per qualifying edge, possibly from a thread the caller does not own.
/// Must not block.
pub type EdgeCallback = Arc<dyn Fn() + Send + Sync>;

/// "Set PWM duty on a channel"
#[cfg_attr(test, mockall::automock)]
pub trait PwmOutput: Send {
    fn set_pwm_duty(&mut self, channel: u32, percent: u8) -> Result<()>;
}

/// "Write a digital output" / "read a digital line"
#[cfg_attr(test, mockall::automock)]
pub trait DigitalIo: Send {
    fn write_digital(&mut self, channel: u32, level: Level) -> Result<()>;
    fn read_digital(&mut self, channel: u32) -> Result<Level>;
}

/// "Receive an edge-triggered interrupt"
#[cfg_attr(test, mockall::automock)]
pub trait EdgeSource: Send {
    fn register_edge_callback(
        &mut self,
        channel: u32,
        edge: EdgeKind,
        callback: EdgeCallback,
    ) -> Result<EdgeHandle>;
    fn deregister(&mut self, handle: EdgeHandle) -> Result<()>;
}

/// "Read raw temperature by sensor id"
#[cfg_attr(test, mockall::automock)]
pub trait TemperatureBus: Send + Sync {
    /// Raw reading in °C
    fn read_raw_temperature(&self, sensor_id: &str) -> Result<f64>;
    /// Ids currently present on the bus
    fn list_sensor_ids(&self) -> Result<BTreeSet<String>>;
}

/// One complete set of capabilities for the rig
pub struct HardwareRig {
    pub pwm: Box<dyn PwmOutput>,
    pub digital: Box<dyn DigitalIo>,
    pub edges: Box<dyn EdgeSource>,
    pub thermometers: Arc<dyn TemperatureBus>,
}

impl std::fmt::Debug for HardwareRig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareRig").finish_non_exhaustive()
    }
}
