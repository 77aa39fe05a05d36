//! Shop Heater Core Library
//!
//! Monitoring and safety control for a liquid-cooled heat-exchange rig.
//!
//! # Module Structure
//!
//! - `hw/` - Hardware capabilities (traits), Linux sysfs backend, simulated rig
//! - `flow` - Interrupt-driven pulse counter and flow meter
//! - `thermometry` - Calibrated probe readings
//! - `fan`, `valves` - Output drivers
//! - `control` - Fan/valve state machine with the no-both-closed invariant
//! - `session`, `persistence` - Recording sessions and their artifacts
//! - `telemetry` - Sampling ticks and snapshot assembly
//! - `heater` - The controller object shared by the daemon
//!
//! # Example
//!
//! ```no_run
//! use sh_core::hw::sim::SimRig;
//! use sh_core::{FileSessionStore, Heater, Settings};
//!
//! let settings = Settings::default();
//! let sim = SimRig::with_default_sensors();
//! let store = FileSessionStore::new(settings.recording.data_dir.clone());
//! let heater = Heater::from_rig(sim.rig(), &settings, Box::new(store)).unwrap();
//!
//! heater.sample_tick();
//! println!("{:?}", heater.snapshot());
//! heater.shutdown();
//! ```

pub mod hw;

pub mod constants;
pub mod control;
pub mod fan;
pub mod flow;
pub mod heater;
pub mod persistence;
pub mod session;
pub mod settings;
pub mod telemetry;
pub mod thermometry;
pub mod valves;

pub use control::{FlowControl, ValveFanState};
pub use fan::FanDrive;
pub use flow::{FlowCalibration, FlowMeter, MassUnit, PulseCounter};
pub use heater::Heater;
pub use persistence::FileSessionStore;
pub use session::{FinishedSession, RecordingSession, SessionKind, SessionManager, SessionPoint, SessionSink};
pub use settings::{default_settings_path, Settings};
pub use telemetry::{SensorFrame, Sampler};
pub use thermometry::{CalibratedThermometry, CalibrationTable, SensorBindings};
pub use valves::{CoolantPath, ValveBank};

pub use sh_error::{Result, ShopHeaterError};
