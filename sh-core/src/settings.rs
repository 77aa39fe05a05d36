//! Daemon Settings
//!
//! Persistent settings stored as JSON in ~/.config/shopheater/settings.json.
//! Every field has a default, so a missing file or a partial file is valid.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use sh_error::{Result, ShopHeaterError};

use crate::constants::{fan, flow, paths, sensors, server, valves};
use crate::flow::FlowCalibration;
use crate::hw::EdgeKind;
use crate::thermometry::{CalibrationTable, SensorBindings};

/// Daemon settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub flow: FlowSettings,

    #[serde(default)]
    pub fan: FanSettings,

    #[serde(default)]
    pub valves: ValveSettings,

    #[serde(default)]
    pub sensors: SensorSettings,

    #[serde(default)]
    pub recording: RecordingSettings,
}

/// Listener and loop timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSettings {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Telemetry push interval in milliseconds
    #[serde(default = "default_broadcast_interval")]
    pub broadcast_interval_ms: u64,

    /// Sensor sampling interval in milliseconds
    #[serde(default = "default_sampling_interval")]
    pub sampling_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowSettings {
    #[serde(default = "default_edge_channel")]
    pub edge_channel: u32,

    #[serde(default = "default_edge_kind")]
    pub edge: EdgeKind,

    #[serde(default = "default_pulses_per_liter")]
    pub pulses_per_liter: f64,

    /// Independent calibration from a weighed reference run
    #[serde(default = "default_pulses_per_pound")]
    pub pulses_per_pound: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FanSettings {
    #[serde(default = "default_pwm_chip")]
    pub pwm_chip: u32,

    #[serde(default = "default_pwm_channel")]
    pub pwm_channel: u32,

    #[serde(default = "default_pwm_frequency")]
    pub pwm_frequency_hz: u32,

    /// Full-duty burst when starting from stopped; 0 disables
    #[serde(default = "default_kick_start")]
    pub kick_start_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValveSettings {
    #[serde(default = "default_main_channel")]
    pub main_channel: u32,

    #[serde(default = "default_diversion_channel")]
    pub diversion_channel: u32,

    /// A LOW output energises the relay and opens the path
    #[serde(default = "default_active_low")]
    pub active_low: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorSettings {
    /// Logical name → 1-Wire id (family prefix stripped)
    #[serde(default = "default_bindings")]
    pub bindings: BTreeMap<String, String>,

    /// 1-Wire id → additive °C offset
    #[serde(default = "default_offsets")]
    pub offsets: HashMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordingSettings {
    #[serde(default = "paths::data_dir")]
    pub data_dir: PathBuf,
}

fn default_bind() -> String {
    server::DEFAULT_BIND.to_string()
}

fn default_max_connections() -> usize {
    server::MAX_CONNECTIONS
}

fn default_broadcast_interval() -> u64 {
    server::BROADCAST_INTERVAL_MS
}

fn default_sampling_interval() -> u64 {
    server::SAMPLING_INTERVAL_MS
}

fn default_edge_channel() -> u32 {
    flow::DEFAULT_EDGE_CHANNEL
}

fn default_edge_kind() -> EdgeKind {
    EdgeKind::Falling
}

fn default_pulses_per_liter() -> f64 {
    flow::PULSES_PER_LITER
}

fn default_pulses_per_pound() -> f64 {
    flow::PULSES_PER_POUND
}

fn default_pwm_chip() -> u32 {
    fan::DEFAULT_PWM_CHIP
}

fn default_pwm_channel() -> u32 {
    fan::DEFAULT_PWM_CHANNEL
}

fn default_pwm_frequency() -> u32 {
    fan::DEFAULT_PWM_FREQUENCY_HZ
}

fn default_kick_start() -> u64 {
    fan::DEFAULT_KICK_START_MS
}

fn default_main_channel() -> u32 {
    valves::DEFAULT_MAIN_CHANNEL
}

fn default_diversion_channel() -> u32 {
    valves::DEFAULT_DIVERSION_CHANNEL
}

fn default_active_low() -> bool {
    valves::DEFAULT_ACTIVE_LOW
}

fn default_bindings() -> BTreeMap<String, String> {
    sensors::DEFAULT_BINDINGS
        .iter()
        .map(|(name, id)| (name.to_string(), id.to_string()))
        .collect()
}

fn default_offsets() -> HashMap<String, f64> {
    sensors::DEFAULT_OFFSETS
        .iter()
        .map(|(id, off)| (id.to_string(), *off))
        .collect()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_connections: default_max_connections(),
            broadcast_interval_ms: default_broadcast_interval(),
            sampling_interval_ms: default_sampling_interval(),
        }
    }
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            edge_channel: default_edge_channel(),
            edge: default_edge_kind(),
            pulses_per_liter: default_pulses_per_liter(),
            pulses_per_pound: default_pulses_per_pound(),
        }
    }
}

impl Default for FanSettings {
    fn default() -> Self {
        Self {
            pwm_chip: default_pwm_chip(),
            pwm_channel: default_pwm_channel(),
            pwm_frequency_hz: default_pwm_frequency(),
            kick_start_ms: default_kick_start(),
        }
    }
}

impl Default for ValveSettings {
    fn default() -> Self {
        Self {
            main_channel: default_main_channel(),
            diversion_channel: default_diversion_channel(),
            active_low: default_active_low(),
        }
    }
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            bindings: default_bindings(),
            offsets: default_offsets(),
        }
    }
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            data_dir: paths::data_dir(),
        }
    }
}

impl ServerSettings {
    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms)
    }

    pub fn sampling_interval(&self) -> Duration {
        Duration::from_millis(self.sampling_interval_ms)
    }
}

impl FlowSettings {
    pub fn calibration(&self) -> FlowCalibration {
        FlowCalibration {
            pulses_per_liter: self.pulses_per_liter,
            pulses_per_pound: self.pulses_per_pound,
        }
    }
}

impl FanSettings {
    pub fn kick_start(&self) -> Duration {
        Duration::from_millis(self.kick_start_ms)
    }
}

impl SensorSettings {
    pub fn bindings(&self) -> SensorBindings {
        SensorBindings::new(self.bindings.clone())
    }

    pub fn calibration(&self) -> CalibrationTable {
        CalibrationTable::new(self.offsets.clone())
    }
}

/// Default settings file location
pub fn default_settings_path() -> PathBuf {
    paths::config_dir().join(paths::SETTINGS_FILE)
}

impl Settings {
    /// Load from `path`. A missing file yields defaults; a malformed one is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No settings file at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path).map_err(|e| ShopHeaterError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let settings: Settings = serde_json::from_str(&contents)
            .map_err(|e| ShopHeaterError::config(format!("{:?}: {}", path, e)))?;
        settings.validate()?;

        debug!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.valves.main_channel == self.valves.diversion_channel {
            return Err(ShopHeaterError::invalid_config(
                "valves",
                "main and diversion must use different channels",
            ));
        }
        if self.flow.edge_channel == self.valves.main_channel
            || self.flow.edge_channel == self.valves.diversion_channel
        {
            return Err(ShopHeaterError::invalid_config(
                "flow.edge_channel",
                "shares a channel with a valve relay",
            ));
        }
        for (field, value) in [
            ("flow.pulses_per_liter", self.flow.pulses_per_liter),
            ("flow.pulses_per_pound", self.flow.pulses_per_pound),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(ShopHeaterError::invalid_config(field, "must be a positive number"));
            }
        }
        if self.server.broadcast_interval_ms == 0 || self.server.sampling_interval_ms == 0 {
            return Err(ShopHeaterError::invalid_config(
                "server",
                "intervals must be non-zero",
            ));
        }
        if self.server.max_connections == 0 {
            return Err(ShopHeaterError::invalid_config(
                "server.max_connections",
                "must be at least 1",
            ));
        }
        if self.fan.pwm_frequency_hz == 0 {
            return Err(ShopHeaterError::invalid_config(
                "fan.pwm_frequency_hz",
                "must be non-zero",
            ));
        }
        Ok(())
    }
}
