//! Wire protocol for the Shop Heater control daemon
//!
//! Clients exchange newline-delimited JSON objects with the daemon:
//! - outbound [`TelemetryMessage`] frames, pushed periodically and after every command
//! - inbound [`CommandMessage`] objects, any subset of the known fields
//! - outbound [`ErrorMessage`] when a line cannot be understood

use serde::{Deserialize, Serialize};

/// Maximum size of a single inbound line (8KB)
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024;

/// Logical names of the six temperature probes, in report order
pub const TEMPERATURE_NAMES: [&str; 6] = [
    "water_hot",
    "water_mix",
    "water_cold",
    "water_reservoir",
    "air_heated",
    "air_cool",
];

// ============================================================================
// Modes
// ============================================================================

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ControlMode {
    /// Operator drives fan and valves directly
    #[default]
    Manual,
    /// Reserved; no control law is attached to this mode
    Automatic,
}

impl ControlMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlMode::Manual => "manual",
            ControlMode::Automatic => "automatic",
        }
    }
}

impl std::str::FromStr for ControlMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(ControlMode::Manual),
            "automatic" => Ok(ControlMode::Automatic),
            other => Err(format!(
                "Invalid control mode: {}. Must be 'manual' or 'automatic'",
                other
            )),
        }
    }
}

/// Which coolant path(s) are open. Always derived, never set directly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FlowMode {
    Main,
    Diversion,
    Mix,
    None,
}

impl FlowMode {
    /// Classify the valve pair. Pure; no hysteresis.
    pub fn from_valves(main_open: bool, diversion_open: bool) -> Self {
        match (main_open, diversion_open) {
            (true, true) => FlowMode::Mix,
            (true, false) => FlowMode::Main,
            (false, true) => FlowMode::Diversion,
            (false, false) => FlowMode::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FlowMode::Main => "main",
            FlowMode::Diversion => "diversion",
            FlowMode::Mix => "mix",
            FlowMode::None => "none",
        }
    }
}

// ============================================================================
// Outbound telemetry
// ============================================================================

/// Calibrated temperatures in °F; `None` serializes as `null` (sensor absent or failed)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Temperatures {
    pub water_hot: Option<f64>,
    pub water_mix: Option<f64>,
    pub water_cold: Option<f64>,
    pub water_reservoir: Option<f64>,
    pub air_heated: Option<f64>,
    pub air_cool: Option<f64>,
}

impl Temperatures {
    /// Look up a reading by logical name
    pub fn get(&self, name: &str) -> Option<f64> {
        match name {
            "water_hot" => self.water_hot,
            "water_mix" => self.water_mix,
            "water_cold" => self.water_cold,
            "water_reservoir" => self.water_reservoir,
            "air_heated" => self.air_heated,
            "air_cool" => self.air_cool,
            _ => None,
        }
    }

    /// Store a reading by logical name. Unknown names are ignored.
    pub fn set(&mut self, name: &str, value: Option<f64>) {
        let slot = match name {
            "water_hot" => &mut self.water_hot,
            "water_mix" => &mut self.water_mix,
            "water_cold" => &mut self.water_cold,
            "water_reservoir" => &mut self.water_reservoir,
            "air_heated" => &mut self.air_heated,
            "air_cool" => &mut self.air_cool,
            _ => return,
        };
        *slot = value;
    }
}

/// Temperature differences in °F
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Deltas {
    /// water_hot - water_cold
    pub delta_water_heater: Option<f64>,
    /// water_mix - water_cold
    pub delta_water_radiator: Option<f64>,
    /// air_heated - air_cool
    pub delta_air: Option<f64>,
}

/// One telemetry frame as sent to clients
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryMessage {
    pub temperatures: Temperatures,
    pub deltas: Deltas,
    /// Liters per minute, 2 decimals
    pub flow_rate: f64,
    pub fan_speed: u8,
    pub main_loop_state: bool,
    pub diversion_state: bool,
    pub control_mode: ControlMode,
    pub flow_mode: FlowMode,
    pub save_enabled: bool,
    pub graph_enabled: bool,
}

/// Reply to a line that could not be processed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorMessage {
    pub error: String,
}

impl ErrorMessage {
    pub fn new(error: impl Into<String>) -> Self {
        Self { error: error.into() }
    }
}

// ============================================================================
// Inbound commands
// ============================================================================

/// A command from a client. Every field is optional; unknown fields are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CommandMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fan_speed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_loop: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diversion: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_enabled: Option<bool>,
}

impl CommandMessage {
    /// Parse one inbound line
    pub fn parse(line: &str) -> Result<Self, String> {
        let trimmed = line.trim();
        if trimmed.len() > MAX_MESSAGE_SIZE {
            return Err(format!("Message too large (max {} bytes)", MAX_MESSAGE_SIZE));
        }
        serde_json::from_str(trimmed).map_err(|e| format!("Invalid command: {}", e))
    }

    /// True when no known field is present
    pub fn is_empty(&self) -> bool {
        self.fan_speed.is_none()
            && self.main_loop.is_none()
            && self.diversion.is_none()
            && self.control_mode.is_none()
            && self.save_enabled.is_none()
            && self.graph_enabled.is_none()
    }

    /// Names of the present fields, in application order (for audit logging)
    pub fn field_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.fan_speed.is_some() {
            names.push("fan_speed");
        }
        if self.main_loop.is_some() {
            names.push("main_loop");
        }
        if self.diversion.is_some() {
            names.push("diversion");
        }
        if self.control_mode.is_some() {
            names.push("control_mode");
        }
        if self.save_enabled.is_some() {
            names.push("save_enabled");
        }
        if self.graph_enabled.is_some() {
            names.push("graph_enabled");
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_mode_is_pure_function_of_valves() {
        assert_eq!(FlowMode::from_valves(true, true), FlowMode::Mix);
        assert_eq!(FlowMode::from_valves(true, false), FlowMode::Main);
        assert_eq!(FlowMode::from_valves(false, true), FlowMode::Diversion);
        assert_eq!(FlowMode::from_valves(false, false), FlowMode::None);
    }

    #[test]
    fn test_command_ignores_unknown_fields() {
        let cmd = CommandMessage::parse(r#"{"fan_speed": 150, "turbo": true}"#).unwrap();
        assert_eq!(cmd.fan_speed, Some(150));
        assert_eq!(cmd.field_names(), vec!["fan_speed"]);
    }

    #[test]
    fn test_command_empty_object() {
        let cmd = CommandMessage::parse("{}\n").unwrap();
        assert!(cmd.is_empty());
    }

    #[test]
    fn test_command_rejects_malformed_json() {
        assert!(CommandMessage::parse("{fan_speed: 10").is_err());
    }

    #[test]
    fn test_control_mode_parse() {
        assert_eq!("manual".parse::<ControlMode>(), Ok(ControlMode::Manual));
        assert_eq!("automatic".parse::<ControlMode>(), Ok(ControlMode::Automatic));
        assert!("eco".parse::<ControlMode>().is_err());
    }

    #[test]
    fn test_telemetry_absent_temperature_serializes_as_null() {
        let msg = TelemetryMessage {
            temperatures: Temperatures {
                water_hot: Some(120.4),
                ..Temperatures::default()
            },
            deltas: Deltas::default(),
            flow_rate: 3.25,
            fan_speed: 40,
            main_loop_state: true,
            diversion_state: false,
            control_mode: ControlMode::Manual,
            flow_mode: FlowMode::Main,
            save_enabled: false,
            graph_enabled: true,
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["temperatures"]["water_hot"], 120.4);
        assert!(json["temperatures"]["air_cool"].is_null());
        assert!(json["deltas"]["delta_air"].is_null());
        assert_eq!(json["flow_mode"], "main");
        assert_eq!(json["control_mode"], "manual");
    }

    #[test]
    fn test_temperatures_set_get_by_name() {
        let mut temps = Temperatures::default();
        temps.set("air_cool", Some(61.2));
        temps.set("not_a_probe", Some(1.0));
        assert_eq!(temps.get("air_cool"), Some(61.2));
        assert_eq!(temps.get("not_a_probe"), None);
    }
}
