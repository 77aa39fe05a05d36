//! Constants and configuration values for Shop Heater
//!
//! Centralizes all magic numbers, paths, and configuration defaults.
//! Settings fall back to these values when a field is missing.

use std::time::Duration;

/// System paths
pub mod paths {
    use std::path::PathBuf;

    /// Application directory name under the user config/data dirs
    pub const APP_DIR: &str = "shopheater";

    /// Settings file name
    pub const SETTINGS_FILE: &str = "settings.json";

    /// Linux sysfs GPIO class directory
    pub const GPIO_BASE: &str = "/sys/class/gpio";

    /// Linux sysfs PWM class directory
    pub const PWM_BASE: &str = "/sys/class/pwm";

    /// 1-Wire bus devices directory
    pub const W1_DEVICES: &str = "/sys/bus/w1/devices";

    /// User configuration directory ($XDG_CONFIG_HOME/shopheater)
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }

    /// Default location for recorded session artifacts ($XDG_DATA_HOME/shopheater/sessions)
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("sessions")
    }
}

/// Flow meter calibration (Digiten FL-408 hall-effect sensor)
pub mod flow {
    /// Pulses per liter, from the sensor datasheet
    pub const PULSES_PER_LITER: f64 = 450.0;

    /// Pulses per pound of water, measured: 3,119 pulses = 19.9 lb.
    /// Independent of PULSES_PER_LITER; the two are not required to agree.
    pub const PULSES_PER_POUND: f64 = 3119.0 / 19.9;

    /// Kilograms per avoirdupois pound
    pub const KG_PER_POUND: f64 = 0.453_592_37;

    /// Rate samples closer together than this (seconds) report 0.0
    pub const MIN_SAMPLE_INTERVAL_SECS: f64 = 0.001;

    /// Flow edge input (BCM numbering)
    pub const DEFAULT_EDGE_CHANNEL: u32 = 27;
}

/// Fan drive constants (BTS7960 driver, RPWM only)
pub mod fan {
    /// Highest speed accepted at the command boundary (percent)
    pub const MAX_COMMAND_PERCENT: i64 = 100;

    /// Highest duty the driver will output (percent)
    pub const MAX_DUTY_PERCENT: u8 = 99;

    /// Duty used while kick-starting a stopped fan
    pub const KICK_START_DUTY_PERCENT: u8 = 99;

    /// Default kick-start burst length
    pub const DEFAULT_KICK_START_MS: u64 = 1000;

    /// Default PWM frequency; high enough to be inaudible
    pub const DEFAULT_PWM_FREQUENCY_HZ: u32 = 10_000;

    /// sysfs PWM chip index
    pub const DEFAULT_PWM_CHIP: u32 = 0;

    /// sysfs PWM channel (PWM0 is routed to GPIO 18)
    pub const DEFAULT_PWM_CHANNEL: u32 = 0;
}

/// Diverter solenoid relays
pub mod valves {
    /// Main loop relay (BCM numbering)
    pub const DEFAULT_MAIN_CHANNEL: u32 = 23;

    /// Diversion relay (BCM numbering)
    pub const DEFAULT_DIVERSION_CHANNEL: u32 = 24;

    /// Relays are normally closed with 12V on COM: a LOW output powers the solenoid open
    pub const DEFAULT_ACTIVE_LOW: bool = true;
}

/// Temperature probes
pub mod sensors {
    /// Physical probe ids, assigned by tracing each probe on the rig
    pub const DEFAULT_BINDINGS: [(&str, &str); 6] = [
        ("water_hot", "3ca4f649bbd0"),
        ("water_mix", "3cf7f6496d4f"),
        ("water_cold", "158200872bfa"),
        ("water_reservoir", "3c52f648a463"),
        ("air_heated", "4460008751fe"),
        ("air_cool", "031294970b3f"),
    ];

    /// Additive °C offsets from an ice-water reference test
    pub const DEFAULT_OFFSETS: [(&str, f64); 6] = [
        ("4460008751fe", -0.75),
        ("3c52f648a463", 0.00),
        ("3cf7f6496d4f", 0.00),
        ("031294970b3f", 1.00),
        ("3ca4f649bbd0", -0.81),
        ("158200872bfa", -0.38),
    ];

    /// 1-Wire family codes of supported thermometers (DS18S20, DS1822, DS18B20, DS1825, MAX31850)
    pub const W1_THERM_FAMILIES: [&str; 5] = ["10", "22", "28", "3b", "42"];

    /// w1 `temperature` files report millidegrees Celsius
    pub const MILLIDEGREE_DIVISOR: f64 = 1000.0;
}

/// Server and loop timing
pub mod server {
    use super::Duration;

    pub const DEFAULT_BIND: &str = "0.0.0.0:8000";

    /// Maximum concurrent client connections
    pub const MAX_CONNECTIONS: usize = 64;

    /// Telemetry push cadence
    pub const BROADCAST_INTERVAL_MS: u64 = 500;

    /// Sensor sampling cadence
    pub const SAMPLING_INTERVAL_MS: u64 = 500;

    /// Write timeout per outbound frame
    pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

    /// Outbound frames buffered per client before frames are dropped for it
    pub const CLIENT_QUEUE_DEPTH: usize = 32;
}

/// Edge watcher poll timeout; bounds how long deregistration waits for the thread
pub const EDGE_POLL_TIMEOUT: Duration = Duration::from_millis(200);
