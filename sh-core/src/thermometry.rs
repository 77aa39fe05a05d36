//! Calibrated temperature readings
//!
//! Probes are bound to logical names by configuration. A reading is the raw
//! °C value plus the probe's additive offset, converted to °F and rounded to
//! one decimal. Anything that prevents a reading (unbound name, probe missing
//! from the bus, failed read) yields `None`; the sampling loop never fails
//! because of a sensor.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use sh_protocol::{Temperatures, TEMPERATURE_NAMES};
use tracing::{debug, warn};

use crate::constants::sensors::{DEFAULT_BINDINGS, DEFAULT_OFFSETS};
use crate::hw::TemperatureBus;

/// Round to one decimal place, half to even on the exact binary value
pub fn round1(value: f64) -> f64 {
    round_to(value, 1)
}

/// Round to two decimal places, half to even on the exact binary value
pub fn round2(value: f64) -> f64 {
    round_to(value, 2)
}

fn round_to(value: f64, places: usize) -> f64 {
    if !value.is_finite() {
        return value;
    }
    // The float formatter rounds the exact value, so 70.25 -> 70.2 and 30.65 (30.6499..) -> 30.6
    format!("{:.*}", places, value).parse().unwrap_or(value)
}

/// Raw °C plus offset, to °F, one decimal
pub fn calibrate(raw_celsius: f64, offset_celsius: f64) -> f64 {
    round1((raw_celsius + offset_celsius) * 9.0 / 5.0 + 32.0)
}

/// Per-probe additive offsets in °C, fixed at startup
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationTable {
    offsets: HashMap<String, f64>,
}

impl CalibrationTable {
    pub fn new(offsets: HashMap<String, f64>) -> Self {
        Self { offsets }
    }

    /// Offset for `sensor_id`; 0.0 for probes never reference-tested
    pub fn offset(&self, sensor_id: &str) -> f64 {
        self.offsets.get(sensor_id).copied().unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}

impl Default for CalibrationTable {
    fn default() -> Self {
        Self::new(
            DEFAULT_OFFSETS
                .iter()
                .map(|(id, off)| (id.to_string(), *off))
                .collect(),
        )
    }
}

/// Logical name → physical probe id
#[derive(Debug, Clone, PartialEq)]
pub struct SensorBindings {
    bindings: BTreeMap<String, String>,
}

impl SensorBindings {
    pub fn new(bindings: BTreeMap<String, String>) -> Self {
        Self { bindings }
    }

    pub fn sensor_id(&self, logical_name: &str) -> Option<&str> {
        self.bindings.get(logical_name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.bindings.iter().map(|(n, id)| (n.as_str(), id.as_str()))
    }
}

impl Default for SensorBindings {
    fn default() -> Self {
        Self::new(
            DEFAULT_BINDINGS
                .iter()
                .map(|(name, id)| (name.to_string(), id.to_string()))
                .collect(),
        )
    }
}

pub struct CalibratedThermometry {
    bus: Arc<dyn TemperatureBus>,
    bindings: SensorBindings,
    calibration: CalibrationTable,
}

impl CalibratedThermometry {
    pub fn new(
        bus: Arc<dyn TemperatureBus>,
        bindings: SensorBindings,
        calibration: CalibrationTable,
    ) -> Self {
        Self {
            bus,
            bindings,
            calibration,
        }
    }

    /// Calibrated °F for one logical probe
    pub fn read_calibrated(&self, logical_name: &str) -> Option<f64> {
        let present = self.live_sensor_ids();
        self.read_with(logical_name, &present)
    }

    /// `a - b` in calibrated °F, one decimal, if both are present
    pub fn delta(&self, name_a: &str, name_b: &str) -> Option<f64> {
        let a = self.read_calibrated(name_a)?;
        let b = self.read_calibrated(name_b)?;
        Some(round1(a - b))
    }

    /// Every named probe, listing the bus once for the whole frame
    pub fn read_all(&self) -> Temperatures {
        let present = self.live_sensor_ids();
        let mut temps = Temperatures::default();
        for name in TEMPERATURE_NAMES {
            temps.set(name, self.read_with(name, &present));
        }
        temps
    }

    fn live_sensor_ids(&self) -> BTreeSet<String> {
        self.bus.list_sensor_ids().unwrap_or_else(|e| {
            warn!("Temperature bus listing failed: {}", e);
            BTreeSet::new()
        })
    }

    fn read_with(&self, logical_name: &str, present: &BTreeSet<String>) -> Option<f64> {
        let sensor_id = self.bindings.sensor_id(logical_name)?;
        if !present.contains(sensor_id) {
            debug!(logical_name, sensor_id, "Probe not on bus");
            return None;
        }
        match self.bus.read_raw_temperature(sensor_id) {
            Ok(raw) => Some(calibrate(raw, self.calibration.offset(sensor_id))),
            Err(e) => {
                warn!(logical_name, "{}", e);
                None
            }
        }
    }
}

/// Difference of two optional calibrated readings
pub fn delta_of(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    Some(round1(a? - b?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::sim::SimRig;
    use crate::hw::MockTemperatureBus;
    use sh_error::ShopHeaterError;

    fn thermometry(sim: &SimRig) -> CalibratedThermometry {
        CalibratedThermometry::new(
            sim.rig().thermometers,
            SensorBindings::default(),
            CalibrationTable::default(),
        )
    }

    #[test]
    fn test_ice_water_with_negative_offset() {
        // -1.35 °C is 30.649999.. °F, which rounds down
        assert_eq!(calibrate(0.0, -0.75), 30.6);
    }

    #[test]
    fn test_sixteenth_degree_tie_rounds_to_even() {
        // DS18B20 resolution is 1/16 °C; 21.25 °C is exactly 70.25 °F
        assert_eq!(calibrate(21.25, 0.0), 70.2);
        assert_eq!(calibrate(21.375, 0.0), 70.5);
        assert_eq!(round1(70.35), 70.3);
        assert_eq!(round2(1.125), 1.12);
        assert_eq!(round2(2.0), 2.0);
    }

    #[test]
    fn test_boiling_without_offset() {
        assert_eq!(calibrate(100.0, 0.0), 212.0);
    }

    #[test]
    fn test_unlisted_probe_has_no_offset() {
        let table = CalibrationTable::default();
        assert_eq!(table.offset("ffffffffffff"), 0.0);
        assert_eq!(table.offset("031294970b3f"), 1.0);
    }

    #[test]
    fn test_read_applies_offset_by_sensor_id() {
        let sim = SimRig::new();
        // air_heated is bound to 4460008751fe (-0.75)
        sim.set_temperature("4460008751fe", 0.0);
        let therm = thermometry(&sim);
        assert_eq!(therm.read_calibrated("air_heated"), Some(30.6));
    }

    #[test]
    fn test_unbound_name_is_absent() {
        let sim = SimRig::with_default_sensors();
        assert_eq!(thermometry(&sim).read_calibrated("oil_sump"), None);
    }

    #[test]
    fn test_probe_missing_from_bus_is_absent() {
        let sim = SimRig::with_default_sensors();
        sim.remove_sensor("3ca4f649bbd0");
        let therm = thermometry(&sim);
        assert_eq!(therm.read_calibrated("water_hot"), None);
        assert!(therm.read_calibrated("water_cold").is_some());
    }

    #[test]
    fn test_failed_read_is_absent() {
        let sim = SimRig::with_default_sensors();
        sim.fail_sensor("158200872bfa", true);
        let temps = thermometry(&sim).read_all();
        assert_eq!(temps.water_cold, None);
        assert!(temps.water_hot.is_some());
    }

    #[test]
    fn test_delta_in_fahrenheit() {
        let sim = SimRig::new();
        sim.set_temperature("3ca4f649bbd0", 50.81); // water_hot, -0.81 → 50.0 °C → 122.0 °F
        sim.set_temperature("158200872bfa", 10.38); // water_cold, -0.38 → 10.0 °C → 50.0 °F
        let therm = thermometry(&sim);
        assert_eq!(therm.delta("water_hot", "water_cold"), Some(72.0));
        assert_eq!(therm.delta("water_hot", "air_cool"), None);
    }

    #[test]
    fn test_bus_listing_failure_reports_all_absent() {
        let mut bus = MockTemperatureBus::new();
        bus.expect_list_sensor_ids()
            .returning(|| Err(ShopHeaterError::generic("bus master gone")));
        bus.expect_read_raw_temperature().never();
        let therm = CalibratedThermometry::new(
            Arc::new(bus),
            SensorBindings::default(),
            CalibrationTable::default(),
        );
        assert_eq!(therm.read_all(), Temperatures::default());
    }

    #[test]
    fn test_delta_of_requires_both() {
        assert_eq!(delta_of(Some(80.25), Some(70.0)), Some(10.2));
        assert_eq!(delta_of(None, Some(70.0)), None);
    }
}
