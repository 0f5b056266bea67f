//! Range table consulted by parameter validation.
//!
//! Loaded as the `[limits]` section of the settings file; every field has a
//! default matching the bench the backends were written for.

use serde::{Deserialize, Serialize};

/// Per-field range constraints, all in SI units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterLimits {
    /// Lowest applied potential (V)
    #[serde(default = "default_voltage_min")]
    pub voltage_min: f64,
    /// Highest applied potential (V)
    #[serde(default = "default_voltage_max")]
    pub voltage_max: f64,
    /// Fastest sweep (V/s); the lower bound is exclusive zero
    #[serde(default = "default_scan_rate_max")]
    pub scan_rate_max: f64,
    /// Fewest cycles
    #[serde(default = "default_cycles_min")]
    pub cycles_min: i64,
    /// Most cycles
    #[serde(default = "default_cycles_max")]
    pub cycles_max: i64,
    /// Largest AC perturbation (V)
    #[serde(default = "default_ac_amplitude_max")]
    pub ac_amplitude_max: f64,
    /// Largest absolute applied current (A)
    #[serde(default = "default_current_max")]
    pub current_max: f64,
    /// Highest excitation frequency (Hz)
    #[serde(default = "default_frequency_max")]
    pub frequency_max: f64,
    /// Densest frequency grid
    #[serde(default = "default_points_per_decade_max")]
    pub points_per_decade_max: i64,
    /// Coldest heater set point (°C)
    #[serde(default = "default_temperature_min")]
    pub temperature_min: f64,
    /// Hottest heater set point (°C)
    #[serde(default = "default_temperature_max")]
    pub temperature_max: f64,
    /// Largest single pump dispense (mL)
    #[serde(default = "default_pump_max_ml")]
    pub pump_max_ml: f64,
    /// Longest ultrasonic burst (ms)
    #[serde(default = "default_ultrasonic_max_ms")]
    pub ultrasonic_max_ms: f64,
}

impl Default for ParameterLimits {
    fn default() -> Self {
        Self {
            voltage_min: default_voltage_min(),
            voltage_max: default_voltage_max(),
            scan_rate_max: default_scan_rate_max(),
            cycles_min: default_cycles_min(),
            cycles_max: default_cycles_max(),
            ac_amplitude_max: default_ac_amplitude_max(),
            current_max: default_current_max(),
            frequency_max: default_frequency_max(),
            points_per_decade_max: default_points_per_decade_max(),
            temperature_min: default_temperature_min(),
            temperature_max: default_temperature_max(),
            pump_max_ml: default_pump_max_ml(),
            ultrasonic_max_ms: default_ultrasonic_max_ms(),
        }
    }
}

impl ParameterLimits {
    /// Checks that every window is well-formed.
    pub fn check(&self) -> Result<(), String> {
        let windows = [
            ("voltage", self.voltage_min, self.voltage_max),
            ("temperature", self.temperature_min, self.temperature_max),
            ("cycles", self.cycles_min as f64, self.cycles_max as f64),
        ];
        for (name, lo, hi) in windows {
            if !(lo.is_finite() && hi.is_finite()) || lo > hi {
                return Err(format!("{name} limits are inverted: [{lo}, {hi}]"));
            }
        }
        let ceilings = [
            ("scan_rate_max", self.scan_rate_max),
            ("ac_amplitude_max", self.ac_amplitude_max),
            ("current_max", self.current_max),
            ("frequency_max", self.frequency_max),
            ("points_per_decade_max", self.points_per_decade_max as f64),
            ("pump_max_ml", self.pump_max_ml),
            ("ultrasonic_max_ms", self.ultrasonic_max_ms),
        ];
        for (name, value) in ceilings {
            if !(value.is_finite() && value > 0.0) {
                return Err(format!("{name} must be positive, got {value}"));
            }
        }
        if self.cycles_min < 1 {
            return Err(format!("cycles_min must be at least 1, got {}", self.cycles_min));
        }
        Ok(())
    }
}

fn default_voltage_min() -> f64 {
    -2.0
}

fn default_voltage_max() -> f64 {
    2.0
}

fn default_scan_rate_max() -> f64 {
    1.0
}

fn default_cycles_min() -> i64 {
    1
}

fn default_cycles_max() -> i64 {
    1000
}

fn default_ac_amplitude_max() -> f64 {
    0.1
}

fn default_current_max() -> f64 {
    0.1
}

fn default_frequency_max() -> f64 {
    1.0e6
}

fn default_points_per_decade_max() -> i64 {
    100
}

fn default_temperature_min() -> f64 {
    0.0
}

fn default_temperature_max() -> f64 {
    100.0
}

fn default_pump_max_ml() -> f64 {
    10.0
}

fn default_ultrasonic_max_ms() -> f64 {
    10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits_are_consistent() {
        assert!(ParameterLimits::default().check().is_ok());
    }

    #[test]
    fn test_inverted_window_rejected() {
        let limits = ParameterLimits {
            voltage_min: 1.0,
            voltage_max: -1.0,
            ..Default::default()
        };
        let err = limits.check().unwrap_err();
        assert!(err.contains("voltage"));
    }

    #[test]
    fn test_partial_table_fills_defaults() {
        let limits: ParameterLimits = serde_json::from_str(r#"{"cycles_max": 50}"#).unwrap();
        assert_eq!(limits.cycles_max, 50);
        assert_eq!(limits.voltage_max, 2.0);
    }
}
