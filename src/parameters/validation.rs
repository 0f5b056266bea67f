use super::{
    CvaParameters, LsvParameters, ParameterLimits, ParsedParameters, PeisParameters,
    SweepVariable, TechniqueParameters,
};
use crate::hardware::peripheral::PeripheralCommand;

/// Checks parsed parameters against `limits`.
///
/// Returns every violation found; an empty list means the parameters are valid.
pub fn validate(parsed: &ParsedParameters, limits: &ParameterLimits) -> Vec<String> {
    let mut errors = Vec::new();
    match &parsed.technique {
        TechniqueParameters::Cva(p) => validate_cva(p, limits, &mut errors),
        TechniqueParameters::Lsv(p) => validate_lsv(p, limits, &mut errors),
        TechniqueParameters::Peis(p) => validate_peis(p, limits, &mut errors),
        TechniqueParameters::Ocv(p) => validate_timing(p.duration, p.sample_interval, &mut errors),
        TechniqueParameters::Cp(p) => {
            if p.current == 0.0 {
                errors.push("Current must be non-zero".to_string());
            } else if p.current.abs() > limits.current_max {
                errors.push(format!(
                    "Current must be between -{max}A and {max}A",
                    max = limits.current_max
                ));
            }
            validate_timing(p.duration, p.sample_interval, &mut errors);
        }
    }

    if !matches!(parsed.reference.kind.as_str(), "RE" | "CE") {
        errors.push(format!(
            "Reference electrode type must be RE or CE, got '{}'",
            parsed.reference.kind
        ));
    }

    for command in &parsed.peripheral {
        validate_peripheral(command, limits, &mut errors);
    }
    errors
}

fn check_voltage(label: &str, value: f64, limits: &ParameterLimits, errors: &mut Vec<String>) {
    if value < limits.voltage_min || value > limits.voltage_max {
        errors.push(format!(
            "{label} must be between {}V and {}V",
            limits.voltage_min, limits.voltage_max
        ));
    }
}

fn check_scan_rate(value: f64, limits: &ParameterLimits, errors: &mut Vec<String>) {
    if value <= 0.0 || value > limits.scan_rate_max {
        errors.push(format!(
            "Scan rate must be between 0 and {} V/s",
            limits.scan_rate_max
        ));
    }
}

fn check_sweep(start: f64, end: f64, interval: f64, errors: &mut Vec<String>) {
    if start == end {
        errors.push("Start and end voltage must differ".to_string());
    }
    if interval <= 0.0 {
        errors.push("Sample interval must be positive".to_string());
    }
}

fn validate_cva(p: &CvaParameters, limits: &ParameterLimits, errors: &mut Vec<String>) {
    check_voltage("Start voltage", p.start_voltage, limits, errors);
    check_voltage("End voltage", p.end_voltage, limits, errors);
    check_scan_rate(p.scan_rate, limits, errors);
    check_sweep(p.start_voltage, p.end_voltage, p.sample_interval, errors);
    if p.cycles < limits.cycles_min || p.cycles > limits.cycles_max {
        errors.push(format!(
            "Cycles must be an integer between {} and {}",
            limits.cycles_min, limits.cycles_max
        ));
    }
    if let Some(nested) = &p.nested_loop {
        if nested.values.is_empty() {
            errors.push("Nested loop needs at least one value".to_string());
        }
        for value in &nested.values {
            match nested.variable {
                SweepVariable::StartVoltage => {
                    check_voltage("Nested start voltage", *value, limits, errors)
                }
                SweepVariable::EndVoltage => {
                    check_voltage("Nested end voltage", *value, limits, errors)
                }
                SweepVariable::ScanRate => check_scan_rate(*value, limits, errors),
            }
        }
    }
}

fn validate_lsv(p: &LsvParameters, limits: &ParameterLimits, errors: &mut Vec<String>) {
    check_voltage("Start voltage", p.start_voltage, limits, errors);
    check_voltage("End voltage", p.end_voltage, limits, errors);
    check_scan_rate(p.scan_rate, limits, errors);
    check_sweep(p.start_voltage, p.end_voltage, p.sample_interval, errors);
}

fn validate_peis(p: &PeisParameters, limits: &ParameterLimits, errors: &mut Vec<String>) {
    check_voltage("DC voltage", p.dc_voltage, limits, errors);
    if p.ac_amplitude <= 0.0 || p.ac_amplitude > limits.ac_amplitude_max {
        errors.push(format!(
            "AC amplitude must be between 0 and {}V",
            limits.ac_amplitude_max
        ));
    }
    for (label, f) in [("Start", p.frequency_start), ("End", p.frequency_end)] {
        if f <= 0.0 {
            errors.push(format!("{label} frequency must be positive"));
        } else if f > limits.frequency_max {
            errors.push(format!(
                "{label} frequency must not exceed {}Hz",
                limits.frequency_max
            ));
        }
    }
    if p.frequency_start == p.frequency_end {
        errors.push("Start and end frequency must differ".to_string());
    }
    if p.points_per_decade < 1 || p.points_per_decade > limits.points_per_decade_max {
        errors.push(format!(
            "Points per decade must be between 1 and {}",
            limits.points_per_decade_max
        ));
    }
}

fn validate_timing(duration: f64, interval: f64, errors: &mut Vec<String>) {
    if duration <= 0.0 {
        errors.push("Duration must be positive".to_string());
    }
    if interval <= 0.0 {
        errors.push("Sample interval must be positive".to_string());
    } else if interval > duration {
        errors.push("Sample interval must not exceed duration".to_string());
    }
}

fn validate_peripheral(
    command: &PeripheralCommand,
    limits: &ParameterLimits,
    errors: &mut Vec<String>,
) {
    match *command {
        PeripheralCommand::SetTemperature { channel, celsius } => {
            if celsius < limits.temperature_min || celsius > limits.temperature_max {
                errors.push(format!(
                    "Temperature on channel {channel} must be between {} and {}°C",
                    limits.temperature_min, limits.temperature_max
                ));
            }
        }
        PeripheralCommand::Dispense { channel, ml } => {
            if ml <= 0.0 || ml > limits.pump_max_ml {
                errors.push(format!(
                    "Pump volume on channel {channel} must be positive and at most {} mL",
                    limits.pump_max_ml
                ));
            }
        }
        PeripheralCommand::RunTimer { channel, ms } => {
            if ms < 0.0 || ms > limits.ultrasonic_max_ms {
                errors.push(format!(
                    "Ultrasonic time on channel {channel} must be between 0 and {} ms",
                    limits.ultrasonic_max_ms
                ));
            }
        }
    }
}
