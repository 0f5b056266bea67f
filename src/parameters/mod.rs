//! Parameter normalisation and validation for unit operations.
//!
//! Raw parameters arrive as a JSON map whose scalars may carry unit suffixes.
//! [`prepare`] is the full pipeline a backend runs before measuring:
//!
//! 1. merge the technique defaults for every field the caller omitted,
//! 2. [`normalize`] into a typed [`ParsedParameters`] (first malformed field
//!    fails with a `Parse` error naming it),
//! 3. [`validate`] against the [`ParameterLimits`] table, collecting every
//!    violation into one `Validation` error.

pub mod limits;
pub mod units;
mod validation;

pub use limits::ParameterLimits;
pub use validation::validate;

use crate::core::{JsonMap, Technique};
use crate::error::{AppResult, EchemError};
use crate::hardware::peripheral::{parse_peripheral_block, PeripheralCommand};
use serde::Serialize;
use serde_json::{json, Value};
use units::{parse_integer, parse_quantity, Quantity};

/// Keys under which a unit operation may carry peripheral-board commands.
pub const PERIPHERAL_KEYS: [&str; 2] = ["peripheral_control", "arduino_control"];

// =============================================================================
// Typed parameters
// =============================================================================

/// Cyclic voltammetry sweep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CvaParameters {
    /// V
    pub start_voltage: f64,
    /// V
    pub end_voltage: f64,
    /// V/s
    pub scan_rate: f64,
    /// Forward+reverse passes
    pub cycles: i64,
    /// s
    pub sample_interval: f64,
    /// Optional outer sweep over one of the scan parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nested_loop: Option<NestedLoop>,
}

/// Scan parameter a nested loop may vary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum SweepVariable {
    StartVoltage,
    EndVoltage,
    ScanRate,
}

impl SweepVariable {
    fn parse(raw: &str) -> AppResult<Self> {
        match raw {
            "start_voltage" => Ok(Self::StartVoltage),
            "end_voltage" => Ok(Self::EndVoltage),
            "scan_rate" => Ok(Self::ScanRate),
            other => Err(EchemError::parse(
                "nested_loop.variable",
                format!("cannot sweep '{other}'"),
            )),
        }
    }

    fn quantity(self) -> Quantity {
        match self {
            Self::StartVoltage | Self::EndVoltage => Quantity::Voltage,
            Self::ScanRate => Quantity::ScanRate,
        }
    }
}

/// Repeats the cycle set once per value of `variable`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NestedLoop {
    #[allow(missing_docs)]
    pub variable: SweepVariable,
    /// SI values, in order
    pub values: Vec<f64>,
}

/// Impedance spectroscopy sweep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeisParameters {
    /// Hz
    pub frequency_start: f64,
    /// Hz
    pub frequency_end: f64,
    /// V
    pub ac_amplitude: f64,
    /// V
    pub dc_voltage: f64,
    #[allow(missing_docs)]
    pub points_per_decade: i64,
}

/// Open circuit voltage recording.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OcvParameters {
    /// s
    pub duration: f64,
    /// s
    pub sample_interval: f64,
}

/// Constant-current recording.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CpParameters {
    /// A
    pub current: f64,
    /// s
    pub duration: f64,
    /// s
    pub sample_interval: f64,
}

/// Linear sweep voltammetry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LsvParameters {
    /// V
    pub start_voltage: f64,
    /// V
    pub end_voltage: f64,
    /// V/s
    pub scan_rate: f64,
    /// s
    pub sample_interval: f64,
}

/// Technique-specific part of a parsed unit operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
#[allow(missing_docs)]
pub enum TechniqueParameters {
    Cva(CvaParameters),
    Peis(PeisParameters),
    Ocv(OcvParameters),
    Cp(CpParameters),
    Lsv(LsvParameters),
}

impl TechniqueParameters {
    /// Technique these parameters belong to.
    pub fn technique(&self) -> Technique {
        match self {
            Self::Cva(_) => Technique::Cva,
            Self::Peis(_) => Technique::Peis,
            Self::Ocv(_) => Technique::Ocv,
            Self::Cp(_) => Technique::Cp,
            Self::Lsv(_) => Technique::Lsv,
        }
    }
}

/// Reference electrode selection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferenceElectrode {
    /// `RE` or `CE`
    #[serde(rename = "type")]
    pub kind: String,
    #[allow(missing_docs)]
    pub enabled: bool,
}

impl Default for ReferenceElectrode {
    fn default() -> Self {
        Self {
            kind: "RE".to_string(),
            enabled: true,
        }
    }
}

/// A unit operation's parameters in canonical SI form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedParameters {
    /// Technique-specific fields
    #[serde(flatten)]
    pub technique: TechniqueParameters,
    #[allow(missing_docs)]
    pub reference: ReferenceElectrode,
    /// Board commands run before the measurement
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub peripheral: Vec<PeripheralCommand>,
}

// =============================================================================
// Defaults and aliases
// =============================================================================

/// Defaults for every optional field of `technique`, keyed by canonical name.
pub fn default_parameters(technique: Technique) -> JsonMap {
    let fields = match technique {
        Technique::Cva => json!({
            "start_voltage": 0.0,
            "end_voltage": 1.0,
            "scan_rate": 0.05,
            "cycles": 1,
            "sample_interval": 0.1,
        }),
        Technique::Peis => json!({
            "frequency_start": 0.1,
            "frequency_end": 100000.0,
            "ac_amplitude": 0.01,
            "dc_voltage": 0.0,
            "points_per_decade": 10,
        }),
        Technique::Ocv => json!({
            "duration": 60.0,
            "sample_interval": 1.0,
        }),
        Technique::Cp => json!({
            "current": 0.001,
            "duration": 60.0,
            "sample_interval": 1.0,
        }),
        Technique::Lsv => json!({
            "start_voltage": 0.0,
            "end_voltage": 1.0,
            "scan_rate": 0.05,
            "sample_interval": 0.1,
        }),
    };
    let mut map = match fields {
        Value::Object(map) => map,
        _ => JsonMap::new(),
    };
    map.insert("reference".into(), json!({"type": "RE", "enabled": true}));
    map
}

/// Alternative spellings accepted for a canonical field.
fn aliases(canonical: &str) -> &'static [&'static str] {
    match canonical {
        "frequency_start" => &["start_freq"],
        "frequency_end" => &["end_freq"],
        "ac_amplitude" => &["amplitude"],
        _ => &[],
    }
}

/// Finds a field by canonical name or alias, returning the spelling used.
fn lookup<'a>(raw: &'a JsonMap, canonical: &'static str) -> Option<(&'a str, &'a Value)> {
    std::iter::once(canonical)
        .chain(aliases(canonical).iter().copied())
        .find_map(|name| raw.get_key_value(name))
        .map(|(k, v)| (k.as_str(), v))
}

/// Returns `raw` with defaults filled in for omitted fields.
pub fn merge_defaults(technique: Technique, raw: &JsonMap) -> JsonMap {
    let mut merged = raw.clone();
    for (key, value) in default_parameters(technique) {
        let present = merged.contains_key(&key)
            || aliases(&key).iter().any(|alias| merged.contains_key(*alias));
        if !present {
            merged.insert(key, value);
        }
    }
    merged
}

// =============================================================================
// Normalisation
// =============================================================================

fn required<'a>(raw: &'a JsonMap, canonical: &'static str) -> AppResult<(&'a str, &'a Value)> {
    lookup(raw, canonical).ok_or_else(|| EchemError::parse(canonical, "missing required field"))
}

fn quantity(raw: &JsonMap, canonical: &'static str, q: Quantity) -> AppResult<f64> {
    let (name, value) = required(raw, canonical)?;
    parse_quantity(name, value, q)
}

fn integer(raw: &JsonMap, canonical: &'static str) -> AppResult<i64> {
    let (name, value) = required(raw, canonical)?;
    parse_integer(name, value)
}

fn nested_loop(raw: &JsonMap) -> AppResult<Option<NestedLoop>> {
    let block = match raw.get("nested_loop") {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Object(block)) => block,
        Some(other) => {
            return Err(EchemError::parse(
                "nested_loop",
                format!("expected an object, got {other}"),
            ))
        }
    };
    let variable = block
        .get("variable")
        .and_then(Value::as_str)
        .ok_or_else(|| EchemError::parse("nested_loop.variable", "missing required field"))?;
    let variable = SweepVariable::parse(variable)?;
    let values = block
        .get("values")
        .and_then(Value::as_array)
        .ok_or_else(|| EchemError::parse("nested_loop.values", "expected an array"))?
        .iter()
        .map(|v| parse_quantity("nested_loop.values", v, variable.quantity()))
        .collect::<AppResult<Vec<_>>>()?;
    Ok(Some(NestedLoop { variable, values }))
}

fn reference(raw: &JsonMap) -> AppResult<ReferenceElectrode> {
    match raw.get("reference") {
        None | Some(Value::Null) => Ok(ReferenceElectrode::default()),
        Some(Value::Object(block)) => Ok(ReferenceElectrode {
            kind: block
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("RE")
                .to_string(),
            enabled: block.get("enabled").and_then(Value::as_bool).unwrap_or(true),
        }),
        Some(other) => Err(EchemError::parse(
            "reference",
            format!("expected an object, got {other}"),
        )),
    }
}

fn peripheral(raw: &JsonMap) -> AppResult<Vec<PeripheralCommand>> {
    let mut commands = Vec::new();
    for key in PERIPHERAL_KEYS {
        match raw.get(key) {
            None | Some(Value::Null) => {}
            Some(Value::Object(block)) => commands.extend(parse_peripheral_block(block)?),
            Some(other) => {
                return Err(EchemError::parse(
                    key,
                    format!("expected an object, got {other}"),
                ))
            }
        }
    }
    Ok(commands)
}

/// Parses raw parameters into canonical SI form.
///
/// Every field must be present (see [`merge_defaults`]). The first malformed
/// field fails the whole call.
pub fn normalize(technique: Technique, raw: &JsonMap) -> AppResult<ParsedParameters> {
    let fields = match technique {
        Technique::Cva => TechniqueParameters::Cva(CvaParameters {
            start_voltage: quantity(raw, "start_voltage", Quantity::Voltage)?,
            end_voltage: quantity(raw, "end_voltage", Quantity::Voltage)?,
            scan_rate: quantity(raw, "scan_rate", Quantity::ScanRate)?,
            cycles: integer(raw, "cycles")?,
            sample_interval: quantity(raw, "sample_interval", Quantity::Time)?,
            nested_loop: nested_loop(raw)?,
        }),
        Technique::Peis => TechniqueParameters::Peis(PeisParameters {
            frequency_start: quantity(raw, "frequency_start", Quantity::Frequency)?,
            frequency_end: quantity(raw, "frequency_end", Quantity::Frequency)?,
            ac_amplitude: quantity(raw, "ac_amplitude", Quantity::Voltage)?,
            dc_voltage: quantity(raw, "dc_voltage", Quantity::Voltage)?,
            points_per_decade: integer(raw, "points_per_decade")?,
        }),
        Technique::Ocv => TechniqueParameters::Ocv(OcvParameters {
            duration: quantity(raw, "duration", Quantity::Time)?,
            sample_interval: quantity(raw, "sample_interval", Quantity::Time)?,
        }),
        Technique::Cp => TechniqueParameters::Cp(CpParameters {
            current: quantity(raw, "current", Quantity::Current)?,
            duration: quantity(raw, "duration", Quantity::Time)?,
            sample_interval: quantity(raw, "sample_interval", Quantity::Time)?,
        }),
        Technique::Lsv => TechniqueParameters::Lsv(LsvParameters {
            start_voltage: quantity(raw, "start_voltage", Quantity::Voltage)?,
            end_voltage: quantity(raw, "end_voltage", Quantity::Voltage)?,
            scan_rate: quantity(raw, "scan_rate", Quantity::ScanRate)?,
            sample_interval: quantity(raw, "sample_interval", Quantity::Time)?,
        }),
    };
    Ok(ParsedParameters {
        technique: fields,
        reference: reference(raw)?,
        peripheral: peripheral(raw)?,
    })
}

/// Merges defaults, normalises and validates in one step.
pub fn prepare(
    technique: Technique,
    raw: &JsonMap,
    limits: &ParameterLimits,
) -> AppResult<ParsedParameters> {
    let merged = merge_defaults(technique, raw);
    let parsed = normalize(technique, &merged)?;
    let violations = validate(&parsed, limits);
    if violations.is_empty() {
        Ok(parsed)
    } else {
        Err(EchemError::Validation(violations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(value: Value) -> JsonMap {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let parsed = prepare(Technique::Ocv, &JsonMap::new(), &ParameterLimits::default()).unwrap();
        match parsed.technique {
            TechniqueParameters::Ocv(ocv) => {
                assert_eq!(ocv.duration, 60.0);
                assert_eq!(ocv.sample_interval, 1.0);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(parsed.reference, ReferenceElectrode::default());
    }

    #[test]
    fn test_caller_values_win_over_defaults() {
        let raw = map(json!({"duration": "2min", "sample_interval": "500ms"}));
        let parsed = normalize(Technique::Ocv, &merge_defaults(Technique::Ocv, &raw)).unwrap();
        assert_eq!(
            parsed.technique,
            TechniqueParameters::Ocv(OcvParameters {
                duration: 120.0,
                sample_interval: 0.5
            })
        );
    }

    #[test]
    fn test_peis_aliases() {
        let raw = map(json!({"start_freq": "10kHz", "end_freq": "1Hz", "amplitude": "5mV"}));
        let merged = merge_defaults(Technique::Peis, &raw);
        assert!(!merged.contains_key("frequency_start"));
        let parsed = normalize(Technique::Peis, &merged).unwrap();
        match parsed.technique {
            TechniqueParameters::Peis(p) => {
                assert_eq!(p.frequency_start, 10_000.0);
                assert_eq!(p.frequency_end, 1.0);
                assert!((p.ac_amplitude - 0.005).abs() < 1e-12);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_error_names_field() {
        let raw = map(json!({"start_voltage": "1.0 volts"}));
        let err = prepare(Technique::Lsv, &raw, &ParameterLimits::default()).unwrap_err();
        assert!(matches!(err, EchemError::Parse { ref field, .. } if field == "start_voltage"));
    }

    #[test]
    fn test_validation_collects_all_violations() {
        let raw = map(json!({"start_voltage": "5V", "end_voltage": -7.0, "scan_rate": 0}));
        match prepare(Technique::Lsv, &raw, &ParameterLimits::default()).unwrap_err() {
            EchemError::Validation(violations) => assert_eq!(violations.len(), 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_peripheral_block_is_parsed() {
        let raw = map(json!({"arduino_control": {"base0_temp": 30, "pump1_ml": 2.5}}));
        let parsed = prepare(Technique::Cp, &raw, &ParameterLimits::default()).unwrap();
        assert_eq!(parsed.peripheral.len(), 2);
    }

    #[test]
    fn test_nested_loop_values_use_units() {
        let raw = map(json!({
            "nested_loop": {"variable": "scan_rate", "values": ["10mV/s", 0.02]}
        }));
        let parsed = prepare(Technique::Cva, &raw, &ParameterLimits::default()).unwrap();
        match parsed.technique {
            TechniqueParameters::Cva(cva) => {
                let nested = cva.nested_loop.unwrap();
                assert_eq!(nested.variable, SweepVariable::ScanRate);
                assert!((nested.values[0] - 0.01).abs() < 1e-12);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
