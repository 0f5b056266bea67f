//! Unit-suffixed scalar parsing.
//!
//! Inputs are either bare JSON numbers (already SI) or strings such as
//! `"1500mV"`, `"10 kHz"` or `"2min"`. Suffixes match case-insensitively and
//! exactly, so `"500ms"` is always milliseconds and never minutes or seconds.

use crate::error::{AppResult, EchemError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

const SCALAR_PATTERN: &str = r"^\s*([-+]?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?)\s*([A-Za-zµ]*)\s*$";

#[allow(clippy::expect_used)]
static SCALAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(SCALAR_PATTERN).expect("Scalar pattern must compile"));

/// Physical quantity a field is expressed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Quantity {
    /// Volts
    Voltage,
    /// Hertz
    Frequency,
    /// Seconds
    Time,
    /// Amperes
    Current,
    /// Volts per second
    ScanRate,
}

impl Quantity {
    /// Recognised suffixes (lower case) and their scale to SI.
    fn units(self) -> &'static [(&'static str, f64)] {
        match self {
            Quantity::Voltage => &[("v", 1.0), ("mv", 1e-3), ("uv", 1e-6), ("µv", 1e-6)],
            Quantity::Frequency => &[("hz", 1.0), ("khz", 1e3)],
            Quantity::Time => &[("s", 1.0), ("ms", 1e-3), ("min", 60.0), ("h", 3600.0)],
            Quantity::Current => &[
                ("a", 1.0),
                ("ma", 1e-3),
                ("ua", 1e-6),
                ("µa", 1e-6),
                ("na", 1e-9),
            ],
            Quantity::ScanRate => &[("v/s", 1.0), ("mv/s", 1e-3)],
        }
    }
}

/// Parses one scalar into SI units, naming `field` in any error.
pub fn parse_quantity(field: &str, value: &Value, quantity: Quantity) -> AppResult<f64> {
    let parsed = match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| EchemError::parse(field, format!("{n} is not representable")))?,
        Value::String(raw) => parse_suffixed(field, raw, quantity)?,
        other => {
            return Err(EchemError::parse(
                field,
                format!("expected a number or unit string, got {other}"),
            ))
        }
    };
    if !parsed.is_finite() {
        return Err(EchemError::parse(field, "value is not finite"));
    }
    Ok(parsed)
}

fn parse_suffixed(field: &str, raw: &str, quantity: Quantity) -> AppResult<f64> {
    // Scan rates are the only compound unit; strip it before the generic pattern.
    let (body, suffix) = match split_compound(raw) {
        Some(split) => split,
        None => {
            let caps = SCALAR
                .captures(raw)
                .ok_or_else(|| EchemError::parse(field, format!("'{raw}' is not numeric")))?;
            (caps[1].to_string(), caps[2].to_lowercase())
        }
    };
    let magnitude: f64 = body
        .parse()
        .map_err(|_| EchemError::parse(field, format!("'{raw}' is not numeric")))?;
    if suffix.is_empty() {
        return Ok(magnitude);
    }
    quantity
        .units()
        .iter()
        .find(|(unit, _)| *unit == suffix)
        .map(|(_, scale)| magnitude * scale)
        .ok_or_else(|| EchemError::parse(field, format!("unknown unit suffix '{suffix}'")))
}

fn split_compound(raw: &str) -> Option<(String, String)> {
    let (head, per) = raw.trim().rsplit_once('/')?;
    let caps = SCALAR.captures(head)?;
    Some((
        caps[1].to_string(),
        format!("{}/{}", caps[2].to_lowercase(), per.trim().to_lowercase()),
    ))
}

/// Parses an integer-valued field. Fractional input is a parse error.
pub fn parse_integer(field: &str, value: &Value) -> AppResult<i64> {
    let as_float = match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Ok(i);
            }
            n.as_f64().unwrap_or(f64::NAN)
        }
        Value::String(raw) => raw
            .trim()
            .parse::<f64>()
            .map_err(|_| EchemError::parse(field, format!("'{raw}' is not a whole number")))?,
        other => {
            return Err(EchemError::parse(
                field,
                format!("expected a whole number, got {other}"),
            ))
        }
    };
    if as_float.is_finite() && as_float.fract() == 0.0 && as_float.abs() < i64::MAX as f64 {
        Ok(as_float as i64)
    } else {
        Err(EchemError::parse(field, format!("{as_float} is not a whole number")))
    }
}

/// Parses a plain number (bare or numeric string) without units.
pub fn parse_number(field: &str, value: &Value) -> AppResult<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(raw) => raw.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed
        .filter(|v| v.is_finite())
        .ok_or_else(|| EchemError::parse(field, format!("expected a number, got {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_voltage_forms_agree() {
        for raw in [json!("1.5V"), json!("1500mV"), json!("1.5"), json!(1.5), json!("1.5 v")] {
            let v = parse_quantity("start_voltage", &raw, Quantity::Voltage).unwrap();
            assert!((v - 1.5).abs() < 1e-12, "{raw} parsed to {v}");
        }
    }

    #[test]
    fn test_time_suffixes_do_not_overlap() {
        let ms = parse_quantity("t", &json!("500ms"), Quantity::Time).unwrap();
        assert!((ms - 0.5).abs() < 1e-12);
        let min = parse_quantity("t", &json!("2min"), Quantity::Time).unwrap();
        assert!((min - 120.0).abs() < 1e-12);
        let upper = parse_quantity("t", &json!("500MS"), Quantity::Time).unwrap();
        assert!((upper - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_frequency_and_current() {
        let f = parse_quantity("f", &json!("10kHz"), Quantity::Frequency).unwrap();
        assert!((f - 10_000.0).abs() < 1e-9);
        let i = parse_quantity("current", &json!("-2.5mA"), Quantity::Current).unwrap();
        assert!((i + 0.0025).abs() < 1e-12);
    }

    #[test]
    fn test_scan_rate_compound_unit() {
        let r = parse_quantity("scan_rate", &json!("50mV/s"), Quantity::ScanRate).unwrap();
        assert!((r - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_unknown_suffix_names_field() {
        let err = parse_quantity("end_voltage", &json!("3 volts"), Quantity::Voltage).unwrap_err();
        match err {
            EchemError::Parse { field, message } => {
                assert_eq!(field, "end_voltage");
                assert!(message.contains("volts"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_non_numeric_body() {
        assert!(parse_quantity("f", &json!("fastHz"), Quantity::Frequency).is_err());
        assert!(parse_quantity("f", &json!(true), Quantity::Frequency).is_err());
    }

    #[test]
    fn test_integer_parsing() {
        assert_eq!(parse_integer("cycles", &json!(3)).unwrap(), 3);
        assert_eq!(parse_integer("cycles", &json!(3.0)).unwrap(), 3);
        assert_eq!(parse_integer("cycles", &json!("7")).unwrap(), 7);
        assert_eq!(parse_integer("cycles", &json!(-4)).unwrap(), -4);
        assert!(parse_integer("cycles", &json!(2.5)).is_err());
    }
}
