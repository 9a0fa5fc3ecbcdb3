//! Raw value → typed, unit-correct value conversion.
//!
//! Driven entirely by the endpoint catalog: scaling, precision and code
//! dictionaries come from the descriptor, never from per-key branches.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::catalog::{DecodeKind, EndpointDescriptor};

/// A typed, unit-normalized telemetry value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryValue {
    Number { value: f64 },
    Text { value: String },
    /// Code-lookup result. `label` is `None` for a code missing from the
    /// dictionary; the raw code is still surfaced instead of failing the
    /// cycle.
    Code { code: String, label: Option<String> },
}

impl TelemetryValue {
    /// Numeric payload, if this is a [`TelemetryValue::Number`].
    pub fn as_number(&self) -> Option<f64> {
        match self {
            TelemetryValue::Number { value } => Some(*value),
            _ => None,
        }
    }
}

/// Why a raw value could not be normalized. Treated as a miss for the
/// affected key, never a cycle failure.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum NormalizeError {
    #[error("value for {key} is not numeric: {raw}")]
    NotNumeric { key: &'static str, raw: String },
    #[error("value for {key} is not a string: {raw}")]
    NotText { key: &'static str, raw: String },
}

/// Convert one raw payload value using its catalog descriptor.
pub fn normalize(
    raw: &Value,
    descriptor: &EndpointDescriptor,
) -> Result<TelemetryValue, NormalizeError> {
    match descriptor.decode {
        DecodeKind::Scaled { divisor, precision } => {
            let number = coerce_number(raw).ok_or_else(|| NormalizeError::NotNumeric {
                key: descriptor.key,
                raw: raw.to_string(),
            })?;
            Ok(TelemetryValue::Number {
                value: round_to(number / divisor, precision),
            })
        }
        DecodeKind::Lookup(dict) => {
            let code = code_string(raw);
            let label = dict.label(&code).map(str::to_string);
            Ok(TelemetryValue::Code { code, label })
        }
        DecodeKind::Text => match raw {
            Value::String(s) => Ok(TelemetryValue::Text {
                value: s.trim().to_string(),
            }),
            Value::Number(n) => Ok(TelemetryValue::Text { value: n.to_string() }),
            other => Err(NormalizeError::NotText {
                key: descriptor.key,
                raw: other.to_string(),
            }),
        },
    }
}

/// Coerce a raw JSON value into f64. The firmware frequently returns numbers
/// as strings, sometimes with a trailing unit suffix (`"5mL"`).
fn coerce_number(raw: &Value) -> Option<f64> {
    match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(v) = trimmed.parse::<f64>() {
                return Some(v);
            }
            let digits: &str =
                trimmed.trim_end_matches(|c: char| c.is_ascii_alphabetic() || c.is_whitespace());
            digits.parse::<f64>().ok()
        }
        _ => None,
    }
}

/// Render a raw code value as its canonical dictionary key. Integral numbers
/// lose the fractional part (`10.0` → `"10"`), strings are trimmed and
/// upper-cased to match the dictionaries.
fn code_string(raw: &Value) -> String {
    match raw {
        Value::Number(n) => match n.as_f64() {
            Some(v) if v.fract() == 0.0 => format!("{}", v as i64),
            _ => n.to_string(),
        },
        Value::String(s) => s.trim().to_ascii_uppercase(),
        other => other.to_string(),
    }
}

fn round_to(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).round() / factor
}
