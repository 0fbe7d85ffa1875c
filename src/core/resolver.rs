//! Field resolution: output name, unit conversion, value conversion and
//! formatting of a single observation.
//!
//! [`resolve`] is pure. Given the same inputs it always produces the same
//! output key and value.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::{
    format::{FormatError, Template},
    units::{number_value, unit_label, UnitConverter, UnitError},
};

#[derive(Debug, Error, PartialEq)]
pub enum ResolveError {
    #[error(transparent)]
    Unit(#[from] UnitError),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("Field '{field}': value {value} is not numeric")]
    NotNumeric { field: String, value: String },

    #[error("Field '{field}': native unit unknown, cannot convert to '{unit}'")]
    NoNativeUnit { field: String, unit: String },
}

/// How a formatted value is published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueConversion {
    /// The format template output, as text.
    #[default]
    String,
    /// The value truncated toward zero.
    Integer,
    /// The format template output, parsed back into a number.
    Float,
}

/// Fully resolved settings for one field or aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSettings {
    /// Output name; the raw field name when unset.
    pub name: Option<String>,
    /// Target unit; the value keeps its native unit when unset.
    pub unit: Option<String>,
    pub ignore: bool,
    pub publish_none: bool,
    pub append_unit_label: bool,
    pub conversion: ValueConversion,
    pub template: Template,
}

impl Default for FieldSettings {
    fn default() -> Self {
        Self {
            name: None,
            unit: None,
            ignore: false,
            publish_none: false,
            append_unit_label: true,
            conversion: ValueConversion::default(),
            template: Template::default(),
        }
    }
}

/// Resolves one observation into its output key and value.
///
/// `native_unit` is the unit `value` is expressed in, when known.
pub fn resolve(
    field: &str,
    value: &Value,
    native_unit: Option<&str>,
    settings: &FieldSettings,
    converter: &dyn UnitConverter,
) -> Result<(String, Value), ResolveError> {
    let unit = settings.unit.as_deref().or(native_unit);

    let mut key = settings.name.clone().unwrap_or_else(|| field.to_string());
    if settings.append_unit_label {
        if let Some(label) = unit.and_then(unit_label) {
            key = format!("{key}_{label}");
        }
    }

    if value.is_null() {
        return Ok((key, Value::Null));
    }

    let value = match settings.unit.as_deref() {
        Some(target) => {
            let from = native_unit.ok_or_else(|| ResolveError::NoNativeUnit {
                field: field.to_string(),
                unit: target.to_string(),
            })?;
            let number = value.as_f64().ok_or_else(|| not_numeric(field, value))?;
            number_value(converter.convert(number, from, target)?)
        }
        None => value.clone(),
    };

    let output = match settings.conversion {
        ValueConversion::Integer => Value::from(to_int(field, &value)?),
        ValueConversion::Float => {
            let formatted = settings.template.apply(&value)?;
            let number = formatted
                .trim()
                .parse::<f64>()
                .map_err(|_| not_numeric(field, &Value::String(formatted.clone())))?;
            number_value(number)
        }
        ValueConversion::String => Value::String(settings.template.apply(&value)?),
    };

    Ok((key, output))
}

fn not_numeric(field: &str, value: &Value) -> ResolveError {
    ResolveError::NotNumeric {
        field: field.to_string(),
        value: value.to_string(),
    }
}

/// Integer value of numbers, booleans and numeric strings, truncated
/// toward zero.
fn to_int(field: &str, value: &Value) -> Result<i64, ResolveError> {
    let number = match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Ok(i);
            }
            n.as_f64()
        }
        Value::Bool(b) => return Ok(i64::from(*b)),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number
        .filter(|n| n.is_finite())
        .map(|n| n.trunc() as i64)
        .ok_or_else(|| not_numeric(field, value))
}
