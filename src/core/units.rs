//! Unit systems, unit groups and conversion.
//!
//! Every observation belongs to a unit group (temperature, pressure, ...).
//! A unit system picks one unit per group. Converting a record between
//! systems converts each known observation from the source system's unit to
//! the target system's unit for its group. Unknown observations pass
//! through untouched.
//!
//! Conversions are linear: every unit maps to its group's base unit with
//! `base = value * factor + offset`.

use std::{collections::HashMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use thiserror::Error;

use super::record::{Packet, US_UNITS};

#[derive(Debug, Error, PartialEq)]
pub enum UnitError {
    #[error("Unknown unit '{0}'")]
    UnknownUnit(String),

    #[error("Cannot convert '{from}' to '{to}'")]
    Incompatible { from: String, to: String },

    #[error("Record has no 'usUnits' field")]
    MissingUnitSystem,

    #[error("Unknown unit system {0}")]
    UnknownUnitSystem(i64),
}

/// Standard unit systems.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitSystem {
    #[default]
    #[serde(rename = "US")]
    Us,
    #[serde(rename = "METRIC")]
    Metric,
    #[serde(rename = "METRICWX")]
    MetricWx,
}

impl UnitSystem {
    /// Numeric tag carried in the `usUnits` field.
    pub fn code(self) -> i64 {
        match self {
            UnitSystem::Us => 1,
            UnitSystem::Metric => 16,
            UnitSystem::MetricWx => 17,
        }
    }

    pub fn from_code(code: i64) -> Result<Self, UnitError> {
        match code {
            1 => Ok(UnitSystem::Us),
            16 => Ok(UnitSystem::Metric),
            17 => Ok(UnitSystem::MetricWx),
            other => Err(UnitError::UnknownUnitSystem(other)),
        }
    }

    /// Reads the unit system tag of `packet`.
    pub fn of(packet: &Packet) -> Result<Self, UnitError> {
        let code = packet
            .get(US_UNITS)
            .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
            .ok_or(UnitError::MissingUnitSystem)?;
        Self::from_code(code)
    }
}

impl fmt::Display for UnitSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UnitSystem::Us => "US",
            UnitSystem::Metric => "METRIC",
            UnitSystem::MetricWx => "METRICWX",
        })
    }
}

/// Observation categories sharing a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitGroup {
    Temperature,
    Pressure,
    Speed,
    Speed2,
    Rain,
    RainRate,
    Direction,
    Percent,
    Radiation,
    Uv,
    Time,
    Interval,
    Altitude,
    Distance,
    Count,
    Volt,
    ElapsedTime,
    Boolean,
}

/// (unit, group, factor, offset) with `base = value * factor + offset`.
const UNITS: &[(&str, UnitGroup, f64, f64)] = &[
    ("degree_C", UnitGroup::Temperature, 1.0, 0.0),
    ("degree_F", UnitGroup::Temperature, 5.0 / 9.0, -32.0 * 5.0 / 9.0),
    ("degree_K", UnitGroup::Temperature, 1.0, -273.15),
    ("mbar", UnitGroup::Pressure, 1.0, 0.0),
    ("hPa", UnitGroup::Pressure, 1.0, 0.0),
    ("kPa", UnitGroup::Pressure, 10.0, 0.0),
    ("inHg", UnitGroup::Pressure, 33.863_886_666_7, 0.0),
    ("mmHg", UnitGroup::Pressure, 1.333_223_684_2, 0.0),
    ("meter_per_second", UnitGroup::Speed, 1.0, 0.0),
    ("mile_per_hour", UnitGroup::Speed, 0.447_04, 0.0),
    ("km_per_hour", UnitGroup::Speed, 1.0 / 3.6, 0.0),
    ("knot", UnitGroup::Speed, 0.514_444_444, 0.0),
    ("meter_per_second2", UnitGroup::Speed2, 1.0, 0.0),
    ("mile_per_hour2", UnitGroup::Speed2, 0.447_04, 0.0),
    ("km_per_hour2", UnitGroup::Speed2, 1.0 / 3.6, 0.0),
    ("knot2", UnitGroup::Speed2, 0.514_444_444, 0.0),
    ("mm", UnitGroup::Rain, 1.0, 0.0),
    ("cm", UnitGroup::Rain, 10.0, 0.0),
    ("inch", UnitGroup::Rain, 25.4, 0.0),
    ("mm_per_hour", UnitGroup::RainRate, 1.0, 0.0),
    ("cm_per_hour", UnitGroup::RainRate, 10.0, 0.0),
    ("inch_per_hour", UnitGroup::RainRate, 25.4, 0.0),
    ("degree_compass", UnitGroup::Direction, 1.0, 0.0),
    ("percent", UnitGroup::Percent, 1.0, 0.0),
    ("watt_per_meter_squared", UnitGroup::Radiation, 1.0, 0.0),
    ("uv_index", UnitGroup::Uv, 1.0, 0.0),
    ("unix_epoch", UnitGroup::Time, 1.0, 0.0),
    ("minute", UnitGroup::Interval, 1.0, 0.0),
    ("meter", UnitGroup::Altitude, 1.0, 0.0),
    ("foot", UnitGroup::Altitude, 0.3048, 0.0),
    ("km", UnitGroup::Distance, 1.0, 0.0),
    ("mile", UnitGroup::Distance, 1.609_344, 0.0),
    ("count", UnitGroup::Count, 1.0, 0.0),
    ("volt", UnitGroup::Volt, 1.0, 0.0),
    ("second", UnitGroup::ElapsedTime, 1.0, 0.0),
    ("hour", UnitGroup::ElapsedTime, 3600.0, 0.0),
    ("boolean", UnitGroup::Boolean, 1.0, 0.0),
];

/// Short unit labels appended to output names. `None` means no label.
const UNIT_REDUCTIONS: &[(&str, Option<&str>)] = &[
    ("degree_F", Some("F")),
    ("degree_C", Some("C")),
    ("inch", Some("in")),
    ("mile_per_hour", Some("mph")),
    ("mile_per_hour2", Some("mph")),
    ("km_per_hour", Some("kph")),
    ("km_per_hour2", Some("kph")),
    ("knot", Some("knot")),
    ("knot2", Some("knot2")),
    ("meter_per_second", Some("mps")),
    ("meter_per_second2", Some("mps")),
    ("degree_compass", None),
    ("watt_per_meter_squared", Some("Wpm2")),
    ("uv_index", None),
    ("percent", None),
    ("unix_epoch", None),
];

/// Label for `unit` as appended to an output name.
///
/// Units in the reduction table use their short form (or none); any other
/// unit is labeled with its own name.
pub fn unit_label(unit: &str) -> Option<&str> {
    UNIT_REDUCTIONS
        .iter()
        .find(|(name, _)| *name == unit)
        .map_or(Some(unit), |(_, label)| *label)
}

fn lookup(unit: &str) -> Result<(UnitGroup, f64, f64), UnitError> {
    UNITS
        .iter()
        .find(|(name, ..)| *name == unit)
        .map(|(_, group, factor, offset)| (*group, *factor, *offset))
        .ok_or_else(|| UnitError::UnknownUnit(unit.to_string()))
}

/// Unit conversion capability consumed by the record pipeline.
pub trait UnitConverter: Send + Sync {
    /// Group of an observation, if known.
    fn group_of(&self, observation: &str) -> Option<UnitGroup>;

    /// Unit used by `system` for `group`.
    fn unit_for(&self, system: UnitSystem, group: UnitGroup) -> &'static str;

    /// Converts `value` between two units of the same group.
    fn convert(&self, value: f64, from: &str, to: &str) -> Result<f64, UnitError>;

    /// Native unit and group of `observation` in `system`.
    fn standard_unit(&self, system: UnitSystem, observation: &str) -> Option<(&'static str, UnitGroup)> {
        let group = self.group_of(observation)?;
        Some((self.unit_for(system, group), group))
    }

    /// Converts every known numeric observation of `packet` to `target` and
    /// retags `usUnits`.
    fn to_system(&self, packet: &Packet, target: UnitSystem) -> Result<Packet, UnitError> {
        let source = UnitSystem::of(packet)?;
        if source == target {
            return Ok(packet.clone());
        }

        let mut converted = Packet::with_capacity(packet.len());
        for (field, value) in packet {
            let value = if field == US_UNITS {
                Value::from(target.code())
            } else {
                match (self.group_of(field), value.as_f64()) {
                    (Some(group), Some(number)) => {
                        let from = self.unit_for(source, group);
                        let to = self.unit_for(target, group);
                        if from == to {
                            value.clone()
                        } else {
                            number_value(self.convert(number, from, to)?)
                        }
                    }
                    _ => value.clone(),
                }
            };
            converted.insert(field.clone(), value);
        }
        Ok(converted)
    }
}

/// JSON number for `value`, or null when it is not finite.
pub fn number_value(value: f64) -> Value {
    Number::from_f64(value).map_or(Value::Null, Value::Number)
}

/// The standard weather unit tables.
#[derive(Debug, Clone, Default)]
pub struct StandardUnits {
    extra: HashMap<String, UnitGroup>,
}

impl StandardUnits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or overrides) the group of an observation.
    pub fn with_observation(mut self, observation: impl Into<String>, group: UnitGroup) -> Self {
        self.extra.insert(observation.into(), group);
        self
    }
}

impl UnitConverter for StandardUnits {
    fn group_of(&self, observation: &str) -> Option<UnitGroup> {
        if let Some(group) = self.extra.get(observation) {
            return Some(*group);
        }
        use UnitGroup::*;
        let group = match observation {
            "outTemp" | "inTemp" | "dewpoint" | "heatindex" | "windchill" | "appTemp"
            | "humidex" | "extraTemp1" | "extraTemp2" | "extraTemp3" | "soilTemp1"
            | "soilTemp2" | "soilTemp3" | "soilTemp4" | "leafTemp1" | "leafTemp2" => Temperature,
            "barometer" | "pressure" | "altimeter" => Pressure,
            "windSpeed" | "windGust" => Speed,
            "rms" | "vecavg" => Speed2,
            "rain" | "hail" | "ET" | "rainTotal" => Rain,
            "rainRate" | "hailRate" => RainRate,
            "windDir" | "windGustDir" | "vecdir" => Direction,
            "outHumidity" | "inHumidity" | "extraHumid1" | "extraHumid2" | "cloudcover" => Percent,
            "radiation" | "maxSolarRad" => Radiation,
            "UV" => Uv,
            "dateTime" => Time,
            "interval" => Interval,
            "altitude" | "cloudbase" => Altitude,
            "windrun" | "lightning_distance" => Distance,
            "lightning_strike_count" => Count,
            "consBatteryVoltage" | "heatingVoltage" | "supplyVoltage" | "referenceVoltage" => Volt,
            "rainDur" | "sunshineDur" => ElapsedTime,
            _ => return None,
        };
        Some(group)
    }

    fn unit_for(&self, system: UnitSystem, group: UnitGroup) -> &'static str {
        use UnitGroup::*;
        use UnitSystem::*;
        match (group, system) {
            (Temperature, Us) => "degree_F",
            (Temperature, Metric | MetricWx) => "degree_C",
            (Pressure, Us) => "inHg",
            (Pressure, Metric | MetricWx) => "mbar",
            (Speed, Us) => "mile_per_hour",
            (Speed, Metric) => "km_per_hour",
            (Speed, MetricWx) => "meter_per_second",
            (Speed2, Us) => "mile_per_hour2",
            (Speed2, Metric) => "km_per_hour2",
            (Speed2, MetricWx) => "meter_per_second2",
            (Rain, Us) => "inch",
            (Rain, Metric) => "cm",
            (Rain, MetricWx) => "mm",
            (RainRate, Us) => "inch_per_hour",
            (RainRate, Metric) => "cm_per_hour",
            (RainRate, MetricWx) => "mm_per_hour",
            (Direction, _) => "degree_compass",
            (Percent, _) => "percent",
            (Radiation, _) => "watt_per_meter_squared",
            (Uv, _) => "uv_index",
            (Time, _) => "unix_epoch",
            (Interval, _) => "minute",
            (Altitude, Us) => "foot",
            (Altitude, Metric | MetricWx) => "meter",
            (Distance, Us) => "mile",
            (Distance, Metric | MetricWx) => "km",
            (Count, _) => "count",
            (Volt, _) => "volt",
            (ElapsedTime, _) => "second",
            (Boolean, _) => "boolean",
        }
    }

    fn convert(&self, value: f64, from: &str, to: &str) -> Result<f64, UnitError> {
        if from == to {
            return Ok(value);
        }
        let (from_group, from_factor, from_offset) = lookup(from)?;
        let (to_group, to_factor, to_offset) = lookup(to)?;
        if from_group != to_group {
            return Err(UnitError::Incompatible {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        let base = value * from_factor + from_offset;
        Ok((base - to_offset) / to_factor)
    }
}
