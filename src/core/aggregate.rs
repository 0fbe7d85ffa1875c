//! Aggregates over historical summary records.
//!
//! The record transformer consumes aggregation through the [`Aggregator`]
//! trait. [`ArchiveAggregator`] is the in-memory implementation: it keeps the
//! summary records it is shown, normalized to US units, and computes
//! aggregates over any span it still retains.

use std::{
    collections::{BTreeMap, HashSet},
    fmt,
    str::FromStr,
    sync::{Arc, RwLock},
};

use thiserror::Error;
use tracing::{debug, warn};

use super::{
    period::TimeSpan,
    record::{time_stamp_of, Packet},
    units::{UnitConverter, UnitGroup, UnitSystem},
};

/// Summary records older than this (relative to the newest) are dropped.
const RETENTION_SECS: i64 = 367 * 86_400;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AggregateError {
    #[error("Unknown aggregation type '{0}'")]
    UnknownAggregation(String),

    #[error("Unknown observation type '{0}'")]
    UnknownType(String),

    #[error("Cannot calculate '{aggregation}' of '{observation}'")]
    CannotCalculate {
        observation: String,
        aggregation: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Min,
    Max,
    Sum,
    Avg,
    Count,
    First,
    Last,
    MinTime,
    MaxTime,
    NotNull,
}

impl Aggregation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Min => "min",
            Aggregation::Max => "max",
            Aggregation::Sum => "sum",
            Aggregation::Avg => "avg",
            Aggregation::Count => "count",
            Aggregation::First => "first",
            Aggregation::Last => "last",
            Aggregation::MinTime => "mintime",
            Aggregation::MaxTime => "maxtime",
            Aggregation::NotNull => "not_null",
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Aggregation {
    type Err = AggregateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "min" => Aggregation::Min,
            "max" => Aggregation::Max,
            "sum" => Aggregation::Sum,
            "avg" => Aggregation::Avg,
            "count" => Aggregation::Count,
            "first" => Aggregation::First,
            "last" => Aggregation::Last,
            "mintime" => Aggregation::MinTime,
            "maxtime" => Aggregation::MaxTime,
            "not_null" => Aggregation::NotNull,
            _ => return Err(AggregateError::UnknownAggregation(s.to_string())),
        })
    }
}

/// Result of an aggregation, with the unit it is expressed in.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateValue {
    /// `None` when the span holds no data.
    pub value: Option<f64>,
    pub unit: Option<&'static str>,
    pub group: Option<UnitGroup>,
}

/// Aggregation capability consumed by the record transformer.
pub trait Aggregator: Send + Sync {
    fn aggregate(
        &self,
        observation: &str,
        span: TimeSpan,
        aggregation: &str,
    ) -> Result<AggregateValue, AggregateError>;

    /// Offers a summary record for later aggregation.
    fn observe(&self, _record: &Packet) {}
}

#[derive(Debug, Default)]
struct Store {
    records: BTreeMap<i64, Packet>,
    observations: HashSet<String>,
}

/// In-memory aggregation over retained summary records.
pub struct ArchiveAggregator {
    converter: Arc<dyn UnitConverter>,
    store: RwLock<Store>,
}

impl ArchiveAggregator {
    pub fn new(converter: Arc<dyn UnitConverter>) -> Self {
        Self {
            converter,
            store: RwLock::new(Store::default()),
        }
    }

    /// Number of retained records.
    pub fn len(&self) -> usize {
        self.read(|store| store.records.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read<R>(&self, f: impl FnOnce(&Store) -> R) -> R {
        let store = self.store.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&store)
    }

    fn write<R>(&self, f: impl FnOnce(&mut Store) -> R) -> R {
        let mut store = self.store.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut store)
    }
}

impl Aggregator for ArchiveAggregator {
    fn aggregate(
        &self,
        observation: &str,
        span: TimeSpan,
        aggregation: &str,
    ) -> Result<AggregateValue, AggregateError> {
        let aggregation: Aggregation = aggregation.parse()?;

        let (values, present) = self.read(|store| {
            if !store.observations.contains(observation) {
                return Err(AggregateError::UnknownType(observation.to_string()));
            }
            let mut values = Vec::new();
            let mut present = 0usize;
            for (ts, record) in store.records.range(span.start + 1..=span.stop) {
                match record.get(observation) {
                    Some(value) if !value.is_null() => {
                        present += 1;
                        if let Some(number) = value.as_f64() {
                            values.push((*ts, number));
                        }
                    }
                    _ => {}
                }
            }
            Ok((values, present))
        })?;

        let counts_only = matches!(aggregation, Aggregation::Count | Aggregation::NotNull);
        if present > 0 && values.is_empty() && !counts_only {
            return Err(AggregateError::CannotCalculate {
                observation: observation.to_string(),
                aggregation: aggregation.to_string(),
            });
        }

        let group = self.converter.group_of(observation);
        let native = group.map(|g| (self.converter.unit_for(UnitSystem::Us, g), g));
        let of_observation = |value: Option<f64>| AggregateValue {
            value,
            unit: native.map(|(unit, _)| unit),
            group: native.map(|(_, group)| group),
        };
        let with_group = |value: Option<f64>, group: UnitGroup| AggregateValue {
            value,
            unit: Some(self.converter.unit_for(UnitSystem::Us, group)),
            group: Some(group),
        };

        let min = || values.iter().copied().min_by(|a, b| a.1.total_cmp(&b.1));
        let max = || values.iter().copied().max_by(|a, b| a.1.total_cmp(&b.1));

        let result = match aggregation {
            Aggregation::Min => of_observation(min().map(|(_, v)| v)),
            Aggregation::Max => of_observation(max().map(|(_, v)| v)),
            Aggregation::Sum => {
                of_observation((!values.is_empty()).then(|| values.iter().map(|(_, v)| v).sum()))
            }
            Aggregation::Avg => of_observation((!values.is_empty()).then(|| {
                values.iter().map(|(_, v)| v).sum::<f64>() / values.len() as f64
            })),
            Aggregation::First => of_observation(values.first().map(|(_, v)| *v)),
            Aggregation::Last => of_observation(values.last().map(|(_, v)| *v)),
            Aggregation::Count => with_group(Some(present as f64), UnitGroup::Count),
            Aggregation::MinTime => with_group(min().map(|(ts, _)| ts as f64), UnitGroup::Time),
            Aggregation::MaxTime => with_group(max().map(|(ts, _)| ts as f64), UnitGroup::Time),
            Aggregation::NotNull => {
                with_group(Some(f64::from(u8::from(present > 0))), UnitGroup::Boolean)
            }
        };

        debug!(
            "Aggregate {aggregation} of {observation} over ({}, {}]: {:?}",
            span.start, span.stop, result.value
        );
        Ok(result)
    }

    fn observe(&self, record: &Packet) {
        let Some(time_stamp) = time_stamp_of(record) else {
            warn!("Summary record without timestamp not retained for aggregation");
            return;
        };
        let normalized = match self.converter.to_system(record, UnitSystem::Us) {
            Ok(normalized) => normalized,
            Err(e) => {
                warn!("Summary record {time_stamp} not retained for aggregation: {e}");
                return;
            }
        };

        self.write(|store| {
            store.observations.extend(normalized.keys().cloned());
            store.records.insert(time_stamp, normalized);

            let newest = store.records.keys().next_back().copied().unwrap_or(time_stamp);
            store.records = store.records.split_off(&(newest - RETENTION_SECS));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::units::StandardUnits;

    const BASE: i64 = 1_700_000_000;

    fn record(text: &str) -> Packet {
        serde_json::from_str(text).unwrap()
    }

    fn aggregator() -> ArchiveAggregator {
        let aggregator = ArchiveAggregator::new(Arc::new(StandardUnits::new()));
        aggregator.observe(&record(
            r#"{"dateTime": 1700000300, "usUnits": 1, "outTemp": 70.0, "rain": 0.1}"#,
        ));
        aggregator.observe(&record(
            r#"{"dateTime": 1700000600, "usUnits": 1, "outTemp": 75.0, "rain": null}"#,
        ));
        aggregator.observe(&record(
            r#"{"dateTime": 1700000900, "usUnits": 16, "outTemp": 20.0, "rain": 0.254}"#,
        ));
        aggregator
    }

    fn value(aggregator: &ArchiveAggregator, obs: &str, how: &str) -> Option<f64> {
        aggregator
            .aggregate(obs, TimeSpan::new(BASE, BASE + 3600), how)
            .unwrap()
            .value
    }

    #[test]
    fn test_basic_aggregations() {
        let aggregator = aggregator();
        // 20 C is normalized to 68 F.
        assert!((value(&aggregator, "outTemp", "min").unwrap() - 68.0).abs() < 1e-9);
        assert_eq!(value(&aggregator, "outTemp", "max"), Some(75.0));
        assert_eq!(value(&aggregator, "outTemp", "first"), Some(70.0));
        assert!((value(&aggregator, "rain", "sum").unwrap() - 0.2).abs() < 1e-9);
        assert_eq!(value(&aggregator, "rain", "count"), Some(2.0));
        assert_eq!(value(&aggregator, "outTemp", "maxtime"), Some(1_700_000_600.0));
        assert_eq!(value(&aggregator, "rain", "not_null"), Some(1.0));
    }

    #[test]
    fn test_result_carries_us_unit() {
        let result = aggregator()
            .aggregate("outTemp", TimeSpan::new(BASE, BASE + 3600), "avg")
            .unwrap();
        assert_eq!(result.unit, Some("degree_F"));
        assert_eq!(result.group, Some(UnitGroup::Temperature));

        let result = aggregator()
            .aggregate("outTemp", TimeSpan::new(BASE, BASE + 3600), "mintime")
            .unwrap();
        assert_eq!(result.unit, Some("unix_epoch"));
    }

    #[test]
    fn test_span_excludes_start() {
        let aggregator = aggregator();
        let result = aggregator
            .aggregate("outTemp", TimeSpan::new(1_700_000_300, 1_700_000_600), "first")
            .unwrap();
        assert_eq!(result.value, Some(75.0));
    }

    #[test]
    fn test_empty_span_is_null() {
        let result = aggregator()
            .aggregate("outTemp", TimeSpan::new(0, 100), "max")
            .unwrap();
        assert_eq!(result.value, None);
    }

    #[test]
    fn test_unknown_inputs() {
        let aggregator = aggregator();
        let span = TimeSpan::new(BASE, BASE + 3600);
        assert_eq!(
            aggregator.aggregate("outTemp", span, "median").unwrap_err(),
            AggregateError::UnknownAggregation("median".into())
        );
        assert_eq!(
            aggregator.aggregate("soilMoist1", span, "max").unwrap_err(),
            AggregateError::UnknownType("soilMoist1".into())
        );
    }

    #[test]
    fn test_old_records_are_dropped() {
        let aggregator = aggregator();
        assert_eq!(aggregator.len(), 3);
        aggregator.observe(&record(&format!(
            r#"{{"dateTime": {}, "usUnits": 1, "outTemp": 50.0}}"#,
            BASE + RETENTION_SECS + 1000
        )));
        assert_eq!(aggregator.len(), 1);
    }

    #[test]
    fn test_records_without_units_are_skipped() {
        let aggregator = ArchiveAggregator::new(Arc::new(StandardUnits::new()));
        aggregator.observe(&record(r#"{"dateTime": 1700000300, "outTemp": 70.0}"#));
        assert!(aggregator.is_empty());
    }
}
