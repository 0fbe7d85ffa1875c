//! Record transformer: turns a raw record into the mapping published for
//! one topic.
//!
//! The whole record is first converted to the topic's unit system. Every
//! field is then resolved with its effective settings, in record order.
//! Configured aggregates are computed and resolved afterwards. An aggregate
//! whose key equals a field key replaces that field's value.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use super::{
    aggregate::Aggregator,
    period::PeriodTable,
    record::{time_stamp_of, Packet},
    registry::{AggregateConfig, TopicConfig},
    resolver::resolve,
    units::{number_value, UnitConverter, UnitError},
};

#[derive(Debug, Error, PartialEq)]
pub enum TransformError {
    #[error("Topic '{topic}': {source}")]
    Units {
        topic: String,
        #[source]
        source: UnitError,
    },
}

/// Applies topic settings to records. Shared read-only by the worker.
pub struct Transformer {
    converter: Arc<dyn UnitConverter>,
    aggregator: Arc<dyn Aggregator>,
    periods: PeriodTable,
}

impl Transformer {
    pub fn new(
        converter: Arc<dyn UnitConverter>,
        aggregator: Arc<dyn Aggregator>,
        periods: PeriodTable,
    ) -> Self {
        Self {
            converter,
            aggregator,
            periods,
        }
    }

    /// Transforms `record` for `topic`.
    ///
    /// Fails only when the record cannot be converted to the topic's unit
    /// system. Fields and aggregates that cannot be resolved are logged and
    /// left out.
    pub fn transform(&self, topic: &TopicConfig, record: &Packet) -> Result<Packet, TransformError> {
        let record = self
            .converter
            .to_system(record, topic.unit_system)
            .map_err(|source| TransformError::Units {
                topic: topic.name.clone(),
                source,
            })?;

        let mut output = Packet::with_capacity(record.len() + topic.aggregates.len());
        for (field, value) in &record {
            let settings = topic.field(field);
            if settings.ignore || (value.is_null() && !settings.publish_none) {
                continue;
            }
            let native = self
                .converter
                .standard_unit(topic.unit_system, field)
                .map(|(unit, _)| unit);
            match resolve(field, value, native, settings, self.converter.as_ref()) {
                Ok((key, value)) => {
                    output.insert(key, value);
                }
                Err(e) => warn!("Topic '{}': field '{field}' skipped: {e}", topic.name),
            }
        }

        if topic.aggregates.is_empty() {
            return Ok(output);
        }
        let Some(time_stamp) = time_stamp_of(&record) else {
            warn!("Topic '{}': record has no timestamp, aggregates skipped", topic.name);
            return Ok(output);
        };
        for (name, aggregate) in &topic.aggregates {
            if let Some((key, value)) = self.aggregate(topic, name, aggregate, time_stamp) {
                output.insert(key, value);
            }
        }

        Ok(output)
    }

    fn aggregate(
        &self,
        topic: &TopicConfig,
        name: &str,
        aggregate: &AggregateConfig,
        time_stamp: i64,
    ) -> Option<(String, Value)> {
        let settings = &aggregate.settings;
        if settings.ignore {
            return None;
        }

        let span = self
            .periods
            .span(aggregate.period, time_stamp)
            .map_err(|e| warn!("Topic '{}': aggregate '{name}' skipped: {e}", topic.name))
            .ok()?;
        let result = self
            .aggregator
            .aggregate(&aggregate.observation, span, &aggregate.aggregation)
            .map_err(|e| warn!("Topic '{}': aggregate '{name}' skipped: {e}", topic.name))
            .ok()?;

        let target = result
            .group
            .map(|group| self.converter.unit_for(topic.unit_system, group));
        let (value, unit) = match (result.value, result.unit, target) {
            (Some(value), Some(from), Some(to)) => {
                let converted = self
                    .converter
                    .convert(value, from, to)
                    .map_err(|e| warn!("Topic '{}': aggregate '{name}' skipped: {e}", topic.name))
                    .ok()?;
                (number_value(converted), Some(to))
            }
            (value, unit, target) => (
                value.map_or(Value::Null, number_value),
                target.or(unit),
            ),
        };

        if value.is_null() && !settings.publish_none {
            return None;
        }

        resolve(name, &value, unit, settings, self.converter.as_ref())
            .map_err(|e| warn!("Topic '{}': aggregate '{name}' skipped: {e}", topic.name))
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        config::publish::PublishConfig,
        core::{aggregate::ArchiveAggregator, registry::build_topics, units::StandardUnits},
    };

    fn topic(text: &str) -> Arc<TopicConfig> {
        let config: PublishConfig = toml::from_str(text).unwrap();
        let topics = build_topics(&config).unwrap();
        topics.live.values().next().unwrap().clone()
    }

    fn record(text: &str) -> Packet {
        serde_json::from_str(text).unwrap()
    }

    fn transformer() -> (Transformer, Arc<ArchiveAggregator>) {
        let units = Arc::new(StandardUnits::new());
        let aggregator = Arc::new(ArchiveAggregator::new(units.clone()));
        aggregator.observe(&record(
            r#"{"dateTime": 1699999800, "usUnits": 1, "outTemp": 75.0}"#,
        ));
        aggregator.observe(&record(
            r#"{"dateTime": 1699999500, "usUnits": 1, "outTemp": 61.0}"#,
        ));
        let transformer = Transformer::new(units, aggregator.clone(), PeriodTable::utc());
        (transformer, aggregator)
    }

    const LOOP: &str = r#"{"dateTime": 1700000000, "usUnits": 1, "outTemp": 72.5}"#;

    #[test]
    fn test_default_topic_labels_and_formats() {
        let (transformer, _) = transformer();
        let output = transformer
            .transform(&topic(r#"[topics."test/loop"]"#), &record(LOOP))
            .unwrap();

        let keys: Vec<&str> = output.keys().map(String::as_str).collect();
        assert_eq!(keys, ["dateTime", "usUnits", "outTemp_F"]);
        assert_eq!(output["outTemp_F"], json!("72.5"));
        assert_eq!(output["dateTime"], json!("1700000000"));
    }

    #[test]
    fn test_ignored_fields_never_appear() {
        let (transformer, _) = transformer();
        let topic = topic(
            r#"
            [topics."test/loop".fields.dateTime]
            ignore = true
            [topics."test/loop".fields.usUnits]
            ignore = true
            "#,
        );
        let output = transformer.transform(&topic, &record(LOOP)).unwrap();
        assert_eq!(output.keys().collect::<Vec<_>>(), ["outTemp_F"]);
    }

    #[test]
    fn test_ignore_everything_but_selected_fields() {
        let (transformer, _) = transformer();
        let topic = topic(
            r#"
            [topics."test/loop"]
            ignore = true
            [topics."test/loop".fields.outTemp]
            ignore = false
            name = "temperature"
            "#,
        );
        let output = transformer.transform(&topic, &record(LOOP)).unwrap();
        assert_eq!(output.keys().collect::<Vec<_>>(), ["temperature_F"]);
    }

    #[test]
    fn test_null_values() {
        let (transformer, _) = transformer();
        let packet = record(r#"{"dateTime": 1700000000, "usUnits": 1, "rain": null}"#);

        let output = transformer
            .transform(&topic(r#"[topics."test/loop"]"#), &packet)
            .unwrap();
        assert!(!output.contains_key("rain_in"));

        let output = transformer
            .transform(
                &topic(
                    r#"
                    [topics."test/loop"]
                    publish_none_value = true
                    "#,
                ),
                &packet,
            )
            .unwrap();
        assert_eq!(output["rain_in"], Value::Null);
    }

    #[test]
    fn test_converts_to_topic_unit_system() {
        let (transformer, _) = transformer();
        let topic = topic(
            r#"
            [topics."test/loop"]
            unit_system = "METRIC"
            [topics."test/loop".fields.outTemp]
            format = "%.1f"
            "#,
        );
        let packet = record(r#"{"dateTime": 1700000000, "usUnits": 1, "outTemp": 212.0}"#);
        let output = transformer.transform(&topic, &packet).unwrap();
        assert_eq!(output["outTemp_C"], json!("100.0"));
        assert_eq!(output["usUnits"], json!("16"));
    }

    #[test]
    fn test_metric_topic_keeps_integer_fields() {
        let (transformer, _) = transformer();
        let topic = topic(
            r#"
            [topics."test/loop"]
            unit_system = "METRIC"
            "#,
        );
        let packet = record(
            r#"{"dateTime": 1700000000, "usUnits": 1, "windDir": 90, "outTemp": 72.5}"#,
        );
        let output = transformer.transform(&topic, &packet).unwrap();
        assert_eq!(output["dateTime"], json!("1700000000"));
        assert_eq!(output["windDir"], json!("90"));
        assert_eq!(output["usUnits"], json!("16"));
        assert_eq!(output["outTemp_C"], json!("22.5"));
    }

    #[test]
    fn test_aggregates_follow_fields() {
        let (transformer, _) = transformer();
        let topic = topic(
            r#"
            [topics."test/loop".aggregates.outTempMax]
            observation = "outTemp"
            aggregation = "max"
            period = "hour"
            [topics."test/loop".aggregates.outTempMin]
            observation = "outTemp"
            aggregation = "min"
            period = "day"
            unit = "degree_C"
            format = "%.1f"
            "#,
        );
        let output = transformer.transform(&topic, &record(LOOP)).unwrap();
        let keys: Vec<&str> = output.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            ["dateTime", "usUnits", "outTemp_F", "outTempMax_F", "outTempMin_C"]
        );
        assert_eq!(output["outTempMax_F"], json!("75.0"));
        assert_eq!(output["outTempMin_C"], json!("16.1"));
    }

    #[test]
    fn test_aggregate_overwrites_field_with_same_key() {
        let (transformer, _) = transformer();
        let topic = topic(
            r#"
            [topics."test/loop".aggregates.outTemp]
            observation = "outTemp"
            aggregation = "max"
            period = "day"
            "#,
        );
        let output = transformer.transform(&topic, &record(LOOP)).unwrap();
        assert_eq!(output.len(), 3);
        assert_eq!(output["outTemp_F"], json!("75.0"));
    }

    #[traced_test]
    #[test]
    fn test_failed_aggregate_is_skipped() {
        let (transformer, _) = transformer();
        let topic = topic(
            r#"
            [topics."test/loop".aggregates.soil]
            observation = "soilMoist1"
            aggregation = "max"
            period = "day"
            [topics."test/loop".aggregates.outTempMax]
            observation = "outTemp"
            aggregation = "max"
            period = "day"
            "#,
        );
        let output = transformer.transform(&topic, &record(LOOP)).unwrap();
        assert!(!output.contains_key("soil"));
        assert!(output.contains_key("outTempMax_F"));
        assert!(logs_contain("aggregate 'soil' skipped"));
    }

    #[test]
    fn test_empty_aggregate_is_null() {
        let units = Arc::new(StandardUnits::new());
        let aggregator = Arc::new(ArchiveAggregator::new(units.clone()));
        aggregator.observe(&record(
            r#"{"dateTime": 1600000000, "usUnits": 1, "outTemp": 75.0}"#,
        ));
        let transformer = Transformer::new(units, aggregator, PeriodTable::utc());
        let topic = topic(
            r#"
            [topics."test/loop"]
            publish_none_value = true
            [topics."test/loop".aggregates.outTempMax]
            observation = "outTemp"
            aggregation = "max"
            period = "hour"
            "#,
        );
        let output = transformer.transform(&topic, &record(LOOP)).unwrap();
        assert_eq!(output["outTempMax_F"], Value::Null);
    }

    #[test]
    fn test_transform_is_idempotent() {
        let (transformer, _) = transformer();
        let topic = topic(r#"[topics."test/loop"]"#);
        let packet = record(LOOP);
        assert_eq!(
            transformer.transform(&topic, &packet).unwrap(),
            transformer.transform(&topic, &packet).unwrap()
        );
    }

    #[test]
    fn test_record_without_unit_system_fails() {
        let (transformer, _) = transformer();
        let err = transformer
            .transform(
                &topic(r#"[topics."test/loop"]"#),
                &record(r#"{"dateTime": 1700000000, "outTemp": 72.5}"#),
            )
            .unwrap_err();
        assert!(matches!(err, TransformError::Units { .. }));
    }
}
