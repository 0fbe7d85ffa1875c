//! Topic registry: the validated, immutable per-topic publishing settings.
//!
//! [`build_topics`] runs once at startup. Every option is resolved through
//! three layers: the topic section, the service-level default under
//! `[publish]`, then a hard-coded default. Field and aggregate sections are
//! layered on top of the resolved topic defaults. Any inconsistency is a
//! [`ConfigError`]; nothing is deferred to publish time.

use std::{fmt, sync::Arc};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    format::{FormatError, Template},
    period::Period,
    record::StreamKind,
    resolver::FieldSettings,
    units::UnitSystem,
};
use crate::config::{
    publish::{BindingSpec, FieldSection, PublishConfig, TopicOptions, TopicSection},
    ConfigError,
};

/// Streams a topic or the service is bound to when nothing is configured.
const DEFAULT_BINDING: [StreamKind; 2] = [StreamKind::Summary, StreamKind::Live];

/// How a transformed record is shaped into messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadKind {
    /// One JSON object per record.
    #[default]
    #[serde(rename = "json", alias = "structured")]
    Structured,

    /// One `key=value, key=value` message per record.
    #[serde(rename = "keyword", alias = "delimited")]
    Delimited,

    /// One message per field on `<topic>/<field>`.
    #[serde(rename = "individual", alias = "per-field")]
    PerField,
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PayloadKind::Structured => "json",
            PayloadKind::Delimited => "keyword",
            PayloadKind::PerField => "individual",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateConfig {
    pub settings: FieldSettings,
    pub observation: String,
    pub aggregation: String,
    pub period: Period,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopicConfig {
    pub name: String,
    pub kind: PayloadKind,
    pub qos: u8,
    pub retain: bool,
    pub unit_system: UnitSystem,
    pub guarantee_delivery: bool,
    /// Settings for fields without their own section.
    pub defaults: FieldSettings,
    pub fields: IndexMap<String, FieldSettings>,
    pub aggregates: IndexMap<String, AggregateConfig>,
}

impl TopicConfig {
    /// Effective settings for `field`.
    pub fn field(&self, field: &str) -> &FieldSettings {
        self.fields.get(field).unwrap_or(&self.defaults)
    }
}

/// Published topics per stream.
#[derive(Debug, Clone, Default)]
pub struct Topics {
    pub live: IndexMap<String, Arc<TopicConfig>>,
    pub summary: IndexMap<String, Arc<TopicConfig>>,
}

impl Topics {
    pub fn for_kind(&self, kind: StreamKind) -> &IndexMap<String, Arc<TopicConfig>> {
        match kind {
            StreamKind::Live => &self.live,
            StreamKind::Summary => &self.summary,
        }
    }

    fn for_kind_mut(&mut self, kind: StreamKind) -> &mut IndexMap<String, Arc<TopicConfig>> {
        match kind {
            StreamKind::Live => &mut self.live,
            StreamKind::Summary => &mut self.summary,
        }
    }
}

/// Stream kinds named by `binding`, or both when unset.
pub fn bindings(binding: Option<&BindingSpec>) -> Result<Vec<StreamKind>, ConfigError> {
    let Some(binding) = binding else {
        return Ok(DEFAULT_BINDING.to_vec());
    };
    let mut kinds = Vec::new();
    for name in binding.names() {
        let kind = name
            .parse::<StreamKind>()
            .map_err(|_| ConfigError::UnknownBinding(name.clone()))?;
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    Ok(kinds)
}

/// Builds the live and summary topic sets from the `[publish]` section.
pub fn build_topics(config: &PublishConfig) -> Result<Topics, ConfigError> {
    let sections = config
        .topics
        .as_ref()
        .filter(|topics| !topics.is_empty())
        .ok_or(ConfigError::MissingTopics)?;

    let mut topics = Topics::default();
    for (name, section) in sections {
        let binding = bindings(section.binding.as_ref().or(config.binding.as_ref()))?;
        let topic = build_topic(name, section, &config.defaults)?;

        if !section.publish.unwrap_or(true) {
            debug!("Topic '{name}' is not published");
            continue;
        }
        if topic.guarantee_delivery && topic.qos == 0 {
            return Err(ConfigError::GuaranteeDeliveryQos(name.clone()));
        }

        let topic = Arc::new(topic);
        for kind in binding {
            topics.for_kind_mut(kind).insert(name.clone(), topic.clone());
        }
    }

    debug!("Loop topics: {:?}", topics.live.keys().collect::<Vec<_>>());
    debug!("Archive topics: {:?}", topics.summary.keys().collect::<Vec<_>>());
    Ok(topics)
}

/// Topic options resolved through the topic and service levels.
struct Cascade<'a> {
    topic: &'a TopicOptions,
    service: &'a TopicOptions,
}

impl<'a> Cascade<'a> {
    fn get<T>(&self, pick: impl Fn(&'a TopicOptions) -> Option<T>) -> Option<T> {
        pick(self.topic).or_else(|| pick(self.service))
    }

    fn field_defaults(&self) -> Result<FieldSettings, ConfigError> {
        let template = match self.get(|o| o.format.as_deref()) {
            Some(source) => template(source)?,
            None => Template::default(),
        };
        Ok(FieldSettings {
            name: None,
            unit: None,
            ignore: self.get(|o| o.ignore).unwrap_or(false),
            publish_none: self.get(|o| o.publish_none_value).unwrap_or(false),
            append_unit_label: self.get(|o| o.append_unit_label).unwrap_or(true),
            conversion: self.get(|o| o.conversion_type).unwrap_or_default(),
            template,
        })
    }
}

/// `section` layered over `base`.
fn overlay(base: &FieldSettings, section: &FieldSection) -> Result<FieldSettings, ConfigError> {
    let template = match section.format.as_deref() {
        Some(source) => template(source)?,
        None => base.template.clone(),
    };
    Ok(FieldSettings {
        name: section.name.clone(),
        unit: section.unit.clone(),
        ignore: section.ignore.unwrap_or(base.ignore),
        publish_none: section.publish_none_value.unwrap_or(base.publish_none),
        append_unit_label: section.append_unit_label.unwrap_or(base.append_unit_label),
        conversion: section.conversion_type.unwrap_or(base.conversion),
        template,
    })
}

fn template(source: &str) -> Result<Template, ConfigError> {
    Template::parse(source).map_err(|e| match e {
        FormatError::Invalid { template, reason } => ConfigError::InvalidFormat { template, reason },
        other => ConfigError::InvalidFormat {
            template: source.to_string(),
            reason: other.to_string(),
        },
    })
}

fn build_topic(
    name: &str,
    section: &TopicSection,
    service: &TopicOptions,
) -> Result<TopicConfig, ConfigError> {
    let options = Cascade {
        topic: &section.options,
        service,
    };

    let qos = options.get(|o| o.qos).unwrap_or(0);
    if qos > 2 {
        return Err(ConfigError::InvalidQos {
            topic: name.to_string(),
            qos,
        });
    }

    let defaults = options.field_defaults()?;

    let mut fields = IndexMap::with_capacity(section.fields.len());
    for (field, field_section) in &section.fields {
        fields.insert(field.clone(), overlay(&defaults, field_section)?);
    }

    let mut aggregates = IndexMap::with_capacity(section.aggregates.len());
    for (aggregate, aggregate_section) in &section.aggregates {
        if !aggregate_section.enable.unwrap_or(true) {
            debug!("Aggregate '{aggregate}' of topic '{name}' is disabled");
            continue;
        }
        let missing = |option| ConfigError::MissingAggregateOption {
            topic: name.to_string(),
            aggregate: aggregate.clone(),
            option,
        };

        let period = aggregate_section
            .period
            .as_deref()
            .ok_or_else(|| missing("period"))?;
        let period = period
            .parse::<Period>()
            .map_err(|_| ConfigError::InvalidPeriod(period.to_string()))?;
        let observation = aggregate_section
            .observation
            .clone()
            .ok_or_else(|| missing("observation"))?;
        let aggregation = aggregate_section
            .aggregation
            .clone()
            .ok_or_else(|| missing("aggregation"))?;

        aggregates.insert(
            aggregate.clone(),
            AggregateConfig {
                settings: overlay(&defaults, &aggregate_section.field)?,
                observation,
                aggregation,
                period,
            },
        );
    }

    Ok(TopicConfig {
        name: name.to_string(),
        kind: options.get(|o| o.payload_type).unwrap_or_default(),
        qos,
        retain: options.get(|o| o.retain).unwrap_or(false),
        unit_system: options.get(|o| o.unit_system).unwrap_or_default(),
        guarantee_delivery: section.guarantee_delivery.unwrap_or(false),
        defaults,
        fields,
        aggregates,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::resolver::ValueConversion;

    fn config(text: &str) -> PublishConfig {
        toml::from_str(text).unwrap()
    }

    #[test]
    fn test_topics_are_required() {
        assert!(matches!(
            build_topics(&config("")),
            Err(ConfigError::MissingTopics)
        ));
        let err = build_topics(&config("[topics]")).unwrap_err();
        assert_eq!(err.to_string(), "[[topics]] is required.");
    }

    #[test]
    fn test_hard_coded_defaults() {
        let topics = build_topics(&config(r#"[topics."weather"]"#)).unwrap();
        let topic = &topics.live["weather"];
        assert_eq!(topic.kind, PayloadKind::Structured);
        assert_eq!(topic.qos, 0);
        assert!(!topic.retain);
        assert_eq!(topic.unit_system, UnitSystem::Us);
        assert!(!topic.guarantee_delivery);
        assert_eq!(topic.defaults, FieldSettings::default());
        assert!(topics.summary.contains_key("weather"));
    }

    #[test]
    fn test_three_level_cascade() {
        let topics = build_topics(&config(
            r#"
            qos = 1
            retain = true
            format = "%.1f"
            append_unit_label = false

            [topics."weather/a"]
            retain = false
            type = "individual"

            [topics."weather/a".fields.outTemp]
            format = "%.2f"
            conversion_type = "float"

            [topics."weather/b"]
            qos = 2
            "#,
        ))
        .unwrap();

        let a = &topics.live["weather/a"];
        assert_eq!(a.qos, 1);
        assert!(!a.retain);
        assert_eq!(a.kind, PayloadKind::PerField);
        assert_eq!(a.defaults.template.as_str(), "%.1f");
        assert!(!a.defaults.append_unit_label);

        let out_temp = a.field("outTemp");
        assert_eq!(out_temp.template.as_str(), "%.2f");
        assert_eq!(out_temp.conversion, ValueConversion::Float);
        assert!(!out_temp.append_unit_label);
        assert_eq!(a.field("barometer"), &a.defaults);

        let b = &topics.live["weather/b"];
        assert_eq!(b.qos, 2);
        assert!(b.retain);
    }

    #[test]
    fn test_ignore_and_publish_none_cascade() {
        let topics = build_topics(&config(
            r#"
            ignore = true
            [topics."weather"]
            publish_none_value = true
            [topics."weather".fields.outTemp]
            ignore = false
            "#,
        ))
        .unwrap();
        let topic = &topics.live["weather"];
        assert!(topic.defaults.ignore);
        assert!(topic.defaults.publish_none);
        assert!(!topic.field("outTemp").ignore);
    }

    #[test]
    fn test_binding_selects_streams() {
        let topics = build_topics(&config(
            r#"
            binding = "archive"
            [topics."weather/archive"]
            [topics."weather/loop"]
            binding = ["loop"]
            [topics."weather/hidden"]
            publish = false
            "#,
        ))
        .unwrap();
        assert_eq!(topics.summary.keys().collect::<Vec<_>>(), ["weather/archive"]);
        assert_eq!(topics.live.keys().collect::<Vec<_>>(), ["weather/loop"]);
        assert!(topics.for_kind(StreamKind::Live).contains_key("weather/loop"));
    }

    #[test]
    fn test_unknown_binding() {
        let err = build_topics(&config(
            r#"
            [topics."weather"]
            binding = "loop, hourly"
            "#,
        ))
        .unwrap_err();
        assert_eq!(err.to_string(), "Invalid 'binding', hourly");
    }

    #[test]
    fn test_guarantee_delivery_needs_qos() {
        let err = build_topics(&config(
            r#"
            [topics."weather"]
            guarantee_delivery = true
            "#,
        ))
        .unwrap_err();
        assert!(err
            .to_string()
            .contains("QOS must be greater than 0 to guarantee delivery."));

        let topics = build_topics(&config(
            r#"
            [topics."weather"]
            guarantee_delivery = true
            qos = 1
            "#,
        ))
        .unwrap();
        assert!(topics.live["weather"].guarantee_delivery);
    }

    #[test]
    fn test_unknown_period_is_fatal() {
        let err = build_topics(&config(
            r#"
            [topics."weather".aggregates.outTempMax]
            observation = "outTemp"
            aggregation = "max"
            period = "fortnight"
            "#,
        ))
        .unwrap_err();
        assert!(matches!(&err, ConfigError::InvalidPeriod(p) if p == "fortnight"));
        assert_eq!(err.to_string(), "Invalid 'period', fortnight");
    }

    #[test]
    fn test_disabled_aggregates_are_skipped() {
        let topics = build_topics(&config(
            r#"
            [topics."weather".aggregates.broken]
            enable = false
            period = "fortnight"
            [topics."weather".aggregates.dayRain]
            observation = "rain"
            aggregation = "sum"
            period = "day"
            name = "rainToday"
            "#,
        ))
        .unwrap();
        let topic = &topics.live["weather"];
        assert_eq!(topic.aggregates.len(), 1);
        let day_rain = &topic.aggregates["dayRain"];
        assert_eq!(day_rain.period, Period::Day);
        assert_eq!(day_rain.settings.name.as_deref(), Some("rainToday"));
    }

    #[test]
    fn test_aggregate_requires_observation() {
        let err = build_topics(&config(
            r#"
            [topics."weather".aggregates.dayRain]
            aggregation = "sum"
            period = "day"
            "#,
        ))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingAggregateOption {
                option: "observation",
                ..
            }
        ));
    }

    #[test]
    fn test_invalid_format_and_qos() {
        let err = build_topics(&config(
            r#"
            [topics."weather".fields.outTemp]
            format = "%q"
            "#,
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidFormat { ref template, .. } if template == "%q"));

        let err = build_topics(&config(
            r#"
            [topics."weather"]
            qos = 3
            "#,
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidQos { qos: 3, .. }));
    }

    #[test]
    fn test_payload_kind_names() {
        for (name, kind) in [
            ("json", PayloadKind::Structured),
            ("structured", PayloadKind::Structured),
            ("keyword", PayloadKind::Delimited),
            ("delimited", PayloadKind::Delimited),
            ("individual", PayloadKind::PerField),
            ("per-field", PayloadKind::PerField),
        ] {
            let parsed: PayloadKind = serde_json::from_str(&format!("\"{name}\"")).unwrap();
            assert_eq!(parsed, kind);
        }
        assert_eq!(PayloadKind::PerField.to_string(), "individual");
    }
}
