//! The `[publish]` section: broker connection, service settings and topics.
//!
//! Broker keys (`host`, `port`, `[publish.tls]`, ...) and service-level
//! topic defaults (`qos`, `type`, `format`, ...) sit directly under
//! `[publish]`. Topics are declared as `[publish.topics."<name>"]` with
//! optional `fields.<name>` and `aggregates.<name>` tables. Everything here
//! is raw and optional; the topic registry applies the default cascade.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::core::{registry::PayloadKind, resolver::ValueConversion, units::UnitSystem};

/// Service configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct PublishConfig {
    /// Master switch. When false the service does not start.
    pub enable: bool,

    /// Broker connection settings.
    #[serde(flatten)]
    #[validate(nested)]
    pub broker: wxbee_mqtt::Config,

    /// Streams the service listens to: `loop`, `archive` or both.
    pub binding: Option<BindingSpec>,

    /// Service-level topic defaults.
    #[serde(flatten)]
    pub defaults: TopicOptions,

    /// Times a dead dispatch worker is restarted before publishing stops.
    #[validate(range(max = 10, message = "Max worker restarts must be between 0 and 10"))]
    pub max_worker_restarts: u32,

    /// Seconds to wait for the worker on shutdown.
    #[validate(range(
        min = 1,
        max = 600,
        message = "Shutdown timeout must be between 1 and 600 seconds"
    ))]
    pub shutdown_timeout: u64,

    /// Topic sections, in declaration order.
    pub topics: Option<IndexMap<String, TopicSection>>,
}

impl Default for PublishConfig {
    fn default() -> Self {
        PublishConfig {
            enable: true,
            broker: wxbee_mqtt::Config::default(),
            binding: None,
            defaults: TopicOptions::default(),
            max_worker_restarts: 2,
            shutdown_timeout: 20,
            topics: None,
        }
    }
}

/// A binding given as a list (`["archive", "loop"]`) or as a
/// comma-separated string (`"archive, loop"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BindingSpec {
    List(Vec<String>),
    Csv(String),
}

impl BindingSpec {
    /// Normalized stream names, empty entries removed.
    pub fn names(&self) -> Vec<String> {
        let raw: Vec<&str> = match self {
            BindingSpec::List(items) => items.iter().map(String::as_str).collect(),
            BindingSpec::Csv(text) => text.split(',').collect(),
        };
        raw.into_iter()
            .map(|name| name.trim().to_lowercase())
            .filter(|name| !name.is_empty())
            .collect()
    }
}

/// Options shared by the service level and every topic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicOptions {
    pub qos: Option<u8>,
    pub retain: Option<bool>,
    #[serde(rename = "type")]
    pub payload_type: Option<PayloadKind>,
    pub unit_system: Option<UnitSystem>,
    pub ignore: Option<bool>,
    pub publish_none_value: Option<bool>,
    pub append_unit_label: Option<bool>,
    pub conversion_type: Option<ValueConversion>,
    pub format: Option<String>,
}

/// `[publish.topics."<name>"]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicSection {
    pub publish: Option<bool>,
    pub binding: Option<BindingSpec>,
    pub guarantee_delivery: Option<bool>,
    #[serde(flatten)]
    pub options: TopicOptions,
    pub fields: IndexMap<String, FieldSection>,
    pub aggregates: IndexMap<String, AggregateSection>,
}

/// Per-field overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldSection {
    /// Output name.
    pub name: Option<String>,
    /// Target unit.
    pub unit: Option<String>,
    pub ignore: Option<bool>,
    pub publish_none_value: Option<bool>,
    pub append_unit_label: Option<bool>,
    pub conversion_type: Option<ValueConversion>,
    pub format: Option<String>,
}

/// An aggregate added to every record of the topic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateSection {
    #[serde(flatten)]
    pub field: FieldSection,
    pub observation: Option<String>,
    pub aggregation: Option<String>,
    pub period: Option<String>,
    pub enable: Option<bool>,
}
