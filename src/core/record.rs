//! Observation records and the queue envelope that carries them.

use std::{fmt, str::FromStr};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A raw or transformed observation record: field name to value, in the
/// order the station produced them.
pub type Packet = IndexMap<String, Value>;

/// Timestamp field (unix epoch seconds) present in every record.
pub const DATE_TIME: &str = "dateTime";

/// Unit system tag of a record (1 = US, 16 = METRIC, 17 = METRICWX).
pub const US_UNITS: &str = "usUnits";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("Record has no 'dateTime' field")]
    MissingTimestamp,

    #[error("Unknown stream kind '{0}', expected 'loop' or 'archive'")]
    UnknownKind(String),
}

/// Which host stream a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    /// High-frequency live readings.
    #[serde(rename = "loop")]
    Live,

    /// Periodic archive records.
    #[serde(rename = "archive")]
    Summary,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Live => "loop",
            StreamKind::Summary => "archive",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamKind {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "loop" => Ok(StreamKind::Live),
            "archive" => Ok(StreamKind::Summary),
            other => Err(RecordError::UnknownKind(other.to_string())),
        }
    }
}

/// Reads the record timestamp as whole seconds.
pub fn time_stamp_of(packet: &Packet) -> Option<i64> {
    let value = packet.get(DATE_TIME)?;
    value.as_i64().or_else(|| value.as_f64().map(|ts| ts as i64))
}

/// A record queued for the dispatch worker. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub time_stamp: i64,
    pub kind: StreamKind,
    pub packet: Packet,
}

impl Envelope {
    /// Wraps `packet`, taking the timestamp from its `dateTime` field.
    pub fn new(kind: StreamKind, packet: Packet) -> Result<Self, RecordError> {
        let time_stamp = time_stamp_of(&packet).ok_or(RecordError::MissingTimestamp)?;
        Ok(Self {
            time_stamp,
            kind,
            packet,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn packet(value: Value) -> Packet {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_envelope_takes_time_stamp() {
        let envelope = Envelope::new(
            StreamKind::Live,
            packet(json!({"dateTime": 1700000000, "outTemp": 72.5})),
        )
        .unwrap();
        assert_eq!(envelope.time_stamp, 1_700_000_000);
        assert_eq!(envelope.kind, StreamKind::Live);
    }

    #[test]
    fn test_envelope_accepts_float_time_stamp() {
        let envelope =
            Envelope::new(StreamKind::Summary, packet(json!({"dateTime": 1700000000.0}))).unwrap();
        assert_eq!(envelope.time_stamp, 1_700_000_000);
    }

    #[test]
    fn test_envelope_requires_time_stamp() {
        let result = Envelope::new(StreamKind::Live, packet(json!({"outTemp": 72.5})));
        assert_eq!(result.unwrap_err(), RecordError::MissingTimestamp);
    }

    #[test]
    fn test_stream_kind_names() {
        assert_eq!("loop".parse::<StreamKind>().unwrap(), StreamKind::Live);
        assert_eq!(" Archive ".parse::<StreamKind>().unwrap(), StreamKind::Summary);
        assert!("hourly".parse::<StreamKind>().is_err());
        assert_eq!(
            serde_json::to_string(&StreamKind::Summary).unwrap(),
            "\"archive\""
        );
    }

    #[test]
    fn test_packet_keeps_field_order() {
        let p: Packet =
            serde_json::from_str(r#"{"dateTime": 1, "usUnits": 1, "outTemp": 2, "barometer": 3}"#)
                .unwrap();
        let keys: Vec<&str> = p.keys().map(String::as_str).collect();
        assert_eq!(keys, ["dateTime", "usUnits", "outTemp", "barometer"]);
    }
}
