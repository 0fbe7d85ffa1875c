//! Publishing pipeline: records in, MQTT messages out.

pub mod aggregate;
pub mod dispatch;
pub mod format;
pub mod period;
pub mod record;
pub mod registry;
pub mod resolver;
pub mod service;
pub mod transform;
pub mod units;
