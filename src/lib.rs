//! wxbee: republishes weather station observations to an MQTT broker
//!
//! The host hands live (`loop`) and summary (`archive`) records to a
//! [`core::service::PublishService`], which transforms them per configured
//! topic and publishes them from a background worker without blocking the
//! caller.
//!
//! ## Modules
//!
//! * `config`: TOML configuration: the `[logger]` and `[publish]` sections,
//!   validated with the `validator` crate.
//!
//! * `core`: The publishing pipeline:
//!   - Topic registry and the option default cascade
//!   - Unit conversion, value formatting and field resolution
//!   - Time periods and aggregates over archived records
//!   - Dispatch queue, publish worker and its supervision
//!
//! * `logger`: Logging initialization using `tracing`, with console
//!   output (compact, pretty, JSON) and optional systemd journald.
//!
//! Broker connection management lives in the `wxbee-mqtt` crate.

pub mod config;
pub mod core;
pub mod logger;
