//! # Sensor Hub
//!
//! Periodic acquisition of calibrated measurements from I2C sensors,
//! published as JSON records to an MQTT broker.
//!
//! ## Features
//!
//! - **Shared bus access**: one serialized handle per I2C bus, with an active-device cache
//! - **Sensor decoders**: Bosch BME280, ST LPS25HB and a synthetic sensor
//! - **Config-driven construction**: bad entries are skipped, the rest keep running
//! - **Per-sensor intervals**: a single tick loop with no per-sensor threads
//! - **Resilient publishing**: bounded connect timeouts and capped reconnect attempts
//! - **Hardware-free runs**: a seeded stub bus and a loopback broker
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sensorhub::{BusBackend, HubConfig, SensorHub};
//!
//! let config = HubConfig::load("config.json")?;
//! let mut hub = SensorHub::dry_run(&config, BusBackend::Stub)?;
//!
//! let stop = hub.stop_handle();
//! std::thread::spawn(move || {
//!     std::thread::sleep(std::time::Duration::from_secs(5));
//!     stop.store(true, std::sync::atomic::Ordering::SeqCst);
//! });
//! hub.run();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Architecture
//!
//! - [`bus`] - Register-level I2C access (Linux i2c-dev and stub)
//! - [`sensors`] - Sensor trait, measurements and decoders
//! - [`builder`] - Configuration entries to sensor instances
//! - [`scheduler`] - Per-sensor interval scheduling
//! - [`telemetry`] - Measurement enrichment and topics
//! - [`publisher`] - MQTT connection state machine and transports
//! - [`agent`] - Orchestrator tying it all together

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_errors_doc)]

pub mod agent;
pub mod builder;
pub mod bus;
pub mod config;
pub mod error;
pub mod publisher;
pub mod scheduler;
pub mod sensors;
pub mod telemetry;

// Re-export main public types for convenience
pub use agent::SensorHub;
pub use bus::{I2cBus, SharedBus, StubI2cBus};
pub use config::{BusBackend, HubConfig, SensorConfig};
pub use publisher::{ConnectionState, MqttPublisher};
pub use sensors::{Measurement, Sensor, SensorKind};
