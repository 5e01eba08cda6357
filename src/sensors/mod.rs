pub mod bme280;
pub mod dummy;
pub mod lps25hb;

pub use bme280::{Bme280Sensor, CalibrationCoefficients};
pub use dummy::DummySensor;
pub use lps25hb::Lps25hbSensor;

use crate::error::ReadError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Capability set shared by every decoder.
///
/// Construction performs the device handshake; a constructed sensor is ready
/// to be read for the rest of its life. `read` failures are transient.
pub trait Sensor: Send {
    fn sensor_type(&self) -> &str;
    fn is_enabled(&self) -> bool;
    fn publish_interval(&self) -> Duration;
    fn topic_suffix(&self) -> &str;
    fn read(&mut self) -> Result<Measurement, ReadError>;
}

/// Closed set of supported sensor kinds, keyed by the configuration type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    Bme280,
    Lps25hb,
    Dummy,
}

impl SensorKind {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "BME280" => Some(Self::Bme280),
            "LPS25HB" => Some(Self::Lps25hb),
            "Dummy" => Some(Self::Dummy),
            _ => None,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Self::Bme280 => "BME280",
            Self::Lps25hb => "LPS25HB",
            Self::Dummy => "Dummy",
        }
    }

    /// Whether the kind talks to a device on an I2C bus.
    pub fn is_bus_addressed(self) -> bool {
        matches!(self, Self::Bme280 | Self::Lps25hb)
    }
}

/// Outcome of one successful read. Absent quantities are left out of the
/// published payload; `errors` carries per-field failure markers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Measurement {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_celsius: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressure_hpa: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counter: Option<u64>,
    /// Health marker, set only by sensors that report one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(flatten)]
    pub errors: BTreeMap<String, String>,
}

impl Measurement {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.temperature_celsius.is_none()
            && self.humidity_percent.is_none()
            && self.pressure_hpa.is_none()
            && self.counter.is_none()
    }

    pub fn mark_error(&mut self, field: &str, message: impl Into<String>) {
        self.errors.insert(format!("{}_error", field), message.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_round_trip() {
        for kind in [SensorKind::Bme280, SensorKind::Lps25hb, SensorKind::Dummy] {
            assert_eq!(SensorKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(SensorKind::from_tag("bme280"), None);
        assert!(!SensorKind::Dummy.is_bus_addressed());
    }

    #[test]
    fn test_measurement_serialization_skips_absent_fields() {
        let mut measurement = Measurement {
            temperature_celsius: Some(21.5),
            ..Measurement::default()
        };
        measurement.mark_error("pressure", "Read failed");

        let json = serde_json::to_value(&measurement).unwrap();
        assert_eq!(json["temperature_celsius"], 21.5);
        assert_eq!(json["pressure_error"], "Read failed");
        assert!(json.get("pressure_hpa").is_none());
        assert!(json.get("humidity_percent").is_none());
    }
}
