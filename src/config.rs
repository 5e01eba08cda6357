//! Configuration model and JSON loading.
//!
//! The loader hands the core an already-parsed [`HubConfig`]; the `sensors`
//! list stays raw JSON so a malformed entry only costs that one sensor.

use crate::error::ConfigError;
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_PUBLISH_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 20;
pub const DEFAULT_MQTT_PORT: u16 = 1883;

const LINUX_PLATFORM: &str = "Linux_RPi";
const STUB_PLATFORM: &str = "Stub_Platform";

/// Which bus implementation backs the configured bus ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusBackend {
    Linux,
    Stub,
}

impl BusBackend {
    pub fn default_platform(self) -> &'static str {
        match self {
            Self::Linux => LINUX_PLATFORM,
            Self::Stub => STUB_PLATFORM,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttSettings {
    pub broker_address: String,
    pub client_id_base: String,
    pub topic_base: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retained: bool,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_sec: u64,
}

fn default_keep_alive() -> u64 {
    DEFAULT_KEEP_ALIVE_SECS
}

fn default_interval() -> u64 {
    DEFAULT_PUBLISH_INTERVAL_SECS
}

impl MqttSettings {
    /// Splits `tcp://host:port`, `mqtt://host:port` or `host[:port]`.
    pub fn broker_endpoint(&self) -> Result<(String, u16), ConfigError> {
        let address = self.broker_address.trim();
        let without_scheme = address
            .strip_prefix("tcp://")
            .or_else(|| address.strip_prefix("mqtt://"))
            .unwrap_or(address);

        if without_scheme.is_empty() {
            return Err(ConfigError::InvalidField {
                field: "broker_address",
                reason: "empty host".into(),
            });
        }

        match without_scheme.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|e| ConfigError::InvalidField {
                    field: "broker_address",
                    reason: format!("bad port '{}': {}", port, e),
                })?;
                if host.is_empty() {
                    return Err(ConfigError::InvalidField {
                        field: "broker_address",
                        reason: "empty host".into(),
                    });
                }
                Ok((host.to_string(), port))
            }
            None => Ok((without_scheme.to_string(), DEFAULT_MQTT_PORT)),
        }
    }

    /// `client_id_base + "_" + platform`, with spaces replaced.
    pub fn client_id(&self, platform: &str) -> String {
        format!("{}_{}", self.client_id_base, platform).replace(' ', "_")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    pub mqtt: MqttSettings,
    #[serde(default = "default_interval")]
    pub global_publish_interval_sec: u64,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub sensors: Value,
}

impl HubConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        if config.global_publish_interval_sec == 0 {
            return Err(ConfigError::InvalidField {
                field: "global_publish_interval_sec",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(config)
    }

    pub fn global_publish_interval(&self) -> Duration {
        Duration::from_secs(self.global_publish_interval_sec)
    }

    pub fn platform_name(&self, backend: BusBackend) -> String {
        self.platform
            .clone()
            .unwrap_or_else(|| backend.default_platform().to_string())
    }
}

/// One sensor entry after parsing. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorConfig {
    pub sensor_type: String,
    pub enabled: bool,
    pub topic_suffix: String,
    pub publish_interval: Duration,
    pub i2c_bus: Option<String>,
    /// Zero means unset.
    pub i2c_address: u8,
    /// Reserved for GPIO-attached sensor kinds.
    pub gpio_pin: Option<i32>,
}

impl SensorConfig {
    /// Parses the fields every sensor kind shares.
    ///
    /// Disabled entries are reported as [`ConfigError::Disabled`] before any
    /// other key is looked at.
    pub fn parse_common(entry: &Value, default_interval: Duration) -> Result<Self, ConfigError> {
        let object = entry.as_object().ok_or(ConfigError::NotAnObject)?;

        let enabled = match object.get("enabled") {
            None => false,
            Some(v) => v.as_bool().ok_or_else(|| ConfigError::InvalidField {
                field: "enabled",
                reason: "expected a boolean".into(),
            })?,
        };
        if !enabled {
            return Err(ConfigError::Disabled);
        }

        let sensor_type = required_str(entry, "type")?;
        let topic_suffix = required_str(entry, "publish_topic_suffix")?;

        let publish_interval = match object.get("publish_interval_sec") {
            None => default_interval,
            Some(v) => {
                let secs = v.as_u64().ok_or_else(|| ConfigError::InvalidField {
                    field: "publish_interval_sec",
                    reason: "expected a non-negative integer".into(),
                })?;
                Duration::from_secs(secs)
            }
        };
        if publish_interval.is_zero() {
            return Err(ConfigError::InvalidField {
                field: "publish_interval_sec",
                reason: "must be greater than zero".into(),
            });
        }

        let gpio_pin = match object.get("gpio_pin") {
            None => None,
            Some(v) => {
                let pin = v.as_i64().ok_or_else(|| ConfigError::InvalidField {
                    field: "gpio_pin",
                    reason: "expected an integer".into(),
                })?;
                if pin < 0 {
                    None
                } else {
                    Some(i32::try_from(pin).map_err(|_| ConfigError::InvalidField {
                        field: "gpio_pin",
                        reason: format!("{} out of range", pin),
                    })?)
                }
            }
        };

        Ok(Self {
            sensor_type,
            enabled,
            topic_suffix,
            publish_interval,
            i2c_bus: None,
            i2c_address: 0,
            gpio_pin,
        })
    }

    /// Adds `i2c_bus` and `i2c_address` for bus-addressed sensor kinds.
    pub fn with_bus_fields(mut self, entry: &Value) -> Result<Self, ConfigError> {
        let bus = required_str(entry, "i2c_bus")?;
        let raw_address = entry
            .get("i2c_address")
            .ok_or(ConfigError::MissingField("i2c_address"))?;
        let address = parse_address(raw_address)?;
        if address == 0 {
            return Err(ConfigError::InvalidField {
                field: "i2c_address",
                reason: "address must be nonzero".into(),
            });
        }
        self.i2c_bus = Some(bus);
        self.i2c_address = address;
        Ok(self)
    }
}

fn required_str(entry: &Value, field: &'static str) -> Result<String, ConfigError> {
    match entry.get(field) {
        None => Err(ConfigError::MissingField(field)),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(ConfigError::InvalidField {
            field,
            reason: "expected a string".into(),
        }),
    }
}

/// Accepts `"0xNN"` strings and plain integers up to 0xFF.
pub fn parse_address(value: &Value) -> Result<u8, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidField {
        field: "i2c_address",
        reason,
    };

    match value {
        Value::String(text) => {
            let digits = text
                .strip_prefix("0x")
                .or_else(|| text.strip_prefix("0X"))
                .filter(|d| !d.is_empty())
                .ok_or_else(|| invalid(format!("'{}' is not of the form 0xNN", text)))?;
            u8::from_str_radix(digits, 16)
                .map_err(|e| invalid(format!("'{}': {}", text, e)))
        }
        Value::Number(n) => n
            .as_u64()
            .and_then(|v| u8::try_from(v).ok())
            .ok_or_else(|| invalid(format!("{} out of range", n))),
        _ => Err(invalid("expected a hex string or integer".into())),
    }
}
