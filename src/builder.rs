//! Configuration-driven sensor factory.
//!
//! Each entry of the `sensors` list is parsed and constructed on its own; a bad
//! entry is logged and skipped. Bus handles are created on first reference and
//! shared by every later entry naming the same bus id.

use crate::bus::{SharedBus, StubI2cBus};
use crate::config::{BusBackend, SensorConfig};
use crate::error::{BusError, ConfigError, InitError};
use crate::sensors::{Bme280Sensor, DummySensor, Lps25hbSensor, Sensor, SensorKind};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub type BusFactory = Box<dyn Fn(&str) -> Result<SharedBus, BusError> + Send>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BuildStats {
    pub entries: u32,
    pub built: u32,
    pub disabled: u32,
    pub skipped: u32,
}

pub struct SensorBuilder {
    factory: BusFactory,
    buses: HashMap<String, SharedBus>,
    default_interval: Duration,
    stats: BuildStats,
}

impl SensorBuilder {
    pub fn new(factory: BusFactory, default_interval: Duration) -> Self {
        Self {
            factory,
            buses: HashMap::new(),
            default_interval,
            stats: BuildStats::default(),
        }
    }

    /// Opens real `/dev/i2c-N` nodes.
    #[cfg(target_os = "linux")]
    pub fn linux(default_interval: Duration) -> Self {
        Self::new(
            Box::new(|path: &str| -> Result<SharedBus, BusError> {
                let bus = crate::bus::LinuxI2cBus::open(path)?;
                Ok(Arc::new(bus) as SharedBus)
            }),
            default_interval,
        )
    }

    #[cfg(not(target_os = "linux"))]
    pub fn linux(default_interval: Duration) -> Self {
        Self::new(
            Box::new(|_: &str| -> Result<SharedBus, BusError> { Err(BusError::Unsupported) }),
            default_interval,
        )
    }

    /// Every bus id maps to a fresh seeded [`StubI2cBus`].
    pub fn stub(default_interval: Duration) -> Self {
        Self::new(
            Box::new(|path: &str| -> Result<SharedBus, BusError> {
                Ok(Arc::new(StubI2cBus::new(path)))
            }),
            default_interval,
        )
    }

    pub fn for_backend(backend: BusBackend, default_interval: Duration) -> Self {
        match backend {
            BusBackend::Linux => Self::linux(default_interval),
            BusBackend::Stub => Self::stub(default_interval),
        }
    }

    /// Builds every usable sensor from the raw `sensors` list.
    ///
    /// Only a non-array list fails the whole batch. An empty result is valid.
    pub fn build_sensors(&mut self, entries: &Value) -> Result<Vec<Box<dyn Sensor>>, ConfigError> {
        let entries = entries.as_array().ok_or_else(|| {
            error!("'sensors' configuration is not an array");
            ConfigError::NotAnArray
        })?;

        let mut sensors: Vec<Box<dyn Sensor>> = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            self.stats.entries += 1;
            match self.build_one(entry) {
                Ok(sensor) => {
                    self.stats.built += 1;
                    sensors.push(sensor);
                }
                Err(BuildFailure::Config(ConfigError::Disabled)) => {
                    self.stats.disabled += 1;
                    debug!("sensor entry {} is disabled, skipping", index);
                }
                Err(failure) => {
                    self.stats.skipped += 1;
                    warn!("skipping sensor entry {}: {}", index, failure);
                }
            }
        }

        if sensors.is_empty() {
            warn!("no sensors were successfully built");
        } else {
            info!("built {} sensor(s) on {} bus(es)", sensors.len(), self.buses.len());
        }
        Ok(sensors)
    }

    fn build_one(&mut self, entry: &Value) -> Result<Box<dyn Sensor>, BuildFailure> {
        let config = SensorConfig::parse_common(entry, self.default_interval)?;
        let kind = SensorKind::from_tag(&config.sensor_type)
            .ok_or_else(|| ConfigError::UnknownType(config.sensor_type.clone()))?;

        let sensor: Box<dyn Sensor> = match kind {
            SensorKind::Dummy => Box::new(DummySensor::new(config)?),
            SensorKind::Bme280 | SensorKind::Lps25hb => {
                let config = config.with_bus_fields(entry)?;
                let bus_id = config.i2c_bus.clone().unwrap_or_default();
                let bus = self.resolve_bus(&bus_id)?;
                if kind == SensorKind::Bme280 {
                    Box::new(Bme280Sensor::new(config, bus)?)
                } else {
                    Box::new(Lps25hbSensor::new(config, bus)?)
                }
            }
        };
        info!("sensor {} ready (topic suffix '{}')", kind.tag(), sensor.topic_suffix());
        Ok(sensor)
    }

    /// Returns the cached handle for `bus_id`, opening it on first use.
    /// A bus that fails to open is not cached.
    fn resolve_bus(&mut self, bus_id: &str) -> Result<SharedBus, BusError> {
        if let Some(bus) = self.buses.get(bus_id) {
            return Ok(Arc::clone(bus));
        }
        let bus = (self.factory)(bus_id).map_err(|e| {
            error!("failed to open bus '{}': {}", bus_id, e);
            e
        })?;
        debug!("bus '{}' opened and cached", bus.bus_path());
        self.buses.insert(bus_id.to_string(), Arc::clone(&bus));
        Ok(bus)
    }

    pub fn bus(&self, bus_id: &str) -> Option<SharedBus> {
        self.buses.get(bus_id).cloned()
    }

    pub fn bus_count(&self) -> usize {
        self.buses.len()
    }

    pub fn get_stats(&self) -> &BuildStats {
        &self.stats
    }
}

/// Why one entry did not produce a sensor.
#[derive(Debug, thiserror::Error)]
enum BuildFailure {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("initialization failed: {0}")]
    Init(#[from] InitError),
}

impl std::fmt::Debug for SensorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorBuilder")
            .field("buses", &self.buses.keys().collect::<Vec<_>>())
            .field("default_interval", &self.default_interval)
            .field("stats", &self.stats)
            .finish()
    }
}
