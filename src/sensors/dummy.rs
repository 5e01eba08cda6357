//! Synthetic sensor for exercising the pipeline without hardware.

use super::{Measurement, Sensor};
use crate::config::SensorConfig;
use crate::error::{InitError, ReadError};
use std::time::Duration;
use tracing::{debug, info};

const BASE_TEMPERATURE_C: f64 = 20.0;
const BASE_HUMIDITY_PCT: f64 = 40.0;
const STATUS_OK: &str = "OK";

pub struct DummySensor {
    config: SensorConfig,
    counter: u64,
}

impl DummySensor {
    pub fn new(config: SensorConfig) -> Result<Self, InitError> {
        if !config.enabled {
            return Err(InitError::Disabled);
        }
        info!("Dummy sensor initialized (suffix: {})", config.topic_suffix);
        Ok(Self { config, counter: 0 })
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }
}

impl Sensor for DummySensor {
    fn sensor_type(&self) -> &str {
        &self.config.sensor_type
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn publish_interval(&self) -> Duration {
        self.config.publish_interval
    }

    fn topic_suffix(&self) -> &str {
        &self.config.topic_suffix
    }

    fn read(&mut self) -> Result<Measurement, ReadError> {
        self.counter += 1;
        debug!("dummy sample #{}", self.counter);

        // Saw-tooth values: 20.0..24.5 C and 40..59 %
        let step = self.counter % 10;
        let humidity_step = self.counter % 20;
        Ok(Measurement {
            temperature_celsius: Some(BASE_TEMPERATURE_C + step as f64 * 0.5),
            humidity_percent: Some(BASE_HUMIDITY_PCT + humidity_step as f64),
            counter: Some(self.counter),
            status: Some(STATUS_OK.to_string()),
            ..Measurement::default()
        })
    }
}
